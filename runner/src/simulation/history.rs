use crate::database::ID;

/// State of one workload at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSnapshot {
    pub workload: ID,
    pub tick: u32,
    pub flops_left: u64,
    pub cores_used: u32,
}

/// State of one machine at one tick. `workload` is 0 for an idle machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub machine: ID,
    pub tick: u32,
    pub workload: ID,
    pub temperature: f32,
    pub load: f32,
    pub memory_mb: u32,
}

/// The in-memory tick history of one experiment.
///
/// Snapshots accumulate until the driver flushes them to the store in one
/// transaction; the buffer is cleared only after that write committed, so a
/// failed flush loses nothing.
#[derive(Debug, Default)]
pub struct ExperimentHistory {
    workloads: Vec<WorkloadSnapshot>,
    machines: Vec<MachineSnapshot>,
}

impl ExperimentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_workload(&mut self, snapshot: WorkloadSnapshot) {
        self.workloads.push(snapshot);
    }

    pub fn record_machine(&mut self, snapshot: MachineSnapshot) {
        self.machines.push(snapshot);
    }

    /// Buffer fill level, counted in workload snapshots.
    pub fn size(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty() && self.machines.is_empty()
    }

    pub fn workloads(&self) -> &[WorkloadSnapshot] {
        &self.workloads
    }

    pub fn machines(&self) -> &[MachineSnapshot] {
        &self.machines
    }

    pub fn clear(&mut self) {
        self.workloads.clear();
        self.machines.clear();
    }
}
