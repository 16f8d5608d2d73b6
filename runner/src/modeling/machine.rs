use crate::{database::ID, simulation::workload::WorkloadPool};
use tracing_unwrap::OptionExt;

pub const MIN_TEMPERATURE_C: f32 = 0.0;
pub const MAX_TEMPERATURE_C: f32 = 80.0;
pub const INITIAL_TEMPERATURE_C: f32 = 23.0;
pub const TEMPERATURE_INCREASE_C: f32 = 10.0;
// baseline memory held by the kernel on an otherwise idle machine
pub const KERNEL_MEMORY_MB: u32 = 50;

/// One CPU or GPU slotted into a machine.
#[derive(Debug, Clone)]
pub struct ProcessingUnit {
    pub clock_rate_mhz: u32,
    pub cores: u32,
    pub energy_consumption_w: u32,
    pub failure_model: ID,
}

/// A compute element of a rack.
///
/// The machine observes its assigned workload by id only; the pool owns the
/// workload and outlives the assignment.
#[derive(Debug, Clone)]
pub struct Machine {
    id: ID,
    cpus: Vec<ProcessingUnit>,
    gpus: Vec<ProcessingUnit>,
    current_workload: Option<ID>,
    load: f32,
    temperature: f32,
    memory_mb: u32,
}

impl Machine {
    pub fn new(id: ID) -> Self {
        Self {
            id,
            cpus: Vec::new(),
            gpus: Vec::new(),
            current_workload: None,
            load: 1.0,
            temperature: INITIAL_TEMPERATURE_C,
            memory_mb: KERNEL_MEMORY_MB,
        }
    }

    pub fn add_cpu(&mut self, unit: ProcessingUnit) {
        self.cpus.push(unit);
    }

    pub fn add_gpu(&mut self, unit: ProcessingUnit) {
        self.gpus.push(unit);
    }

    pub fn id(&self) -> ID {
        self.id
    }

    /// FLOPs this machine delivers per tick at full load.
    pub fn speed(&self) -> u64 {
        self.cpus
            .iter()
            .map(|cpu| u64::from(cpu.clock_rate_mhz) * u64::from(cpu.cores))
            .sum()
    }

    pub fn number_of_cores(&self) -> u32 {
        self.cpus.iter().map(|cpu| cpu.cores).sum()
    }

    pub fn gpus(&self) -> &[ProcessingUnit] {
        &self.gpus
    }

    /// Id of the assigned workload, 0 when idle.
    pub fn current_workload(&self) -> ID {
        self.current_workload.unwrap_or(0)
    }

    pub fn is_busy(&self) -> bool {
        self.current_workload.is_some()
    }

    pub fn load(&self) -> f32 {
        self.load
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    /// Assign a workload for the current tick. Last assignment wins.
    pub fn assign(&mut self, workload: ID) {
        self.current_workload = Some(workload);
    }

    pub fn clear_assignment(&mut self) {
        self.current_workload = None;
    }

    /// Perform one tick of work on the assigned workload, if any.
    ///
    /// Delivers `floor(speed * load)` FLOPs, heats the machine up by
    /// `load * 10` degrees (clamped to the operating range) and saturates the
    /// load for the next tick.
    pub fn work(&mut self, pool: &mut WorkloadPool) {
        let Some(id) = self.current_workload else {
            return;
        };

        let delivered = (self.speed() as f64 * f64::from(self.load)).floor() as u64;
        pool.get_mut(id)
            .expect_or_log("machine assigned a workload that is not in the pool")
            .apply_work(delivered);

        self.temperature = (self.temperature + self.load * TEMPERATURE_INCREASE_C)
            .clamp(MIN_TEMPERATURE_C, MAX_TEMPERATURE_C);
        self.load = 1.0;
    }
}
