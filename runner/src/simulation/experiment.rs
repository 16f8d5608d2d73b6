use super::{
    history::{ExperimentHistory, MachineSnapshot, WorkloadSnapshot},
    path::Path,
    scheduler::Scheduler,
    workload::WorkloadPool,
};
use crate::database::ID;
use tracing::debug;
use tracing_unwrap::OptionExt;

/// One loaded experiment: a path of topologies, a scheduling policy and the
/// workload pool of its trace, advanced one logical tick at a time.
#[derive(Debug)]
pub struct Experiment {
    id: ID,
    path: Path,
    scheduler: Scheduler,
    pool: WorkloadPool,
    history: ExperimentHistory,
    current_tick: u32,
    finished: bool,
}

impl Experiment {
    pub fn new(id: ID, path: Path, scheduler: Scheduler, pool: WorkloadPool) -> Self {
        Self {
            id,
            path,
            scheduler,
            pool,
            history: ExperimentHistory::new(),
            current_tick: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn pool(&self) -> &WorkloadPool {
        &self.pool
    }

    pub fn history(&self) -> &ExperimentHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut ExperimentHistory {
        &mut self.history
    }

    /// Advance the experiment by one tick.
    ///
    /// Assignments are cleared before the reap so no machine still points at
    /// a workload finished last tick when the pool deletes it. Scheduling
    /// completes before any machine performs work.
    pub fn tick(&mut self) {
        if self.finished {
            return;
        }

        let tick = self.current_tick;
        let section = self.path.active_at_mut(tick);
        let mut machines = section.datacenter_mut().machines_mut();

        for machine in machines.iter_mut() {
            machine.clear_assignment();
        }

        self.pool.reap();

        let candidates = self.pool.runnable_at(tick);
        self.scheduler
            .schedule(&mut machines, &candidates, &mut self.pool);

        for machine in machines {
            machine.work(&mut self.pool);
        }

        self.current_tick += 1;

        if self.pool.is_empty() {
            self.finished = true;
            debug!(
                experiment = self.id,
                tick = self.current_tick,
                "Trace drained, experiment finished"
            );
        }
    }

    /// Buffer snapshots of every runnable workload and every machine of the
    /// active section at the current tick.
    pub fn save_state(&mut self) {
        let tick = self.current_tick;

        for id in self.pool.runnable_at(tick) {
            let workload = self
                .pool
                .get(id)
                .expect_or_log("runnable workload vanished from the pool");
            self.history.record_workload(WorkloadSnapshot {
                workload: id,
                tick,
                flops_left: workload.remaining_ops(),
                cores_used: workload.cores_used(),
            });
        }

        for machine in self.path.active_at(tick).datacenter().machines() {
            self.history.record_machine(MachineSnapshot {
                machine: machine.id(),
                tick,
                workload: machine.current_workload(),
                temperature: machine.temperature(),
                load: machine.load(),
                memory_mb: machine.memory_mb(),
            });
        }
    }
}
