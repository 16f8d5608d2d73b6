use crate::database::ID;
use std::collections::BTreeMap;
use tracing::trace;

/// A unit of work from an experiment trace.
///
/// A workload carries a FLOP budget that machines drain tick by tick. It may
/// depend on exactly one other workload from the same trace; until that
/// dependency finishes the workload is never handed to a machine.
#[derive(Debug, Clone)]
pub struct Workload {
    id: ID,
    trace: ID,
    start_tick: u32,
    total_ops: u64,
    remaining_ops: u64,
    dependency: ID,
    dependency_ready: bool,
    parallel: bool,
    // transient, reset by the scheduler on every tick
    cores_used: u32,
}

impl Workload {
    pub fn new(
        id: ID,
        trace: ID,
        start_tick: u32,
        total_ops: u64,
        dependency: ID,
        parallel: bool,
    ) -> Self {
        Self {
            id,
            trace,
            start_tick,
            total_ops,
            remaining_ops: total_ops,
            dependency,
            // a dependency id of 0 means there is none
            dependency_ready: dependency == 0,
            parallel,
            cores_used: 0,
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn trace(&self) -> ID {
        self.trace
    }

    pub fn start_tick(&self) -> u32 {
        self.start_tick
    }

    pub fn total_ops(&self) -> u64 {
        self.total_ops
    }

    pub fn remaining_ops(&self) -> u64 {
        self.remaining_ops
    }

    pub fn dependency(&self) -> ID {
        self.dependency
    }

    pub fn is_dependency_ready(&self) -> bool {
        self.dependency_ready
    }

    pub fn mark_dependency_ready(&mut self) {
        self.dependency_ready = true;
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn cores_used(&self) -> u32 {
        self.cores_used
    }

    pub fn set_cores_used(&mut self, cores: u32) {
        self.cores_used = cores;
    }

    pub fn is_finished(&self) -> bool {
        self.remaining_ops == 0
    }

    /// Drain up to `ops` FLOPs from the remaining budget. A no-op on an
    /// already finished workload; the budget saturates at zero.
    pub fn apply_work(&mut self, ops: u64) {
        if ops == 0 || self.is_finished() {
            return;
        }

        self.remaining_ops = self.remaining_ops.saturating_sub(ops);

        if self.is_finished() {
            trace!(workload = self.id, "Workload drained its FLOP budget");
        }
    }
}

/// The workloads of one experiment, keyed by id.
///
/// The pool is the single owner of its workloads; machines and schedulers
/// refer to them by id only, so removing a finished workload never leaves a
/// dangling reference.
#[derive(Debug, Default)]
pub struct WorkloadPool {
    workloads: BTreeMap<ID, Workload>,
}

impl WorkloadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workload: Workload) {
        self.workloads.insert(workload.id(), workload);
    }

    pub fn get(&self, id: ID) -> Option<&Workload> {
        self.workloads.get(&id)
    }

    pub fn get_mut(&mut self, id: ID) -> Option<&mut Workload> {
        self.workloads.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    /// True once no unfinished workload remains, i.e. the trace is drained.
    pub fn is_empty(&self) -> bool {
        self.workloads.values().all(Workload::is_finished)
    }

    /// Workloads eligible to run at `tick`: started strictly before it and
    /// not finished. Dependency readiness is the scheduler's concern.
    pub fn runnable_at(&self, tick: u32) -> Vec<ID> {
        self.workloads
            .values()
            .filter(|workload| workload.start_tick() < tick && !workload.is_finished())
            .map(Workload::id)
            .collect()
    }

    /// Delete finished workloads and release every workload that depended on
    /// one of them.
    pub fn reap(&mut self) {
        let finished: Vec<ID> = self
            .workloads
            .values()
            .filter(|workload| workload.is_finished())
            .map(Workload::id)
            .collect();

        if finished.is_empty() {
            return;
        }

        for id in &finished {
            self.workloads.remove(id);
        }

        for workload in self.workloads.values_mut() {
            if workload.dependency() != 0 && finished.contains(&workload.dependency()) {
                trace!(
                    workload = workload.id(),
                    dependency = workload.dependency(),
                    "Dependency finished, workload released"
                );
                workload.mark_dependency_ready();
            }
        }
    }

    /// Every non-zero dependency id must name a workload in this pool. A
    /// dangling id means the trace rows are corrupt.
    pub fn validate_dependencies(&self) {
        for workload in self.workloads.values() {
            let dependency = workload.dependency();
            assert!(
                dependency == 0 || self.workloads.contains_key(&dependency),
                "workload {} depends on {} which is not part of the trace",
                workload.id(),
                dependency
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_work_saturates() {
        let mut workload = Workload::new(1, 1, 0, 100, 0, false);

        workload.apply_work(40);
        assert_eq!(workload.remaining_ops(), 60);
        assert!(!workload.is_finished());

        workload.apply_work(500);
        assert_eq!(workload.remaining_ops(), 0);
        assert!(workload.is_finished());

        // finished workloads ignore further work
        workload.apply_work(10);
        assert_eq!(workload.remaining_ops(), 0);
    }

    #[test]
    fn apply_work_zero_is_noop() {
        let mut workload = Workload::new(1, 1, 0, 100, 0, false);

        workload.apply_work(0);
        assert_eq!(workload.remaining_ops(), 100);
    }

    #[test]
    fn zero_budget_is_finished_at_load() {
        let workload = Workload::new(1, 1, 0, 0, 0, false);
        assert!(workload.is_finished());
    }

    #[test]
    fn dependency_zero_is_ready_at_load() {
        assert!(Workload::new(1, 1, 0, 10, 0, false).is_dependency_ready());
        assert!(!Workload::new(2, 1, 0, 10, 1, false).is_dependency_ready());
    }

    #[test]
    fn runnable_requires_started_and_unfinished() {
        let mut pool = WorkloadPool::new();
        pool.insert(Workload::new(1, 1, 0, 10, 0, false));
        pool.insert(Workload::new(2, 1, 5, 10, 0, false));
        pool.insert(Workload::new(3, 1, 0, 0, 0, false));

        // nothing has started strictly before tick 0
        assert!(pool.runnable_at(0).is_empty());
        // workload 3 is finished, workload 2 has not started yet
        assert_eq!(pool.runnable_at(1), vec![1]);
        assert_eq!(pool.runnable_at(6), vec![1, 2]);
    }

    #[test]
    fn reap_releases_dependents() {
        let mut pool = WorkloadPool::new();
        let mut parent = Workload::new(1, 1, 0, 10, 0, false);
        parent.apply_work(10);
        pool.insert(parent);
        pool.insert(Workload::new(2, 1, 0, 10, 1, false));
        pool.insert(Workload::new(3, 1, 0, 10, 2, false));

        pool.reap();

        assert_eq!(pool.len(), 2);
        assert!(pool.get(1).is_none());
        assert!(pool.get(2).unwrap().is_dependency_ready());
        // workload 3 depends on 2 which is still alive
        assert!(!pool.get(3).unwrap().is_dependency_ready());
    }

    #[test]
    fn empty_means_drained() {
        let mut pool = WorkloadPool::new();
        assert!(pool.is_empty());

        pool.insert(Workload::new(1, 1, 0, 10, 0, false));
        assert!(!pool.is_empty());

        pool.get_mut(1).unwrap().apply_work(10);
        // the finished workload still occupies the pool until reaped, but no
        // unfinished work remains
        assert!(pool.is_empty());

        pool.reap();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    #[should_panic]
    fn dangling_dependency_panics() {
        let mut pool = WorkloadPool::new();
        pool.insert(Workload::new(1, 1, 0, 10, 42, false));
        pool.validate_dependencies();
    }
}
