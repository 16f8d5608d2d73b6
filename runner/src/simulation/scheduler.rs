use crate::{
    database::ID,
    modeling::machine::Machine,
    simulation::workload::{Workload, WorkloadPool},
};
use itertools::Itertools;
use tracing_unwrap::OptionExt;

/// The scheduling policies the store may name for an experiment.
///
/// Policies are stateless; every experiment owns its own value. Given the
/// same machines and candidates a policy always produces the same
/// assignments, with ties broken by input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    Fifo,
    Srtf,
}

impl Scheduler {
    /// Resolve a scheduler name from the store. `None` rejects the
    /// experiment at load.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "FIFO" | "DEFAULT" => Some(Self::Fifo),
            "SRTF" => Some(Self::Srtf),
            _ => None,
        }
    }

    /// Map the candidate workloads onto the machines for one tick.
    ///
    /// Resets every candidate's transient core count first; workloads whose
    /// dependency has not finished are skipped over.
    pub fn schedule(&self, machines: &mut [&mut Machine], candidates: &[ID], pool: &mut WorkloadPool) {
        for id in candidates {
            if let Some(workload) = pool.get_mut(*id) {
                workload.set_cores_used(0);
            }
        }

        match self {
            Self::Fifo => fifo(machines, candidates, pool),
            Self::Srtf => srtf(machines, candidates, pool),
        }
    }
}

/// Every machine works on the earliest dependency-ready candidate.
fn fifo(machines: &mut [&mut Machine], candidates: &[ID], pool: &mut WorkloadPool) {
    let Some(head) = candidates
        .iter()
        .copied()
        .find(|id| pool.get(*id).is_some_and(Workload::is_dependency_ready))
    else {
        return;
    };

    for machine in machines.iter_mut() {
        machine.assign(head);

        let cores = machine.number_of_cores();
        let workload = pool
            .get_mut(head)
            .expect_or_log("scheduled workload vanished from the pool");
        workload.set_cores_used(workload.cores_used() + cores);
    }
}

/// Shortest remaining time first.
///
/// Walks the machines over the candidates sorted by remaining FLOPs. A
/// serial workload leaves the list after its single assignment; parallel
/// workloads share machines round-robin.
fn srtf(machines: &mut [&mut Machine], candidates: &[ID], pool: &mut WorkloadPool) {
    // stable sort, input order breaks ties between equal budgets
    let mut queue = candidates
        .iter()
        .copied()
        .filter(|id| pool.get(*id).is_some_and(Workload::is_dependency_ready))
        .sorted_by_key(|id| {
            pool.get(*id)
                .expect_or_log("candidate vanished from the pool")
                .remaining_ops()
        })
        .collect_vec();

    let mut cursor = 0;
    for machine in machines.iter_mut() {
        if queue.is_empty() {
            break;
        }
        if cursor >= queue.len() {
            cursor = 0;
        }

        let id = queue[cursor];
        machine.assign(id);

        let cores = machine.number_of_cores();
        let workload = pool
            .get_mut(id)
            .expect_or_log("scheduled workload vanished from the pool");
        workload.set_cores_used(workload.cores_used() + cores);

        if workload.is_parallel() {
            cursor = (cursor + 1) % queue.len();
        } else {
            queue.remove(cursor);
        }
    }
}
