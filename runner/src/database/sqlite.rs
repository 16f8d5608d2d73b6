use super::{ConnectionError, ExperimentState, ID};
use crate::{
    modeling::{
        machine::{Machine, ProcessingUnit},
        topology::{Datacenter, Rack, Room, ServerRoom},
    },
    simulation::{
        experiment::Experiment,
        history::ExperimentHistory,
        path::{Path, Section},
        scheduler::Scheduler,
        workload::{Workload, WorkloadPool},
    },
};
use cowstr::CowStr;
use itertools::Itertools;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock_mut(&mut self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        self.lock_mut().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn poll_queued(&self, excluded: &BTreeSet<ID>) -> Result<Option<ID>, ConnectionError> {
        self.lock().poll_queued(excluded)
    }

    pub fn dequeue(&self, experiment: ID) -> Result<(), ConnectionError> {
        self.lock().set_state(experiment, ExperimentState::Simulating)
    }

    pub fn finish(&self, experiment: ID) -> Result<(), ConnectionError> {
        self.lock().set_state(experiment, ExperimentState::Finished)
    }

    pub fn load_experiment(&self, experiment: ID) -> Result<Experiment, ConnectionError> {
        self.lock().load_experiment(experiment)
    }

    pub fn flush(
        &self,
        experiment: ID,
        current_tick: u32,
        history: &ExperimentHistory,
    ) -> Result<(), ConnectionError> {
        self.lock().flush(experiment, current_tick, history)
    }
}

impl InnerConnection {
    pub fn load(path: &std::path::Path) -> Result<Self, ConnectionError> {
        let connection = Connection::open(path)?;

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, SOL");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    /// The next experiment waiting in the queue, or `None`. Ids in
    /// `excluded` are skipped so a rejected experiment at the head of the
    /// queue cannot shadow the ones behind it.
    pub fn poll_queued(&self, excluded: &BTreeSet<ID>) -> Result<Option<ID>, ConnectionError> {
        if excluded.is_empty() {
            return self
                .connection
                .prepare_cached("select id from experiments where state = ? order by id limit 1")?
                .query_row(params![ExperimentState::Queued.as_str()], |row| row.get(0))
                .optional()
                .map_err(ConnectionError::SQLite);
        }

        // the exclusion list is numeric, inlining it keeps a single query
        let query = format!(
            "select id from experiments where state = ? and id not in ({}) order by id limit 1",
            excluded.iter().join(", ")
        );
        self.connection
            .prepare(&query)?
            .query_row(params![ExperimentState::Queued.as_str()], |row| row.get(0))
            .optional()
            .map_err(ConnectionError::SQLite)
    }

    pub fn set_state(&self, experiment: ID, state: ExperimentState) -> Result<(), ConnectionError> {
        self.connection
            .prepare_cached("update experiments set state = ? where id = ?")?
            .execute(params![state.as_str(), experiment])?;

        debug!(experiment, state = state.as_str(), "Updated experiment state");

        Ok(())
    }

    /// Assemble a full experiment: scheduler, trace pool and the path with
    /// its sections and topologies. Nothing is dequeued here; the caller
    /// only moves the row out of the queue once assembly succeeded.
    pub fn load_experiment(&self, experiment: ID) -> Result<Experiment, ConnectionError> {
        let (path_id, trace_id, scheduler_name, name) = self
            .connection
            .prepare_cached(
                "select path_id, trace_id, scheduler_name, name from experiments where id = ?",
            )?
            .query_row(params![experiment], |row| {
                Ok((
                    row.get::<_, ID>(0)?,
                    row.get::<_, ID>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?
            .ok_or(ConnectionError::MissingExperiment(experiment))?;

        let scheduler = Scheduler::from_name(&scheduler_name)
            .ok_or_else(|| ConnectionError::UnknownScheduler(CowStr::from(scheduler_name.as_str())))?;

        let pool = self.load_workloads(trace_id)?;
        pool.validate_dependencies();

        let sections = self
            .connection
            .prepare_cached("select datacenter_id, start_tick from sections where path_id = ?")?
            .query_map(params![path_id], |row| {
                Ok((row.get::<_, ID>(0)?, row.get::<_, i64>(1)?))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<(ID, i64)>, ConnectionError>(init)
            })?;

        let mut path = Path::new(path_id);
        for (datacenter_id, start_tick) in sections {
            let datacenter = self.load_datacenter(datacenter_id)?;
            let start_tick = u32::try_from(start_tick)
                .expect_or_log("section start tick does not fit the tick range");

            path.add_section(Section::new(datacenter, start_tick));
        }

        if path.is_empty() {
            return Err(ConnectionError::EmptyPath(path_id));
        }

        info!(
            experiment,
            name = %name,
            scheduler = %scheduler_name,
            workloads = pool.len(),
            "Assembled experiment"
        );

        Ok(Experiment::new(experiment, path, scheduler, pool))
    }

    fn load_datacenter(&self, datacenter: ID) -> Result<Datacenter, ConnectionError> {
        let rooms = self
            .connection
            .prepare_cached("select id, type from rooms where datacenter_id = ?")?
            .query_map(params![datacenter], |row| {
                Ok((row.get::<_, ID>(0)?, row.get::<_, String>(1)?))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<(ID, String)>, ConnectionError>(init)
            })?;

        let mut loaded = Datacenter::new(datacenter);
        for (room_id, kind) in rooms {
            let room = match kind.as_str() {
                "SERVER" => Room::Server(self.load_server_room(room_id)?),
                "HALLWAY" => Room::Hallway { id: room_id },
                "POWER" => Room::Power { id: room_id },
                _ => return Err(ConnectionError::UnknownRoomType(CowStr::from(kind.as_str()))),
            };

            loaded.add_room(room);
        }

        Ok(loaded)
    }

    fn load_server_room(&self, room: ID) -> Result<ServerRoom, ConnectionError> {
        let racks = self
            .connection
            .prepare_cached("select id from racks where room_id = ?")?
            .query_map(params![room], |row| row.get::<_, ID>(0))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<ID>, ConnectionError>(init)
            })?;

        let mut loaded = ServerRoom::new(room);
        for rack_id in racks {
            let machines = self
                .connection
                .prepare_cached(
                    "select id, position from machines where rack_id = ? order by position",
                )?
                .query_map(params![rack_id], |row| {
                    Ok((row.get::<_, ID>(0)?, row.get::<_, i64>(1)?))
                })?
                .try_fold(Vec::new(), |mut init, result| {
                    init.push(result?);

                    Ok::<Vec<(ID, i64)>, ConnectionError>(init)
                })?;

            let mut rack = Rack::new(rack_id);
            for (machine_id, position) in machines {
                let mut machine = Machine::new(machine_id);
                for unit in self.load_processing_units(GET_CPUS_OF_MACHINE, machine_id)? {
                    machine.add_cpu(unit);
                }
                for unit in self.load_processing_units(GET_GPUS_OF_MACHINE, machine_id)? {
                    machine.add_gpu(unit);
                }

                let position = u32::try_from(position)
                    .expect_or_log("machine slot position does not fit the slot range");
                rack.insert_machine(position, machine);
            }

            loaded.add_rack(rack);
        }

        Ok(loaded)
    }

    fn load_processing_units(
        &self,
        query: &'static str,
        machine: ID,
    ) -> Result<Vec<ProcessingUnit>, ConnectionError> {
        self.connection
            .prepare_cached(query)?
            .query_map(params![machine], |row| {
                Ok(ProcessingUnit {
                    clock_rate_mhz: row.get(0)?,
                    cores: row.get(1)?,
                    energy_consumption_w: row.get(2)?,
                    failure_model: row.get::<_, Option<ID>>(3)?.unwrap_or(0),
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<ProcessingUnit>, ConnectionError>(init)
            })
    }

    fn load_workloads(&self, trace: ID) -> Result<WorkloadPool, ConnectionError> {
        let tasks = self
            .connection
            .prepare_cached(
                "select id, start_tick, total_flop_count, task_dependency_id, parallelizability
                 from tasks where trace_id = ?",
            )?
            .query_map(params![trace], |row| {
                Ok((
                    row.get::<_, ID>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, ID>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<(ID, i64, i64, ID, String)>, ConnectionError>(init)
            })?;

        let mut pool = WorkloadPool::new();
        for (id, start_tick, total_flop_count, dependency, parallelizability) in tasks {
            // a negative budget means the trace rows are corrupt
            assert!(
                total_flop_count >= 0,
                "task {id} has a negative flop budget"
            );
            let start_tick =
                u32::try_from(start_tick).expect_or_log("task start tick does not fit the tick range");
            let parallel = parallelizability == "PARALLEL";

            pool.insert(Workload::new(
                id,
                trace,
                start_tick,
                total_flop_count as u64,
                dependency,
                parallel,
            ));
        }

        Ok(pool)
    }

    /// Write every buffered snapshot plus the last simulated tick in one
    /// transaction. The buffer is untouched; the caller clears it once this
    /// returns `Ok`.
    pub fn flush(
        &self,
        experiment: ID,
        current_tick: u32,
        history: &ExperimentHistory,
    ) -> Result<(), ConnectionError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        {
            let mut write_workload_state = tx.prepare_cached(
                "insert into task_states
                 (task_id, experiment_id, tick, flops_left, cores_used)
                 values (?, ?, ?, ?, ?)",
            )?;
            for snapshot in history.workloads() {
                write_workload_state.execute(params![
                    snapshot.workload,
                    experiment,
                    snapshot.tick,
                    snapshot.flops_left as i64,
                    snapshot.cores_used
                ])?;
            }

            let mut write_machine_state = tx.prepare_cached(
                "insert into machine_states
                 (task_id, machine_id, experiment_id, tick, temperature_c, in_use_memory_mb, load_fraction)
                 values (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for snapshot in history.machines() {
                write_machine_state.execute(params![
                    snapshot.workload,
                    snapshot.machine,
                    experiment,
                    snapshot.tick,
                    f64::from(snapshot.temperature),
                    snapshot.memory_mb,
                    f64::from(snapshot.load)
                ])?;
            }

            let last_simulated_tick = if current_tick != 0 { current_tick - 1 } else { 0 };
            tx.prepare_cached("update experiments set last_simulated_tick = ? where id = ?")?
                .execute(params![last_simulated_tick, experiment])?;
        }

        tx.commit()?;

        debug!(
            experiment,
            workloads = history.size(),
            machines = history.machines().len(),
            "Stored snapshot batch"
        );

        Ok(())
    }
}

const GET_CPUS_OF_MACHINE: &str =
    "select cpus.clock_rate_mhz, cpus.number_of_cores, cpus.energy_consumption_w, cpus.failure_model_id
     from machine_cpus
     join cpus on cpus.id = machine_cpus.cpu_id
     where machine_cpus.machine_id = ?";

const GET_GPUS_OF_MACHINE: &str =
    "select gpus.clock_rate_mhz, gpus.number_of_cores, gpus.energy_consumption_w, gpus.failure_model_id
     from machine_gpus
     join gpus on gpus.id = machine_gpus.gpu_id
     where machine_gpus.machine_id = ?";

pub const SQL_SCHEMA: [&str; 14] = [
    "create table if not exists experiments (
    id integer primary key,
    simulation_id integer,
    path_id integer not null references paths (id),
    trace_id integer not null,
    scheduler_name text not null,
    name text not null default '',
    state text not null default 'QUEUED',
    last_simulated_tick integer not null default 0
);",
    "create table if not exists paths (
    id integer primary key,
    simulation_id integer,
    name text,
    datetime_created text
);",
    "create table if not exists sections (
    id integer primary key,
    path_id integer not null references paths (id),
    datacenter_id integer not null references datacenters (id),
    start_tick integer not null
);",
    "create table if not exists datacenters (
    id integer primary key,
    simulation_id integer
);",
    "create table if not exists rooms (
    id integer primary key,
    name text,
    datacenter_id integer not null references datacenters (id),
    type text not null
);",
    "create table if not exists racks (
    id integer primary key,
    room_id integer not null references rooms (id),
    name text,
    capacity integer
);",
    "create table if not exists machines (
    id integer primary key,
    rack_id integer not null references racks (id),
    position integer not null
);",
    "create table if not exists cpus (
    id integer primary key,
    clock_rate_mhz integer not null,
    number_of_cores integer not null,
    energy_consumption_w integer not null,
    failure_model_id integer
);",
    "create table if not exists machine_cpus (
    machine_id integer not null references machines (id),
    cpu_id integer not null references cpus (id)
);",
    "create table if not exists gpus (
    id integer primary key,
    clock_rate_mhz integer not null,
    number_of_cores integer not null,
    energy_consumption_w integer not null,
    failure_model_id integer
);",
    "create table if not exists machine_gpus (
    machine_id integer not null references machines (id),
    gpu_id integer not null references gpus (id)
);",
    "create table if not exists tasks (
    id integer primary key,
    start_tick integer not null,
    total_flop_count integer not null,
    trace_id integer not null,
    task_dependency_id integer not null default 0,
    parallelizability text not null default 'SERIAL'
);",
    "create table if not exists task_states (
    task_id integer not null references tasks (id),
    experiment_id integer not null references experiments (id),
    tick integer not null,
    flops_left integer not null,
    cores_used integer not null
);",
    "create table if not exists machine_states (
    task_id integer not null,
    machine_id integer not null references machines (id),
    experiment_id integer not null references experiments (id),
    tick integer not null,
    temperature_c real not null,
    in_use_memory_mb integer not null,
    load_fraction real not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[cfg(test)]
impl SharedConnection {
    /// Test seam: run a raw statement against the underlying connection.
    pub fn execute_raw(&self, sql: &str) {
        self.lock().connection.execute(sql, []).unwrap();
    }

    /// Test seam: fetch a single value as text.
    pub fn query_one(&self, sql: &str) -> String {
        self.lock()
            .connection
            .query_row(sql, [], |row| {
                row.get::<_, i64>(0)
                    .map(|value| value.to_string())
                    .or_else(|_| row.get::<_, String>(0))
            })
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SharedConnection {
        let mut connection =
            SharedConnection::load(std::path::Path::new(":memory:")).unwrap();
        connection.init().unwrap();
        connection
    }

    /// One datacenter with one server room, one rack and two machines with
    /// one 100 MHz single-core CPU each, plus a two-task trace.
    fn seed_experiment(connection: &SharedConnection, scheduler: &str) {
        let guard = connection.0.lock_arc();
        let sql = [
            "insert into datacenters (id) values (1)",
            "insert into rooms (id, name, datacenter_id, type) values (1, 'room', 1, 'SERVER')",
            "insert into rooms (id, name, datacenter_id, type) values (2, 'hall', 1, 'HALLWAY')",
            "insert into racks (id, room_id, name, capacity) values (1, 1, 'rack', 42)",
            "insert into machines (id, rack_id, position) values (1, 1, 0)",
            "insert into machines (id, rack_id, position) values (2, 1, 1)",
            "insert into cpus (id, clock_rate_mhz, number_of_cores, energy_consumption_w, failure_model_id)
             values (1, 100, 1, 95, null)",
            "insert into machine_cpus (machine_id, cpu_id) values (1, 1)",
            "insert into machine_cpus (machine_id, cpu_id) values (2, 1)",
            "insert into paths (id, simulation_id, name) values (1, 1, 'path')",
            "insert into sections (id, path_id, datacenter_id, start_tick) values (1, 1, 1, 0)",
            "insert into tasks (id, start_tick, total_flop_count, trace_id, task_dependency_id, parallelizability)
             values (1, 0, 200, 1, 0, 'SERIAL')",
            "insert into tasks (id, start_tick, total_flop_count, trace_id, task_dependency_id, parallelizability)
             values (2, 0, 100, 1, 1, 'PARALLEL')",
        ];
        for statement in sql {
            guard.connection.execute(statement, []).unwrap();
        }
        guard
            .connection
            .execute(
                "insert into experiments
                 (id, simulation_id, path_id, trace_id, scheduler_name, name, state)
                 values (1, 1, 1, 1, ?, 'test', 'QUEUED')",
                params![scheduler],
            )
            .unwrap();
    }

    #[test]
    fn queue_lifecycle() {
        let connection = memory_store();
        seed_experiment(&connection, "FIFO");
        let nothing_excluded = BTreeSet::new();

        assert_eq!(connection.poll_queued(&nothing_excluded).unwrap(), Some(1));
        // polling is idempotent
        assert_eq!(connection.poll_queued(&nothing_excluded).unwrap(), Some(1));

        connection.dequeue(1).unwrap();
        assert_eq!(connection.poll_queued(&nothing_excluded).unwrap(), None);

        connection.finish(1).unwrap();
        let state: String = connection
            .0
            .lock_arc()
            .connection
            .query_row("select state from experiments where id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(state, "FINISHED");
    }

    #[test]
    fn empty_queue_is_not_an_error() {
        let connection = memory_store();
        assert_eq!(connection.poll_queued(&BTreeSet::new()).unwrap(), None);
        connection.close().unwrap();
    }

    #[test]
    fn poll_skips_excluded_experiments() {
        let connection = memory_store();
        seed_experiment(&connection, "FIFO");
        connection.execute_raw(
            "insert into experiments
             (id, simulation_id, path_id, trace_id, scheduler_name, name, state)
             values (2, 1, 1, 1, 'SRTF', 'second', 'QUEUED')",
        );

        assert_eq!(connection.poll_queued(&BTreeSet::new()).unwrap(), Some(1));
        // an excluded head must not shadow the rest of the queue
        assert_eq!(
            connection.poll_queued(&BTreeSet::from([1])).unwrap(),
            Some(2)
        );
        assert_eq!(
            connection.poll_queued(&BTreeSet::from([1, 2])).unwrap(),
            None
        );
    }

    #[test]
    fn assembles_experiment() {
        let connection = memory_store();
        seed_experiment(&connection, "SRTF");

        let experiment = connection.load_experiment(1).unwrap();
        assert_eq!(experiment.id(), 1);
        assert_eq!(experiment.current_tick(), 0);
        assert_eq!(experiment.pool().len(), 2);
        // every workload carries the trace it was fetched from
        assert!(experiment.pool().iter().all(|workload| workload.trace() == 1));
        assert!(experiment.pool().get(1).unwrap().is_dependency_ready());
        assert!(!experiment.pool().get(2).unwrap().is_dependency_ready());
        assert!(experiment.pool().get(2).unwrap().is_parallel());
    }

    #[test]
    fn unknown_scheduler_is_rejected() {
        let connection = memory_store();
        seed_experiment(&connection, "ROUND_ROBIN");

        assert!(matches!(
            connection.load_experiment(1),
            Err(ConnectionError::UnknownScheduler(_))
        ));
    }

    #[test]
    fn missing_experiment_is_rejected() {
        let connection = memory_store();

        assert!(matches!(
            connection.load_experiment(99),
            Err(ConnectionError::MissingExperiment(99))
        ));
    }

    #[test]
    fn flush_writes_snapshots_and_last_tick() {
        let connection = memory_store();
        seed_experiment(&connection, "FIFO");

        let mut history = ExperimentHistory::new();
        history.record_workload(crate::simulation::history::WorkloadSnapshot {
            workload: 1,
            tick: 1,
            flops_left: 100,
            cores_used: 2,
        });
        history.record_machine(crate::simulation::history::MachineSnapshot {
            machine: 1,
            tick: 1,
            workload: 1,
            temperature: 33.0,
            load: 1.0,
            memory_mb: 50,
        });

        connection.flush(1, 2, &history).unwrap();

        let guard = connection.0.lock_arc();
        let (flops_left, cores_used): (i64, u32) = guard
            .connection
            .query_row(
                "select flops_left, cores_used from task_states where experiment_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(flops_left, 100);
        assert_eq!(cores_used, 2);

        let machine_rows: i64 = guard
            .connection
            .query_row("select count(*) from machine_states", [], |row| row.get(0))
            .unwrap();
        assert_eq!(machine_rows, 1);

        let last_simulated_tick: i64 = guard
            .connection
            .query_row(
                "select last_simulated_tick from experiments where id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_simulated_tick, 1);
    }

    #[test]
    fn flush_at_tick_zero_stores_zero() {
        let connection = memory_store();
        seed_experiment(&connection, "FIFO");

        connection.flush(1, 0, &ExperimentHistory::new()).unwrap();

        let last_simulated_tick: i64 = connection
            .0
            .lock_arc()
            .connection
            .query_row(
                "select last_simulated_tick from experiments where id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_simulated_tick, 0);
    }
}
