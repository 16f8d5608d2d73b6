use crate::{
    config::RunnerConfig,
    database::{sqlite::SharedConnection, ID},
    simulation::experiment::Experiment,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// The worker loop: polls the experiment queue, advances every loaded
/// experiment tick by tick and flushes their snapshot buffers back into the
/// store.
///
/// Experiments never share state, so one loop iteration ticks them on the
/// rayon pool; all store traffic stays on the sequential flush pass.
#[derive(Debug)]
pub struct Driver {
    connection: SharedConnection,
    experiments: BTreeMap<ID, Experiment>,
    // malformed experiments stay QUEUED in the store but are not retried by
    // this process
    rejected: BTreeSet<ID>,
    poll_interval: Duration,
    flush_threshold: usize,
    last_poll: Option<Instant>,
}

impl Driver {
    pub fn load(connection: SharedConnection, config: &RunnerConfig) -> Self {
        Self {
            connection,
            experiments: BTreeMap::new(),
            rejected: BTreeSet::new(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            flush_threshold: config.flush_threshold,
            last_poll: None,
        }
    }

    pub fn run(mut self) -> ! {
        info!(
            poll_interval = self.poll_interval.as_secs(),
            flush_threshold = self.flush_threshold,
            "Starting simulation loop"
        );

        loop {
            self.step();
        }
    }

    fn step(&mut self) {
        let poll_due = self
            .last_poll
            .map_or(true, |instant| instant.elapsed() >= self.poll_interval);
        if poll_due {
            self.drain_queue();
            self.last_poll = Some(Instant::now());
        }

        if self.experiments.is_empty() {
            let elapsed = self
                .last_poll
                .map_or(Duration::ZERO, |instant| instant.elapsed());
            let time_to_sleep = self.poll_interval.saturating_sub(elapsed);
            thread::sleep(time_to_sleep);

            return;
        }

        self.advance();
        self.flush_pass();
    }

    /// Pull queued experiments out of the store until it has nothing new.
    ///
    /// An experiment is only dequeued once it assembled and validated. A
    /// malformed one is left QUEUED and remembered as rejected; the poll
    /// skips rejected ids, so experiments queued behind it still load.
    fn drain_queue(&mut self) {
        loop {
            let id = match self.connection.poll_queued(&self.rejected) {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(error) => {
                    error!(error = ?error, "Failed to poll the experiment queue: {error}");

                    break;
                }
            };

            if self.experiments.contains_key(&id) {
                break;
            }

            match self.connection.load_experiment(id) {
                Ok(experiment) => match self.connection.dequeue(id) {
                    Ok(()) => {
                        info!(experiment = id, "Simulating experiment");
                        self.experiments.insert(id, experiment);
                    }
                    Err(error) => {
                        error!(experiment = id, error = ?error, "Failed to dequeue experiment: {error}");

                        break;
                    }
                },
                Err(error) => {
                    error!(experiment = id, error = ?error, "Rejecting malformed experiment: {error}");
                    self.rejected.insert(id);
                }
            }
        }
    }

    /// One tick plus snapshot for every unfinished experiment.
    fn advance(&mut self) {
        self.experiments.par_iter_mut().for_each(|(_, experiment)| {
            if !experiment.finished() {
                experiment.tick();
                experiment.save_state();
            }
        });
    }

    /// Flush every experiment whose buffer ran full or whose trace drained.
    ///
    /// A failed flush keeps the buffer and the experiment; the next pass
    /// retries. Snapshots always hit the store before an experiment is
    /// marked FINISHED.
    fn flush_pass(&mut self) {
        let mut finished = Vec::new();

        for (&id, experiment) in self.experiments.iter_mut() {
            if experiment.history().size() <= self.flush_threshold && !experiment.finished() {
                continue;
            }

            match self
                .connection
                .flush(id, experiment.current_tick(), experiment.history())
            {
                Ok(()) => {
                    debug!(experiment = id, "Flushed snapshot buffer");
                    experiment.history_mut().clear();

                    if experiment.finished() {
                        finished.push(id);
                    }
                }
                Err(error) => {
                    error!(experiment = id, error = ?error, "Failed to flush snapshots, keeping buffer: {error}");
                }
            }
        }

        for id in finished {
            match self.connection.finish(id) {
                Ok(()) => {
                    info!(experiment = id, "Experiment finished");
                    self.experiments.remove(&id);
                }
                Err(error) => {
                    error!(experiment = id, error = ?error, "Failed to mark experiment finished: {error}");
                }
            }
        }
    }
}
