pub mod sqlite;

use cowstr::CowStr;
use thiserror::Error;

// Alias for all store IDs: experiments, paths, rooms, machines and tasks.
// This might be upped to an i64 if the demand ever arises.
pub type ID = i32;

/// Lifecycle of an experiment row. Stored as text in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    Queued,
    Simulating,
    Finished,
}

impl ExperimentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Simulating => "SIMULATING",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("SQLite adapter error")]
    SQLite(#[from] rusqlite::Error),
    #[error("experiment {0} does not exist")]
    MissingExperiment(ID),
    #[error("unknown scheduler name '{0}'")]
    UnknownScheduler(CowStr),
    #[error("unknown room type '{0}'")]
    UnknownRoomType(CowStr),
    #[error("path {0} holds no sections")]
    EmptyPath(ID),
}
