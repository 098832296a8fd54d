//! State-machine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    /// A committed log entry failed to decode into a command. This means a
    /// replica disagrees about the log contents and must not guess.
    #[error("undecodable command at log index {index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: bincode::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoordError>;
