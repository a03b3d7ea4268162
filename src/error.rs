use std::io;
use thiserror::Error;

/// Errors surfaced by construction and start/stop operations.
///
/// Steady-state scheduling never propagates errors: a clock glitch during a
/// check is absorbed by rearming the timer and treating the tick as missed.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The monotonic clock could not be read.
    #[error("clock read failed: {reason}")]
    Clock { reason: &'static str },

    /// The event already belongs to a handler.
    #[error("event is already attached to a handler")]
    AlreadyAttached,

    /// A scheduling thread could not be spawned.
    #[error("failed to spawn scheduling thread")]
    Spawn(#[from] io::Error),
}
