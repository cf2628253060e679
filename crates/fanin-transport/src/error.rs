//! Construction-time error taxonomy.
//!
//! The running protocol never surfaces errors to its caller — loss,
//! reordering, collisions, and congestion are all recovered in-band.
//! Errors exist only where a component is built from configuration.

use thiserror::Error;

/// Errors raised while building protocol components.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FaninError {
    /// The application asked for more logical slots than the physical table holds.
    /// The slot map must stay injective, so this cannot be probed around.
    #[error("slot map needs {needed} slots but the table holds {capacity}")]
    SlotMapOversubscribed { needed: usize, capacity: usize },

    /// Worker ids index into the 32-bit participation bitmap.
    #[error("worker id {0} exceeds the participation bitmap width")]
    WorkerIdOutOfRange(u8),

    /// Fan-in counts contributors in the 32-bit participation bitmap.
    #[error("fan-in {0} is outside the participation bitmap width")]
    FanInOutOfRange(u8),
}
