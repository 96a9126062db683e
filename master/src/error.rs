//! Startup error type shared by the configuration surface
//!
//! Steady-state conditions (quota hit, list full, loopback refused) are not
//! errors: they are logged as warnings and turn into a "not added" result.
//! Everything here is fatal at startup and aborts initialization.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    /// Malformed or contradictory option parameters
    #[error("invalid option parameters: {0}")]
    InvalidOptParams(String),

    /// A mapping endpoint could not be resolved to an IPv4 address
    #[error("can't resolve {0}")]
    ResolutionFailed(String),

    /// Two address mappings share the same source endpoint
    #[error("several mappings are declared for address {0}")]
    DuplicateMapping(String),
}
