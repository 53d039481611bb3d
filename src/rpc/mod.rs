//! The wire contract the engine speaks with its workers.
//!
//! Workers attach to the engine's bus endpoint as peers identified by their
//! slave id; every envelope in either direction carries that id as its first
//! part. [`codec`] defines the framing, [`bus`] the router-style endpoint.

pub mod bus;
pub mod codec;

pub use bus::{Bus, BusHandle};
pub use codec::{Envelope, RpcMessage};

/// Error codes with engine-level meaning. Any other code is passed through
/// to the job's response sink untouched.
pub mod codes {
    /// Malformed request reported by the worker.
    pub const REQUEST_ERROR: u32 = 400;
    /// The application itself is broken; the engine shuts down.
    pub const SERVER_ERROR: u32 = 500;
    /// Application-level failure, transparent to the engine.
    pub const APP_ERROR: u32 = 502;
    /// Admission refused: inactive engine, full queue, or worker death.
    pub const RESOURCE_ERROR: u32 = 503;
    /// Job deadline exceeded while queued.
    pub const DEADLINE_ERROR: u32 = 520;
}
