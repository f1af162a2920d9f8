//! Controller-side synchronization core for OASIS co-simulation.
//!
//! Drives an external simulation engine step-by-step over a single ZeroMQ
//! REQ/REP channel: opening handshake, field registration, time advancement,
//! typed value exchange, and interventions injected at chosen steps. The
//! transport enforces strict turn-taking and the protocol has no
//! resynchronization, so any ordering mistake is fatal for the session; the
//! state machine in [`controller`] exists to make those mistakes impossible
//! to put on the wire.

/// Wire encoding: command framing and the shared msgpack value model.
pub mod codec;

/// Session configuration (bind address, receive timeout, cancellation).
pub mod config;

/// The protocol state machine.
pub mod controller;

/// Step loop: sampling and scheduled interventions.
pub mod driver;

/// Error taxonomy: connection, protocol, and serialization failures.
pub mod error;

/// ZeroMQ reply-side channel, multipart frame transfer.
pub mod transport;

pub use codec::Value;
pub use config::SessionConfig;
pub use controller::{FieldHandle, FieldSpec, SessionState, SimulationController, StepOutcome};
pub use driver::{Intervention, LoopOutcome, Sample, StepLoop};
pub use error::{ConnectionError, Phase, ProtocolError, Result, SerializationError, SyncError};
