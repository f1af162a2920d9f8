//! Session state machine for the synchronization protocol.
//!
//! One controller owns one [`Channel`] for the lifetime of a session and
//! enforces the legal token sequence on top of the transport's lockstep
//! guarantee. The peer has no way to reject an out-of-order command, sending
//! one would desynchronize both sides permanently, so every operation checks
//! the session state before touching the wire and every illegal token is
//! fatal: the only valid follow-up is [`SimulationController::close`] and a
//! fresh session.
//!
//! Opening sequence (peer → controller / controller → peer):
//!
//! ```text
//! connect  →           ← ok
//! setup    →           ← field (one per entity) → id
//!                      ← energize
//! ```
//!
//! Thereafter the engine pauses at each checkpoint and the controller drives
//! it with `get`/`set`/`do`/`resume`.

use serde::{Deserialize, Serialize};

use crate::{
    codec::{self, Value},
    config::SessionConfig,
    error::{Phase, ProtocolError, Result, SerializationError},
    transport::Channel,
};

const CONNECT: &str = "connect";
const OK: &str = "ok";
const SETUP: &str = "setup";
const FIELD: &str = "field";
const ENERGIZE: &str = "energize";
const RESUME: &str = "resume";
const GET: &str = "get";
const SET: &str = "set";
const DO: &str = "do";

const PAUSED: &str = "paused";
const FINISHED: &str = "finished";

/// Where a session is in its lifecycle. States only advance; `Paused` is the
/// logical outcome of a `"paused"` step reply and is equivalent to `Running`
/// for operation gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    AwaitConnect,
    Setup,
    RegisteringFields,
    Running,
    Paused,
    Finished,
    Closed,
}

/// Outcome of a single [`SimulationController::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The engine paused at the next checkpoint and awaits further commands.
    Continue,
    /// The simulation ran to completion; no further steps are permitted.
    Done,
}

/// One simulated entity to register with the engine.
///
/// Configuration order is wire-significant: rows are sent as `"Key,Value"`
/// strings in the order name, x, y, z, then `extra` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub extra: Vec<(String, String)>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        FieldSpec {
            name: name.into(),
            x,
            y,
            z,
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn wire_rows(&self) -> Vec<String> {
        // {:?} keeps the decimal point on whole floats: the engine expects
        // "X,1.0", not "X,1".
        let mut rows = vec![
            format!("Name,{}", self.name),
            format!("X,{:?}", self.x),
            format!("Y,{:?}", self.y),
            format!("Z,{:?}", self.z),
        ];
        rows.extend(self.extra.iter().map(|(key, value)| format!("{key},{value}")));
        rows
    }
}

/// Peer-assigned field id; dense, in registration order, immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldHandle {
    pub id: u32,
}

/// Drives one co-simulation session over one bound channel.
pub struct SimulationController {
    config: SessionConfig,
    channel: Option<Channel>,
    state: SessionState,
}

impl SimulationController {
    pub fn new(config: SessionConfig) -> Self {
        SimulationController {
            config,
            channel: None,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The bound endpoint once `initiate` has run, with wildcard ports
    /// resolved.
    pub fn local_endpoint(&self) -> Option<&str> {
        self.channel.as_ref().map(Channel::local_endpoint)
    }

    /// Binds the channel and runs the opening handshake: receive
    /// `"connect"`, reply `"ok"`, receive `"setup"`.
    ///
    /// Any other token fails with [`ProtocolError`] and the channel is
    /// released before returning; there is no internal retry. A later
    /// [`close`](Self::close) remains safe.
    pub fn initiate(&mut self) -> Result<()> {
        self.expect_state(SessionState::Init, "initiate")?;
        let channel = Channel::bind(
            &self.config.endpoint(),
            self.config.recv_timeout,
            self.config.cancel_handle(),
        )?;
        self.channel = Some(channel);
        self.state = SessionState::AwaitConnect;
        if let Err(err) = self.handshake() {
            tracing::warn!(%err, "handshake failed, releasing channel");
            self.close();
            return Err(err);
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        self.expect_token(Phase::Handshake, CONNECT)?;
        self.state = SessionState::Setup;
        let frames = codec::encode_command(OK, &[])?;
        self.channel()?.send_frames(&frames)?;
        self.expect_token(Phase::Handshake, SETUP)?;
        self.state = SessionState::RegisteringFields;
        tracing::info!("handshake complete, peer ready for field registration");
        Ok(())
    }

    /// Registers `specs` in order, one `"field"` command each, and returns
    /// the peer-assigned handles in the same order.
    pub fn configure_fields(&mut self, specs: &[FieldSpec]) -> Result<Vec<FieldHandle>> {
        self.expect_state(SessionState::RegisteringFields, "configure_fields")?;
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let args: Vec<Value> = spec.wire_rows().into_iter().map(Value::Str).collect();
            let reply = self.exchange(FIELD, &args)?;
            let value = codec::decode_value(&reply)?;
            let id = value
                .as_i64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| SerializationError::FieldId(format!("{value:?}")))?;
            tracing::debug!(field = %spec.name, id, "field registered");
            handles.push(FieldHandle { id });
        }
        Ok(handles)
    }

    /// Starts the simulation. The lockstep reply is consumed but its content
    /// is not part of the protocol.
    pub fn energize(&mut self) -> Result<()> {
        self.expect_state(SessionState::RegisteringFields, "energize")?;
        self.exchange(ENERGIZE, &[])?;
        self.state = SessionState::Running;
        tracing::info!("simulation energized");
        Ok(())
    }

    /// Advances the engine to its next checkpoint.
    ///
    /// The raw reply must be exactly `"paused"` or `"finished"`; anything
    /// else is a fatal [`ProtocolError`]. There is no partial-match or
    /// case-insensitive tolerance.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.expect_running("step")?;
        let reply = self.exchange(RESUME, &[])?;
        let raw = codec::decode_raw(&reply)?;
        let text = std::str::from_utf8(raw).map_err(SerializationError::from)?;
        match text {
            PAUSED => {
                self.state = SessionState::Paused;
                Ok(StepOutcome::Continue)
            }
            FINISHED => {
                self.state = SessionState::Finished;
                tracing::info!("simulation finished");
                Ok(StepOutcome::Done)
            }
            other => Err(ProtocolError::UnexpectedToken {
                token: other.to_owned(),
                phase: Phase::StepLoop,
                state: self.state,
                expected: r#""paused" or "finished""#,
            }
            .into()),
        }
    }

    /// Reads one value out of the simulated model, e.g. `"[Weather].Rain"`.
    pub fn get_value(&mut self, path: &str) -> Result<Value> {
        self.expect_running("get_value")?;
        let reply = self.exchange(GET, &[Value::Str(path.to_owned())])?;
        Ok(codec::decode_value(&reply)?)
    }

    /// Writes one value into the simulated model. The acknowledgment is
    /// decoded (so a malformed reply still fails) and discarded.
    pub fn set_value(&mut self, path: &str, value: Value) -> Result<()> {
        self.expect_running("set_value")?;
        let reply = self.exchange(SET, &[Value::Str(path.to_owned()), value])?;
        codec::decode_value(&reply)?;
        Ok(())
    }

    /// Invokes a named action on the engine, e.g. `"applyIrrigation"`, and
    /// returns the decoded acknowledgment.
    pub fn do_action(&mut self, action: &str, params: &[Value]) -> Result<Value> {
        self.expect_running("do_action")?;
        let mut args = Vec::with_capacity(params.len() + 1);
        args.push(Value::Str(action.to_owned()));
        args.extend_from_slice(params);
        let reply = self.exchange(DO, &args)?;
        Ok(codec::decode_value(&reply)?)
    }

    /// Releases the channel. Idempotent and safe on every exit path,
    /// including right after a failed handshake.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if self.state != SessionState::Closed {
            tracing::debug!(state = ?self.state, "session closed");
            self.state = SessionState::Closed;
        }
    }

    /// Sends one command and returns the lockstep reply frames.
    fn exchange(&mut self, token: &str, args: &[Value]) -> Result<Vec<Vec<u8>>> {
        let frames = codec::encode_command(token, args)?;
        tracing::debug!(%token, args = args.len(), "sending command");
        let channel = self.channel()?;
        channel.send_frames(&frames)?;
        Ok(channel.recv_frames()?)
    }

    /// Receives one message and requires its token to be `expected`.
    fn expect_token(&mut self, phase: Phase, expected: &'static str) -> Result<()> {
        let frames = self.channel()?.recv_frames()?;
        let token = codec::token_of(&frames)?;
        tracing::debug!(%token, "received");
        if token == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedToken {
                token: token.to_owned(),
                phase,
                state: self.state,
                expected,
            }
            .into())
        }
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel.as_ref().ok_or_else(|| {
            ProtocolError::BadState {
                op: "io",
                state: self.state,
            }
            .into()
        })
    }

    fn expect_state(&self, wanted: SessionState, op: &'static str) -> Result<()> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(ProtocolError::BadState {
                op,
                state: self.state,
            }
            .into())
        }
    }

    fn expect_running(&self, op: &'static str) -> Result<()> {
        if matches!(self.state, SessionState::Running | SessionState::Paused) {
            Ok(())
        } else {
            Err(ProtocolError::BadState {
                op,
                state: self.state,
            }
            .into())
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        // backstop only; deterministic release is the caller's close()
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn field_rows_keep_wire_order_and_float_form() {
        let spec = FieldSpec::new("CoolField", 1.0, 2.0, 3.5).with_extra("Bird", "duck");
        assert_eq!(
            spec.wire_rows(),
            vec!["Name,CoolField", "X,1.0", "Y,2.0", "Z,3.5", "Bird,duck"]
        );
    }

    #[test]
    fn operations_are_gated_before_initiate() {
        let mut controller = SimulationController::new(SessionConfig::default());
        let err = controller.step().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::BadState { op: "step", .. })
        ));
        let err = controller.get_value("[Clock].Today").unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::BadState { .. })
        ));
        assert_eq!(controller.state(), SessionState::Init);
    }

    #[test]
    fn close_without_initiate_is_safe_and_idempotent() {
        let mut controller = SimulationController::new(SessionConfig::default());
        controller.close();
        controller.close();
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(matches!(
            controller.initiate().unwrap_err(),
            SyncError::Protocol(ProtocolError::BadState { op: "initiate", .. })
        ));
    }
}
