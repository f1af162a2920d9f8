//! Reply-side channel to the simulation engine.
//!
//! The controller binds a ZeroMQ REP socket and the engine connects with a
//! REQ socket, so the transport itself enforces strict turn-taking: exactly
//! one reply per request, never two sends in a row. A logical message is one
//! multipart transfer; each part is a frame.
//!
//! The base protocol has no timeout, so receives poll in short slices and
//! check both the configured deadline and the external cancellation flag.
//! That is the only escape hatch from a stalled peer; nothing here retries.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::error::ConnectionError;

/// How long each poll slice waits before re-checking deadline/cancellation.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// A bound reply endpoint exchanging multipart messages with one peer.
pub struct Channel {
    socket: Option<zmq::Socket>,
    endpoint: String,
    recv_timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
}

impl Channel {
    /// Binds a REP socket on `endpoint` (`tcp://addr:port`, `*` for an
    /// ephemeral port).
    pub fn bind(
        endpoint: &str,
        recv_timeout: Option<Duration>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, ConnectionError> {
        let bind_err = |source| ConnectionError::Bind {
            endpoint: endpoint.to_owned(),
            source,
        };
        let context = zmq::Context::new();
        let socket = context.socket(zmq::REP).map_err(bind_err)?;
        socket.set_linger(0).map_err(bind_err)?;
        socket.bind(endpoint).map_err(bind_err)?;
        let resolved = socket
            .get_last_endpoint()
            .map_err(bind_err)?
            .unwrap_or_else(|_| endpoint.to_owned());
        tracing::info!(endpoint = %resolved, "listening for simulation engine");
        Ok(Channel {
            socket: Some(socket),
            endpoint: resolved,
            recv_timeout,
            cancel,
        })
    }

    /// The endpoint actually bound, with any wildcard port resolved.
    pub fn local_endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one logical message; all but the last frame carry SNDMORE.
    pub fn send_frames(&self, frames: &[Vec<u8>]) -> Result<(), ConnectionError> {
        let socket = self.socket()?;
        let Some((last, head)) = frames.split_last() else {
            return Ok(());
        };
        for frame in head {
            socket
                .send(frame.as_slice(), zmq::SNDMORE)
                .map_err(ConnectionError::Send)?;
        }
        socket
            .send(last.as_slice(), 0)
            .map_err(ConnectionError::Send)
    }

    /// Blocks until one full multipart message is available and returns its
    /// frames in order. Honors the receive timeout and the cancellation flag
    /// between poll slices.
    pub fn recv_frames(&self) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let socket = self.socket()?;
        let started = Instant::now();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ConnectionError::Cancelled);
            }
            if let Some(limit) = self.recv_timeout {
                if started.elapsed() >= limit {
                    return Err(ConnectionError::Timeout(limit));
                }
            }
            let ready = socket
                .poll(zmq::POLLIN, POLL_SLICE.as_millis() as i64)
                .map_err(ConnectionError::Recv)?;
            if ready > 0 {
                break;
            }
        }
        let mut frames = Vec::new();
        loop {
            let frame = socket.recv_bytes(0).map_err(ConnectionError::Recv)?;
            frames.push(frame);
            if !socket.get_rcvmore().map_err(ConnectionError::Recv)? {
                break;
            }
        }
        tracing::trace!(frames = frames.len(), "message received");
        Ok(frames)
    }

    /// Releases the binding. Idempotent; errors are logged and swallowed,
    /// close is best-effort on every exit path.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(err) = socket.unbind(&self.endpoint) {
                tracing::debug!(%err, "unbind failed during close");
            }
            tracing::info!(endpoint = %self.endpoint, "channel closed");
        }
    }

    fn socket(&self) -> Result<&zmq::Socket, ConnectionError> {
        self.socket.as_ref().ok_or(ConnectionError::Closed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn bind_rejects_malformed_endpoint() {
        let err = Channel::bind("not-an-endpoint", None, cancel_flag());
        assert!(matches!(err, Err(ConnectionError::Bind { .. })));
    }

    #[test]
    fn wildcard_port_is_resolved() -> Result<(), ConnectionError> {
        let channel = Channel::bind("tcp://127.0.0.1:*", None, cancel_flag())?;
        assert!(!channel.local_endpoint().ends_with(":*"));
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<(), ConnectionError> {
        let mut channel = Channel::bind("tcp://127.0.0.1:*", None, cancel_flag())?;
        channel.close();
        channel.close();
        assert!(matches!(
            channel.recv_frames(),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            channel.send_frames(&[b"x".to_vec()]),
            Err(ConnectionError::Closed)
        ));
        Ok(())
    }

    #[test]
    fn recv_times_out_without_a_peer() -> Result<(), ConnectionError> {
        let channel = Channel::bind(
            "tcp://127.0.0.1:*",
            Some(Duration::from_millis(150)),
            cancel_flag(),
        )?;
        assert!(matches!(
            channel.recv_frames(),
            Err(ConnectionError::Timeout(_))
        ));
        Ok(())
    }

    #[test]
    fn recv_observes_cancellation() -> Result<(), ConnectionError> {
        let cancel = cancel_flag();
        let channel = Channel::bind("tcp://127.0.0.1:*", None, cancel.clone())?;
        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(
            channel.recv_frames(),
            Err(ConnectionError::Cancelled)
        ));
        Ok(())
    }
}
