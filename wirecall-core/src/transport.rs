use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::batch::{Batch, BatchReply};
use crate::credentials::CallCredentials;
use crate::error::{Result, RpcStatus};

/// An absolute call deadline. `Deadline::infinite()` never expires.
///
/// Deadlines are monotonic (an `Instant`, not wall-clock time) and do not
/// advance once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn infinite() -> Deadline {
        Deadline(None)
    }

    pub fn at(instant: Instant) -> Deadline {
        Deadline(Some(instant))
    }

    pub fn after(timeout: Duration) -> Deadline {
        Deadline(Some(Instant::now() + timeout))
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left until expiry; `None` for an infinite deadline, zero when
    /// already past.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The earlier of two deadlines. Used for deadline propagation from a
    /// parent call.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }
}

impl Default for Deadline {
    fn default() -> Deadline {
        Deadline::infinite()
    }
}

/// Parameters fixed at call creation.
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Full method path, e.g. `/grpc.testing.TestService/UnaryCall`.
    pub path: String,

    /// The `:authority` value for this call.
    pub authority: String,

    pub deadline: Deadline,
}

/// A connected transport able to host calls.
///
/// The transport is an opaque collaborator: anything that can supply the
/// batch semantics of [`TransportCall`] conforms. `wirecall-core` ships
/// one implementation (the framed TCP/TLS channel).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_call(&self, settings: CallSettings) -> Result<Box<dyn TransportCall>>;
}

/// A single in-flight call at the transport layer.
///
/// Batches on the same call are serialized per direction in submission
/// order; a send-side and a recv-side batch may be in flight at once.
#[async_trait]
pub trait TransportCall: Send + Sync {
    /// Submit a batch and wait for every operation in it to complete.
    ///
    /// The batch is atomic: it is validated before any I/O, and a
    /// rejection leaves the call untouched.
    async fn run_batch(&self, batch: Batch) -> Result<BatchReply>;

    /// Tear the call down. The local observer sees `status`; the remote
    /// end sees CANCELLED. The first terminal signal wins; later ones are
    /// suppressed.
    fn cancel(&self, status: RpcStatus);

    /// Override per-call credentials. Must be called before the first
    /// SEND_INITIAL_METADATA batch; requires a secure channel.
    fn set_credentials(&self, credentials: CallCredentials) -> Result<()>;

    /// The remote endpoint's address, as reported by the transport.
    fn peer(&self) -> String;

    /// Whether a terminal status has been observed.
    fn is_terminated(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_deadline_never_expires() {
        let d = Deadline::infinite();
        assert!(d.is_infinite());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn finite_deadline_reports_remaining() {
        let d = Deadline::after(Duration::from_secs(60));
        let remaining = d.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn elapsed_deadline_saturates_to_zero() {
        let d = Deadline::at(Instant::now() - Duration::from_secs(1));
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn min_prefers_the_earlier_deadline() {
        let near = Deadline::after(Duration::from_secs(1));
        let far = Deadline::after(Duration::from_secs(60));
        assert_eq!(near.min(far), near);
        assert_eq!(far.min(near), near);
        assert_eq!(near.min(Deadline::infinite()), near);
        assert!(Deadline::infinite().min(Deadline::infinite()).is_infinite());
    }
}
