use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::batch::{Batch, BatchReply};
use crate::credentials::CallCredentials;
use crate::error::{Code, Error, Result, RpcStatus};
use crate::transport::{Deadline, TransportCall};

/// A single in-flight RPC.
///
/// The handle owns the per-call lifetime invariants: initial metadata and
/// the client half-close are sent at most once, and exactly one
/// RECV_STATUS_ON_CLIENT completes. Once that status has been delivered
/// the call is terminal and every further batch fails without I/O.
///
/// Cloning yields another handle to the same call; drivers keep one owner
/// per direction.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    transport: Box<dyn TransportCall>,
    deadline: Deadline,
    sent_initial_metadata: AtomicBool,
    sent_close: AtomicBool,
    recv_status_issued: AtomicBool,
    status_delivered: AtomicBool,
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<CallInner>>>,
}

impl Call {
    pub(crate) fn new(transport: Box<dyn TransportCall>, deadline: Deadline) -> Call {
        Call {
            inner: Arc::new(CallInner {
                transport,
                deadline,
                sent_initial_metadata: AtomicBool::new(false),
                sent_close: AtomicBool::new(false),
                recv_status_issued: AtomicBool::new(false),
                status_delivered: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// Whether the final status has been delivered to the application.
    pub fn is_terminated(&self) -> bool {
        self.inner.status_delivered.load(Ordering::Acquire)
    }

    /// Whether a terminal signal (remote status, deadline, cancel) has
    /// been observed at the transport, even if not yet delivered.
    pub fn transport_terminated(&self) -> bool {
        self.inner.transport.is_terminated()
    }

    /// Submit a batch and wait for all of its operations to complete.
    pub async fn run_batch(&self, batch: Batch) -> Result<BatchReply> {
        if batch.is_empty() {
            return Err(Error::InvalidArgument("batch contains no operations".into()));
        }
        if self.is_terminated() {
            return Err(Error::Call("call already finished".into()));
        }

        // Claim the once-per-call slots before touching the transport.
        if batch.send_initial_metadata.is_some()
            && self
                .inner
                .sent_initial_metadata
                .swap(true, Ordering::AcqRel)
        {
            return Err(Error::Call("initial metadata already sent".into()));
        }
        if batch.send_close && self.inner.sent_close.swap(true, Ordering::AcqRel) {
            return Err(Error::Call("client already half-closed".into()));
        }
        if batch.recv_status && self.inner.recv_status_issued.swap(true, Ordering::AcqRel) {
            return Err(Error::Call("status already requested".into()));
        }

        let reply = self.inner.transport.run_batch(batch).await?;
        if reply.status.is_some() {
            self.inner.status_delivered.store(true, Ordering::Release);
        }
        Ok(reply)
    }

    /// Cancel the call. The local observer and the remote end both see
    /// CANCELLED. A no-op once a terminal status has been observed.
    pub fn cancel(&self) {
        self.cancel_with_status(Code::Cancelled, "Cancelled on client");
    }

    /// Cancel the call, reporting `code`/`details` to the local observer
    /// only; the remote end sees CANCELLED.
    pub fn cancel_with_status(&self, code: Code, details: impl Into<String>) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let details = details.into();
        debug!(code = code.name(), %details, "cancelling call");
        self.inner
            .transport
            .cancel(RpcStatus::new(code, details.clone()));

        let children = self.inner.children.lock().expect("children lock");
        for child in children.iter() {
            if let Some(inner) = child.upgrade() {
                Call { inner }.cancel();
            }
        }
    }

    /// Override per-call credentials. Only valid before the first batch
    /// that sends initial metadata, and only on secure channels.
    pub fn set_credentials(&self, credentials: CallCredentials) -> Result<()> {
        if self.inner.sent_initial_metadata.load(Ordering::Acquire) {
            return Err(Error::Call(
                "credentials must be set before initial metadata is sent".into(),
            ));
        }
        self.inner.transport.set_credentials(credentials)
    }

    /// The remote endpoint's address as reported by the transport.
    pub fn peer(&self) -> String {
        self.inner.transport.peer()
    }

    /// Register `child` for transitive cancellation when this call is
    /// cancelled.
    pub(crate) fn register_child(&self, child: &Call) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            child.cancel();
            return;
        }
        self.inner
            .children
            .lock()
            .expect("children lock")
            .push(Arc::downgrade(&child.inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OutboundMessage;
    use crate::metadata::Metadata;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// A transport stub that records cancellations and completes every
    /// batch with a canned status.
    struct StubTransport {
        shared: Arc<StubShared>,
    }

    #[derive(Default)]
    struct StubShared {
        cancels: AtomicUsize,
        terminated: AtomicBool,
    }

    impl StubTransport {
        fn new() -> StubTransport {
            StubTransport {
                shared: Arc::new(StubShared::default()),
            }
        }
    }

    #[async_trait]
    impl TransportCall for StubTransport {
        async fn run_batch(&self, batch: Batch) -> Result<BatchReply> {
            let mut reply = BatchReply::default();
            if batch.recv_initial_metadata {
                reply.initial_metadata = Some(Metadata::new());
            }
            if batch.recv_message {
                reply.message = Some(None);
            }
            if batch.recv_status {
                reply.status = Some(RpcStatus::ok());
            }
            Ok(reply)
        }

        fn cancel(&self, _status: RpcStatus) {
            self.shared.cancels.fetch_add(1, Ordering::SeqCst);
            self.shared.terminated.store(true, Ordering::SeqCst);
        }

        fn set_credentials(&self, _credentials: CallCredentials) -> Result<()> {
            Ok(())
        }

        fn peer(&self) -> String {
            "127.0.0.1:1".into()
        }

        fn is_terminated(&self) -> bool {
            self.shared.terminated.load(Ordering::SeqCst)
        }
    }

    fn stub_call() -> (Call, Arc<StubShared>) {
        let transport = StubTransport::new();
        let shared = transport.shared.clone();
        (Call::new(Box::new(transport), Deadline::infinite()), shared)
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let (call, _) = stub_call();
        let err = call.run_batch(Batch::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn initial_metadata_sent_at_most_once() {
        let (call, _) = stub_call();
        call.run_batch(Batch::new().send_initial_metadata(Metadata::new()))
            .await
            .unwrap();
        let err = call
            .run_batch(Batch::new().send_initial_metadata(Metadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Call(_)));
    }

    #[tokio::test]
    async fn half_close_sent_at_most_once() {
        let (call, _) = stub_call();
        call.run_batch(Batch::new().send_close()).await.unwrap();
        let err = call.run_batch(Batch::new().send_close()).await.unwrap_err();
        assert!(matches!(err, Error::Call(_)));
    }

    #[tokio::test]
    async fn status_delivery_makes_the_call_terminal() {
        let (call, _) = stub_call();
        let reply = call.run_batch(Batch::new().recv_status()).await.unwrap();
        assert!(reply.status.unwrap().is_ok());
        assert!(call.is_terminated());

        let err = call
            .run_batch(Batch::new().send_message(OutboundMessage::new(vec![1])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Call(_)));
    }

    #[tokio::test]
    async fn cancel_reaches_the_transport_once() {
        let (call, shared) = stub_call();
        call.cancel();
        call.cancel();
        call.cancel_with_status(Code::Aborted, "late");
        assert_eq!(shared.cancels.load(Ordering::SeqCst), 1);
        assert!(call.transport_terminated());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let (parent, _) = stub_call();
        let (child, child_shared) = stub_call();
        parent.register_child(&child);
        parent.cancel();
        assert_eq!(child_shared.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn child_registered_after_cancel_is_cancelled_immediately() {
        let (parent, _) = stub_call();
        parent.cancel();
        let (child, child_shared) = stub_call();
        parent.register_child(&child);
        assert_eq!(child_shared.cancels.load(Ordering::SeqCst), 1);
    }
}
