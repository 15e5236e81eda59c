//! The client-side reference transport: one TCP (optionally TLS)
//! connection per channel, calls multiplexed by stream id, batch
//! operations mapped onto the frame protocol of [`crate::wire`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::batch::{Batch, BatchReply};
use crate::call::Call;
use crate::credentials::{CallCredentials, ChannelCredentials};
use crate::error::{Code, Error, Result, RpcStatus};
use crate::metadata::Metadata;
use crate::transport::{CallSettings, Transport, TransportCall};
use crate::wire::{self, frame, Frame, IoStream};

/// Default ceiling on a deserialised inbound message.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Depth of the per-connection outbound frame queue.
const WRITE_QUEUE_DEPTH: usize = 64;


/// Configuration recognised at channel construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// The authority used for TLS hostname matching, when it differs from
    /// the dialled host.
    pub ssl_target_name_override: Option<String>,

    /// Fallback `:authority` value for calls that do not override it.
    pub default_authority: Option<String>,

    /// Prepended to the library's own user-agent string.
    pub primary_user_agent: Option<String>,

    /// Hard ceiling on an inbound message, in bytes.
    pub max_receive_message_size: Option<usize>,
}

/// A connected client channel.
///
/// Channels are internally synchronised and may be shared by any number
/// of concurrent calls; cloning is cheap.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    credentials: ChannelCredentials,
    user_agent: String,
    authority: String,
    max_receive_message_size: usize,
    frames_tx: mpsc::Sender<Frame>,
    streams: Arc<StreamTable>,
    next_stream_id: AtomicU32,
    peer: String,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
    }
}

impl Channel {
    /// Dial `target` (`host:port`) with the given credentials and options.
    ///
    /// The connection is established eagerly; TLS is negotiated when the
    /// credentials are secure.
    pub async fn connect(
        target: &str,
        credentials: ChannelCredentials,
        options: ChannelOptions,
    ) -> Result<Channel> {
        let tcp = TcpStream::connect(target)
            .await
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("failed to connect to {target}: {e}"))))?;
        let peer = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| target.to_string());

        let host = host_of(target);
        let io: Box<dyn IoStream> = match credentials.ssl_credentials() {
            Some(ssl) => {
                let config = ssl.client_config()?;
                let connector = TlsConnector::from(Arc::new(config));
                let sni = options
                    .ssl_target_name_override
                    .clone()
                    .unwrap_or_else(|| host.clone());
                let server_name = rustls::pki_types::ServerName::try_from(sni.as_str())
                    .map_err(|e| Error::InvalidArgument(format!("invalid TLS server name {sni:?}: {e}")))?
                    .to_owned();
                let tls = connector.connect(server_name, tcp).await?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let authority = options
            .default_authority
            .clone()
            .unwrap_or_else(|| host.clone());
        let user_agent = build_user_agent(options.primary_user_agent.as_deref());
        let max_receive_message_size = options
            .max_receive_message_size
            .unwrap_or(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE);

        let (frames_tx, frames_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let streams = Arc::new(StreamTable::default());

        let (read_half, write_half) = tokio::io::split(io);
        let writer = tokio::spawn(write_loop(frames_rx, write_half));
        let reader = tokio::spawn(read_loop(read_half, streams.clone()));

        debug!(%target, %peer, secure = credentials.is_secure(), "channel connected");

        Ok(Channel {
            shared: Arc::new(ChannelShared {
                credentials,
                user_agent,
                authority,
                max_receive_message_size,
                frames_tx,
                streams,
                next_stream_id: AtomicU32::new(1),
                peer,
                tasks: Mutex::new(vec![writer, reader]),
            }),
        })
    }

    /// The `:authority` used for calls that do not override it.
    pub fn authority(&self) -> &str {
        &self.shared.authority
    }

    /// Whether this channel carries transport security.
    pub fn is_secure(&self) -> bool {
        self.shared.credentials.is_secure()
    }

    /// Start a call and wrap it in a [`Call`] handle.
    pub(crate) async fn new_call(&self, settings: CallSettings) -> Result<Call> {
        let deadline = settings.deadline;
        let transport = self.start_call(settings).await?;
        Ok(Call::new(transport, deadline))
    }
}

#[async_trait]
impl Transport for Channel {
    async fn start_call(&self, settings: CallSettings) -> Result<Box<dyn TransportCall>> {
        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(StreamState::new(
            id,
            self.shared.frames_tx.clone(),
            self.shared.max_receive_message_size,
        ));
        self.shared.streams.insert(id, stream.clone());
        trace!(stream_id = id, path = %settings.path, "call started");

        Ok(Box::new(ClientCall {
            shared: self.shared.clone(),
            stream,
            settings,
            per_call_credentials: Mutex::new(None),
            open_sent: AtomicBool::new(false),
            open_signal: watch::channel(false).0,
            send_gate: tokio::sync::Mutex::new(()),
            recv_gate: tokio::sync::Mutex::new(()),
        }))
    }
}

fn build_user_agent(primary: Option<&str>) -> String {
    let base = format!("wirecall-rust/{}", env!("CARGO_PKG_VERSION"));
    match primary {
        Some(custom) => format!("{custom} {base}"),
        None => base,
    }
}

fn host_of(target: &str) -> String {
    let host = match target.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => target,
    };
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

async fn write_loop(
    mut frames_rx: mpsc::Receiver<Frame>,
    mut write_half: tokio::io::WriteHalf<Box<dyn IoStream>>,
) {
    while let Some(frame) = frames_rx.recv().await {
        if let Err(e) = wire::write_frame(&mut write_half, &frame).await {
            warn!(error = %e, "connection write failed");
            break;
        }
    }
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<Box<dyn IoStream>>,
    streams: Arc<StreamTable>,
) {
    loop {
        match wire::read_frame(&mut read_half).await {
            Ok(Some(frame)) => streams.dispatch(frame),
            Ok(None) => {
                streams.fail_all(RpcStatus::new(Code::Unavailable, "connection closed"));
                return;
            }
            Err(e) => {
                streams.fail_all(RpcStatus::new(
                    Code::Unavailable,
                    format!("connection error: {e}"),
                ));
                return;
            }
        }
    }
}

// -- Per-connection stream table ----------------------------------------------

#[derive(Default)]
struct StreamTable {
    streams: Mutex<HashMap<u32, Arc<StreamState>>>,
}

impl StreamTable {
    fn insert(&self, id: u32, stream: Arc<StreamState>) {
        self.streams.lock().expect("streams lock").insert(id, stream);
    }

    fn remove(&self, id: u32) {
        self.streams.lock().expect("streams lock").remove(&id);
    }

    fn get(&self, id: u32) -> Option<Arc<StreamState>> {
        self.streams.lock().expect("streams lock").get(&id).cloned()
    }

    fn dispatch(&self, frame: Frame) {
        let Some(stream) = self.get(frame.stream_id) else {
            trace!(stream_id = frame.stream_id, "frame for unknown stream dropped");
            return;
        };
        match frame.kind {
            Some(frame::Kind::Headers(headers)) => match wire::metadata_from_wire(headers.metadata)
            {
                Ok(md) => stream.on_initial_metadata(md),
                Err(e) => stream.terminate_local(
                    RpcStatus::new(Code::Internal, format!("bad metadata from server: {e}")),
                    false,
                ),
            },
            Some(frame::Kind::Message(message)) => stream.on_message(message.body),
            Some(frame::Kind::Status(status)) => {
                let trailers = wire::metadata_from_wire(status.trailers).unwrap_or_default();
                stream.on_remote_status(
                    RpcStatus::new(Code::from_i32(status.code), status.details)
                        .with_trailers(trailers),
                );
                self.remove(frame.stream_id);
            }
            _ => trace!(stream_id = frame.stream_id, "unexpected frame kind dropped"),
        }
    }

    fn fail_all(&self, status: RpcStatus) {
        let streams: Vec<Arc<StreamState>> = self
            .streams
            .lock()
            .expect("streams lock")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for stream in streams {
            stream.on_remote_status(status.clone());
        }
    }
}

// -- Per-call receive state ---------------------------------------------------

struct StreamState {
    id: u32,
    frames_tx: mpsc::Sender<Frame>,
    max_receive_message_size: usize,
    version: watch::Sender<u64>,
    queues: Mutex<RecvQueues>,
    deadline_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
struct RecvQueues {
    initial_metadata: Option<Metadata>,
    initial_consumed: bool,
    messages: VecDeque<Vec<u8>>,
    status: Option<RpcStatus>,
    /// Set on local termination (cancel, deadline, oversize message):
    /// further inbound data is dropped.
    ignore_incoming: bool,
}

impl StreamState {
    fn new(id: u32, frames_tx: mpsc::Sender<Frame>, max_receive_message_size: usize) -> StreamState {
        StreamState {
            id,
            frames_tx,
            max_receive_message_size,
            version: watch::channel(0).0,
            queues: Mutex::new(RecvQueues::default()),
            deadline_timer: Mutex::new(None),
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn is_terminated(&self) -> bool {
        self.queues.lock().expect("queues lock").status.is_some()
    }

    fn arm_deadline(self: &Arc<Self>, at: std::time::Instant) {
        let stream = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            stream.terminate_local(
                RpcStatus::new(Code::DeadlineExceeded, "Deadline Exceeded"),
                true,
            );
        });
        *self.deadline_timer.lock().expect("deadline lock") = Some(handle);
    }

    fn abort_deadline(&self) {
        if let Some(handle) = self.deadline_timer.lock().expect("deadline lock").take() {
            handle.abort();
        }
    }

    fn on_initial_metadata(&self, metadata: Metadata) {
        {
            let mut q = self.queues.lock().expect("queues lock");
            if q.ignore_incoming || q.initial_consumed {
                return;
            }
            q.initial_metadata = Some(metadata);
        }
        self.bump();
    }

    fn on_message(&self, body: Vec<u8>) {
        let oversize = body.len() > self.max_receive_message_size;
        if oversize {
            self.terminate_local(
                RpcStatus::new(
                    Code::ResourceExhausted,
                    format!(
                        "Received message larger than max ({} vs. {})",
                        body.len(),
                        self.max_receive_message_size
                    ),
                ),
                true,
            );
            return;
        }
        {
            let mut q = self.queues.lock().expect("queues lock");
            if q.ignore_incoming || q.status.is_some() {
                return;
            }
            q.messages.push_back(body);
        }
        self.bump();
    }

    fn on_remote_status(&self, status: RpcStatus) {
        {
            let mut q = self.queues.lock().expect("queues lock");
            if q.status.is_some() {
                return;
            }
            q.status = Some(status);
        }
        self.abort_deadline();
        self.bump();
    }

    /// Terminate locally: the given status wins if none has been observed
    /// yet, queued data is discarded, and (optionally) a Cancel frame
    /// tears the call down at the server.
    fn terminate_local(&self, status: RpcStatus, send_cancel: bool) {
        {
            let mut q = self.queues.lock().expect("queues lock");
            if q.status.is_some() {
                return;
            }
            q.status = Some(status);
            q.ignore_incoming = true;
            q.messages.clear();
        }
        self.abort_deadline();
        if send_cancel {
            send_best_effort(
                &self.frames_tx,
                Frame::new(self.id, frame::Kind::Cancel(wire::CancelFrame {})),
            );
        }
        self.bump();
    }

    /// Wait for initial metadata; resolves with an empty map when the
    /// call terminates without headers. Delivered at most once.
    async fn await_initial_metadata(&self) -> Metadata {
        let mut rx = self.version.subscribe();
        loop {
            {
                let mut q = self.queues.lock().expect("queues lock");
                if let Some(md) = q.initial_metadata.take() {
                    q.initial_consumed = true;
                    return md;
                }
                if q.initial_consumed || q.status.is_some() {
                    return Metadata::new();
                }
            }
            if rx.changed().await.is_err() {
                return Metadata::new();
            }
        }
    }

    /// Wait for the next message; `None` marks end of stream. Queued
    /// messages are drained before a terminal status ends the stream.
    async fn await_message(&self) -> Option<Vec<u8>> {
        let mut rx = self.version.subscribe();
        loop {
            {
                let mut q = self.queues.lock().expect("queues lock");
                if let Some(body) = q.messages.pop_front() {
                    return Some(body);
                }
                if q.status.is_some() {
                    return None;
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Wait for the terminal status.
    async fn await_status(&self) -> RpcStatus {
        let mut rx = self.version.subscribe();
        loop {
            {
                let q = self.queues.lock().expect("queues lock");
                if let Some(ref status) = q.status {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                return RpcStatus::new(Code::Unavailable, "connection closed");
            }
        }
    }
}

fn send_best_effort(tx: &mpsc::Sender<Frame>, frame: Frame) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let tx = tx.clone();
                handle.spawn(async move {
                    let _ = tx.send(frame).await;
                });
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

// -- The transport call -------------------------------------------------------

struct ClientCall {
    shared: Arc<ChannelShared>,
    stream: Arc<StreamState>,
    settings: CallSettings,
    per_call_credentials: Mutex<Option<CallCredentials>>,
    open_sent: AtomicBool,
    /// Signalled once the initial-metadata batch has run (or the call
    /// died first): message/close batches hold their frames until then,
    /// so the Open frame always leads even when the opening batch runs
    /// on another task.
    open_signal: watch::Sender<bool>,
    /// Serializes send-side batches; held only while frames are written.
    send_gate: tokio::sync::Mutex<()>,
    /// Serializes recv-side batches.
    recv_gate: tokio::sync::Mutex<()>,
}

impl ClientCall {
    /// The URI handed to call-credential generators: scheme, authority
    /// and the service portion of the method path.
    fn authority_uri(&self) -> String {
        let scheme = if self.shared.credentials.is_secure() {
            "https"
        } else {
            "http"
        };
        let service_path = match self.settings.path.rfind('/') {
            Some(idx) if idx > 0 => &self.settings.path[..idx],
            _ => "",
        };
        format!("{scheme}://{}{service_path}", self.settings.authority)
    }

    /// Resolve the effective call credentials: channel-attached first,
    /// then the per-call override.
    fn effective_credentials(&self) -> Option<CallCredentials> {
        let attached = self.shared.credentials.attached_call_credentials();
        let override_creds = self
            .per_call_credentials
            .lock()
            .expect("credentials lock")
            .clone();
        match (attached, override_creds) {
            (Some(a), Some(b)) => Some(a.compose(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    async fn send_open(&self, metadata: Metadata) -> Result<()> {
        let mut merged = metadata;
        if let Some(credentials) = self.effective_credentials() {
            match credentials.generate(&self.authority_uri()).await {
                Ok(md) => merged.merge(md),
                Err(status) => {
                    // The call fails with the generator's status; the recv
                    // side observes it, the open frame is never sent.
                    self.stream.terminate_local(status, false);
                    return Ok(());
                }
            }
        }
        merged.set("user-agent", self.shared.user_agent.clone())?;

        let timeout_ms = match self.settings.deadline.remaining() {
            Some(remaining) => remaining.as_millis().max(1) as u64,
            None => 0,
        };

        let open = Frame::new(
            self.stream.id,
            frame::Kind::Open(wire::OpenFrame {
                path: self.settings.path.clone(),
                authority: self.settings.authority.clone(),
                timeout_ms,
                metadata: wire::metadata_to_wire(&merged),
            }),
        );
        self.open_sent.store(true, Ordering::Release);
        self.send_frame(open).await?;

        if let Some(at) = self.settings.deadline.instant() {
            self.stream.arm_deadline(at);
        }
        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.shared
            .frames_tx
            .send(frame)
            .await
            .map_err(|_| Error::Call("connection closed".into()))
    }

    fn mark_open(&self) {
        let _ = self.open_signal.send(true);
    }

    /// Wait until the opening batch has run. The driver issues it
    /// concurrently, so the wait is short-lived.
    async fn wait_for_open(&self) {
        let mut rx = self.open_signal.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl TransportCall for ClientCall {
    async fn run_batch(&self, batch: Batch) -> Result<BatchReply> {
        let Batch {
            send_initial_metadata,
            send_message,
            send_close,
            recv_initial_metadata,
            recv_message,
            recv_status,
        } = batch;

        if send_initial_metadata.is_some() || send_message.is_some() || send_close {
            if send_initial_metadata.is_none() {
                // This batch follows the opening one; hold its frames
                // until the Open frame has gone out.
                self.wait_for_open().await;
            }
            let _gate = self.send_gate.lock().await;
            // Writes on a terminated call are dropped without error; the
            // failure surfaces through the final status.
            if let Some(metadata) = send_initial_metadata {
                let opened = if self.stream.is_terminated() {
                    Ok(())
                } else {
                    self.send_open(metadata).await
                };
                self.mark_open();
                opened?;
            }
            if !self.stream.is_terminated() {
                if let Some(message) = send_message {
                    self.send_frame(Frame::new(
                        self.stream.id,
                        frame::Kind::Message(wire::MessageFrame {
                            body: message.body,
                            flags: message.flags,
                        }),
                    ))
                    .await?;
                }
                if send_close {
                    self.send_frame(Frame::new(
                        self.stream.id,
                        frame::Kind::HalfClose(wire::HalfCloseFrame {}),
                    ))
                    .await?;
                }
            }
        }

        let mut reply = BatchReply::default();
        if recv_initial_metadata || recv_message || recv_status {
            let _gate = self.recv_gate.lock().await;
            if recv_initial_metadata {
                reply.initial_metadata = Some(self.stream.await_initial_metadata().await);
            }
            if recv_message {
                reply.message = Some(self.stream.await_message().await);
            }
            if recv_status {
                reply.status = Some(self.stream.await_status().await);
            }
        }
        Ok(reply)
    }

    fn cancel(&self, status: RpcStatus) {
        self.stream.terminate_local(status, true);
    }

    fn set_credentials(&self, credentials: CallCredentials) -> Result<()> {
        if !self.shared.credentials.is_secure() {
            return Err(Error::InvalidArgument(
                "call credentials require a secure channel".into(),
            ));
        }
        if self.open_sent.load(Ordering::Acquire) {
            return Err(Error::Call(
                "credentials must be set before initial metadata is sent".into(),
            ));
        }
        *self.per_call_credentials.lock().expect("credentials lock") = Some(credentials);
        Ok(())
    }

    fn peer(&self) -> String {
        self.shared.peer.clone()
    }

    fn is_terminated(&self) -> bool {
        self.stream.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_default() {
        let ua = build_user_agent(None);
        assert!(ua.starts_with("wirecall-rust/"));
    }

    #[test]
    fn user_agent_prepends_primary() {
        let ua = build_user_agent(Some("my-app/1.0"));
        assert!(ua.starts_with("my-app/1.0 wirecall-rust/"));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("localhost:50051"), "localhost");
        assert_eq!(host_of("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("bare-host"), "bare-host");
    }

    #[tokio::test]
    async fn local_termination_wins_over_remote_status() {
        let (tx, _rx) = mpsc::channel(4);
        let stream = Arc::new(StreamState::new(1, tx, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE));
        stream.terminate_local(RpcStatus::cancelled("Cancelled on client"), false);
        stream.on_remote_status(RpcStatus::ok());
        assert_eq!(stream.await_status().await.code, Code::Cancelled);
    }

    #[tokio::test]
    async fn messages_drain_before_end_of_stream() {
        let (tx, _rx) = mpsc::channel(4);
        let stream = Arc::new(StreamState::new(1, tx, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE));
        stream.on_message(vec![1]);
        stream.on_message(vec![2]);
        stream.on_remote_status(RpcStatus::ok());
        assert_eq!(stream.await_message().await, Some(vec![1]));
        assert_eq!(stream.await_message().await, Some(vec![2]));
        assert_eq!(stream.await_message().await, None);
    }

    #[tokio::test]
    async fn cancellation_discards_queued_messages() {
        let (tx, _rx) = mpsc::channel(4);
        let stream = Arc::new(StreamState::new(1, tx, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE));
        stream.on_message(vec![1]);
        stream.terminate_local(RpcStatus::cancelled("Cancelled on client"), false);
        assert_eq!(stream.await_message().await, None);
        assert_eq!(stream.await_status().await.code, Code::Cancelled);
    }

    #[tokio::test]
    async fn oversize_message_exhausts_the_call() {
        let (tx, mut rx) = mpsc::channel(4);
        let stream = Arc::new(StreamState::new(1, tx, 8));
        stream.on_message(vec![0u8; 9]);
        assert_eq!(stream.await_status().await.code, Code::ResourceExhausted);
        // A cancel frame tears the call down at the server.
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame.kind, Some(frame::Kind::Cancel(_))));
    }

    #[tokio::test]
    async fn initial_metadata_delivered_at_most_once() {
        let (tx, _rx) = mpsc::channel(4);
        let stream = Arc::new(StreamState::new(1, tx, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE));
        let mut md = Metadata::new();
        md.add("k", "v").unwrap();
        stream.on_initial_metadata(md);
        let first = stream.await_initial_metadata().await;
        assert!(first.get("k").is_some());
        stream.on_remote_status(RpcStatus::ok());
        let second = stream.await_initial_metadata().await;
        assert!(second.is_empty());
    }
}
