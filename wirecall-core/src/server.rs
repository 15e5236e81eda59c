//! Server runtime: accept loop, per-connection frame routing, and typed
//! method handlers over prost messages.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace};

use crate::credentials::ServerCredentials;
use crate::error::{Code, Error, Result, RpcStatus};
use crate::metadata::Metadata;
use crate::wire::{self, frame, Frame, IoStream};

/// Depth of the per-connection outbound frame queue.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Depth of the per-call inbound event queue.
const INBOUND_QUEUE_DEPTH: usize = 32;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RawHandler = Arc<dyn Fn(ServerContext, RawRequestStream) -> BoxFuture + Send + Sync>;

pub(crate) enum Inbound {
    Message(Vec<u8>),
    HalfClose,
    Cancelled,
}

/// The undecoded inbound side of one server call.
pub struct RawRequestStream {
    events: mpsc::Receiver<Inbound>,
}

// -- Per-call server state ----------------------------------------------------

struct ServerCallShared {
    stream_id: u32,
    frames_tx: mpsc::Sender<Frame>,
    request_metadata: Metadata,
    peer: String,
    initial_metadata: Mutex<Metadata>,
    trailing_metadata: Mutex<Metadata>,
    headers_sent: AtomicBool,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl ServerCallShared {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.frames_tx
            .send(frame)
            .await
            .map_err(|_| Error::Call("connection closed".into()))
    }

    /// Emit the staged initial metadata, once, before the first message.
    async fn flush_headers(&self) -> Result<()> {
        if self.headers_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let metadata = self
            .initial_metadata
            .lock()
            .expect("initial metadata lock")
            .clone();
        self.send(Frame::new(
            self.stream_id,
            frame::Kind::Headers(wire::HeadersFrame {
                metadata: wire::metadata_to_wire(&metadata),
            }),
        ))
        .await
    }

    async fn send_message(&self, body: Vec<u8>) -> Result<()> {
        if self.finished.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Call("call is closed".into()));
        }
        self.flush_headers().await?;
        self.send(Frame::new(
            self.stream_id,
            frame::Kind::Message(wire::MessageFrame { body, flags: 0 }),
        ))
        .await
    }

    /// Send the terminal status with the staged trailing metadata. At
    /// most one status leaves per call; nothing is sent after a cancel.
    async fn finish(&self, status: RpcStatus) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut trailers = self
            .trailing_metadata
            .lock()
            .expect("trailing metadata lock")
            .clone();
        trailers.merge(status.trailers.clone());
        self.send(Frame::new(
            self.stream_id,
            frame::Kind::Status(wire::StatusFrame {
                code: status.code as i32,
                details: status.details,
                trailers: wire::metadata_to_wire(&trailers),
            }),
        ))
        .await
    }
}

/// Handler-facing view of one call: the request metadata and the staged
/// response metadata.
#[derive(Clone)]
pub struct ServerContext {
    shared: Arc<ServerCallShared>,
}

impl ServerContext {
    pub fn request_metadata(&self) -> &Metadata {
        &self.shared.request_metadata
    }

    /// Stage initial metadata; it is flushed before the first response
    /// message.
    pub fn set_initial_metadata(&self, metadata: Metadata) {
        *self
            .shared
            .initial_metadata
            .lock()
            .expect("initial metadata lock") = metadata;
    }

    /// Stage trailing metadata; it rides the terminal status.
    pub fn set_trailing_metadata(&self, metadata: Metadata) {
        *self
            .shared
            .trailing_metadata
            .lock()
            .expect("trailing metadata lock") = metadata;
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

/// The decoded inbound message sequence of a streaming call.
pub struct RequestStream<Req> {
    events: mpsc::Receiver<Inbound>,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req: prost::Message + Default> RequestStream<Req> {
    fn new(raw: RawRequestStream) -> RequestStream<Req> {
        RequestStream {
            events: raw.events,
            _marker: PhantomData,
        }
    }

    /// The next request, or `None` once the client has half-closed.
    pub async fn message(&mut self) -> Result<Option<Req>> {
        match self.events.recv().await {
            Some(Inbound::Message(bytes)) => Req::decode(bytes.as_slice())
                .map(Some)
                .map_err(|e| Error::status(Code::Internal, format!("failed to parse client message: {e}"))),
            Some(Inbound::HalfClose) | None => Ok(None),
            Some(Inbound::Cancelled) => {
                Err(Error::status(Code::Cancelled, "call cancelled by client"))
            }
        }
    }
}

/// The outbound message sequence of a streaming call.
pub struct ServerSink<Resp> {
    shared: Arc<ServerCallShared>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp> Clone for ServerSink<Resp> {
    fn clone(&self) -> Self {
        ServerSink {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Resp: prost::Message> ServerSink<Resp> {
    /// Send one response message. Fails once the call is closed; callers
    /// typically stop streaming on error.
    pub async fn send(&self, message: &Resp) -> Result<()> {
        self.shared.send_message(message.encode_to_vec()).await
    }
}

fn status_of(err: Error) -> RpcStatus {
    match err {
        Error::Status(status) => status,
        other => RpcStatus::new(Code::Internal, other.to_string()),
    }
}

// -- Service registration -----------------------------------------------------

/// A named service: a set of typed method handlers.
pub struct Service {
    name: String,
    methods: HashMap<String, RawHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Service {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn register(mut self, method: &str, handler: RawHandler) -> Service {
        self.methods.insert(method.to_string(), handler);
        self
    }

    /// One request, one response.
    pub fn unary<Req, Resp, F, Fut>(self, method: &str, handler: F) -> Service
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, RpcStatus>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            method,
            Arc::new(move |ctx: ServerContext, raw: RawRequestStream| -> BoxFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let mut requests = RequestStream::<Req>::new(raw);
                    let request = match requests.message().await {
                        Ok(Some(request)) => request,
                        Ok(None) => {
                            let _ = ctx
                                .shared
                                .finish(RpcStatus::new(
                                    Code::InvalidArgument,
                                    "missing request message",
                                ))
                                .await;
                            return;
                        }
                        Err(e) => {
                            let _ = ctx.shared.finish(status_of(e)).await;
                            return;
                        }
                    };
                    match handler(ctx.clone(), request).await {
                        Ok(response) => {
                            if ctx
                                .shared
                                .send_message(response.encode_to_vec())
                                .await
                                .is_ok()
                            {
                                let _ = ctx.shared.finish(RpcStatus::ok()).await;
                            }
                        }
                        Err(status) => {
                            let _ = ctx.shared.finish(status).await;
                        }
                    }
                })
            }),
        )
    }

    /// A request sequence, one response.
    pub fn client_streaming<Req, Resp, F, Fut>(self, method: &str, handler: F) -> Service
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(ServerContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, RpcStatus>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            method,
            Arc::new(move |ctx: ServerContext, raw: RawRequestStream| -> BoxFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let requests = RequestStream::<Req>::new(raw);
                    match handler(ctx.clone(), requests).await {
                        Ok(response) => {
                            if ctx
                                .shared
                                .send_message(response.encode_to_vec())
                                .await
                                .is_ok()
                            {
                                let _ = ctx.shared.finish(RpcStatus::ok()).await;
                            }
                        }
                        Err(status) => {
                            let _ = ctx.shared.finish(status).await;
                        }
                    }
                })
            }),
        )
    }

    /// One request, a response sequence.
    pub fn server_streaming<Req, Resp, F, Fut>(self, method: &str, handler: F) -> Service
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(ServerContext, Req, ServerSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), RpcStatus>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            method,
            Arc::new(move |ctx: ServerContext, raw: RawRequestStream| -> BoxFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let mut requests = RequestStream::<Req>::new(raw);
                    let request = match requests.message().await {
                        Ok(Some(request)) => request,
                        Ok(None) => {
                            let _ = ctx
                                .shared
                                .finish(RpcStatus::new(
                                    Code::InvalidArgument,
                                    "missing request message",
                                ))
                                .await;
                            return;
                        }
                        Err(e) => {
                            let _ = ctx.shared.finish(status_of(e)).await;
                            return;
                        }
                    };
                    let sink = ServerSink {
                        shared: ctx.shared.clone(),
                        _marker: PhantomData,
                    };
                    match handler(ctx.clone(), request, sink).await {
                        Ok(()) => {
                            let _ = ctx.shared.finish(RpcStatus::ok()).await;
                        }
                        Err(status) => {
                            let _ = ctx.shared.finish(status).await;
                        }
                    }
                })
            }),
        )
    }

    /// Request and response sequences driven independently.
    pub fn duplex<Req, Resp, F, Fut>(self, method: &str, handler: F) -> Service
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(ServerContext, RequestStream<Req>, ServerSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), RpcStatus>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            method,
            Arc::new(move |ctx: ServerContext, raw: RawRequestStream| -> BoxFuture {
                let handler = handler.clone();
                Box::pin(async move {
                    let requests = RequestStream::<Req>::new(raw);
                    let sink = ServerSink {
                        shared: ctx.shared.clone(),
                        _marker: PhantomData,
                    };
                    match handler(ctx.clone(), requests, sink).await {
                        Ok(()) => {
                            let _ = ctx.shared.finish(RpcStatus::ok()).await;
                        }
                        Err(status) => {
                            let _ = ctx.shared.finish(status).await;
                        }
                    }
                })
            }),
        )
    }
}

// -- Server -------------------------------------------------------------------

pub struct Server;

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            routes: HashMap::new(),
            credentials: ServerCredentials::insecure(),
        }
    }
}

pub struct ServerBuilder {
    routes: HashMap<String, RawHandler>,
    credentials: ServerCredentials,
}

impl ServerBuilder {
    /// Register every method of `service` under `/<service>/<method>`.
    pub fn add_service(mut self, service: Service) -> ServerBuilder {
        for (method, handler) in service.methods {
            self.routes
                .insert(format!("/{}/{}", service.name, method), handler);
        }
        self
    }

    pub fn credentials(mut self, credentials: ServerCredentials) -> ServerBuilder {
        self.credentials = credentials;
        self
    }

    /// Bind a listener; `addr` may use port 0 for an ephemeral port.
    pub async fn bind(self, addr: &str) -> Result<BoundServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let tls = self
            .credentials
            .server_config()?
            .map(|config| TlsAcceptor::from(Arc::new(config)));
        debug!(%local_addr, secure = tls.is_some(), "server bound");
        Ok(BoundServer {
            listener,
            local_addr,
            router: Arc::new(self.routes),
            tls,
        })
    }
}

/// A bound but not yet running server.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<HashMap<String, RawHandler>>,
    tls: Option<TlsAcceptor>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the listener fails.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (tcp, peer) = self.listener.accept().await?;
            let router = self.router.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(tcp, peer, router, tls).await {
                    debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.serve());
        ServerHandle { local_addr, task }
    }
}

/// Handle to a server running in the background. Aborts on drop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// -- Connection driving -------------------------------------------------------

struct LiveCall {
    inbound: mpsc::Sender<Inbound>,
    task: tokio::task::JoinHandle<()>,
    shared: Arc<ServerCallShared>,
}

async fn serve_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    router: Arc<HashMap<String, RawHandler>>,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    let io: Box<dyn IoStream> = match tls {
        Some(acceptor) => Box::new(acceptor.accept(tcp).await?),
        None => Box::new(tcp),
    };
    let (mut read_half, mut write_half) = tokio::io::split(io);
    let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if wire::write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut calls: HashMap<u32, LiveCall> = HashMap::new();
    loop {
        let frame = match wire::read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                trace!(%peer, error = %e, "dropping connection");
                break;
            }
        };
        calls.retain(|_, call| !call.task.is_finished());

        let id = frame.stream_id;
        match frame.kind {
            Some(frame::Kind::Open(open)) => {
                let Some(handler) = router.get(&open.path) else {
                    send_status(
                        &frames_tx,
                        id,
                        RpcStatus::new(
                            Code::Unimplemented,
                            format!("method {:?} is not implemented", open.path),
                        ),
                    )
                    .await;
                    continue;
                };
                let request_metadata = match wire::metadata_from_wire(open.metadata) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        send_status(
                            &frames_tx,
                            id,
                            RpcStatus::new(Code::Internal, format!("bad request metadata: {e}")),
                        )
                        .await;
                        continue;
                    }
                };
                trace!(%peer, stream_id = id, path = %open.path, "call accepted");

                let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
                let shared = Arc::new(ServerCallShared {
                    stream_id: id,
                    frames_tx: frames_tx.clone(),
                    request_metadata,
                    peer: peer.to_string(),
                    initial_metadata: Mutex::new(Metadata::new()),
                    trailing_metadata: Mutex::new(Metadata::new()),
                    headers_sent: AtomicBool::new(false),
                    finished: AtomicBool::new(false),
                    cancelled: AtomicBool::new(false),
                });
                let ctx = ServerContext {
                    shared: shared.clone(),
                };
                let fut = handler(ctx, RawRequestStream { events: inbound_rx });

                let deadline_shared = shared.clone();
                let timeout_ms = open.timeout_ms;
                let task = tokio::spawn(async move {
                    if timeout_ms > 0 {
                        tokio::select! {
                            _ = fut => {}
                            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                                let _ = deadline_shared
                                    .finish(RpcStatus::new(Code::DeadlineExceeded, "Deadline Exceeded"))
                                    .await;
                            }
                        }
                    } else {
                        fut.await;
                    }
                });
                calls.insert(
                    id,
                    LiveCall {
                        inbound: inbound_tx,
                        task,
                        shared,
                    },
                );
            }
            Some(frame::Kind::Message(message)) => {
                if let Some(call) = calls.get(&id) {
                    let _ = call.inbound.send(Inbound::Message(message.body)).await;
                }
            }
            Some(frame::Kind::HalfClose(_)) => {
                if let Some(call) = calls.get(&id) {
                    let _ = call.inbound.send(Inbound::HalfClose).await;
                }
            }
            Some(frame::Kind::Cancel(_)) => {
                if let Some(call) = calls.remove(&id) {
                    trace!(%peer, stream_id = id, "call cancelled by client");
                    call.shared.cancelled.store(true, Ordering::Release);
                    let _ = call.inbound.try_send(Inbound::Cancelled);
                    call.task.abort();
                }
            }
            _ => trace!(%peer, stream_id = id, "unexpected frame kind dropped"),
        }
    }

    for (_, call) in calls {
        call.task.abort();
    }
    writer.abort();
    Ok(())
}

async fn send_status(frames_tx: &mpsc::Sender<Frame>, stream_id: u32, status: RpcStatus) {
    let _ = frames_tx
        .send(Frame::new(
            stream_id,
            frame::Kind::Status(wire::StatusFrame {
                code: status.code as i32,
                details: status.details,
                trailers: wire::metadata_to_wire(&status.trailers),
            }),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_service_routes_by_full_path() {
        let service = Service::new("test.Echo").unary(
            "Ping",
            |_ctx, request: wire::HalfCloseFrame| async move { Ok(request) },
        );
        let builder = Server::builder().add_service(service);
        assert!(builder.routes.contains_key("/test.Echo/Ping"));
    }

    #[test]
    fn status_of_maps_plain_errors_to_internal() {
        let status = status_of(Error::Call("boom".into()));
        assert_eq!(status.code, Code::Internal);

        let status = status_of(Error::status(Code::Cancelled, "gone"));
        assert_eq!(status.code, Code::Cancelled);
    }
}
