//! The call surface: per-shape drivers that turn method invocations into
//! batch sequences, and the client factory that dispatches on a method
//! descriptor map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::batch::{Batch, OutboundMessage};
use crate::call::Call;
use crate::channel::Channel;
use crate::credentials::CallCredentials;
use crate::error::{Code, Error, Result, RpcStatus};
use crate::metadata::Metadata;
use crate::transport::{CallSettings, Deadline};

/// Propagate the parent call's deadline to the child.
pub const PROPAGATE_DEADLINE: u32 = 0x1;
/// Cancel the child when the parent call is cancelled.
pub const PROPAGATE_CANCELLATION: u32 = 0x2;
/// Both propagation behaviors.
pub const PROPAGATE_DEFAULTS: u32 = PROPAGATE_DEADLINE | PROPAGATE_CANCELLATION;

/// Per-call options recognised at invocation.
#[derive(Clone)]
pub struct CallOptions {
    /// Absolute deadline; infinite by default.
    pub deadline: Deadline,

    /// Authority override for this call.
    pub host: Option<String>,

    /// Parent call, for propagation.
    pub parent: Option<Call>,

    /// Which parent attributes to propagate.
    pub propagate_flags: u32,

    /// Per-call credential override. Requires a secure channel.
    pub credentials: Option<CallCredentials>,

    /// Per-message send flags.
    pub flags: u32,
}

impl Default for CallOptions {
    fn default() -> CallOptions {
        CallOptions {
            deadline: Deadline::infinite(),
            host: None,
            parent: None,
            propagate_flags: PROPAGATE_DEFAULTS,
            credentials: None,
            flags: 0,
        }
    }
}

type SerializeFn<Req> = Arc<dyn Fn(&Req) -> std::result::Result<Vec<u8>, String> + Send + Sync>;
type DeserializeFn<Resp> =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Resp, String> + Send + Sync>;

/// Describes one method: its wire path, its shape, and the opaque byte
/// codec supplied by the caller.
pub struct MethodDescriptor<Req, Resp> {
    path: String,
    request_streaming: bool,
    response_streaming: bool,
    serialize: SerializeFn<Req>,
    deserialize: DeserializeFn<Resp>,
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        MethodDescriptor {
            path: self.path.clone(),
            request_streaming: self.request_streaming,
            response_streaming: self.response_streaming,
            serialize: self.serialize.clone(),
            deserialize: self.deserialize.clone(),
        }
    }
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub fn new(
        path: impl Into<String>,
        request_streaming: bool,
        response_streaming: bool,
        serialize: impl Fn(&Req) -> std::result::Result<Vec<u8>, String> + Send + Sync + 'static,
        deserialize: impl Fn(&[u8]) -> std::result::Result<Resp, String> + Send + Sync + 'static,
    ) -> MethodDescriptor<Req, Resp> {
        MethodDescriptor {
            path: path.into(),
            request_streaming,
            response_streaming,
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_streaming(&self) -> bool {
        self.request_streaming
    }

    pub fn response_streaming(&self) -> bool {
        self.response_streaming
    }
}

impl<Req, Resp> MethodDescriptor<Req, Resp>
where
    Req: prost::Message,
    Resp: prost::Message + Default,
{
    /// A descriptor over prost-encoded messages.
    pub fn prost(
        path: impl Into<String>,
        request_streaming: bool,
        response_streaming: bool,
    ) -> MethodDescriptor<Req, Resp> {
        MethodDescriptor::new(
            path,
            request_streaming,
            response_streaming,
            |req: &Req| Ok(req.encode_to_vec()),
            |bytes: &[u8]| Resp::decode(bytes).map_err(|e| e.to_string()),
        )
    }
}

struct MethodEntry {
    request_streaming: bool,
    response_streaming: bool,
    descriptor: Box<dyn Any + Send + Sync>,
}

/// A mapping `method name -> descriptor` for one fully-qualified service.
pub struct ServiceDescriptor {
    service: String,
    methods: HashMap<String, MethodEntry>,
}

impl ServiceDescriptor {
    pub fn new(service: impl Into<String>) -> ServiceDescriptor {
        ServiceDescriptor {
            service: service.into(),
            methods: HashMap::new(),
        }
    }

    pub fn method<Req: Send + Sync + 'static, Resp: Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        descriptor: MethodDescriptor<Req, Resp>,
    ) -> ServiceDescriptor {
        let entry = MethodEntry {
            request_streaming: descriptor.request_streaming,
            response_streaming: descriptor.response_streaming,
            descriptor: Box::new(descriptor),
        };
        self.methods.insert(name.into(), entry);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }
}

fn validate_method_names(descriptor: &ServiceDescriptor) -> Result<()> {
    for name in descriptor.methods.keys() {
        if name.starts_with('$') {
            return Err(Error::InvalidArgument(format!(
                "cannot construct client; method name {name:?} uses the reserved \"$\" prefix"
            )));
        }
    }
    Ok(())
}

/// Message, initial metadata and trailing metadata of a completed
/// single-response call.
#[derive(Debug)]
pub struct UnaryReply<Resp> {
    pub message: Resp,
    pub initial_metadata: Metadata,
    pub trailing_metadata: Metadata,
}

/// A client bound to one service's method descriptor map.
#[derive(Clone)]
pub struct Client {
    channel: Channel,
    descriptor: Arc<ServiceDescriptor>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}

impl Client {
    /// Bind `descriptor` to `channel`.
    ///
    /// Method names beginning with `$` are reserved for internal client
    /// fields and rejected here.
    pub fn new(channel: Channel, descriptor: ServiceDescriptor) -> Result<Client> {
        validate_method_names(&descriptor)?;
        Ok(Client {
            channel,
            descriptor: Arc::new(descriptor),
        })
    }

    pub fn service_name(&self) -> &str {
        self.descriptor.service_name()
    }

    fn resolve<Req: 'static, Resp: 'static>(
        &self,
        method: &str,
        request_streaming: bool,
        response_streaming: bool,
    ) -> Result<MethodDescriptor<Req, Resp>> {
        let entry = self.descriptor.methods.get(method).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "service {:?} has no method {method:?}",
                self.descriptor.service
            ))
        })?;
        if entry.request_streaming != request_streaming
            || entry.response_streaming != response_streaming
        {
            return Err(Error::InvalidArgument(format!(
                "method {method:?} has a different streaming shape"
            )));
        }
        entry
            .descriptor
            .downcast_ref::<MethodDescriptor<Req, Resp>>()
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "method {method:?} was registered with different message types"
                ))
            })
    }

    async fn start_call(&self, path: &str, options: &CallOptions) -> Result<Call> {
        let mut deadline = options.deadline;
        if let Some(ref parent) = options.parent {
            if options.propagate_flags & PROPAGATE_DEADLINE != 0 {
                deadline = deadline.min(parent.deadline());
            }
        }
        let authority = options
            .host
            .clone()
            .unwrap_or_else(|| self.channel.authority().to_string());

        let call = self
            .channel
            .new_call(CallSettings {
                path: path.to_string(),
                authority,
                deadline,
            })
            .await?;

        if let Some(ref credentials) = options.credentials {
            call.set_credentials(credentials.clone())?;
        }
        if let Some(ref parent) = options.parent {
            if options.propagate_flags & PROPAGATE_CANCELLATION != 0 {
                parent.register_child(&call);
            }
        }
        debug!(%path, "call dispatched");
        Ok(call)
    }

    /// One request, one response: a single batch carrying all six
    /// operations.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        request: &Req,
        options: CallOptions,
    ) -> Result<UnaryReply<Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let descriptor = self.resolve::<Req, Resp>(method, false, false)?;
        let call = self.start_call(descriptor.path(), &options).await?;
        let body = (descriptor.serialize)(request)
            .map_err(|e| Error::InvalidArgument(format!("failed to serialize request: {e}")))?;

        let batch = Batch::new()
            .send_initial_metadata(metadata)
            .send_message(OutboundMessage {
                body,
                flags: options.flags,
            })
            .send_close()
            .recv_initial_metadata()
            .recv_message()
            .recv_status();
        let reply = call.run_batch(batch).await?;

        let status = reply
            .status
            .unwrap_or_else(|| RpcStatus::new(Code::Internal, "status missing from batch"));
        if !status.is_ok() {
            return Err(Error::Status(status));
        }
        let initial_metadata = reply.initial_metadata.unwrap_or_default();
        match reply.message.flatten() {
            Some(bytes) => match (descriptor.deserialize)(&bytes) {
                Ok(message) => Ok(UnaryReply {
                    message,
                    initial_metadata,
                    trailing_metadata: status.trailers,
                }),
                Err(_) => Err(Error::status(
                    Code::Internal,
                    "Failed to parse server response",
                )),
            },
            None => Err(Error::status(Code::Internal, "No message received")),
        }
    }

    /// A writable request sequence resolving to one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<Req, Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let descriptor = self.resolve::<Req, Resp>(method, true, false)?;
        let call = self.start_call(descriptor.path(), &options).await?;

        // Two concurrent batches on open: headers, and the single
        // response + status.
        let open_call = call.clone();
        let recv_call = call.clone();
        let deserialize = descriptor.deserialize.clone();
        let (response_tx, response_rx) = oneshot::channel();
        tokio::spawn(async move {
            let open = open_call.run_batch(
                Batch::new()
                    .send_initial_metadata(metadata)
                    .recv_initial_metadata(),
            );
            let recv = recv_call.run_batch(Batch::new().recv_message().recv_status());
            let (open_reply, recv_reply) = tokio::join!(open, recv);

            let initial_metadata = open_reply
                .ok()
                .and_then(|r| r.initial_metadata)
                .unwrap_or_default();
            let result = match recv_reply {
                Ok(reply) => {
                    let status = reply.status.unwrap_or_else(|| {
                        RpcStatus::new(Code::Internal, "status missing from batch")
                    });
                    if !status.is_ok() {
                        Err(Error::Status(status))
                    } else {
                        match reply.message.flatten() {
                            Some(bytes) => match (deserialize)(&bytes) {
                                Ok(message) => Ok(UnaryReply {
                                    message,
                                    initial_metadata,
                                    trailing_metadata: status.trailers,
                                }),
                                Err(_) => Err(Error::status(
                                    Code::Internal,
                                    "Failed to parse server response",
                                )),
                            },
                            None => Err(Error::status(Code::Internal, "No message received")),
                        }
                    }
                }
                Err(e) => Err(e),
            };
            let _ = response_tx.send(result);
        });

        Ok(ClientStreamingCall {
            sink: OutboundSink {
                call,
                serialize: descriptor.serialize.clone(),
                flags: options.flags,
            },
            response: response_rx,
        })
    }

    /// One request, a readable response sequence.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        request: &Req,
        options: CallOptions,
    ) -> Result<InboundStream<Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let descriptor = self.resolve::<Req, Resp>(method, false, true)?;
        let call = self.start_call(descriptor.path(), &options).await?;
        let body = (descriptor.serialize)(request)
            .map_err(|e| Error::InvalidArgument(format!("failed to serialize request: {e}")))?;

        let open_batch = Batch::new()
            .send_initial_metadata(metadata)
            .send_message(OutboundMessage {
                body,
                flags: options.flags,
            })
            .send_close()
            .recv_initial_metadata();

        Ok(InboundStream::open(
            call,
            descriptor.deserialize.clone(),
            open_batch,
        ))
    }

    /// Writable and readable sequences driven independently.
    pub async fn duplex<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<DuplexCall<Req, Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let descriptor = self.resolve::<Req, Resp>(method, true, true)?;
        let call = self.start_call(descriptor.path(), &options).await?;

        let open_batch = Batch::new()
            .send_initial_metadata(metadata)
            .recv_initial_metadata();

        let stream = InboundStream::open(call.clone(), descriptor.deserialize.clone(), open_batch);
        Ok(DuplexCall {
            sink: OutboundSink {
                call,
                serialize: descriptor.serialize.clone(),
                flags: options.flags,
            },
            stream,
        })
    }
}

// -- Streaming surfaces -------------------------------------------------------

/// The writable half of a streaming call.
///
/// Writes after cancellation or end-of-stream are dropped silently; the
/// failure surfaces through the call's final status.
pub struct OutboundSink<Req> {
    call: Call,
    serialize: SerializeFn<Req>,
    flags: u32,
}

impl<Req> OutboundSink<Req> {
    /// Send one message. Completion of the underlying SEND_MESSAGE batch
    /// is the backpressure signal.
    pub async fn send(&self, message: &Req) -> Result<()> {
        let body = (self.serialize)(message)
            .map_err(|e| Error::InvalidArgument(format!("failed to serialize message: {e}")))?;
        let batch = Batch::new().send_message(OutboundMessage {
            body,
            flags: self.flags,
        });
        match self.call.run_batch(batch).await {
            Ok(_) => Ok(()),
            Err(Error::Call(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send every message of `stream`, in order, applying backpressure
    /// per message.
    pub async fn send_all<S>(&self, mut stream: S) -> Result<()>
    where
        S: tokio_stream::Stream<Item = Req> + Unpin,
    {
        use tokio_stream::StreamExt;
        while let Some(message) = stream.next().await {
            self.send(&message).await?;
        }
        Ok(())
    }

    /// Signal that no further messages will be sent.
    pub async fn half_close(&self) -> Result<()> {
        match self.call.run_batch(Batch::new().send_close()).await {
            Ok(_) => Ok(()),
            Err(Error::Call(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }
}

/// A client-streaming call: a sink plus the pending single response.
pub struct ClientStreamingCall<Req, Resp> {
    sink: OutboundSink<Req>,
    response: oneshot::Receiver<Result<UnaryReply<Resp>>>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    pub async fn send(&self, message: &Req) -> Result<()> {
        self.sink.send(message).await
    }

    pub async fn send_all<S>(&self, stream: S) -> Result<()>
    where
        S: tokio_stream::Stream<Item = Req> + Unpin,
    {
        self.sink.send_all(stream).await
    }

    /// Half-close the request side and wait for the response.
    pub async fn finish(self) -> Result<UnaryReply<Resp>> {
        self.sink.half_close().await?;
        self.response
            .await
            .map_err(|_| Error::Call("call was dropped before completion".into()))?
    }

    pub fn cancel(&self) {
        self.sink.call.cancel();
    }

    pub fn call(&self) -> &Call {
        &self.sink.call
    }
}

/// The readable half of a streaming call. Messages are pulled on demand;
/// the final status arrives after the last message, and a non-OK status
/// is reported as the stream's error.
pub struct InboundStream<Resp> {
    call: Call,
    deserialize: DeserializeFn<Resp>,
    initial_metadata: watch::Receiver<Option<Metadata>>,
    finished: Option<RpcStatus>,
}

impl<Resp> InboundStream<Resp> {
    /// Issue `open_batch` in the background and expose its initial
    /// metadata through [`InboundStream::initial_metadata`].
    fn open(call: Call, deserialize: DeserializeFn<Resp>, open_batch: Batch) -> InboundStream<Resp> {
        let (md_tx, md_rx) = watch::channel(None);
        let open_call = call.clone();
        tokio::spawn(async move {
            let metadata = match open_call.run_batch(open_batch).await {
                Ok(reply) => reply.initial_metadata.unwrap_or_default(),
                Err(_) => Metadata::new(),
            };
            let _ = md_tx.send(Some(metadata));
        });
        InboundStream {
            call,
            deserialize,
            initial_metadata: md_rx,
            finished: None,
        }
    }

    /// The next message, or `None` once the stream has ended cleanly.
    pub async fn message(&mut self) -> Result<Option<Resp>> {
        if self.finished.is_some() {
            return Ok(None);
        }
        let reply = self.call.run_batch(Batch::new().recv_message()).await?;
        match reply.message.flatten() {
            Some(bytes) => match (self.deserialize)(&bytes) {
                Ok(message) => Ok(Some(message)),
                Err(_) => {
                    self.call
                        .cancel_with_status(Code::Internal, "Failed to parse server response");
                    self.finished = Some(self.fetch_status().await?);
                    Err(Error::status(
                        Code::Internal,
                        "Failed to parse server response",
                    ))
                }
            },
            None => {
                let status = self.fetch_status().await?;
                self.finished = Some(status.clone());
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(Error::Status(status))
                }
            }
        }
    }

    async fn fetch_status(&self) -> Result<RpcStatus> {
        let reply = self.call.run_batch(Batch::new().recv_status()).await?;
        Ok(reply
            .status
            .unwrap_or_else(|| RpcStatus::new(Code::Internal, "status missing from batch")))
    }

    /// Initial metadata, available once the server's headers arrive (or
    /// empty when the call ends without any).
    pub async fn initial_metadata(&self) -> Metadata {
        let mut rx = self.initial_metadata.clone();
        loop {
            {
                let value = rx.borrow_and_update();
                if let Some(ref metadata) = *value {
                    return metadata.clone();
                }
            }
            if rx.changed().await.is_err() {
                return Metadata::new();
            }
        }
    }

    /// The terminal status, once the stream has ended.
    pub fn status(&self) -> Option<&RpcStatus> {
        self.finished.as_ref()
    }

    /// Trailing metadata, once the stream has ended.
    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.finished.as_ref().map(|s| &s.trailers)
    }

    pub fn cancel(&self) {
        self.call.cancel();
    }

    pub fn call(&self) -> &Call {
        &self.call
    }
}

/// A bidirectional call: both halves, splittable for concurrent use.
pub struct DuplexCall<Req, Resp> {
    sink: OutboundSink<Req>,
    stream: InboundStream<Resp>,
}

impl<Req, Resp> DuplexCall<Req, Resp> {
    pub async fn send(&self, message: &Req) -> Result<()> {
        self.sink.send(message).await
    }

    pub async fn half_close(&self) -> Result<()> {
        self.sink.half_close().await
    }

    pub async fn message(&mut self) -> Result<Option<Resp>> {
        self.stream.message().await
    }

    pub async fn initial_metadata(&self) -> Metadata {
        self.stream.initial_metadata().await
    }

    pub fn status(&self) -> Option<&RpcStatus> {
        self.stream.status()
    }

    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.stream.trailing_metadata()
    }

    pub fn cancel(&self) {
        self.sink.call.cancel();
    }

    pub fn call(&self) -> &Call {
        &self.sink.call
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (OutboundSink<Req>, InboundStream<Resp>) {
        (self.sink, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_descriptor(path: &str, req_stream: bool, resp_stream: bool) -> MethodDescriptor<Vec<u8>, Vec<u8>> {
        MethodDescriptor::new(
            path,
            req_stream,
            resp_stream,
            |req: &Vec<u8>| Ok(req.clone()),
            |bytes: &[u8]| Ok(bytes.to_vec()),
        )
    }

    #[test]
    fn descriptor_reports_shape() {
        let desc = dummy_descriptor("/svc/Method", true, false);
        assert_eq!(desc.path(), "/svc/Method");
        assert!(desc.request_streaming());
        assert!(!desc.response_streaming());
    }

    #[test]
    fn service_descriptor_collects_methods() {
        let service = ServiceDescriptor::new("test.Service")
            .method("A", dummy_descriptor("/test.Service/A", false, false))
            .method("B", dummy_descriptor("/test.Service/B", true, true));
        assert_eq!(service.service_name(), "test.Service");
        assert_eq!(service.methods.len(), 2);
    }

    #[test]
    fn default_options_propagate_everything() {
        let options = CallOptions::default();
        assert!(options.deadline.is_infinite());
        assert_eq!(options.propagate_flags, PROPAGATE_DEFAULTS);
    }

    #[test]
    fn reserved_method_prefix_rejected() {
        let service = ServiceDescriptor::new("test.Service")
            .method("$foo", dummy_descriptor("/test.Service/$foo", false, false));
        let err = validate_method_names(&service).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn ordinary_method_names_accepted() {
        let service = ServiceDescriptor::new("test.Service")
            .method("Foo", dummy_descriptor("/test.Service/Foo", false, false));
        assert!(validate_method_names(&service).is_ok());
    }
}
