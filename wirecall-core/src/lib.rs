//! wirecall-core: a batch-oriented RPC client/server surface.
//!
//! The library turns method-oriented calls into ordered batches of
//! transport operations (send/recv metadata, messages, close, status),
//! with a credentials algebra, per-shape streaming drivers, and a server
//! runtime. The reference transport multiplexes calls over one framed
//! TCP (optionally TLS) connection per channel; any transport with the
//! same batch semantics can stand in behind the [`transport::Transport`]
//! seam.

pub mod batch;
pub mod call;
pub mod channel;
pub mod client;
pub mod credentials;
pub mod error;
pub mod metadata;
pub mod server;
pub mod transport;
pub mod wire;

pub use batch::{Batch, BatchReply, OpKind, OutboundMessage};
pub use call::Call;
pub use channel::{Channel, ChannelOptions, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE};
pub use client::{
    CallOptions, Client, ClientStreamingCall, DuplexCall, InboundStream, MethodDescriptor,
    OutboundSink, ServiceDescriptor, UnaryReply, PROPAGATE_CANCELLATION, PROPAGATE_DEADLINE,
    PROPAGATE_DEFAULTS,
};
pub use credentials::{
    CallCredentials, ChannelCredentials, MetadataGenerator, ServerCredentials, StaticTokenSource,
    TokenSource,
};
pub use error::{Code, Error, Result, RpcStatus};
pub use metadata::{Metadata, MetadataValue};
pub use server::{
    BoundServer, RequestStream, Server, ServerBuilder, ServerContext, ServerHandle, ServerSink,
    Service,
};
pub use transport::{CallSettings, Deadline, Transport, TransportCall};
