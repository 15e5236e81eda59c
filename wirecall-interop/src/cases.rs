//! The named interop test cases: per-case credential acquisition,
//! payload fixtures, and assertions against the reference service.

use std::time::Duration;

use wirecall_core::{
    CallCredentials, CallOptions, Channel, ChannelCredentials, ChannelOptions, Client, Code,
    Deadline, Metadata, MethodDescriptor, ServiceDescriptor, StaticTokenSource,
};

use crate::messages::{
    Empty, Payload, PayloadType, ResponseParameters, SimpleRequest, SimpleResponse,
    StreamingInputCallRequest, StreamingInputCallResponse, StreamingOutputCallRequest,
    StreamingOutputCallResponse,
};
use crate::service::{ECHO_INITIAL_KEY, ECHO_TRAILING_KEY, SERVICE_NAME};

pub type CaseError = Box<dyn std::error::Error + Send + Sync>;
pub type CaseResult = std::result::Result<(), CaseError>;

/// The canonical case set.
pub const TEST_CASES: &[&str] = &[
    "empty_unary",
    "large_unary",
    "client_streaming",
    "server_streaming",
    "ping_pong",
    "empty_stream",
    "cancel_after_begin",
    "cancel_after_first_response",
    "timeout_on_sleeping_server",
    "custom_metadata",
    "compute_engine_creds",
    "service_account_creds",
    "jwt_token_creds",
    "oauth2_auth_token",
    "per_rpc_creds",
];

const REQUEST_SIZES: [i32; 4] = [27182, 8, 1828, 45904];
const RESPONSE_SIZES: [i32; 4] = [31415, 9, 2653, 58979];
const LARGE_REQUEST_SIZE: i32 = 271828;
const LARGE_RESPONSE_SIZE: i32 = 314159;

/// The client-side view of the test service.
pub fn test_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE_NAME)
        .method(
            "EmptyCall",
            MethodDescriptor::<Empty, Empty>::prost(
                "/grpc.testing.TestService/EmptyCall",
                false,
                false,
            ),
        )
        .method(
            "UnaryCall",
            MethodDescriptor::<SimpleRequest, SimpleResponse>::prost(
                "/grpc.testing.TestService/UnaryCall",
                false,
                false,
            ),
        )
        .method(
            "StreamingInputCall",
            MethodDescriptor::<StreamingInputCallRequest, StreamingInputCallResponse>::prost(
                "/grpc.testing.TestService/StreamingInputCall",
                true,
                false,
            ),
        )
        .method(
            "StreamingOutputCall",
            MethodDescriptor::<StreamingOutputCallRequest, StreamingOutputCallResponse>::prost(
                "/grpc.testing.TestService/StreamingOutputCall",
                false,
                true,
            ),
        )
        .method(
            "FullDuplexCall",
            MethodDescriptor::<StreamingOutputCallRequest, StreamingOutputCallResponse>::prost(
                "/grpc.testing.TestService/FullDuplexCall",
                true,
                true,
            ),
        )
        .method(
            "HalfDuplexCall",
            MethodDescriptor::<StreamingOutputCallRequest, StreamingOutputCallResponse>::prost(
                "/grpc.testing.TestService/HalfDuplexCall",
                true,
                true,
            ),
        )
}

/// Where and how the interop client connects.
#[derive(Clone)]
pub struct InteropTarget {
    pub address: String,
    pub use_tls: bool,
    /// Custom root CAs (the test CA); native roots when absent.
    pub root_certs: Option<Vec<u8>>,
    /// TLS name override for the test certificate.
    pub server_host_override: Option<String>,
    /// Identity asserted by the auth cases.
    pub default_service_account: String,
    pub oauth_scope: String,
}

impl InteropTarget {
    /// A plaintext target with no auth identity.
    pub fn plaintext(address: impl Into<String>) -> InteropTarget {
        InteropTarget {
            address: address.into(),
            use_tls: false,
            root_certs: None,
            server_host_override: None,
            default_service_account: String::new(),
            oauth_scope: String::new(),
        }
    }

    fn channel_credentials(&self) -> Result<ChannelCredentials, CaseError> {
        if self.use_tls {
            Ok(ChannelCredentials::ssl(
                self.root_certs.as_deref(),
                None,
                None,
            )?)
        } else {
            Ok(ChannelCredentials::insecure())
        }
    }

    /// The bearer credential the auth cases attach. The token carries
    /// the identity the server echoes back.
    pub fn bearer_credentials(&self) -> CallCredentials {
        CallCredentials::from_access_token_source(StaticTokenSource::new(format!(
            "{}/{}",
            self.default_service_account, self.oauth_scope
        )))
    }

    /// Connect, optionally attaching call credentials to the channel.
    pub async fn connect_with(
        &self,
        call_credentials: Option<CallCredentials>,
    ) -> Result<Client, CaseError> {
        let mut credentials = self.channel_credentials()?;
        if let Some(calls) = call_credentials {
            credentials = credentials.compose(calls)?;
        }
        let channel = Channel::connect(
            &self.address,
            credentials,
            ChannelOptions {
                ssl_target_name_override: self.server_host_override.clone(),
                ..Default::default()
            },
        )
        .await?;
        Ok(Client::new(channel, test_service_descriptor())?)
    }

    pub async fn client(&self) -> Result<Client, CaseError> {
        self.connect_with(None).await
    }
}

/// Run one named case against the target.
pub async fn run_test_case(name: &str, target: &InteropTarget) -> CaseResult {
    match name {
        "empty_unary" => empty_unary(target).await,
        "large_unary" => large_unary(target).await,
        "client_streaming" => client_streaming(target).await,
        "server_streaming" => server_streaming(target).await,
        "ping_pong" => ping_pong(target).await,
        "empty_stream" => empty_stream(target).await,
        "cancel_after_begin" => cancel_after_begin(target).await,
        "cancel_after_first_response" => cancel_after_first_response(target).await,
        "timeout_on_sleeping_server" => timeout_on_sleeping_server(target).await,
        "custom_metadata" => custom_metadata(target).await,
        "compute_engine_creds" => channel_auth_case(target, true).await,
        "service_account_creds" => channel_auth_case(target, true).await,
        "jwt_token_creds" => channel_auth_case(target, false).await,
        "oauth2_auth_token" => channel_auth_case(target, true).await,
        "per_rpc_creds" => per_rpc_creds(target).await,
        other => Err(format!("unknown test case {other:?}").into()),
    }
}

fn expect(condition: bool, message: impl Into<String>) -> CaseResult {
    if condition {
        Ok(())
    } else {
        Err(message.into().into())
    }
}

fn compressable_payload(size: i32) -> Payload {
    Payload {
        r#type: PayloadType::Compressable as i32,
        body: vec![0u8; size as usize],
    }
}

fn large_request() -> SimpleRequest {
    SimpleRequest {
        response_type: PayloadType::Compressable as i32,
        response_size: LARGE_RESPONSE_SIZE,
        payload: Some(compressable_payload(LARGE_REQUEST_SIZE)),
        ..Default::default()
    }
}

fn response_body_len(response: &StreamingOutputCallResponse) -> usize {
    response
        .payload
        .as_ref()
        .map(|p| p.body.len())
        .unwrap_or(0)
}

async fn empty_unary(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let reply = client
        .unary::<Empty, Empty>("EmptyCall", Metadata::new(), &Empty {}, CallOptions::default())
        .await?;
    expect(reply.message == Empty {}, "response was not empty")
}

async fn large_unary(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let reply = client
        .unary::<SimpleRequest, SimpleResponse>(
            "UnaryCall",
            Metadata::new(),
            &large_request(),
            CallOptions::default(),
        )
        .await?;
    let payload = reply.message.payload.ok_or("response payload missing")?;
    expect(
        payload.r#type == PayloadType::Compressable as i32,
        "response payload type mismatch",
    )?;
    expect(
        payload.body.len() == LARGE_RESPONSE_SIZE as usize,
        format!(
            "response body length {} != {LARGE_RESPONSE_SIZE}",
            payload.body.len()
        ),
    )
}

async fn client_streaming(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let call = client
        .client_streaming::<StreamingInputCallRequest, StreamingInputCallResponse>(
            "StreamingInputCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await?;
    let requests: Vec<StreamingInputCallRequest> = REQUEST_SIZES
        .iter()
        .map(|&size| StreamingInputCallRequest {
            payload: Some(compressable_payload(size)),
        })
        .collect();
    call.send_all(tokio_stream::iter(requests)).await?;
    let reply = call.finish().await?;
    let total: i32 = REQUEST_SIZES.iter().sum();
    expect(
        reply.message.aggregated_payload_size == total,
        format!(
            "aggregated {} != {total}",
            reply.message.aggregated_payload_size
        ),
    )
}

async fn server_streaming(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let request = StreamingOutputCallRequest {
        response_type: PayloadType::Compressable as i32,
        response_parameters: RESPONSE_SIZES
            .iter()
            .map(|&size| ResponseParameters {
                size,
                interval_us: 0,
            })
            .collect(),
        ..Default::default()
    };
    let mut stream = client
        .server_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "StreamingOutputCall",
            Metadata::new(),
            &request,
            CallOptions::default(),
        )
        .await?;

    let mut received = 0usize;
    while let Some(response) = stream.message().await? {
        expect(
            received < RESPONSE_SIZES.len(),
            "more responses than requested",
        )?;
        expect(
            response_body_len(&response) == RESPONSE_SIZES[received] as usize,
            format!("response {received} has wrong body length"),
        )?;
        received += 1;
    }
    expect(
        received == RESPONSE_SIZES.len(),
        format!("received {received} responses, wanted {}", RESPONSE_SIZES.len()),
    )
}

async fn ping_pong(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await?;

    for round in 0..REQUEST_SIZES.len() {
        call.send(&StreamingOutputCallRequest {
            response_type: PayloadType::Compressable as i32,
            response_parameters: vec![ResponseParameters {
                size: RESPONSE_SIZES[round],
                interval_us: 0,
            }],
            payload: Some(compressable_payload(REQUEST_SIZES[round])),
            ..Default::default()
        })
        .await?;
        let response = call
            .message()
            .await?
            .ok_or(format!("stream ended before round {round}"))?;
        expect(
            response_body_len(&response) == RESPONSE_SIZES[round] as usize,
            format!("round {round} response has wrong body length"),
        )?;
    }

    call.half_close().await?;
    expect(call.message().await?.is_none(), "expected end of stream")?;
    expect(
        call.status().map(|s| s.is_ok()).unwrap_or(false),
        "terminal status was not OK",
    )
}

async fn empty_stream(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await?;
    call.half_close().await?;
    expect(call.message().await?.is_none(), "expected no responses")?;
    expect(
        call.status().map(|s| s.is_ok()).unwrap_or(false),
        "terminal status was not OK",
    )
}

async fn cancel_after_begin(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let call = client
        .client_streaming::<StreamingInputCallRequest, StreamingInputCallResponse>(
            "StreamingInputCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await?;
    call.cancel();
    match call.finish().await {
        Err(e) if e.code() == Some(Code::Cancelled) => Ok(()),
        Err(e) => Err(format!("expected CANCELLED, got: {e}").into()),
        Ok(_) => Err("expected CANCELLED, call succeeded".into()),
    }
}

async fn cancel_after_first_response(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await?;
    call.send(&StreamingOutputCallRequest {
        response_type: PayloadType::Compressable as i32,
        response_parameters: vec![ResponseParameters {
            size: RESPONSE_SIZES[0],
            interval_us: 0,
        }],
        payload: Some(compressable_payload(REQUEST_SIZES[0])),
        ..Default::default()
    })
    .await?;
    let first = call.message().await?;
    expect(first.is_some(), "no first response before cancel")?;
    call.cancel();
    match call.message().await {
        Err(e) if e.code() == Some(Code::Cancelled) => Ok(()),
        Err(e) => Err(format!("expected CANCELLED, got: {e}").into()),
        Ok(_) => Err("expected CANCELLED after cancel".into()),
    }
}

async fn timeout_on_sleeping_server(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions {
                deadline: Deadline::after(Duration::from_millis(1)),
                ..Default::default()
            },
        )
        .await?;
    // The send may already be dropped by the expiring deadline.
    let _ = call
        .send(&StreamingOutputCallRequest {
            response_type: PayloadType::Compressable as i32,
            response_parameters: vec![ResponseParameters {
                size: RESPONSE_SIZES[0],
                interval_us: 2_000_000,
            }],
            payload: Some(compressable_payload(REQUEST_SIZES[0])),
            ..Default::default()
        })
        .await;
    match call.message().await {
        Err(e)
            if matches!(
                e.code(),
                Some(Code::DeadlineExceeded) | Some(Code::Internal)
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(format!("expected DEADLINE_EXCEEDED or INTERNAL, got: {e}").into()),
        Ok(_) => Err("expected the deadline to expire".into()),
    }
}

const ECHO_INITIAL_VALUE: &str = "test_initial_metadata_value";
const ECHO_TRAILING_VALUE: [u8; 3] = [0xAB, 0xAB, 0xAB];

fn echo_metadata() -> Result<Metadata, CaseError> {
    let mut metadata = Metadata::new();
    metadata.add(ECHO_INITIAL_KEY, ECHO_INITIAL_VALUE)?;
    metadata.add(ECHO_TRAILING_KEY, ECHO_TRAILING_VALUE.to_vec())?;
    Ok(metadata)
}

fn check_initial_echo(metadata: &Metadata) -> CaseResult {
    expect(
        metadata.get(ECHO_INITIAL_KEY).and_then(|v| v.as_str()) == Some(ECHO_INITIAL_VALUE),
        "initial metadata echo mismatch",
    )
}

fn check_trailing_echo(metadata: &Metadata) -> CaseResult {
    expect(
        metadata.get(ECHO_TRAILING_KEY).map(|v| v.as_bytes()) == Some(&ECHO_TRAILING_VALUE[..]),
        "trailing metadata echo mismatch",
    )
}

/// The 5-way echo assertion: unary payload plus initial/trailing echo on
/// both the unary and the duplex path.
async fn custom_metadata(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;

    let reply = client
        .unary::<SimpleRequest, SimpleResponse>(
            "UnaryCall",
            echo_metadata()?,
            &large_request(),
            CallOptions::default(),
        )
        .await?;
    let payload = reply.message.payload.ok_or("response payload missing")?;
    expect(
        payload.body.len() == LARGE_RESPONSE_SIZE as usize,
        "unary payload length mismatch",
    )?;
    check_initial_echo(&reply.initial_metadata)?;
    check_trailing_echo(&reply.trailing_metadata)?;

    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            echo_metadata()?,
            CallOptions::default(),
        )
        .await?;
    call.send(&StreamingOutputCallRequest {
        response_type: PayloadType::Compressable as i32,
        response_parameters: vec![ResponseParameters {
            size: RESPONSE_SIZES[0],
            interval_us: 0,
        }],
        payload: Some(compressable_payload(REQUEST_SIZES[0])),
        ..Default::default()
    })
    .await?;
    expect(call.message().await?.is_some(), "no streaming response")?;
    call.half_close().await?;
    expect(call.message().await?.is_none(), "expected end of stream")?;

    check_initial_echo(&call.initial_metadata().await)?;
    let trailers = call
        .trailing_metadata()
        .ok_or("trailing metadata missing")?
        .clone();
    check_trailing_echo(&trailers)
}

/// The channel-composed auth cases: the token credential is attached to
/// the channel credential, and the echoed identity is asserted.
async fn channel_auth_case(target: &InteropTarget, check_scope: bool) -> CaseResult {
    let client = target.connect_with(Some(target.bearer_credentials())).await?;
    auth_unary(&client, target, check_scope, CallOptions::default()).await
}

/// Credentials supplied per call instead of per channel.
async fn per_rpc_creds(target: &InteropTarget) -> CaseResult {
    let client = target.client().await?;
    let options = CallOptions {
        credentials: Some(target.bearer_credentials()),
        ..Default::default()
    };
    auth_unary(&client, target, true, options).await
}

async fn auth_unary(
    client: &Client,
    target: &InteropTarget,
    check_scope: bool,
    options: CallOptions,
) -> CaseResult {
    let request = SimpleRequest {
        fill_username: true,
        fill_oauth_scope: check_scope,
        ..large_request()
    };
    let reply = client
        .unary::<SimpleRequest, SimpleResponse>("UnaryCall", Metadata::new(), &request, options)
        .await?;
    expect(
        reply.message.username == target.default_service_account,
        format!(
            "username {:?} != {:?}",
            reply.message.username, target.default_service_account
        ),
    )?;
    if check_scope {
        expect(
            !reply.message.oauth_scope.is_empty()
                && target.oauth_scope.contains(&reply.message.oauth_scope),
            "oauth scope mismatch",
        )?;
    }
    Ok(())
}
