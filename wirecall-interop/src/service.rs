//! The reference test service: the server half of the interop matrix.

use std::time::Duration;

use tracing::debug;
use wirecall_core::{Code, Metadata, RpcStatus, ServerContext, Service};

use crate::messages::{
    Empty, Payload, PayloadType, ResponseParameters, SimpleRequest, SimpleResponse,
    StreamingInputCallRequest, StreamingInputCallResponse, StreamingOutputCallRequest,
    StreamingOutputCallResponse,
};

/// Fully-qualified name of the test service.
pub const SERVICE_NAME: &str = "grpc.testing.TestService";

/// Initial-metadata key echoed back as response headers.
pub const ECHO_INITIAL_KEY: &str = "x-grpc-test-echo-initial";

/// Binary metadata key echoed back on the trailers.
pub const ECHO_TRAILING_KEY: &str = "x-grpc-test-echo-trailing-bin";

/// Build the test service. `HalfDuplexCall` is left unimplemented; the
/// server answers it with UNIMPLEMENTED.
pub fn test_service() -> Service {
    Service::new(SERVICE_NAME)
        .unary("EmptyCall", |ctx, _request: Empty| async move {
            echo_metadata(&ctx);
            Ok(Empty {})
        })
        .unary("UnaryCall", |ctx, request: SimpleRequest| async move {
            echo_metadata(&ctx);
            unary_call(&ctx, request)
        })
        .client_streaming(
            "StreamingInputCall",
            |ctx, mut requests: wirecall_core::RequestStream<StreamingInputCallRequest>| async move {
                echo_metadata(&ctx);
                let mut aggregated_payload_size: i32 = 0;
                while let Some(request) = requests.message().await.map_err(request_status)? {
                    if let Some(ref payload) = request.payload {
                        aggregated_payload_size += payload.body.len() as i32;
                    }
                }
                Ok(StreamingInputCallResponse {
                    aggregated_payload_size,
                })
            },
        )
        .server_streaming(
            "StreamingOutputCall",
            |ctx,
             request: StreamingOutputCallRequest,
             sink: wirecall_core::ServerSink<StreamingOutputCallResponse>| async move {
                echo_metadata(&ctx);
                check_echo_status(request.response_status.as_ref())?;
                for parameters in &request.response_parameters {
                    if sink
                        .send(&output_response(request.response_type, parameters).await?)
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Ok(())
            },
        )
        .duplex(
            "FullDuplexCall",
            |ctx,
             mut requests: wirecall_core::RequestStream<StreamingOutputCallRequest>,
             sink: wirecall_core::ServerSink<StreamingOutputCallResponse>| async move {
                echo_metadata(&ctx);
                loop {
                    let request = match requests.message().await {
                        Ok(Some(request)) => request,
                        Ok(None) => return Ok(()),
                        // Cancelled mid-stream: nothing left to send.
                        Err(_) => return Ok(()),
                    };
                    check_echo_status(request.response_status.as_ref())?;
                    for parameters in &request.response_parameters {
                        if sink
                            .send(&output_response(request.response_type, parameters).await?)
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                }
            },
        )
}

/// Echo the reserved request-metadata keys back per the interop
/// convention: `x-grpc-test-echo-initial` into the response headers,
/// `x-grpc-test-echo-trailing-bin` into the trailers.
fn echo_metadata(ctx: &ServerContext) {
    let request_metadata = ctx.request_metadata();

    let mut initial = Metadata::new();
    for value in request_metadata.get_all(ECHO_INITIAL_KEY) {
        if let Some(text) = value.as_str() {
            let _ = initial.add(ECHO_INITIAL_KEY, text);
        }
    }
    if !initial.is_empty() {
        ctx.set_initial_metadata(initial);
    }

    let mut trailing = Metadata::new();
    for value in request_metadata.get_all(ECHO_TRAILING_KEY) {
        let _ = trailing.add(ECHO_TRAILING_KEY, value.as_bytes().to_vec());
    }
    if !trailing.is_empty() {
        ctx.set_trailing_metadata(trailing);
    }
}

fn unary_call(ctx: &ServerContext, request: SimpleRequest) -> Result<SimpleResponse, RpcStatus> {
    check_echo_status(request.response_status.as_ref())?;

    let payload = make_payload(request.response_type, request.response_size.max(0) as usize)?;

    let mut username = String::new();
    let mut oauth_scope = String::new();
    if request.fill_username || request.fill_oauth_scope {
        if let Some((user, scope)) = authenticated_identity(ctx.request_metadata()) {
            if request.fill_username {
                username = user;
            }
            if request.fill_oauth_scope {
                oauth_scope = scope;
            }
        }
    }

    Ok(SimpleResponse {
        payload: Some(payload),
        username,
        oauth_scope,
    })
}

async fn output_response(
    response_type: i32,
    parameters: &ResponseParameters,
) -> Result<StreamingOutputCallResponse, RpcStatus> {
    if parameters.interval_us > 0 {
        tokio::time::sleep(Duration::from_micros(parameters.interval_us as u64)).await;
    }
    Ok(StreamingOutputCallResponse {
        payload: Some(make_payload(
            response_type,
            parameters.size.max(0) as usize,
        )?),
    })
}

/// Map a request-stream error onto the status the handler should fail
/// with.
fn request_status(err: wirecall_core::Error) -> RpcStatus {
    match err {
        wirecall_core::Error::Status(status) => status,
        other => RpcStatus::new(Code::Internal, other.to_string()),
    }
}

/// Fail with the status a request carries in `response_status`, if any.
fn check_echo_status(echo: Option<&crate::messages::EchoStatus>) -> Result<(), RpcStatus> {
    match echo {
        Some(status) if status.code != 0 => Err(RpcStatus::new(
            Code::from_i32(status.code),
            status.message.clone(),
        )),
        _ => Ok(()),
    }
}

/// Synthesize a payload of the requested type and size. COMPRESSABLE is
/// all zeros, UNCOMPRESSABLE a byte ramp; RANDOM picks one of the two.
fn make_payload(requested_type: i32, size: usize) -> Result<Payload, RpcStatus> {
    let resolved = match PayloadType::try_from(requested_type) {
        Ok(PayloadType::Random) => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            if nanos % 2 == 0 {
                PayloadType::Compressable
            } else {
                PayloadType::Uncompressable
            }
        }
        Ok(payload_type) => payload_type,
        Err(_) => {
            return Err(RpcStatus::new(
                Code::InvalidArgument,
                format!("unknown payload type {requested_type}"),
            ))
        }
    };

    let body = match resolved {
        PayloadType::Compressable => vec![0u8; size],
        _ => {
            let mut buf = vec![0u8; size];
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = i as u8;
            }
            buf
        }
    };

    Ok(Payload {
        r#type: resolved as i32,
        body,
    })
}

/// The identity behind a bearer token, as `<username>/<oauth scope>`.
///
/// Token acquisition is outside the protocol; the server only needs a
/// parseable identity to echo back for the auth test cases.
fn authenticated_identity(metadata: &Metadata) -> Option<(String, String)> {
    let value = metadata.get("authorization")?.as_str()?;
    let token = value.strip_prefix("Bearer ")?;
    debug!(%token, "authenticated call");
    match token.split_once('/') {
        Some((user, scope)) => Some((user.to_string(), scope.to_string())),
        None => Some((token.to_string(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressable_payload_is_zeros_of_requested_size() {
        let payload = make_payload(PayloadType::Compressable as i32, 5).unwrap();
        assert_eq!(payload.r#type, PayloadType::Compressable as i32);
        assert_eq!(payload.body, vec![0u8; 5]);
    }

    #[test]
    fn uncompressable_payload_has_requested_size() {
        let payload = make_payload(PayloadType::Uncompressable as i32, 300).unwrap();
        assert_eq!(payload.r#type, PayloadType::Uncompressable as i32);
        assert_eq!(payload.body.len(), 300);
        assert_ne!(payload.body, vec![0u8; 300]);
    }

    #[test]
    fn random_payload_resolves_to_a_concrete_type() {
        let payload = make_payload(PayloadType::Random as i32, 8).unwrap();
        assert_ne!(payload.r#type, PayloadType::Random as i32);
        assert_eq!(payload.body.len(), 8);
    }

    #[test]
    fn unknown_payload_type_is_invalid() {
        let err = make_payload(9, 8).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn echo_status_propagates_code_and_message() {
        let echo = crate::messages::EchoStatus {
            code: Code::PermissionDenied as i32,
            message: "no".into(),
        };
        let err = check_echo_status(Some(&echo)).unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
        assert_eq!(err.details, "no");

        assert!(check_echo_status(None).is_ok());
    }

    #[test]
    fn bearer_token_identity_parsing() {
        let mut md = Metadata::new();
        md.add("authorization", "Bearer someone@example.com/test.scope")
            .unwrap();
        let (user, scope) = authenticated_identity(&md).unwrap();
        assert_eq!(user, "someone@example.com");
        assert_eq!(scope, "test.scope");
    }

    #[test]
    fn missing_authorization_yields_no_identity() {
        assert!(authenticated_identity(&Metadata::new()).is_none());
    }
}
