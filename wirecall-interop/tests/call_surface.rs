//! Behavior of the call surface beyond the named interop cases:
//! status propagation, cancellation semantics, deadlines, propagation
//! from parent calls, and channel-level limits.

mod common;

use std::time::Duration;

use common::start_plaintext;
use wirecall_core::{
    CallOptions, Channel, ChannelCredentials, ChannelOptions, Client, Code, Deadline, Error,
    Metadata,
};
use wirecall_interop::messages::{
    Empty, Payload, PayloadType, ResponseParameters, SimpleRequest, SimpleResponse,
    StreamingOutputCallRequest, StreamingOutputCallResponse,
};
use wirecall_interop::test_service_descriptor;

fn compressable(size: usize) -> Payload {
    Payload {
        r#type: PayloadType::Compressable as i32,
        body: vec![0u8; size],
    }
}

#[tokio::test]
async fn unary_response_size_round_trips() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    for size in [0usize, 1, 1024, 65536] {
        let request = SimpleRequest {
            response_size: size as i32,
            payload: Some(compressable(16)),
            ..Default::default()
        };
        let reply = client
            .unary::<SimpleRequest, SimpleResponse>(
                "UnaryCall",
                Metadata::new(),
                &request,
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            reply.message.payload.map(|p| p.body.len()),
            Some(size),
            "size {size} did not round-trip"
        );
    }
}

#[tokio::test]
async fn remote_status_carries_code_and_details() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let request = SimpleRequest {
        response_status: Some(wirecall_interop::messages::EchoStatus {
            code: Code::PermissionDenied as i32,
            message: "operator said no".into(),
        }),
        ..Default::default()
    };
    let err = client
        .unary::<SimpleRequest, SimpleResponse>(
            "UnaryCall",
            Metadata::new(),
            &request,
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        Error::Status(status) => {
            assert_eq!(status.code, Code::PermissionDenied);
            assert_eq!(status.details, "operator said no");
        }
        other => panic!("expected a status error, got: {other}"),
    }
}

#[tokio::test]
async fn unimplemented_method_reported_on_the_stream() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "HalfDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    call.half_close().await.unwrap();
    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Unimplemented));
}

#[tokio::test]
async fn per_call_credentials_require_a_secure_channel() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let options = CallOptions {
        credentials: Some(target.bearer_credentials()),
        ..Default::default()
    };
    let err = client
        .unary::<Empty, Empty>("EmptyCall", Metadata::new(), &Empty {}, options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn writes_after_cancel_are_dropped_silently() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    call.cancel();

    // Neither the write nor the half-close surfaces an error.
    call.send(&StreamingOutputCallRequest::default())
        .await
        .unwrap();
    call.half_close().await.unwrap();

    let (_sink, mut stream) = call.split();
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Cancelled));
}

#[tokio::test]
async fn exactly_one_terminal_event_per_call() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let mut call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    call.cancel();
    call.cancel();

    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Cancelled));
    // After the terminal event the stream reports a clean end, not a
    // second status.
    assert!(call.message().await.unwrap().is_none());
    assert_eq!(call.status().map(|s| s.code), Some(Code::Cancelled));
}

#[tokio::test]
async fn parent_cancellation_propagates_to_children() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let parent = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    let mut child = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions {
                parent: Some(parent.call().clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    parent.cancel();
    let err = child.message().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::Cancelled));
}

#[tokio::test]
async fn deadline_propagates_from_parent() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let parent = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions {
                deadline: Deadline::after(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut child = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions {
                parent: Some(parent.call().clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A response the server will not produce before the inherited
    // deadline expires.
    let _ = child
        .send(&StreamingOutputCallRequest {
            response_parameters: vec![ResponseParameters {
                size: 16,
                interval_us: 2_000_000,
            }],
            ..Default::default()
        })
        .await;
    let err = child.message().await.unwrap_err();
    assert!(
        matches!(
            err.code(),
            Some(Code::DeadlineExceeded) | Some(Code::Internal)
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn oversize_response_is_resource_exhausted() {
    let (_server, target) = start_plaintext().await;
    let channel = Channel::connect(
        &target.address,
        ChannelCredentials::insecure(),
        ChannelOptions {
            max_receive_message_size: Some(1024),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let client = Client::new(channel, test_service_descriptor()).unwrap();

    let request = SimpleRequest {
        response_size: 4096,
        ..Default::default()
    };
    let err = client
        .unary::<SimpleRequest, SimpleResponse>(
            "UnaryCall",
            Metadata::new(),
            &request,
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(Code::ResourceExhausted));
}

#[tokio::test]
async fn peer_reports_the_remote_address() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let call = client
        .duplex::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    let peer = call.call().peer();
    assert!(peer.contains("127.0.0.1"), "unexpected peer: {peer}");
    call.cancel();
}

#[tokio::test]
async fn reserved_method_prefix_rejected_at_construction() {
    let (_server, target) = start_plaintext().await;
    let channel = Channel::connect(
        &target.address,
        ChannelCredentials::insecure(),
        ChannelOptions::default(),
    )
    .await
    .unwrap();

    let descriptor = wirecall_core::ServiceDescriptor::new("grpc.testing.TestService").method(
        "$internal",
        wirecall_core::MethodDescriptor::<Empty, Empty>::prost(
            "/grpc.testing.TestService/$internal",
            false,
            false,
        ),
    );
    let err = Client::new(channel, descriptor).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn server_streaming_stops_at_requested_count() {
    let (_server, target) = start_plaintext().await;
    let client = target.client().await.unwrap();

    let request = StreamingOutputCallRequest {
        response_parameters: vec![
            ResponseParameters {
                size: 10,
                interval_us: 0,
            },
            ResponseParameters {
                size: 20,
                interval_us: 0,
            },
        ],
        ..Default::default()
    };
    let mut stream = client
        .server_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "StreamingOutputCall",
            Metadata::new(),
            &request,
            CallOptions::default(),
        )
        .await
        .unwrap();

    let mut sizes = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        sizes.push(response.payload.map(|p| p.body.len()).unwrap_or(0));
    }
    assert_eq!(sizes, vec![10, 20]);
    assert!(stream.status().unwrap().is_ok());
}
