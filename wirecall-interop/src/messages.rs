//! The interop message set, hand-derived with the canonical field tags so
//! the wire layout matches other implementations of the protocol.

/// The kind of payload that should be returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    /// Compressable text format.
    Compressable = 0,
    /// Uncompressable binary format.
    Uncompressable = 1,
    /// Randomly chosen from all other formats.
    Random = 2,
}

/// A block of bytes to be transmitted, with its requested type.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

/// A status the server should respond with, for error-path testing.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleRequest {
    /// Desired payload type in the response.
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub response_type: i32,
    /// Desired payload size in the response.
    #[prost(int32, tag = "2")]
    pub response_size: i32,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<Payload>,
    /// Whether the server should fill username in the response.
    #[prost(bool, tag = "4")]
    pub fill_username: bool,
    /// Whether the server should fill oauth scope in the response.
    #[prost(bool, tag = "5")]
    pub fill_oauth_scope: bool,
    /// Whether the server should respond with the given status.
    #[prost(message, optional, tag = "7")]
    pub response_status: Option<EchoStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
    /// The authenticated user, when requested.
    #[prost(string, tag = "2")]
    pub username: String,
    /// The granted OAuth scope, when requested.
    #[prost(string, tag = "3")]
    pub oauth_scope: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingInputCallRequest {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingInputCallResponse {
    /// Sum of the sizes of all inbound payloads.
    #[prost(int32, tag = "1")]
    pub aggregated_payload_size: i32,
}

/// Configuration for one expected response on an output stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseParameters {
    #[prost(int32, tag = "1")]
    pub size: i32,
    /// Delay before sending this response, in microseconds.
    #[prost(int32, tag = "2")]
    pub interval_us: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingOutputCallRequest {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub response_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub response_parameters: Vec<ResponseParameters>,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<Payload>,
    #[prost(message, optional, tag = "7")]
    pub response_status: Option<EchoStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingOutputCallResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn simple_request_round_trip() {
        let request = SimpleRequest {
            response_type: PayloadType::Compressable as i32,
            response_size: 314159,
            payload: Some(Payload {
                r#type: PayloadType::Compressable as i32,
                body: vec![0u8; 16],
            }),
            fill_username: true,
            fill_oauth_scope: false,
            response_status: None,
        };
        let decoded = SimpleRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn payload_type_wire_values() {
        assert_eq!(PayloadType::Compressable as i32, 0);
        assert_eq!(PayloadType::Uncompressable as i32, 1);
        assert_eq!(PayloadType::Random as i32, 2);
        assert_eq!(PayloadType::try_from(1), Ok(PayloadType::Uncompressable));
        assert!(PayloadType::try_from(9).is_err());
    }

    #[test]
    fn empty_message_encodes_to_nothing() {
        assert!(Empty {}.encode_to_vec().is_empty());
    }
}
