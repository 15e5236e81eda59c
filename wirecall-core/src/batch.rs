use crate::error::RpcStatus;
use crate::metadata::Metadata;

/// The six operation slots a batch may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
}

/// One outbound user message: serialized body plus per-message send flags.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub flags: u32,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> OutboundMessage {
        OutboundMessage { body, flags: 0 }
    }
}

/// An atomic set of operations submitted to the transport on one call.
///
/// Each slot appears at most once per batch by construction. The transport
/// either accepts the whole batch or rejects it before any I/O; within a
/// batch, initial metadata is emitted before a message and a message
/// before the half-close.
#[derive(Debug, Default)]
pub struct Batch {
    pub send_initial_metadata: Option<Metadata>,
    pub send_message: Option<OutboundMessage>,
    pub send_close: bool,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_status: bool,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    pub fn send_initial_metadata(mut self, metadata: Metadata) -> Batch {
        self.send_initial_metadata = Some(metadata);
        self
    }

    pub fn send_message(mut self, message: OutboundMessage) -> Batch {
        self.send_message = Some(message);
        self
    }

    pub fn send_close(mut self) -> Batch {
        self.send_close = true;
        self
    }

    pub fn recv_initial_metadata(mut self) -> Batch {
        self.recv_initial_metadata = true;
        self
    }

    pub fn recv_message(mut self) -> Batch {
        self.recv_message = true;
        self
    }

    pub fn recv_status(mut self) -> Batch {
        self.recv_status = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops().is_empty()
    }

    pub fn has_send_ops(&self) -> bool {
        self.send_initial_metadata.is_some() || self.send_message.is_some() || self.send_close
    }

    pub fn has_recv_ops(&self) -> bool {
        self.recv_initial_metadata || self.recv_message || self.recv_status
    }

    /// The operations this batch carries, for diagnostics.
    pub fn ops(&self) -> Vec<OpKind> {
        let mut ops = Vec::new();
        if self.send_initial_metadata.is_some() {
            ops.push(OpKind::SendInitialMetadata);
        }
        if self.send_message.is_some() {
            ops.push(OpKind::SendMessage);
        }
        if self.send_close {
            ops.push(OpKind::SendCloseFromClient);
        }
        if self.recv_initial_metadata {
            ops.push(OpKind::RecvInitialMetadata);
        }
        if self.recv_message {
            ops.push(OpKind::RecvMessage);
        }
        if self.recv_status {
            ops.push(OpKind::RecvStatusOnClient);
        }
        ops
    }
}

/// Results of a completed batch. Only recv operations carry payloads;
/// completed send operations are implied by the batch completing at all.
#[derive(Debug, Default)]
pub struct BatchReply {
    /// Set when the batch contained RECV_INITIAL_METADATA.
    pub initial_metadata: Option<Metadata>,

    /// Set when the batch contained RECV_MESSAGE. The inner `None` is the
    /// end-of-stream marker.
    pub message: Option<Option<Vec<u8>>>,

    /// Set when the batch contained RECV_STATUS_ON_CLIENT.
    pub status: Option<RpcStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_has_no_ops() {
        let batch = Batch::new();
        assert!(batch.is_empty());
        assert!(!batch.has_send_ops());
        assert!(!batch.has_recv_ops());
    }

    #[test]
    fn ops_reflect_populated_slots() {
        let batch = Batch::new()
            .send_initial_metadata(Metadata::new())
            .send_message(OutboundMessage::new(vec![1, 2, 3]))
            .send_close()
            .recv_initial_metadata()
            .recv_message()
            .recv_status();
        assert_eq!(
            batch.ops(),
            vec![
                OpKind::SendInitialMetadata,
                OpKind::SendMessage,
                OpKind::SendCloseFromClient,
                OpKind::RecvInitialMetadata,
                OpKind::RecvMessage,
                OpKind::RecvStatusOnClient,
            ]
        );
    }

    #[test]
    fn send_and_recv_sides_detected() {
        let batch = Batch::new().send_close();
        assert!(batch.has_send_ops());
        assert!(!batch.has_recv_ops());

        let batch = Batch::new().recv_status();
        assert!(!batch.has_send_ops());
        assert!(batch.has_recv_ops());
    }
}
