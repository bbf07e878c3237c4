//! Receive extensions: hooks that see every incoming message after the path
//! processors and may consume it.

use std::sync::Arc;

use super::ProbeMessage;
use crate::connection::PathAwareConnection;
use crate::transport::Message;

/// Inspects incoming messages. Returning `None` consumes the message.
pub trait ReceiveExtension: Send + Sync {
    fn handle_receive(&self, message: Message, connection: &PathAwareConnection) -> Option<Message>;
}

/// Runs several extensions. Every extension sees the message; it is passed on
/// only if none of them consumed it.
#[derive(Default, Clone)]
pub struct ReceiveChain {
    extensions: Vec<Arc<dyn ReceiveExtension>>,
}

impl ReceiveChain {
    pub fn new(extensions: Vec<Arc<dyn ReceiveExtension>>) -> Self {
        Self { extensions }
    }

    pub fn push(&mut self, extension: Arc<dyn ReceiveExtension>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl ReceiveExtension for ReceiveChain {
    fn handle_receive(&self, message: Message, connection: &PathAwareConnection) -> Option<Message> {
        let mut accepted = true;
        for extension in &self.extensions {
            if extension.handle_receive(message.clone(), connection).is_none() {
                accepted = false;
            }
        }
        accepted.then_some(message)
    }
}

impl std::fmt::Debug for ReceiveChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveChain")
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// Answers probe requests on the path they arrived over and drops probe
/// responses nobody was waiting for.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyProbeResponder;

impl ReceiveExtension for LatencyProbeResponder {
    fn handle_receive(&self, message: Message, connection: &PathAwareConnection) -> Option<Message> {
        match ProbeMessage::decode(&message.payload) {
            Ok(Some(request @ ProbeMessage::Request(_))) => {
                let reply = request.response().encode();
                if let Err(e) = connection.send(&reply, message.reply_path.as_ref()) {
                    tracing::debug!(id = request.id(), error = %e, "Failed to answer probe");
                }
                None
            }
            Ok(Some(ProbeMessage::Response(id))) => {
                tracing::trace!(id, "Dropping stray probe response");
                None
            }
            Ok(None) => Some(message),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed probe");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::path::Path;
    use crate::transport::LoopbackTransport;

    fn connection() -> (Arc<LoopbackTransport>, Arc<PathAwareConnection>, Path) {
        let path = Path::new("1-ff00:0:110#1 1-ff00:0:111#2", 1);
        let transport = Arc::new(
            LoopbackTransport::new(
                "1-ff00:0:110,127.0.0.1:4000".parse().unwrap(),
                "1-ff00:0:111,127.0.0.1:5000".parse().unwrap(),
            )
            .with_paths(vec![path.clone()]),
        );
        let connection = PathAwareConnection::new(transport.clone(), Vec::new(), ConnectionOptions::new());
        (transport, connection, path)
    }

    struct Counting(AtomicUsize);

    impl ReceiveExtension for Counting {
        fn handle_receive(&self, message: Message, _connection: &PathAwareConnection) -> Option<Message> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(message)
        }
    }

    #[tokio::test]
    async fn test_responder_answers_on_reply_path() {
        let (transport, connection, path) = connection();
        let request = Message::new(ProbeMessage::Request(7).encode()).with_reply_path(path.clone());

        assert!(LatencyProbeResponder.handle_receive(request, &connection).is_none());

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, ProbeMessage::Response(7).encode());
        assert_eq!(sent[0].pinned, Some(path));
    }

    #[tokio::test]
    async fn test_responder_drops_stray_and_malformed() {
        let (transport, connection, _) = connection();

        let stray = Message::new(ProbeMessage::Response(3).encode());
        assert!(LatencyProbeResponder.handle_receive(stray, &connection).is_none());
        let malformed = Message::new(&b"0x69\x01"[..]);
        assert!(LatencyProbeResponder.handle_receive(malformed, &connection).is_none());
        assert!(transport.take_sent().is_empty());

        let data = Message::new(&b"frame"[..]);
        assert!(LatencyProbeResponder.handle_receive(data, &connection).is_some());
    }

    #[tokio::test]
    async fn test_chain_runs_every_extension() {
        let (_transport, connection, path) = connection();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let chain = ReceiveChain::new(vec![Arc::new(LatencyProbeResponder), counting.clone()]);
        assert_eq!(chain.len(), 2);

        let request = Message::new(ProbeMessage::Request(1).encode()).with_reply_path(path);
        assert!(chain.handle_receive(request, &connection).is_none());
        assert!(chain.handle_receive(Message::new(&b"frame"[..]), &connection).is_some());
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
