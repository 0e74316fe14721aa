use std::sync::atomic::{AtomicBool, Ordering};

use thais_events::ConnectionId;
use tokio::sync::mpsc;

/// What the bridge needs from a client connection.
///
/// The transport owns the connection; the bridge only ever pushes bytes into
/// it and asks whether it is still alive.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;

    /// Stop accepting outbound data. The transport tears the socket down once
    /// it notices.
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("transport failure on {id}: {reason}")]
    Transport { id: ConnectionId, reason: String },
}

/// A [`Connection`] whose outbound frames land in an unbounded channel.
///
/// The receiving half is drained by a writer task owned by the transport.
#[derive(Debug)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: AtomicBool,
}

impl ChannelConnection {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            tx,
            open: AtomicBool::new(true),
        };
        (connection, rx)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed(self.id));
        }
        self.tx.send(bytes.to_vec()).map_err(|_| {
            self.open.store(false, Ordering::Release);
            ConnectionError::Transport {
                id: self.id,
                reason: "writer task is gone".to_string(),
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_reaches_receiver() {
        let (conn, mut rx) = ChannelConnection::new(ConnectionId::from_raw(1));
        conn.send(b"hello").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"hello".to_vec());
        assert!(conn.is_open());
    }

    #[test]
    fn test_closed_connection_refuses_data() {
        let (conn, mut rx) = ChannelConnection::new(ConnectionId::from_raw(2));
        conn.close();
        assert!(!conn.is_open());
        assert_eq!(
            conn.send(b"late"),
            Err(ConnectionError::Closed(ConnectionId::from_raw(2)))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_reads_as_closed() {
        let (conn, rx) = ChannelConnection::new(ConnectionId::from_raw(3));
        drop(rx);
        assert!(!conn.is_open());
        assert!(conn.send(b"x").is_err());
    }
}
