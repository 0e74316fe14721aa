use std::fmt;

use thais_events::Priority;
use thais_scheduler::{Callback, CallbackResult, FireContext};

/// Work that runs right away on the connection's task. A returned payload is
/// sent back to the same connection.
pub type ImmediateAction = Box<dyn FnOnce() -> Option<Vec<u8>> + Send>;

/// What a decoded packet asks the server to do
pub enum PacketIntent<S> {
    /// Bypasses the scheduler entirely
    Immediate(ImmediateAction),
    /// Cooldown or delayed action, scheduled with the sending connection as
    /// its origin
    Delayed {
        delay_ms: i64,
        priority: Priority,
        label: Option<String>,
        action: Callback<S>,
    },
    /// The client asked to leave
    Disconnect,
}

impl<S> PacketIntent<S> {
    pub fn immediate<F>(action: F) -> Self
    where
        F: FnOnce() -> Option<Vec<u8>> + Send + 'static,
    {
        PacketIntent::Immediate(Box::new(action))
    }

    pub fn delayed<F>(delay_ms: i64, priority: Priority, action: F) -> Self
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        PacketIntent::Delayed {
            delay_ms,
            priority,
            label: None,
            action: Box::new(action),
        }
    }

    /// Attach a label to a delayed intent. Other intents are returned as is.
    pub fn labelled(self, name: impl Into<String>) -> Self {
        match self {
            PacketIntent::Delayed {
                delay_ms,
                priority,
                action,
                ..
            } => PacketIntent::Delayed {
                delay_ms,
                priority,
                label: Some(name.into()),
                action,
            },
            other => other,
        }
    }
}

impl<S> fmt::Debug for PacketIntent<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketIntent::Immediate(_) => f.write_str("Immediate"),
            PacketIntent::Delayed {
                delay_ms,
                priority,
                label,
                ..
            } => f
                .debug_struct("Delayed")
                .field("delay_ms", delay_ms)
                .field("priority", priority)
                .field("label", label)
                .finish_non_exhaustive(),
            PacketIntent::Disconnect => f.write_str("Disconnect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("packet 0x{opcode:02X} truncated: need {needed} bytes, got {got}")]
    Truncated { opcode: u8, needed: usize, got: usize },
}

/// Protocol-specific translation of raw packets into intents.
///
/// Implemented by the server; the bridge treats it as a black box.
pub trait PacketDecoder<S>: Send + Sync {
    fn decode(&self, packet: &[u8]) -> Result<Vec<PacketIntent<S>>, DecodeError>;
}

impl<S, F> PacketDecoder<S> for F
where
    F: Fn(&[u8]) -> Result<Vec<PacketIntent<S>>, DecodeError> + Send + Sync,
{
    fn decode(&self, packet: &[u8]) -> Result<Vec<PacketIntent<S>>, DecodeError> {
        self(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_only_touches_delayed() {
        let delayed: PacketIntent<()> =
            PacketIntent::delayed(100, Priority::HIGH, |_, _| Ok(None)).labelled("spell");
        match delayed {
            PacketIntent::Delayed { label, priority, .. } => {
                assert_eq!(label.as_deref(), Some("spell"));
                assert_eq!(priority, Priority::HIGH);
            }
            other => panic!("unexpected intent {other:?}"),
        }

        let disconnect: PacketIntent<()> = PacketIntent::Disconnect.labelled("ignored");
        assert!(matches!(disconnect, PacketIntent::Disconnect));
    }

    #[test]
    fn test_closure_decoder() {
        let decoder = |packet: &[u8]| -> Result<Vec<PacketIntent<()>>, DecodeError> {
            match packet.first() {
                None => Err(DecodeError::Empty),
                Some(0x01) => Ok(vec![PacketIntent::immediate(|| None)]),
                Some(op) => Err(DecodeError::UnknownOpcode(*op)),
            }
        };
        assert_eq!(decoder.decode(&[]).unwrap_err(), DecodeError::Empty);
        assert_eq!(decoder.decode(&[0x01]).unwrap().len(), 1);
        assert_eq!(
            decoder.decode(&[0xFF]).unwrap_err().to_string(),
            "unknown opcode 0xFF"
        );
    }
}
