//! Demo wire protocol.
//!
//! Every packet starts with a one-byte opcode. Multi-byte fields are little
//! endian.
//!
//! | opcode | body                          | effect                          |
//! |--------|-------------------------------|---------------------------------|
//! | `0x1E` | -                             | immediate pong `[0x1E]`         |
//! | `0x64` | `u16 delay_ms`, `u8 priority` | delayed action, ack `[0x65, u32 count]` |
//! | `0x14` | -                             | logout                          |

use byteorder::{ByteOrder, LittleEndian};
use thais_bridge::{DecodeError, PacketDecoder, PacketIntent};
use thais_events::Priority;

use crate::world::GameWorld;

pub const OP_PING: u8 = 0x1E;
pub const OP_ACTION: u8 = 0x64;
pub const OP_ACTION_ACK: u8 = 0x65;
pub const OP_LOGOUT: u8 = 0x14;

const ACTION_BODY_LEN: usize = 3;

/// Decoder for the demo protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoDecoder;

impl PacketDecoder<GameWorld> for DemoDecoder {
    fn decode(&self, packet: &[u8]) -> Result<Vec<PacketIntent<GameWorld>>, DecodeError> {
        let (&opcode, body) = packet.split_first().ok_or(DecodeError::Empty)?;
        match opcode {
            OP_PING => Ok(vec![PacketIntent::immediate(|| Some(vec![OP_PING]))]),
            OP_ACTION => {
                if body.len() < ACTION_BODY_LEN {
                    return Err(DecodeError::Truncated {
                        opcode,
                        needed: ACTION_BODY_LEN,
                        got: body.len(),
                    });
                }
                let delay_ms = LittleEndian::read_u16(&body[0..2]);
                let priority = Priority(body[2]);
                Ok(vec![action(delay_ms, priority)])
            }
            OP_LOGOUT => Ok(vec![PacketIntent::Disconnect]),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

fn action(delay_ms: u16, priority: Priority) -> PacketIntent<GameWorld> {
    PacketIntent::delayed(
        i64::from(delay_ms),
        priority,
        |world: &mut GameWorld, ctx| {
            let player = ctx
                .origin()
                .ok_or_else(|| anyhow::anyhow!("action {} has no player", ctx.id()))?;
            let count = world.record_action(player);
            Ok(Some(action_ack(count)))
        },
    )
    .labelled("action")
}

pub fn action_ack(count: u32) -> Vec<u8> {
    let mut ack = vec![OP_ACTION_ACK, 0, 0, 0, 0];
    LittleEndian::write_u32(&mut ack[1..], count);
    ack
}

/// Build an action packet, as a client would send it
pub fn action_packet(delay_ms: u16, priority: Priority) -> Vec<u8> {
    let mut packet = vec![OP_ACTION, 0, 0, priority.0];
    LittleEndian::write_u16(&mut packet[1..3], delay_ms);
    packet
}
