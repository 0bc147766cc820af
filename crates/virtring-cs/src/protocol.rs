//! Transport control commands.
//!
//! Each command is `u32 command_type`, `u32 flags` and then its operands, all little-endian.
//! API-call encodings share the header but are produced by the callers' own codecs.

use crate::decoder::CommandDecoder;
use crate::encoder::CommandEncoder;
use crate::error::{CsError, DecodeError};

pub const COMMAND_HEADER_SIZE: usize = 8;

/// Encoded size of one [`CommandStreamDescription`].
pub const COMMAND_STREAM_DESCRIPTION_SIZE: usize = 4 + 8 + 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    SetReplyCommandStream = 178,
    ExecuteCommandStreams = 180,
    CreateRing = 188,
    DestroyRing = 189,
    NotifyRing = 190,
    SubmitVirtqueueSeqno = 191,
}

impl CommandType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            178 => CommandType::SetReplyCommandStream,
            180 => CommandType::ExecuteCommandStreams,
            188 => CommandType::CreateRing,
            189 => CommandType::DestroyRing,
            190 => CommandType::NotifyRing,
            191 => CommandType::SubmitVirtqueueSeqno,
            _ => return None,
        })
    }
}

/// A byte range inside a shared region, as seen by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStreamDescription {
    pub res_id: u32,
    pub offset: u64,
    pub size: u64,
}

/// Everything the remote needs to map a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingCreateInfo {
    pub ring_id: u64,
    pub res_id: u32,
    pub size: u32,
    pub head_offset: u32,
    pub tail_offset: u32,
    pub status_offset: u32,
    pub buffer_offset: u32,
    pub buffer_size: u32,
    pub extra_offset: u32,
    pub extra_size: u32,
    pub idle_timeout_ns: u64,
    pub report_period_us: u32,
}

const RING_CREATE_INFO_SIZE: usize = 8 + 4 * 9 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    CreateRing(RingCreateInfo),
    DestroyRing { ring_id: u64 },
    NotifyRing { ring_id: u64, seqno: u32, flags: u32 },
    /// Replies of following ring commands go to this stream.
    SetReplyCommandStream(CommandStreamDescription),
    /// Execute command streams that live outside the ring.
    ExecuteCommandStreams(Vec<CommandStreamDescription>),
    /// Bump the ring's roundtrip counter to `seqno` once everything before it has executed.
    SubmitVirtqueueSeqno { ring_id: u64, seqno: u32 },
}

impl ControlCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            ControlCommand::CreateRing(_) => CommandType::CreateRing,
            ControlCommand::DestroyRing { .. } => CommandType::DestroyRing,
            ControlCommand::NotifyRing { .. } => CommandType::NotifyRing,
            ControlCommand::SetReplyCommandStream(_) => CommandType::SetReplyCommandStream,
            ControlCommand::ExecuteCommandStreams(_) => CommandType::ExecuteCommandStreams,
            ControlCommand::SubmitVirtqueueSeqno { .. } => CommandType::SubmitVirtqueueSeqno,
        }
    }

    pub fn encoded_size(&self) -> usize {
        COMMAND_HEADER_SIZE
            + match self {
                ControlCommand::CreateRing(_) => RING_CREATE_INFO_SIZE,
                ControlCommand::DestroyRing { .. } => 8,
                ControlCommand::NotifyRing { .. } => 8 + 4 + 4,
                ControlCommand::SetReplyCommandStream(_) => COMMAND_STREAM_DESCRIPTION_SIZE,
                ControlCommand::ExecuteCommandStreams(streams) => {
                    4 + streams.len() * COMMAND_STREAM_DESCRIPTION_SIZE
                }
                ControlCommand::SubmitVirtqueueSeqno { .. } => 8 + 4,
            }
    }

    /// Append the command to `enc` as one contiguous record.
    pub fn encode(&self, enc: &mut CommandEncoder) -> Result<(), CsError> {
        enc.reserve(self.encoded_size())?;
        put_u32(enc, self.command_type() as u32);
        put_u32(enc, 0);

        match self {
            ControlCommand::CreateRing(info) => {
                put_u64(enc, info.ring_id);
                put_u32(enc, info.res_id);
                put_u32(enc, info.size);
                put_u32(enc, info.head_offset);
                put_u32(enc, info.tail_offset);
                put_u32(enc, info.status_offset);
                put_u32(enc, info.buffer_offset);
                put_u32(enc, info.buffer_size);
                put_u32(enc, info.extra_offset);
                put_u32(enc, info.extra_size);
                put_u64(enc, info.idle_timeout_ns);
                put_u32(enc, info.report_period_us);
            }
            ControlCommand::DestroyRing { ring_id } => put_u64(enc, *ring_id),
            ControlCommand::NotifyRing {
                ring_id,
                seqno,
                flags,
            } => {
                put_u64(enc, *ring_id);
                put_u32(enc, *seqno);
                put_u32(enc, *flags);
            }
            ControlCommand::SetReplyCommandStream(stream) => put_stream(enc, stream),
            ControlCommand::ExecuteCommandStreams(streams) => {
                put_u32(enc, streams.len() as u32);
                for stream in streams {
                    put_stream(enc, stream);
                }
            }
            ControlCommand::SubmitVirtqueueSeqno { ring_id, seqno } => {
                put_u64(enc, *ring_id);
                put_u32(enc, *seqno);
            }
        }
        Ok(())
    }

    /// Encode through a fixed local buffer, for side-channel submission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CsError> {
        let mut enc = CommandEncoder::local(self.encoded_size());
        self.encode(&mut enc)?;
        enc.commit();
        Ok(enc.local_bytes().to_vec())
    }

    /// Decode one command from the front of `dec`.
    pub fn decode(dec: &mut CommandDecoder<'_>) -> Result<Self, DecodeError> {
        let ty = dec.read_u32()?;
        let _flags = dec.read_u32()?;
        let Some(ty) = CommandType::from_u32(ty) else {
            dec.set_fatal();
            return Err(DecodeError::UnknownCommand(ty));
        };

        Ok(match ty {
            CommandType::CreateRing => ControlCommand::CreateRing(RingCreateInfo {
                ring_id: dec.read_u64()?,
                res_id: dec.read_u32()?,
                size: dec.read_u32()?,
                head_offset: dec.read_u32()?,
                tail_offset: dec.read_u32()?,
                status_offset: dec.read_u32()?,
                buffer_offset: dec.read_u32()?,
                buffer_size: dec.read_u32()?,
                extra_offset: dec.read_u32()?,
                extra_size: dec.read_u32()?,
                idle_timeout_ns: dec.read_u64()?,
                report_period_us: dec.read_u32()?,
            }),
            CommandType::DestroyRing => ControlCommand::DestroyRing {
                ring_id: dec.read_u64()?,
            },
            CommandType::NotifyRing => ControlCommand::NotifyRing {
                ring_id: dec.read_u64()?,
                seqno: dec.read_u32()?,
                flags: dec.read_u32()?,
            },
            CommandType::SetReplyCommandStream => {
                ControlCommand::SetReplyCommandStream(read_stream(dec)?)
            }
            CommandType::ExecuteCommandStreams => {
                let count = dec.read_u32()? as usize;
                // Bound the allocation by what the stream can actually hold.
                dec.ensure(count.saturating_mul(COMMAND_STREAM_DESCRIPTION_SIZE))?;
                let streams = (0..count)
                    .map(|_| read_stream(dec))
                    .collect::<Result<Vec<_>, _>>()?;
                ControlCommand::ExecuteCommandStreams(streams)
            }
            CommandType::SubmitVirtqueueSeqno => ControlCommand::SubmitVirtqueueSeqno {
                ring_id: dec.read_u64()?,
                seqno: dec.read_u32()?,
            },
        })
    }
}

/// Decode exactly one command occupying all of `bytes`.
pub fn decode_command(bytes: &[u8]) -> Result<ControlCommand, DecodeError> {
    let mut dec = CommandDecoder::new(bytes);
    let cmd = ControlCommand::decode(&mut dec)?;
    if dec.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(dec.remaining()));
    }
    Ok(cmd)
}

/// Decode a back-to-back sequence of commands.
pub fn decode_commands(bytes: &[u8]) -> Result<Vec<ControlCommand>, DecodeError> {
    let mut dec = CommandDecoder::new(bytes);
    let mut out = Vec::new();
    while dec.remaining() != 0 {
        out.push(ControlCommand::decode(&mut dec)?);
    }
    Ok(out)
}

fn put_u32(enc: &mut CommandEncoder, v: u32) {
    enc.write(&v.to_le_bytes());
}

fn put_u64(enc: &mut CommandEncoder, v: u64) {
    enc.write(&v.to_le_bytes());
}

fn put_stream(enc: &mut CommandEncoder, stream: &CommandStreamDescription) {
    put_u32(enc, stream.res_id);
    put_u64(enc, stream.offset);
    put_u64(enc, stream.size);
}

fn read_stream(dec: &mut CommandDecoder<'_>) -> Result<CommandStreamDescription, DecodeError> {
    Ok(CommandStreamDescription {
        res_id: dec.read_u32()?,
        offset: dec.read_u64()?,
        size: dec.read_u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn notify_ring_layout_is_stable() {
        let bytes = ControlCommand::NotifyRing {
            ring_id: 0x1122_3344_5566_7788,
            seqno: 0x100,
            flags: 0,
        }
        .to_bytes()
        .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&190u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        expected.extend_from_slice(&0x100u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn encoded_size_matches_output() {
        let cmds = [
            ControlCommand::CreateRing(RingCreateInfo {
                ring_id: 1,
                res_id: 2,
                size: 4096 + 192 + 4,
                head_offset: 0,
                tail_offset: 64,
                status_offset: 128,
                buffer_offset: 192,
                buffer_size: 4096,
                extra_offset: 4288,
                extra_size: 4,
                idle_timeout_ns: 50_000_000,
                report_period_us: 3_000_000,
            }),
            ControlCommand::DestroyRing { ring_id: 9 },
            ControlCommand::SetReplyCommandStream(CommandStreamDescription {
                res_id: 4,
                offset: 128,
                size: 64,
            }),
            ControlCommand::ExecuteCommandStreams(vec![
                CommandStreamDescription {
                    res_id: 5,
                    offset: 0,
                    size: 5000,
                },
                CommandStreamDescription {
                    res_id: 6,
                    offset: 16,
                    size: 1,
                },
            ]),
            ControlCommand::SubmitVirtqueueSeqno {
                ring_id: 3,
                seqno: u32::MAX,
            },
        ];

        for cmd in cmds {
            let bytes = cmd.to_bytes().unwrap();
            assert_eq!(bytes.len(), cmd.encoded_size());
            assert_eq!(decode_command(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn decode_rejects_unknown_and_truncated_commands() {
        let mut bytes = 7u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            decode_command(&bytes).unwrap_err(),
            DecodeError::UnknownCommand(7)
        );

        let full = ControlCommand::DestroyRing { ring_id: 1 }.to_bytes().unwrap();
        assert!(matches!(
            decode_command(&full[..full.len() - 1]).unwrap_err(),
            DecodeError::Truncated { .. }
        ));

        let mut long = full.clone();
        long.push(0);
        assert_eq!(
            decode_command(&long).unwrap_err(),
            DecodeError::TrailingBytes(1)
        );
    }

    #[test]
    fn execute_count_larger_than_stream_is_truncation() {
        let mut bytes = 180u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_command(&bytes).unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn sequences_decode_in_order() {
        let mut enc = CommandEncoder::local(256);
        let a = ControlCommand::DestroyRing { ring_id: 1 };
        let b = ControlCommand::SubmitVirtqueueSeqno {
            ring_id: 1,
            seqno: 5,
        };
        a.encode(&mut enc).unwrap();
        b.encode(&mut enc).unwrap();
        enc.commit();
        assert_eq!(decode_commands(enc.local_bytes()).unwrap(), vec![a, b]);
    }
}
