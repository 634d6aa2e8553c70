//! QPOS consensus packets. Each packet is the RLP list `[code, fields...]`;
//! block payloads are embedded as raw RLP so the committed bytes survive unchanged.

use crate::error::Error;
use crate::rlp::{self, RlpItem};
use crate::types::{NodeId, Signature};

pub const BLOCK_VOTE: u8 = 0x01;
pub const BLOCK_VOTE_ACK: u8 = 0x02;
pub const VOTE: u8 = 0x03;
pub const VOTE_ACK: u8 = 0x04;
pub const HEART: u8 = 0x05;
pub const BROAD_BLOCK: u8 = 0x06;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QposPacket {
    /// Leader proposal: view, leader signature over the pre-seal hash, raw block.
    BlockVote {
        view: u64,
        signature: Signature,
        block: Vec<u8>,
    },
    /// Reply to a proposal, addressed to the proposer.
    BlockVoteAck {
        vote: bool,
        view: u64,
        signature: Signature,
        target: NodeId,
    },
    /// Leadership bid for `view`, claiming local height `height`.
    Vote { view: u64, height: u64 },
    VoteAck { vote: bool },
    Heart { view: u64 },
    /// Committed block carrying its signature list.
    BroadBlock { block: Vec<u8> },
}

impl QposPacket {
    pub fn code(&self) -> u8 {
        match self {
            QposPacket::BlockVote { .. } => BLOCK_VOTE,
            QposPacket::BlockVoteAck { .. } => BLOCK_VOTE_ACK,
            QposPacket::Vote { .. } => VOTE,
            QposPacket::VoteAck { .. } => VOTE_ACK,
            QposPacket::Heart { .. } => HEART,
            QposPacket::BroadBlock { .. } => BROAD_BLOCK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QposPacket::BlockVote { .. } => "BlockVote",
            QposPacket::BlockVoteAck { .. } => "BlockVoteAck",
            QposPacket::Vote { .. } => "Vote",
            QposPacket::VoteAck { .. } => "VoteAck",
            QposPacket::Heart { .. } => "Heart",
            QposPacket::BroadBlock { .. } => "BroadBlock",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut items = vec![RlpItem::u64(self.code() as u64).encode()];
        match self {
            QposPacket::BlockVote { view, signature, block } => {
                items.push(RlpItem::u64(*view).encode());
                items.push(rlp::encode_bytes(signature));
                items.push(block.clone());
            }
            QposPacket::BlockVoteAck { vote, view, signature, target } => {
                items.push(RlpItem::bool(*vote).encode());
                items.push(RlpItem::u64(*view).encode());
                items.push(rlp::encode_bytes(signature));
                items.push(rlp::encode_bytes(target));
            }
            QposPacket::Vote { view, height } => {
                items.push(RlpItem::u64(*view).encode());
                items.push(RlpItem::u64(*height).encode());
            }
            QposPacket::VoteAck { vote } => items.push(RlpItem::bool(*vote).encode()),
            QposPacket::Heart { view } => items.push(RlpItem::u64(*view).encode()),
            QposPacket::BroadBlock { block } => items.push(block.clone()),
        }
        rlp::encode_list_of_encoded(&items)
    }

    pub fn decode(data: &[u8]) -> Result<QposPacket, Error> {
        let parts = rlp::split_list(data)?;
        let (code, fields) = parts
            .split_first()
            .ok_or_else(|| Error::Qpos("empty packet".to_string()))?;
        let code = rlp::decode(code)?.as_u64()?;
        let code = u8::try_from(code).map_err(|_| Error::Qpos(format!("unknown packet code {:#x}", code)))?;

        let expect = |n: usize| {
            if fields.len() == n {
                Ok(())
            } else {
                Err(Error::Qpos(format!(
                    "packet {:#04x} has {} fields, expected {}",
                    code,
                    fields.len(),
                    n
                )))
            }
        };

        let packet = match code {
            BLOCK_VOTE => {
                expect(3)?;
                QposPacket::BlockVote {
                    view: int(fields[0])?,
                    signature: fixed(fields[1])?,
                    block: block(fields[2])?,
                }
            }
            BLOCK_VOTE_ACK => {
                expect(4)?;
                QposPacket::BlockVoteAck {
                    vote: int(fields[0])? != 0,
                    view: int(fields[1])?,
                    signature: fixed(fields[2])?,
                    target: fixed(fields[3])?,
                }
            }
            VOTE => {
                expect(2)?;
                QposPacket::Vote {
                    view: int(fields[0])?,
                    height: int(fields[1])?,
                }
            }
            VOTE_ACK => {
                expect(1)?;
                QposPacket::VoteAck { vote: int(fields[0])? != 0 }
            }
            HEART => {
                expect(1)?;
                QposPacket::Heart { view: int(fields[0])? }
            }
            BROAD_BLOCK => {
                expect(1)?;
                QposPacket::BroadBlock { block: block(fields[0])? }
            }
            _ => return Err(Error::Qpos(format!("unknown packet code {:#x}", code))),
        };
        Ok(packet)
    }
}

fn int(raw: &[u8]) -> Result<u64, Error> {
    rlp::decode(raw)?.as_u64()
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N], Error> {
    let bytes = rlp::decode(raw)?.into_bytes()?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| Error::Qpos(format!("expected {} bytes, got {}", N, bytes.len())))
}

fn block(raw: &[u8]) -> Result<Vec<u8>, Error> {
    if !rlp::decode(raw)?.is_list() {
        return Err(Error::Qpos("block payload is not a list".to_string()));
    }
    Ok(raw.to_vec())
}
