//! The chain message union: eight variants, each with a fixed binary
//! layout, keyed by a one-byte tag. Unknown tags are a fatal frame error.

use crate::error::{Error, Result};
use crate::wire::types::{
    write_string, write_varuint, Checksum256, Cursor, PublicKey, Signature, Timestamp,
    PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};

/// The message type tag, the first byte of every packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    GoAway = 1,
    Time = 2,
    Notice = 3,
    Request = 4,
    SyncRequest = 5,
    SignedBlock = 6,
    PackedTransaction = 7,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => MessageType::Handshake,
            1 => MessageType::GoAway,
            2 => MessageType::Time,
            3 => MessageType::Notice,
            4 => MessageType::Request,
            5 => MessageType::SyncRequest,
            6 => MessageType::SignedBlock,
            7 => MessageType::PackedTransaction,
            other => return Err(Error::UnknownTag(other)),
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A decoded chain message, tagged by variant.
#[derive(Debug, Clone)]
pub enum Message {
    Handshake(HandshakeMessage),
    GoAway(GoAwayMessage),
    Time(TimeMessage),
    Notice(NoticeMessage),
    Request(RequestMessage),
    SyncRequest(SyncRequestMessage),
    SignedBlock(SignedBlock),
    PackedTransaction(PackedTransaction),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::GoAway(_) => MessageType::GoAway,
            Message::Time(_) => MessageType::Time,
            Message::Notice(_) => MessageType::Notice,
            Message::Request(_) => MessageType::Request,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::SignedBlock(_) => MessageType::SignedBlock,
            Message::PackedTransaction(_) => MessageType::PackedTransaction,
        }
    }

    /// Serializes the message body (without the length prefix or the tag
    /// byte, which the framing layer in [`crate::wire`] owns).
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Message::Handshake(m) => m.encode(),
            Message::GoAway(m) => m.encode(),
            Message::Time(m) => m.encode(),
            Message::Notice(m) => m.encode(),
            Message::Request(m) => m.encode(),
            Message::SyncRequest(m) => m.encode(),
            Message::SignedBlock(m) => m.encode(),
            Message::PackedTransaction(m) => m.encode(),
        }
    }

    pub fn decode(message_type: MessageType, body: &[u8]) -> Result<Self> {
        Ok(match message_type {
            MessageType::Handshake => Message::Handshake(HandshakeMessage::decode(body)?),
            MessageType::GoAway => Message::GoAway(GoAwayMessage::decode(body)?),
            MessageType::Time => Message::Time(TimeMessage::decode(body)?),
            MessageType::Notice => Message::Notice(NoticeMessage::decode(body)?),
            MessageType::Request => Message::Request(RequestMessage::decode(body)?),
            MessageType::SyncRequest => Message::SyncRequest(SyncRequestMessage::decode(body)?),
            MessageType::SignedBlock => Message::SignedBlock(SignedBlock::decode(body)?),
            MessageType::PackedTransaction => {
                Message::PackedTransaction(PackedTransaction::decode(body)?)
            }
        })
    }
}

/// Announces chain id, node id, head and LIB. Sent by both sides on a new
/// connection, and re-sent whenever a sync window completes.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub network_version: u16,
    pub chain_id: Checksum256,
    pub node_id: Checksum256,
    pub key: PublicKey,
    pub time: Timestamp,
    pub token: Checksum256,
    pub sig: Signature,
    pub p2p_address: String,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
    pub head_num: u32,
    pub head_id: Checksum256,
    pub os: String,
    pub agent: String,
    pub generation: i16,
}

impl HandshakeMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.network_version.to_le_bytes());
        buf.extend_from_slice(&self.chain_id.0);
        buf.extend_from_slice(&self.node_id.0);
        buf.extend_from_slice(&self.key.0);
        buf.extend_from_slice(&self.time.0.to_le_bytes());
        buf.extend_from_slice(&self.token.0);
        buf.extend_from_slice(&self.sig.0);
        write_string(&mut buf, &self.p2p_address);
        buf.extend_from_slice(&self.last_irreversible_block_num.to_le_bytes());
        buf.extend_from_slice(&self.last_irreversible_block_id.0);
        buf.extend_from_slice(&self.head_num.to_le_bytes());
        buf.extend_from_slice(&self.head_id.0);
        write_string(&mut buf, &self.os);
        write_string(&mut buf, &self.agent);
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            network_version: c.u16_le()?,
            chain_id: c.checksum256()?,
            node_id: c.checksum256()?,
            key: c.public_key()?,
            time: c.timestamp()?,
            token: c.checksum256()?,
            sig: c.signature()?,
            p2p_address: c.string()?,
            last_irreversible_block_num: c.u32_le()?,
            last_irreversible_block_id: c.checksum256()?,
            head_num: c.u32_le()?,
            head_id: c.checksum256()?,
            os: c.string()?,
            agent: c.string()?,
            generation: c.u16_le()? as i16,
        })
    }
}

/// The reason a peer is being asked (or is asking us) to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayReason {
    NoReason,
    SelfConnect,
    Duplicate,
    WrongChain,
    WrongVersion,
    Forked,
    Unlinkable,
    BadTransaction,
    Validation,
    Benign,
    Fatal,
    Other(u8),
}

impl GoAwayReason {
    fn to_tag(self) -> u8 {
        match self {
            GoAwayReason::NoReason => 0,
            GoAwayReason::SelfConnect => 1,
            GoAwayReason::Duplicate => 2,
            GoAwayReason::WrongChain => 3,
            GoAwayReason::WrongVersion => 4,
            GoAwayReason::Forked => 5,
            GoAwayReason::Unlinkable => 6,
            GoAwayReason::BadTransaction => 7,
            GoAwayReason::Validation => 8,
            GoAwayReason::Benign => 9,
            GoAwayReason::Fatal => 10,
            GoAwayReason::Other(t) => t,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => GoAwayReason::NoReason,
            1 => GoAwayReason::SelfConnect,
            2 => GoAwayReason::Duplicate,
            3 => GoAwayReason::WrongChain,
            4 => GoAwayReason::WrongVersion,
            5 => GoAwayReason::Forked,
            6 => GoAwayReason::Unlinkable,
            7 => GoAwayReason::BadTransaction,
            8 => GoAwayReason::Validation,
            9 => GoAwayReason::Benign,
            10 => GoAwayReason::Fatal,
            other => GoAwayReason::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoAwayMessage {
    pub reason: GoAwayReason,
    pub node_id: Checksum256,
}

impl GoAwayMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + Checksum256::LENGTH);
        buf.push(self.reason.to_tag());
        buf.extend_from_slice(&self.node_id.0);
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            reason: GoAwayReason::from_tag(c.u8()?),
            node_id: c.checksum256()?,
        })
    }
}

/// A keep-alive round trip, used to estimate clock skew and latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeMessage {
    pub origin: Timestamp,
    pub receive: Timestamp,
    pub transmit: Timestamp,
}

impl TimeMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.origin.0.to_le_bytes());
        buf.extend_from_slice(&self.receive.0.to_le_bytes());
        buf.extend_from_slice(&self.transmit.0.to_le_bytes());
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            origin: c.timestamp()?,
            receive: c.timestamp()?,
            transmit: c.timestamp()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdListMode {
    None,
    CatchUp,
    LastIrrCatchUp,
    Normal,
}

impl IdListMode {
    fn to_tag(self) -> u8 {
        match self {
            IdListMode::None => 0,
            IdListMode::CatchUp => 1,
            IdListMode::LastIrrCatchUp => 2,
            IdListMode::Normal => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => IdListMode::None,
            1 => IdListMode::CatchUp,
            2 => IdListMode::LastIrrCatchUp,
            3 => IdListMode::Normal,
            other => return Err(Error::framing(format!("bad id list mode {other}"))),
        })
    }
}

/// A range of block (or transaction) ids a peer is announcing or
/// requesting. `pending` is the count of ids the announcer has beyond
/// what is listed in `ids`.
#[derive(Debug, Clone, Default)]
pub struct BlockIdRange {
    pub mode: Option<IdListMode>,
    pub pending: u32,
    pub ids: Vec<Checksum256>,
}

impl BlockIdRange {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.mode.unwrap_or(IdListMode::None).to_tag());
        write_varuint(&mut buf, self.pending);
        write_varuint(&mut buf, self.ids.len() as u32);
        for id in &self.ids {
            buf.extend_from_slice(&id.0);
        }
        buf
    }

    fn decode(c: &mut Cursor<'_>) -> Result<Self> {
        let mode = IdListMode::from_tag(c.u8()?)?;
        let pending = c.varuint()?;
        let count = c.varuint()? as usize;
        let mut ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            ids.push(c.checksum256()?);
        }
        Ok(Self {
            mode: Some(mode),
            pending,
            ids,
        })
    }
}

/// Announces blocks or transactions the sender has, without being asked.
#[derive(Debug, Clone, Default)]
pub struct NoticeMessage {
    pub known_trx: BlockIdRange,
    pub known_blocks: BlockIdRange,
}

impl NoticeMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = self.known_trx.encode();
        buf.extend(self.known_blocks.encode());
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            known_trx: BlockIdRange::decode(&mut c)?,
            known_blocks: BlockIdRange::decode(&mut c)?,
        })
    }
}

/// Requests blocks or transactions by id (not a range). Unused by this
/// client; included for protocol completeness.
#[derive(Debug, Clone, Default)]
pub struct RequestMessage {
    pub req_trx: BlockIdRange,
    pub req_blocks: BlockIdRange,
}

impl RequestMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = self.req_trx.encode();
        buf.extend(self.req_blocks.encode());
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            req_trx: BlockIdRange::decode(&mut c)?,
            req_blocks: BlockIdRange::decode(&mut c)?,
        })
    }
}

/// Requests a contiguous range of blocks by number. `end_block` is
/// exclusive on the wire; the sync engine always passes `requested_end + 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRequestMessage {
    pub start_block: u32,
    pub end_block: u32,
}

impl SyncRequestMessage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.start_block.to_le_bytes());
        buf.extend_from_slice(&self.end_block.to_le_bytes());
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        Ok(Self {
            start_block: c.u32_le()?,
            end_block: c.u32_le()?,
        })
    }
}

/// A block pushed by a peer. Only the header fields the sync engine needs
/// are decoded; the rest of the chain-defined block body (transactions,
/// producer schedule, signature) is carried opaquely, since its codec
/// belongs to the host chain, not this core.
#[derive(Debug, Clone)]
pub struct SignedBlock {
    pub block_number: u32,
    pub block_id: Checksum256,
    pub previous: Checksum256,
    pub timestamp: Timestamp,
    pub body: Vec<u8>,
}

impl SignedBlock {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(44 + self.body.len());
        buf.extend_from_slice(&self.block_number.to_le_bytes());
        buf.extend_from_slice(&self.block_id.0);
        buf.extend_from_slice(&self.previous.0);
        buf.extend_from_slice(&self.timestamp.0.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        let block_number = c.u32_le()?;
        let block_id = c.checksum256()?;
        let previous = c.checksum256()?;
        let timestamp = c.timestamp()?;
        let rest = c.bytes_to_end().to_vec();
        Ok(Self {
            block_number,
            block_id,
            previous,
            timestamp,
            body: rest,
        })
    }
}

/// An opaque, possibly-compressed transaction. Never inspected by this
/// core (transaction gossip/execution are non-goals); kept only so the
/// tag is round-trippable.
#[derive(Debug, Clone)]
pub struct PackedTransaction {
    pub compression: u8,
    pub body: Vec<u8>,
}

impl PackedTransaction {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.body.len());
        buf.push(self.compression);
        buf.extend_from_slice(&self.body);
        buf
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(body);
        let compression = c.u8()?;
        let rest = c.bytes_to_end().to_vec();
        Ok(Self {
            compression,
            body: rest,
        })
    }
}

const _: () = {
    // sanity: the constants above must agree with the cursor helpers
    assert!(PUBLIC_KEY_LENGTH == 34);
    assert!(SIGNATURE_LENGTH == 65);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let msg = HandshakeMessage {
            network_version: 1206,
            chain_id: Checksum256([7; 32]),
            node_id: Checksum256([9; 32]),
            key: PublicKey::sentinel(),
            time: Timestamp(1234),
            token: Checksum256::zero(),
            sig: Signature::zero(),
            p2p_address: "peer-a".to_string(),
            last_irreversible_block_num: 1,
            last_irreversible_block_id: Checksum256::zero(),
            head_num: 10,
            head_id: Checksum256([1; 32]),
            os: "linux".to_string(),
            agent: "eosio-p2p-core".to_string(),
            generation: 3,
        };
        let encoded = msg.encode();
        let decoded = HandshakeMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.head_num, 10);
        assert_eq!(decoded.p2p_address, "peer-a");
        assert_eq!(decoded.agent, "eosio-p2p-core");
        assert_eq!(decoded.generation, 3);
    }

    #[test]
    fn sync_request_round_trips() {
        let msg = SyncRequestMessage {
            start_block: 1,
            end_block: 51,
        };
        let decoded = SyncRequestMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.start_block, 1);
        assert_eq!(decoded.end_block, 51);
    }

    #[test]
    fn signed_block_round_trips() {
        let msg = SignedBlock {
            block_number: 42,
            block_id: Checksum256([42; 32]),
            previous: Checksum256([41; 32]),
            timestamp: Timestamp(99),
            body: vec![1, 2, 3, 4],
        };
        let decoded = SignedBlock::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.block_number, 42);
        assert_eq!(decoded.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(MessageType::from_tag(200).is_err());
    }
}
