//! Opaque wire types borrowed from the host chain's own specification.
//!
//! The core never interprets these beyond moving bytes around: block and
//! transaction validation, signature verification and public-key parsing
//! belong to the chain's own codec, referenced here by name only.

use std::fmt;

use crate::error::{Error, Result};

/// A 32-byte chain-defined digest (block id, transaction id, chain id...).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum256(pub [u8; 32]);

impl Checksum256 {
    pub const LENGTH: usize = 32;

    pub fn zero() -> Self {
        Self([0; Self::LENGTH])
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != Self::LENGTH * 2 {
            return Err(Error::Config(format!(
                "chain id hex must be {} characters, got {}",
                Self::LENGTH * 2,
                hex.len()
            )));
        }
        let mut out = [0u8; Self::LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            let s = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(s, 16)
                .map_err(|_| Error::Config(format!("invalid hex digit in {hex}")))?;
        }
        Ok(Self(out))
    }

    /// EOS-family block ids encode the block number in their first four
    /// bytes (big-endian). Not used to validate anything, only to let
    /// callers that already trust a `block_id` recover its height.
    pub fn block_num(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Debug for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Microseconds since the Unix epoch, the chain's wire time representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn zero() -> Self {
        Self(0)
    }
}

/// Length of a chain public key on the wire: one type byte plus 33 bytes
/// of compressed curve data.
pub const PUBLIC_KEY_LENGTH: usize = 34;

/// A chain public key. The core never derives or verifies these; it only
/// ever sends the sentinel value below on behalf of unsigned peers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// The sentinel key sent by an unsigned observer. The chain protocol
    /// permits this; implementations must not synthesize a real key here.
    pub fn sentinel() -> Self {
        Self([0u8; PUBLIC_KEY_LENGTH])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(sentinel={})", self == &Self::sentinel())
    }
}

/// Length of a chain signature on the wire.
pub const SIGNATURE_LENGTH: usize = 65;

/// A chain signature. See [`PublicKey::sentinel`]: the core only ever
/// sends the all-zero signature, never a real one.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn zero() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(zero={})", self == &Self::zero())
    }
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return Err(Error::framing("buffer too short"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub(crate) fn checksum256(&mut self) -> Result<Checksum256> {
        let b = self.take(Checksum256::LENGTH)?;
        let mut out = [0u8; Checksum256::LENGTH];
        out.copy_from_slice(b);
        Ok(Checksum256(out))
    }

    pub(crate) fn timestamp(&mut self) -> Result<Timestamp> {
        Ok(Timestamp(self.u64_le()?))
    }

    pub(crate) fn public_key(&mut self) -> Result<PublicKey> {
        let b = self.take(PUBLIC_KEY_LENGTH)?;
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out.copy_from_slice(b);
        Ok(PublicKey(out))
    }

    pub(crate) fn signature(&mut self) -> Result<Signature> {
        let b = self.take(SIGNATURE_LENGTH)?;
        let mut out = [0u8; SIGNATURE_LENGTH];
        out.copy_from_slice(b);
        Ok(Signature(out))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.varuint()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|e| Error::framing(e.to_string()))
    }

    pub(crate) fn bytes_to_end(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// LEB128 varint, same encoding the chain uses for vector lengths.
    pub(crate) fn varuint(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::framing("varuint too long"));
            }
        }
        Ok(result)
    }
}

pub(crate) fn write_varuint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varuint(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}
