//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: At least 4 bytes
//! - `4 + packet_length` is a multiple of `max(block size, 8)`; in
//!   encrypt-then-MAC and AEAD modes the clear length field is left out of
//!   the sum
//! - Maximum packet size: 35000 bytes by default
//!
//! # Modes
//!
//! | Mode    | Encrypted               | MAC input                    |
//! |---------|-------------------------|------------------------------|
//! | classic | whole packet            | `seq ‖ plaintext packet`     |
//! | ETM     | all but `packet_length` | `seq ‖ length ‖ ciphertext`  |
//! | AEAD    | all but `packet_length` | tag, `packet_length` as AAD  |
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::packet::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec());
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```

use crate::ssh::crypto::{CipherState, Compressor, NoCompression, PacketMac};
use crate::ssh::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Default maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Plaintext SSH binary packet.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - The packet is aligned to the block size it was built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet aligned to 8 bytes, length field included.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_alignment(payload, 8, true)
    }

    /// Creates a packet aligned to `block_size` (at least 8).
    ///
    /// With `include_length` false the 4-byte length field is left out of
    /// the alignment sum, as required by encrypt-then-MAC and AEAD modes.
    /// Padding bytes come from a CSPRNG.
    pub fn with_alignment(payload: Vec<u8>, block_size: usize, include_length: bool) -> Self {
        let block_size = block_size.max(8);
        let header = if include_length { 5 } else { 1 };
        let unpadded = header + payload.len();

        let mut padding_len = block_size - unpadded % block_size;
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes this packet (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.packet_length());
        buf.put_u32(self.packet_length() as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a plaintext packet including its length field.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] if the data is truncated, longer than
    /// declared, above [`MAX_PACKET_SIZE`], or has invalid padding.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }
        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        if packet_length > MAX_PACKET_SIZE {
            return Err(Error::protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if buf.len() != packet_length {
            return Err(Error::protocol(format!(
                "Packet length mismatch: declared {}, got {} bytes",
                packet_length,
                buf.len()
            )));
        }
        Self::from_body(buf)
    }

    /// Parses `padding_length ‖ payload ‖ padding`.
    fn from_body(body: &[u8]) -> Result<Self> {
        let (&padding_length, rest) = body
            .split_first()
            .ok_or_else(|| Error::protocol("Empty packet body"))?;
        let padding_length = padding_length as usize;

        if padding_length < MIN_PADDING_LEN {
            return Err(Error::protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if padding_length >= body.len() {
            return Err(Error::protocol(format!(
                "Padding length {} exceeds packet length {}",
                padding_length,
                body.len()
            )));
        }

        let (payload, padding) = rest.split_at(rest.len() - padding_length);
        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

/// Cipher, MAC and compression for one direction.
pub struct DirectionalKeys {
    /// Active cipher
    pub cipher: CipherState,
    /// Active MAC, absent for AEAD ciphers and before the first NEWKEYS
    pub mac: Option<Box<dyn PacketMac>>,
    /// Encrypt-then-MAC framing
    pub etm: bool,
    /// Active compression
    pub compression: Box<dyn Compressor>,
}

impl DirectionalKeys {
    /// Cleartext state used until the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: CipherState::None,
            mac: None,
            etm: false,
            compression: Box::new(NoCompression),
        }
    }

    /// Length field travels in the clear.
    fn clear_length(&self) -> bool {
        self.etm || self.cipher.is_aead()
    }

    fn tag_len(&self) -> usize {
        match (&self.cipher, &self.mac) {
            (CipherState::Aead(c), _) => c.tag_size(),
            (_, Some(mac)) => mac.mac_size(),
            _ => 0,
        }
    }
}

impl Default for DirectionalKeys {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionalKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac.as_ref().map(|m| m.mac_size()))
            .field("etm", &self.etm)
            .finish_non_exhaustive()
    }
}

/// Outbound half of the codec: frames, encrypts and authenticates payloads.
#[derive(Debug, Default)]
pub struct PacketSealer {
    keys: DirectionalKeys,
    seq: u32,
}

impl PacketSealer {
    /// Creates a cleartext sealer starting at sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the next packet.
    pub fn sequence_number(&self) -> u32 {
        self.seq
    }

    /// Replaces the active keys; the sequence number carries on.
    pub fn install(&mut self, keys: DirectionalKeys) {
        self.keys = keys;
    }

    /// Encodes one payload into wire bytes and advances the sequence number.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let keys = &mut self.keys;
        let payload = keys.compression.compress(payload)?;
        let clear_length = keys.clear_length();
        let packet = Packet::with_alignment(payload, keys.cipher.block_size(), !clear_length);
        let mut bytes = packet.to_bytes();

        match &mut keys.cipher {
            CipherState::Aead(cipher) => {
                let mut body = bytes.split_off(4);
                cipher.seal(&bytes, &mut body)?;
                bytes.extend_from_slice(&body);
            }
            CipherState::Stream(cipher) if keys.etm => {
                cipher.encrypt(&mut bytes[4..]);
                if let Some(mac) = &keys.mac {
                    let tag = mac.compute(self.seq, &bytes);
                    bytes.extend_from_slice(&tag);
                }
            }
            CipherState::Stream(cipher) => {
                let tag = keys.mac.as_ref().map(|mac| mac.compute(self.seq, &bytes));
                cipher.encrypt(&mut bytes);
                if let Some(tag) = tag {
                    bytes.extend_from_slice(&tag);
                }
            }
            CipherState::None => {
                if let Some(mac) = &keys.mac {
                    let tag = mac.compute(self.seq, &bytes);
                    bytes.extend_from_slice(&tag);
                }
            }
        }

        trace!(seq = self.seq, len = bytes.len(), "Sealed packet");
        self.seq = self.seq.wrapping_add(1);
        Ok(bytes)
    }
}

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Sequence number the packet was received under
    pub seq: u32,
    /// Decompressed payload
    pub payload: Vec<u8>,
    /// Bytes consumed from the stream, MAC included
    pub wire_len: usize,
}

/// Inbound half of the codec: reads, authenticates and decrypts packets.
#[derive(Debug)]
pub struct PacketOpener {
    keys: DirectionalKeys,
    seq: u32,
    max_packet_size: usize,
}

impl Default for PacketOpener {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl PacketOpener {
    /// Creates a cleartext opener accepting packets up to `max_packet_size`.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            keys: DirectionalKeys::none(),
            seq: 0,
            max_packet_size,
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence_number(&self) -> u32 {
        self.seq
    }

    /// Replaces the active keys; the sequence number carries on.
    pub fn install(&mut self, keys: DirectionalKeys) {
        self.keys = keys;
    }

    fn check_length(&self, packet_length: usize, aligned: usize, block: usize) -> Result<()> {
        if packet_length > self.max_packet_size {
            return Err(Error::protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, self.max_packet_size
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN {
            return Err(Error::protocol(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }
        if aligned % block != 0 {
            return Err(Error::protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, block
            )));
        }
        Ok(())
    }

    /// Reads exactly one packet from `reader`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProtocolViolation`] for a bad length or padding
    /// - [`Error::CorruptPacket`] for a MAC or AEAD tag mismatch
    /// - [`Error::ConnectionLost`] when the stream ends mid-packet
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> Result<InboundPacket>
    where
        R: AsyncRead + Unpin,
    {
        let block = self.keys.cipher.block_size();
        let tag_len = self.keys.tag_len();

        let mut packet = if self.keys.clear_length() {
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes).await?;
            let packet_length = u32::from_be_bytes(len_bytes) as usize;
            self.check_length(packet_length, packet_length, block)?;

            let mut packet = Vec::with_capacity(4 + packet_length + tag_len);
            packet.extend_from_slice(&len_bytes);
            packet.resize(4 + packet_length + tag_len, 0);
            reader.read_exact(&mut packet[4..]).await?;
            packet
        } else {
            let mut packet = vec![0u8; block];
            reader.read_exact(&mut packet).await?;
            if let CipherState::Stream(cipher) = &mut self.keys.cipher {
                cipher.decrypt(&mut packet);
            }
            let packet_length =
                u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
            self.check_length(packet_length, 4 + packet_length, block)?;

            packet.resize(4 + packet_length + tag_len, 0);
            reader.read_exact(&mut packet[block..]).await?;
            if let CipherState::Stream(cipher) = &mut self.keys.cipher {
                cipher.decrypt(&mut packet[block..4 + packet_length]);
            }
            packet
        };
        let wire_len = packet.len();

        let body = self.authenticate_and_decrypt(&mut packet)?;
        let parsed = Packet::from_body(&body[4..])?;
        let payload = self.keys.compression.decompress(parsed.payload())?;

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        trace!(seq, len = wire_len, "Opened packet");
        Ok(InboundPacket {
            seq,
            payload,
            wire_len,
        })
    }

    /// Verifies the MAC or tag and returns `length ‖ plaintext body`.
    fn authenticate_and_decrypt(&mut self, packet: &mut Vec<u8>) -> Result<Vec<u8>> {
        let keys = &mut self.keys;
        match &mut keys.cipher {
            CipherState::Aead(cipher) => {
                let mut body = packet.split_off(4);
                cipher.open(&packet[..], &mut body)?;
                packet.extend_from_slice(&body);
                Ok(std::mem::take(packet))
            }
            cipher => {
                let Some(mac) = &keys.mac else {
                    return Ok(std::mem::take(packet));
                };
                let tag = packet.split_off(packet.len() - mac.mac_size());
                // Classic mode: `packet` is already plaintext. ETM: ciphertext.
                if !mac.verify(self.seq, &packet[..], &tag) {
                    return Err(Error::CorruptPacket(format!(
                        "MAC verification failed for packet {}",
                        self.seq
                    )));
                }
                if keys.etm {
                    if let CipherState::Stream(c) = cipher {
                        c.decrypt(&mut packet[4..]);
                    }
                }
                Ok(std::mem::take(packet))
            }
        }
    }
}
