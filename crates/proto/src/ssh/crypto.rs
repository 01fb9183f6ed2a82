//! Packet ciphers, MACs and compression for the binary packet codec.
//!
//! Three cipher shapes are supported:
//!
//! - **none** - the identity transform used before the first NEWKEYS
//! - **stream/block** ciphers ([`PacketCipher`]), e.g. AES-CTR, paired with
//!   a separate [`PacketMac`]
//! - **AEAD** ciphers ([`AeadCipher`]), e.g. AES-GCM (RFC 5647), which
//!   authenticate the packet themselves and leave the length in the clear
//!
//! Instances are built by the factories referenced from
//! [`crate::ssh::registry::AlgorithmRegistry`] and owned by exactly one
//! direction of one codec.
//!
//! # Security
//!
//! - MAC tags are compared in constant time ([`subtle::ConstantTimeEq`])
//! - AEAD nonces follow the RFC 5647 invocation counter and never repeat
//!   under one key
//! - Key material handed to the factories is zeroized by the caller

use crate::ssh::error::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Cipher that transforms whole packets in place.
pub trait PacketCipher: Send {
    /// Cipher block size in bytes (1 for pure stream ciphers).
    fn block_size(&self) -> usize;

    /// Encrypts `data` in place. `data` is a multiple of the block size.
    fn encrypt(&mut self, data: &mut [u8]);

    /// Decrypts `data` in place. `data` is a multiple of the block size.
    fn decrypt(&mut self, data: &mut [u8]);
}

/// Authenticated cipher that seals `padding_length || payload || padding`
/// with the packet length as associated data.
pub trait AeadCipher: Send {
    /// Block size used for padding alignment.
    fn block_size(&self) -> usize;

    /// Authentication tag size in bytes.
    fn tag_size(&self) -> usize;

    /// Encrypts `data` in place and appends the tag.
    fn seal(&mut self, aad: &[u8], data: &mut Vec<u8>) -> Result<()>;

    /// Verifies the trailing tag, decrypts in place and strips the tag.
    fn open(&mut self, aad: &[u8], data: &mut Vec<u8>) -> Result<()>;
}

/// Message authentication code keyed for one direction.
pub trait PacketMac: Send {
    /// Tag size in bytes.
    fn mac_size(&self) -> usize;

    /// Computes the tag over `uint32 seq || data`.
    fn compute(&self, seq: u32, data: &[u8]) -> Vec<u8>;

    /// Verifies a tag in constant time.
    fn verify(&self, seq: u32, data: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(seq, data);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

/// Payload compression for one direction.
pub trait Compressor: Send {
    /// Compresses an outbound payload.
    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses an inbound payload.
    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// The cipher half of a directional key set.
pub enum CipherState {
    /// No encryption (before the first NEWKEYS)
    None,
    /// Stream or block cipher with a separate MAC
    Stream(Box<dyn PacketCipher>),
    /// Authenticated encryption
    Aead(Box<dyn AeadCipher>),
}

impl CipherState {
    /// Block size for padding alignment (at least 8).
    pub fn block_size(&self) -> usize {
        let size = match self {
            CipherState::None => 8,
            CipherState::Stream(c) => c.block_size(),
            CipherState::Aead(c) => c.block_size(),
        };
        size.max(8)
    }

    /// Returns `true` for AEAD ciphers.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherState::Aead(_))
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            CipherState::None => "none",
            CipherState::Stream(_) => "stream",
            CipherState::Aead(_) => "aead",
        };
        f.debug_tuple("CipherState").field(&kind).finish()
    }
}

fn check_len(what: &str, material: &[u8], needed: usize) -> Result<()> {
    if material.len() < needed {
        return Err(Error::protocol(format!(
            "Insufficient key material for {}: expected {}, got {}",
            what,
            needed,
            material.len()
        )));
    }
    Ok(())
}

enum AesCtrInner {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

/// AES in counter mode (RFC 4344).
pub struct AesCtr {
    inner: AesCtrInner,
}

impl AesCtr {
    /// Creates an AES-CTR cipher; the key length (16, 24 or 32) picks the variant.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        check_len("aes-ctr iv", iv, 16)?;
        let iv = &iv[..16];
        let inner = match key.len() {
            16 => AesCtrInner::Aes128(Aes128Ctr::new(key.into(), iv.into())),
            24 => AesCtrInner::Aes192(Aes192Ctr::new(key.into(), iv.into())),
            32 => AesCtrInner::Aes256(Aes256Ctr::new(key.into(), iv.into())),
            other => {
                return Err(Error::protocol(format!(
                    "Invalid AES-CTR key length: {}",
                    other
                )))
            }
        };
        Ok(Self { inner })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            AesCtrInner::Aes128(c) => c.apply_keystream(data),
            AesCtrInner::Aes192(c) => c.apply_keystream(data),
            AesCtrInner::Aes256(c) => c.apply_keystream(data),
        }
    }
}

impl PacketCipher for AesCtr {
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        self.apply(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        self.apply(data);
    }
}

/// AES-GCM as used by `aes128-gcm@openssh.com` / `aes256-gcm@openssh.com`.
///
/// The 12-byte nonce is a 4-byte fixed field followed by a 64-bit
/// invocation counter that is incremented after every packet.
pub struct AesGcm {
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation: u64,
}

impl AesGcm {
    /// Creates an AES-GCM cipher; the key length (16 or 32) picks the variant.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        check_len("aes-gcm iv", iv, 12)?;
        let algorithm = match key.len() {
            16 => &AES_128_GCM,
            32 => &AES_256_GCM,
            other => {
                return Err(Error::protocol(format!(
                    "Invalid AES-GCM key length: {}",
                    other
                )))
            }
        };
        let unbound = UnboundKey::new(algorithm, key)
            .map_err(|_| Error::protocol("Failed to create AES-GCM key"))?;

        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);

        Ok(Self {
            key: LessSafeKey::new(unbound),
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

impl AeadCipher for AesGcm {
    fn block_size(&self) -> usize {
        16
    }

    fn tag_size(&self) -> usize {
        16
    }

    fn seal(&mut self, aad: &[u8], data: &mut Vec<u8>) -> Result<()> {
        let nonce = self.next_nonce();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad), data)
            .map_err(|_| Error::protocol("AES-GCM encryption failed"))
    }

    fn open(&mut self, aad: &[u8], data: &mut Vec<u8>) -> Result<()> {
        let nonce = self.next_nonce();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::from(aad), data)
            .map_err(|_| Error::CorruptPacket("AES-GCM authentication tag mismatch".into()))?
            .len();
        data.truncate(plaintext_len);
        Ok(())
    }
}

enum HmacInner {
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// HMAC over `uint32 seq || data` (RFC 4253 Section 6.4, RFC 6668).
pub struct HmacMac {
    inner: HmacInner,
    size: usize,
}

impl HmacMac {
    /// HMAC-SHA1 (20-byte key and tag).
    pub fn sha1(key: &[u8]) -> Result<Self> {
        check_len("hmac-sha1", key, 20)?;
        let mac = Hmac::<Sha1>::new_from_slice(&key[..20])
            .map_err(|_| Error::protocol("Invalid HMAC key"))?;
        Ok(Self {
            inner: HmacInner::Sha1(mac),
            size: 20,
        })
    }

    /// HMAC-SHA2-256 (32-byte key and tag).
    pub fn sha256(key: &[u8]) -> Result<Self> {
        check_len("hmac-sha2-256", key, 32)?;
        let mac = Hmac::<Sha256>::new_from_slice(&key[..32])
            .map_err(|_| Error::protocol("Invalid HMAC key"))?;
        Ok(Self {
            inner: HmacInner::Sha256(mac),
            size: 32,
        })
    }

    /// HMAC-SHA2-512 (64-byte key and tag).
    pub fn sha512(key: &[u8]) -> Result<Self> {
        check_len("hmac-sha2-512", key, 64)?;
        let mac = Hmac::<Sha512>::new_from_slice(&key[..64])
            .map_err(|_| Error::protocol("Invalid HMAC key"))?;
        Ok(Self {
            inner: HmacInner::Sha512(mac),
            size: 64,
        })
    }
}

impl PacketMac for HmacMac {
    fn mac_size(&self) -> usize {
        self.size
    }

    fn compute(&self, seq: u32, data: &[u8]) -> Vec<u8> {
        let seq = seq.to_be_bytes();
        match &self.inner {
            HmacInner::Sha1(template) => {
                let mut mac = template.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacInner::Sha256(template) => {
                let mut mac = template.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacInner::Sha512(template) => {
                let mut mac = template.clone();
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// The `none` compression method.
#[derive(Debug, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}
