//! Diffie-Hellman key exchange methods (RFC 4253, RFC 4419, RFC 8268, RFC 8731).
//!
//! Each method is a small state machine behind [`KexMethod`]: it produces the
//! client's first message, consumes the server's method messages (type bytes
//! 30 to 49, which different methods reuse) and finally yields a
//! [`KexOutput`] carrying the shared secret, the exchange hash and the
//! server's host key and signature. Signature verification and key
//! installation happen in [`crate::ssh::kex`].
//!
//! # Methods
//!
//! - `curve25519-sha256`, `curve25519-sha256@libssh.org` (X25519 via `ring`)
//! - `diffie-hellman-group14-sha256`, `diffie-hellman-group14-sha1`
//! - `diffie-hellman-group-exchange-sha256`, `diffie-hellman-group-exchange-sha1`
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex_dh::{derive_key, HashAlgorithm};
//!
//! let shared_secret = vec![0x42; 32];
//! let exchange_hash = vec![0x01; 32];
//! let session_id = vec![0x02; 32];
//!
//! // Encryption key client to server, longer than one SHA-256 block
//! let key = derive_key(HashAlgorithm::Sha256, &shared_secret, &exchange_hash, &session_id, b'C', 64);
//! assert_eq!(key.len(), 64);
//! ```

use crate::ssh::error::{Error, Result};
use crate::ssh::message::{KexMethodMessage, Message, MessageType};
use crate::ssh::wire::{self, Reader};
use bytes::{BufMut, BytesMut};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

const MSG_KEX_DH_GEX_GROUP: u8 = 31;

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy methods only)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha1 => run::<Sha1>(parts),
            HashAlgorithm::Sha256 => run::<Sha256>(parts),
            HashAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }
}

/// Group sizes (in bits) requested during a group exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRange {
    /// Smallest acceptable prime
    pub min: u32,
    /// Preferred prime size
    pub preferred: u32,
    /// Largest acceptable prime
    pub max: u32,
}

impl Default for GroupRange {
    fn default() -> Self {
        Self {
            min: 2048,
            preferred: 3072,
            max: 8192,
        }
    }
}

/// Transcript pieces shared by every exchange hash.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeInput<'a> {
    /// Client identification string, without CR LF
    pub client_id: &'a [u8],
    /// Server identification string, without CR LF
    pub server_id: &'a [u8],
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
}

/// Incremental builder for the exchange hash H.
///
/// ```text
/// H = HASH(string V_C || string V_S || string I_C || string I_S || string K_S || <method fields> || mpint K)
/// ```
#[derive(Debug)]
pub struct ExchangeHash {
    buf: BytesMut,
}

impl ExchangeHash {
    /// Starts the transcript with identification strings, KEXINIT payloads
    /// and the server host key.
    pub fn new(input: &ExchangeInput<'_>, host_key: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        wire::put_string(&mut buf, input.client_id);
        wire::put_string(&mut buf, input.server_id);
        wire::put_string(&mut buf, input.client_kexinit);
        wire::put_string(&mut buf, input.server_kexinit);
        wire::put_string(&mut buf, host_key);
        Self { buf }
    }

    /// Appends a `uint32`.
    pub fn put_u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a `string`.
    pub fn put_string(mut self, data: &[u8]) -> Self {
        wire::put_string(&mut self.buf, data);
        self
    }

    /// Appends an `mpint` from its unsigned magnitude.
    pub fn put_mpint(mut self, magnitude: &[u8]) -> Self {
        wire::put_mpint(&mut self.buf, magnitude);
        self
    }

    /// Hashes the transcript.
    pub fn finish(self, hash: HashAlgorithm) -> Vec<u8> {
        hash.digest(&[&self.buf])
    }
}

/// Result of a completed key exchange method.
pub struct KexOutput {
    /// Shared secret K as an unsigned big-endian magnitude
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// Exchange hash H
    pub exchange_hash: Vec<u8>,
    /// Server host key blob K_S
    pub host_key: Vec<u8>,
    /// Server signature blob over H
    pub signature: Vec<u8>,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("host_key_len", &self.host_key.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of feeding one server message to a [`KexMethod`].
#[derive(Debug)]
pub enum KexStep {
    /// Send this message and wait for the next one
    Send(Message),
    /// The method has finished
    Done(KexOutput),
}

/// Client side of a Diffie-Hellman style key exchange method.
pub trait KexMethod: Send {
    /// Hash used for the exchange hash and key derivation.
    fn hash(&self) -> HashAlgorithm;

    /// First message the client sends.
    fn start(&mut self) -> Result<Message>;

    /// Consumes a server method message.
    fn handle(&mut self, msg: &KexMethodMessage, input: &ExchangeInput<'_>) -> Result<KexStep>;
}

fn method_message(code: MessageType, body: BytesMut) -> Message {
    Message::KexMethod(KexMethodMessage {
        code: code as u8,
        body: body.to_vec(),
    })
}

fn unexpected(method: &str, code: u8) -> Error {
    Error::protocol(format!(
        "unexpected message {} during {} key exchange",
        code, method
    ))
}

/// Diffie-Hellman Group 14 parameters (RFC 3526, 2048-bit MODP group).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const P_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
        29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
        EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
        E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
        EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
        C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
        83655D23DCA3AD961C62F356208552BB9ED529077096966D\
        670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
        E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
        DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
        15728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// DH Group 14 prime
    pub static P: Lazy<BigUint> =
        Lazy::new(|| BigUint::parse_bytes(P_HEX, 16).unwrap_or_default());

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Ephemeral finite-field DH key pair over a given group.
struct DhKeyPair {
    p: BigUint,
    g: BigUint,
    /// Private exponent x
    private_key: Zeroizing<Vec<u8>>,
    /// Public value e = g^x mod p
    public_key: BigUint,
}

impl DhKeyPair {
    fn generate(p: &BigUint, g: &BigUint, hash: HashAlgorithm) -> Self {
        // Exponent twice the hash strength, bounded by the group size
        let bits = ((hash.output_len() * 16) as u64).min(p.bits().saturating_sub(1));
        let mut rng = rand::thread_rng();
        let x = loop {
            let candidate = rng.gen_biguint(bits);
            if candidate > BigUint::from(1u32) {
                break candidate;
            }
        };
        let public_key = g.modpow(&x, p);

        Self {
            p: p.clone(),
            g: g.clone(),
            private_key: Zeroizing::new(x.to_bytes_be()),
            public_key,
        }
    }

    /// Computes K = f^x mod p after checking 1 < f < p-1.
    fn agree(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let f = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        if f <= one || f >= &self.p - &one {
            return Err(Error::protocol("DH public value out of range"));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(Zeroizing::new(f.modpow(&x, &self.p).to_bytes_be()))
    }
}

/// Parsed KEXDH_REPLY / KEX_DH_GEX_REPLY / KEX_ECDH_REPLY.
struct ServerReply<'a> {
    host_key: &'a [u8],
    public: &'a [u8],
    signature: &'a [u8],
}

impl<'a> ServerReply<'a> {
    fn parse(body: &'a [u8], public_is_mpint: bool) -> Result<Self> {
        let mut r = Reader::new(body);
        let host_key = r.read_string()?;
        let public = if public_is_mpint {
            r.read_mpint()?
        } else {
            r.read_string()?
        };
        let signature = r.read_string()?;
        r.finish("key exchange reply")?;
        Ok(Self {
            host_key,
            public,
            signature,
        })
    }
}

/// `diffie-hellman-group14-sha256` and `diffie-hellman-group14-sha1`.
pub struct FixedGroupKex {
    hash: HashAlgorithm,
    keys: Option<DhKeyPair>,
}

impl FixedGroupKex {
    /// Group 14 with the given hash.
    pub fn group14(hash: HashAlgorithm) -> Self {
        Self { hash, keys: None }
    }
}

impl KexMethod for FixedGroupKex {
    fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    fn start(&mut self) -> Result<Message> {
        let keys = DhKeyPair::generate(&dh_group14::P, &dh_group14::G, self.hash);
        let mut body = BytesMut::new();
        wire::put_mpint(&mut body, &keys.public_key.to_bytes_be());
        self.keys = Some(keys);
        Ok(method_message(MessageType::KexdhInit, body))
    }

    fn handle(&mut self, msg: &KexMethodMessage, input: &ExchangeInput<'_>) -> Result<KexStep> {
        let keys = match (&self.keys, msg.code) {
            (Some(keys), code) if code == MessageType::KexdhReply as u8 => keys,
            (_, code) => return Err(unexpected("diffie-hellman-group14", code)),
        };
        let reply = ServerReply::parse(&msg.body, true)?;
        let shared_secret = keys.agree(reply.public)?;

        let exchange_hash = ExchangeHash::new(input, reply.host_key)
            .put_mpint(&keys.public_key.to_bytes_be())
            .put_mpint(reply.public)
            .put_mpint(&shared_secret)
            .finish(self.hash);

        Ok(KexStep::Done(KexOutput {
            shared_secret,
            exchange_hash,
            host_key: reply.host_key.to_vec(),
            signature: reply.signature.to_vec(),
        }))
    }
}

/// `diffie-hellman-group-exchange-sha256` and `-sha1` (RFC 4419).
pub struct GroupExchangeKex {
    hash: HashAlgorithm,
    range: GroupRange,
    keys: Option<DhKeyPair>,
    requested: bool,
}

impl GroupExchangeKex {
    /// Creates a group exchange requesting primes within `range`.
    pub fn new(hash: HashAlgorithm, range: GroupRange) -> Self {
        Self {
            hash,
            range,
            keys: None,
            requested: false,
        }
    }

    fn on_group(&mut self, body: &[u8]) -> Result<KexStep> {
        let mut r = Reader::new(body);
        let p = BigUint::from_bytes_be(r.read_mpint()?);
        let g = BigUint::from_bytes_be(r.read_mpint()?);
        r.finish("KEX_DH_GEX_GROUP")?;

        let bits = p.bits();
        if bits < u64::from(self.range.min) || bits > u64::from(self.range.max) {
            return Err(Error::protocol(format!(
                "group exchange prime has {} bits, requested {}..={}",
                bits, self.range.min, self.range.max
            )));
        }
        let one = BigUint::from(1u32);
        if !p.bit(0) || g <= one || g >= &p - &one {
            return Err(Error::protocol("invalid group exchange parameters"));
        }
        debug!(bits, "Received group exchange prime");

        let keys = DhKeyPair::generate(&p, &g, self.hash);
        let mut out = BytesMut::new();
        wire::put_mpint(&mut out, &keys.public_key.to_bytes_be());
        self.keys = Some(keys);
        Ok(KexStep::Send(method_message(MessageType::KexDhGexInit, out)))
    }

    fn on_reply(&self, keys: &DhKeyPair, body: &[u8], input: &ExchangeInput<'_>) -> Result<KexStep> {
        let reply = ServerReply::parse(body, true)?;
        let shared_secret = keys.agree(reply.public)?;

        let exchange_hash = ExchangeHash::new(input, reply.host_key)
            .put_u32(self.range.min)
            .put_u32(self.range.preferred)
            .put_u32(self.range.max)
            .put_mpint(&keys.p.to_bytes_be())
            .put_mpint(&keys.g.to_bytes_be())
            .put_mpint(&keys.public_key.to_bytes_be())
            .put_mpint(reply.public)
            .put_mpint(&shared_secret)
            .finish(self.hash);

        Ok(KexStep::Done(KexOutput {
            shared_secret,
            exchange_hash,
            host_key: reply.host_key.to_vec(),
            signature: reply.signature.to_vec(),
        }))
    }
}

impl KexMethod for GroupExchangeKex {
    fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    fn start(&mut self) -> Result<Message> {
        let mut body = BytesMut::new();
        body.put_u32(self.range.min);
        body.put_u32(self.range.preferred);
        body.put_u32(self.range.max);
        self.requested = true;
        Ok(method_message(MessageType::KexDhGexRequest, body))
    }

    fn handle(&mut self, msg: &KexMethodMessage, input: &ExchangeInput<'_>) -> Result<KexStep> {
        if msg.code == MSG_KEX_DH_GEX_GROUP && self.requested && self.keys.is_none() {
            return self.on_group(&msg.body);
        }
        match &self.keys {
            Some(keys) if msg.code == MessageType::KexDhGexReply as u8 => {
                self.on_reply(keys, &msg.body, input)
            }
            _ => Err(unexpected("diffie-hellman-group-exchange", msg.code)),
        }
    }
}

/// `curve25519-sha256` and `curve25519-sha256@libssh.org` (RFC 8731).
pub struct Curve25519Kex {
    private_key: Option<EphemeralPrivateKey>,
    public_key: [u8; 32],
}

impl Curve25519Kex {
    /// Creates an exchange; the ephemeral key is generated by [`KexMethod::start`].
    pub fn new() -> Self {
        Self {
            private_key: None,
            public_key: [0u8; 32],
        }
    }
}

impl Default for Curve25519Kex {
    fn default() -> Self {
        Self::new()
    }
}

impl KexMethod for Curve25519Kex {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn start(&mut self) -> Result<Message> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| Error::protocol("failed to generate Curve25519 key"))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| Error::protocol("failed to compute Curve25519 public key"))?;
        self.public_key.copy_from_slice(public_key.as_ref());
        self.private_key = Some(private_key);

        let mut body = BytesMut::new();
        wire::put_string(&mut body, &self.public_key);
        Ok(method_message(MessageType::KexdhInit, body))
    }

    fn handle(&mut self, msg: &KexMethodMessage, input: &ExchangeInput<'_>) -> Result<KexStep> {
        if msg.code != MessageType::KexdhReply as u8 || self.private_key.is_none() {
            return Err(unexpected("curve25519", msg.code));
        }
        let reply = ServerReply::parse(&msg.body, false)?;
        if reply.public.len() != 32 {
            return Err(Error::protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                reply.public.len()
            )));
        }
        let private_key = self
            .private_key
            .take()
            .ok_or_else(|| unexpected("curve25519", msg.code))?;

        let peer = UnparsedPublicKey::new(&X25519, reply.public);
        let shared_secret = agree_ephemeral(private_key, &peer, |material| {
            Zeroizing::new(material.to_vec())
        })
        .map_err(|_| Error::protocol("Curve25519 key agreement failed"))?;
        if shared_secret.iter().all(|&b| b == 0) {
            return Err(Error::protocol("Curve25519 shared secret is zero"));
        }

        // The raw X25519 output is interpreted as an unsigned big-endian integer
        let exchange_hash = ExchangeHash::new(input, reply.host_key)
            .put_string(&self.public_key)
            .put_string(reply.public)
            .put_mpint(&shared_secret)
            .finish(HashAlgorithm::Sha256);

        Ok(KexStep::Done(KexOutput {
            shared_secret,
            exchange_hash,
            host_key: reply.host_key.to_vec(),
            signature: reply.signature.to_vec(),
        }))
    }
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...   truncated to `len`
/// ```
///
/// `shared_secret` is the unsigned magnitude of K, encoded here as an mpint.
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    len: usize,
) -> Vec<u8> {
    let k = Zeroizing::new(wire::encode_mpint(shared_secret));
    let mut key = hash.digest(&[&k, exchange_hash, &[letter], session_id]);
    while key.len() < len {
        let block = hash.digest(&[&k, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}

/// Group 14 prime, for peers that need to mirror the fixed-group exchange.
pub fn group14_prime() -> &'static BigUint {
    Lazy::force(&dh_group14::P)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> (Vec<u8>, Vec<u8>) {
        (b"client kexinit".to_vec(), b"server kexinit".to_vec())
    }

    fn exchange_input<'a>(ic: &'a [u8], is: &'a [u8]) -> ExchangeInput<'a> {
        ExchangeInput {
            client_id: b"SSH-2.0-client",
            server_id: b"SSH-2.0-server",
            client_kexinit: ic,
            server_kexinit: is,
        }
    }

    fn reply_body(host_key: &[u8], public: &[u8], mpint: bool) -> Vec<u8> {
        let mut body = BytesMut::new();
        wire::put_string(&mut body, host_key);
        if mpint {
            wire::put_mpint(&mut body, public);
        } else {
            wire::put_string(&mut body, public);
        }
        wire::put_string(&mut body, b"signature");
        body.to_vec()
    }

    fn kex_body(msg: &Message) -> Vec<u8> {
        match msg {
            Message::KexMethod(m) => m.body.clone(),
            other => panic!("expected method message, got {:?}", other),
        }
    }

    #[test]
    fn test_group14_prime() {
        assert_eq!(group14_prime().bits(), 2048);
    }

    #[test]
    fn test_group14_exchange_agrees_with_server() {
        let (ic, is) = input();
        let mut client = FixedGroupKex::group14(HashAlgorithm::Sha256);
        let init = client.start().unwrap();
        assert_eq!(init.code(), 30);

        let e_bytes = kex_body(&init);
        let e = Reader::new(&e_bytes).read_mpint().unwrap().to_vec();

        // Server side
        let server = DhKeyPair::generate(&dh_group14::P, &dh_group14::G, HashAlgorithm::Sha256);
        let f = server.public_key.to_bytes_be();
        let server_secret = server.agree(&e).unwrap();

        let reply = KexMethodMessage {
            code: 31,
            body: reply_body(b"host key", &f, true),
        };
        let out = match client.handle(&reply, &exchange_input(&ic, &is)).unwrap() {
            KexStep::Done(out) => out,
            KexStep::Send(m) => panic!("unexpected {:?}", m),
        };

        assert_eq!(*out.shared_secret, *server_secret);
        assert_eq!(out.exchange_hash.len(), 32);
        assert_eq!(out.host_key, b"host key");
        assert_eq!(out.signature, b"signature");

        let expected = ExchangeHash::new(&exchange_input(&ic, &is), b"host key")
            .put_mpint(&e)
            .put_mpint(&f)
            .put_mpint(&server_secret)
            .finish(HashAlgorithm::Sha256);
        assert_eq!(out.exchange_hash, expected);
    }

    #[test]
    fn test_dh_rejects_out_of_range_public() {
        let keys = DhKeyPair::generate(&dh_group14::P, &dh_group14::G, HashAlgorithm::Sha1);
        assert!(keys.agree(&[1]).is_err());
        assert!(keys.agree(&[]).is_err());
        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(keys.agree(&p_minus_one).is_err());
        assert!(keys.agree(&[2]).is_ok());
    }

    #[test]
    fn test_group_exchange_flow() {
        let (ic, is) = input();
        let range = GroupRange {
            min: 1024,
            preferred: 2048,
            max: 4096,
        };
        let mut client = GroupExchangeKex::new(HashAlgorithm::Sha256, range);
        let request = client.start().unwrap();
        assert_eq!(request.code(), 34);
        assert_eq!(
            kex_body(&request),
            [0, 0, 4, 0, 0, 0, 8, 0, 0, 0, 16, 0].to_vec()
        );

        let mut group = BytesMut::new();
        wire::put_mpint(&mut group, &dh_group14::P.to_bytes_be());
        wire::put_mpint(&mut group, &[2]);
        let step = client
            .handle(
                &KexMethodMessage {
                    code: 31,
                    body: group.to_vec(),
                },
                &exchange_input(&ic, &is),
            )
            .unwrap();
        let init = match step {
            KexStep::Send(m) => m,
            KexStep::Done(_) => panic!("group exchange finished early"),
        };
        assert_eq!(init.code(), 32);
        let e_bytes = kex_body(&init);
        let e = Reader::new(&e_bytes).read_mpint().unwrap().to_vec();

        let server = DhKeyPair::generate(&dh_group14::P, &dh_group14::G, HashAlgorithm::Sha256);
        let f = server.public_key.to_bytes_be();
        let step = client
            .handle(
                &KexMethodMessage {
                    code: 33,
                    body: reply_body(b"hk", &f, true),
                },
                &exchange_input(&ic, &is),
            )
            .unwrap();
        match step {
            KexStep::Done(out) => assert_eq!(*out.shared_secret, *server.agree(&e).unwrap()),
            KexStep::Send(m) => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn test_group_exchange_rejects_small_prime() {
        let (ic, is) = input();
        let mut client = GroupExchangeKex::new(HashAlgorithm::Sha256, GroupRange::default());
        client.start().unwrap();

        // 2048-bit prime is fine, a 1024-bit one is below the requested minimum
        let small = BigUint::from(1u32) << 1023usize | BigUint::from(1u32);
        let mut group = BytesMut::new();
        wire::put_mpint(&mut group, &small.to_bytes_be());
        wire::put_mpint(&mut group, &[2]);
        let result = client.handle(
            &KexMethodMessage {
                code: 31,
                body: group.to_vec(),
            },
            &exchange_input(&ic, &is),
        );
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_curve25519_exchange() {
        let (ic, is) = input();
        let mut client = Curve25519Kex::new();
        let init = client.start().unwrap();
        let q_c_body = kex_body(&init);
        let q_c = Reader::new(&q_c_body).read_string().unwrap().to_vec();
        assert_eq!(q_c.len(), 32);

        let rng = SystemRandom::new();
        let server_key = EphemeralPrivateKey::generate(&X25519, &rng).unwrap();
        let q_s = server_key.compute_public_key().unwrap().as_ref().to_vec();
        let server_secret = agree_ephemeral(
            server_key,
            &UnparsedPublicKey::new(&X25519, &q_c),
            |m| m.to_vec(),
        )
        .unwrap();

        let reply = KexMethodMessage {
            code: 31,
            body: reply_body(b"hk", &q_s, false),
        };
        let out = match client.handle(&reply, &exchange_input(&ic, &is)).unwrap() {
            KexStep::Done(out) => out,
            KexStep::Send(m) => panic!("unexpected {:?}", m),
        };
        assert_eq!(*out.shared_secret, server_secret);

        let expected = ExchangeHash::new(&exchange_input(&ic, &is), b"hk")
            .put_string(&q_c)
            .put_string(&q_s)
            .put_mpint(&server_secret)
            .finish(HashAlgorithm::Sha256);
        assert_eq!(out.exchange_hash, expected);
    }

    #[test]
    fn test_curve25519_rejects_wrong_message() {
        let (ic, is) = input();
        let mut client = Curve25519Kex::new();
        client.start().unwrap();
        let result = client.handle(
            &KexMethodMessage {
                code: 33,
                body: vec![],
            },
            &exchange_input(&ic, &is),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_derive_key_lengths() {
        for hash in [HashAlgorithm::Sha1, HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            for len in [12, 16, 20, 24, 32, 64, 100] {
                let key = derive_key(hash, &[0x42; 32], &[1; 32], &[2; 32], b'C', len);
                assert_eq!(key.len(), len);
            }
        }
    }

    #[test]
    fn test_derive_key_extension_hashes_all_output() {
        let hash = HashAlgorithm::Sha1;
        let k = [0x80u8; 16];
        let h = [7u8; 20];
        let key = derive_key(hash, &k, &h, &h, b'A', 60);

        let k_enc = wire::encode_mpint(&k);
        let k1 = hash.digest(&[&k_enc, &h, b"A", &h]);
        let k2 = hash.digest(&[&k_enc, &h, &k1]);
        let k12 = [k1.clone(), k2.clone()].concat();
        let k3 = hash.digest(&[&k_enc, &h, &k12]);

        assert_eq!(&key[..20], &k1[..]);
        assert_eq!(&key[20..40], &k2[..]);
        assert_eq!(&key[40..60], &k3[..]);
    }

    #[test]
    fn test_derive_key_deterministic_and_letter_dependent() {
        let a = derive_key(HashAlgorithm::Sha256, &[9; 32], &[1; 32], &[2; 32], b'A', 32);
        let b = derive_key(HashAlgorithm::Sha256, &[9; 32], &[1; 32], &[2; 32], b'A', 32);
        let c = derive_key(HashAlgorithm::Sha256, &[9; 32], &[1; 32], &[2; 32], b'B', 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
