//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - Algorithm negotiation
//! - The per-handshake [`KeyExchange`] context
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client name the server also lists)
//! 3. Method messages (DH, group exchange or ECDH) from [`crate::ssh::kex_dh`]
//! 4. Server signature verified, host key callback consulted
//! 5. Both sides send SSH_MSG_NEWKEYS; each direction switches keys on its
//!    own NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::{negotiate_algorithm, KexInit};
//! use kestrel_proto::ssh::registry::Preferences;
//!
//! let kexinit = KexInit::from_preferences(&Preferences::default());
//! assert_eq!(kexinit.kex_algorithms()[0], "curve25519-sha256");
//! assert_eq!(kexinit.to_bytes()[0], 20); // SSH_MSG_KEXINIT
//!
//! let client = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! let server = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes128-ctr");
//! ```

use crate::ssh::config::SessionConfig;
use crate::ssh::error::{Error, Result};
use crate::ssh::hostkey::HostKeyInfo;
use crate::ssh::kex_dh::{derive_key, ExchangeInput, KexMethod, KexStep};
use crate::ssh::message::{KexMethodMessage, Message, MessageType};
use crate::ssh::packet::DirectionalKeys;
use crate::ssh::registry::{AlgorithmRegistry, Preferences};
use crate::ssh::wire::{self, Reader};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use std::fmt;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// MAC name recorded when an AEAD cipher provides integrity.
pub const IMPLICIT_MAC: &str = "<implicit>";

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
    /// Payload exactly as sent or received; hashed into H as I_C / I_S
    payload: Vec<u8>,
}

impl KexInit {
    /// Creates a KEXINIT proposing `prefs`, with a random cookie.
    pub fn from_preferences(prefs: &Preferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let mut kexinit = Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.cipher_c2s.clone(),
            encryption_algorithms_server_to_client: prefs.cipher_s2c.clone(),
            mac_algorithms_client_to_server: prefs.mac_c2s.clone(),
            mac_algorithms_server_to_client: prefs.mac_s2c.clone(),
            compression_algorithms_client_to_server: prefs.compression_c2s.clone(),
            compression_algorithms_server_to_client: prefs.compression_s2c.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
            payload: Vec::new(),
        };
        kexinit.payload = kexinit.encode();
        kexinit
    }

    /// Sets the first_kex_packet_follows flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self.payload = self.encode();
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Payload including the SSH_MSG_KEXINIT byte.
    ///
    /// A parsed KEXINIT returns the received bytes unchanged, so the
    /// exchange hash covers exactly what the peer sent, reserved field and
    /// non-canonical booleans included.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.payload.clone()
    }

    /// Encodes the fields.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT
    /// byte[16]     cookie
    /// name-list    x 10
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        for list in [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_algorithms_client_to_server,
            &self.encryption_algorithms_server_to_client,
            &self.mac_algorithms_client_to_server,
            &self.mac_algorithms_server_to_client,
            &self.compression_algorithms_client_to_server,
            &self.compression_algorithms_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ] {
            wire::put_name_list(&mut buf, list);
        }

        wire::put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT payload, including the message type byte.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let code = r.read_u8()?;
        if code != MessageType::KexInit as u8 {
            return Err(Error::protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                code
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kexinit = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_algorithms_client_to_server: r.read_name_list()?,
            encryption_algorithms_server_to_client: r.read_name_list()?,
            mac_algorithms_client_to_server: r.read_name_list()?,
            mac_algorithms_server_to_client: r.read_name_list()?,
            compression_algorithms_client_to_server: r.read_name_list()?,
            compression_algorithms_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
            payload: data.to_vec(),
        };
        // uint32 reserved
        r.read_u32()?;
        r.finish("SSH_MSG_KEXINIT")?;
        Ok(kexinit)
    }
}

/// Picks the first algorithm in `client` that `server` also lists.
///
/// # Errors
///
/// [`Error::AlgorithmNegotiation`] naming `category` if nothing matches.
pub fn negotiate_algorithm(
    category: &'static str,
    client: &[String],
    server: &[String],
) -> Result<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| Error::AlgorithmNegotiation {
            category,
            client: client.join(","),
            server: server.join(","),
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_c2s: String,
    /// Cipher server to client
    pub cipher_s2c: String,
    /// MAC client to server ([`IMPLICIT_MAC`] for AEAD ciphers)
    pub mac_c2s: String,
    /// MAC server to client ([`IMPLICIT_MAC`] for AEAD ciphers)
    pub mac_s2c: String,
    /// Compression client to server
    pub compression_c2s: String,
    /// Compression server to client
    pub compression_s2c: String,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category of `client` against `server`.
    ///
    /// AEAD ciphers satisfy the MAC category of their direction.
    pub fn negotiate(
        client: &KexInit,
        server: &KexInit,
        registry: &AlgorithmRegistry,
    ) -> Result<Self> {
        let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let cipher_c2s = negotiate_algorithm(
            "encryption client->server",
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_s2c = negotiate_algorithm(
            "encryption server->client",
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;

        let is_aead = |name: &str| registry.cipher(name).map_or(false, |c| c.aead);
        let mac_c2s = if is_aead(&cipher_c2s) {
            IMPLICIT_MAC.to_string()
        } else {
            negotiate_algorithm(
                "MAC client->server",
                &client.mac_algorithms_client_to_server,
                &server.mac_algorithms_client_to_server,
            )?
        };
        let mac_s2c = if is_aead(&cipher_s2c) {
            IMPLICIT_MAC.to_string()
        } else {
            negotiate_algorithm(
                "MAC server->client",
                &client.mac_algorithms_server_to_client,
                &server.mac_algorithms_server_to_client,
            )?
        };

        Ok(Self {
            kex,
            host_key,
            cipher_c2s,
            cipher_s2c,
            mac_c2s,
            mac_s2c,
            compression_c2s: negotiate_algorithm(
                "compression client->server",
                &client.compression_algorithms_client_to_server,
                &server.compression_algorithms_client_to_server,
            )?,
            compression_s2c: negotiate_algorithm(
                "compression server->client",
                &client.compression_algorithms_server_to_client,
                &server.compression_algorithms_server_to_client,
            )?,
        })
    }
}

/// Session-wide inputs a key exchange needs.
#[derive(Clone, Copy)]
pub struct KexContext<'a> {
    /// Session configuration (registry, host key callback, group range)
    pub config: &'a SessionConfig,
    /// Client identification string, without CR LF
    pub client_id: &'a str,
    /// Server identification string, without CR LF
    pub server_id: &'a str,
    /// Session identifier, once the first exchange finished
    pub session_id: Option<&'a [u8]>,
    /// Host key accepted by the previous exchange
    pub previous_host_key: Option<&'a [u8]>,
}

/// Key material for both directions, wiped on drop.
struct DerivedKeys {
    iv_c2s: Zeroizing<Vec<u8>>,
    iv_s2c: Zeroizing<Vec<u8>>,
    key_c2s: Zeroizing<Vec<u8>>,
    key_s2c: Zeroizing<Vec<u8>>,
    mac_c2s: Zeroizing<Vec<u8>>,
    mac_s2c: Zeroizing<Vec<u8>>,
}

/// Summary of a finished key exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Algorithms now in use
    pub algorithms: NegotiatedAlgorithms,
    /// Session identifier (unchanged by rekeys)
    pub session_id: Vec<u8>,
    /// Exchange hash of this exchange
    pub exchange_hash: Vec<u8>,
    /// Accepted server host key blob
    pub host_key: Vec<u8>,
}

/// Transient state of one key exchange, from our KEXINIT to both NEWKEYS.
pub struct KeyExchange {
    client_proposal: KexInit,
    client_kexinit: Vec<u8>,
    server_kexinit: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    method: Option<Box<dyn KexMethod>>,
    skip_guessed_packet: bool,
    keys: Option<DerivedKeys>,
    outcome: Option<KexOutcome>,
    outbound_installed: bool,
    inbound_installed: bool,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("negotiated", &self.negotiated)
            .field("keys_ready", &self.keys.is_some())
            .field("outbound_installed", &self.outbound_installed)
            .field("inbound_installed", &self.inbound_installed)
            .finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Starts a key exchange with our proposal.
    pub fn new(proposal: KexInit) -> Self {
        let client_kexinit = proposal.to_bytes();
        Self {
            client_proposal: proposal,
            client_kexinit,
            server_kexinit: None,
            negotiated: None,
            method: None,
            skip_guessed_packet: false,
            keys: None,
            outcome: None,
            outbound_installed: false,
            inbound_installed: false,
        }
    }

    /// Our KEXINIT, to be sent first.
    pub fn kexinit_message(&self) -> Message {
        Message::KexInit(Box::new(self.client_proposal.clone()))
    }

    /// Whether the server's KEXINIT has arrived.
    pub fn has_server_kexinit(&self) -> bool {
        self.server_kexinit.is_some()
    }

    /// Whether the method finished and NEWKEYS may be exchanged.
    pub fn keys_ready(&self) -> bool {
        self.keys.is_some()
    }

    /// Algorithms negotiated so far.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Negotiates against the server's KEXINIT and returns the first method
    /// message to send.
    pub fn handle_server_kexinit(
        &mut self,
        server: &KexInit,
        ctx: &KexContext<'_>,
    ) -> Result<Message> {
        if self.server_kexinit.is_some() {
            return Err(Error::protocol("duplicate SSH_MSG_KEXINIT"));
        }
        let registry = &ctx.config.registry;
        let negotiated = NegotiatedAlgorithms::negotiate(&self.client_proposal, server, registry)?;
        crate::ssh::logging::log_negotiated(&negotiated);

        // RFC 4253 7: a wrong guess is discarded
        if server.first_kex_packet_follows {
            let guess_ok = server.kex_algorithms.first() == self.client_proposal.kex_algorithms.first()
                && server.server_host_key_algorithms.first()
                    == self.client_proposal.server_host_key_algorithms.first();
            self.skip_guessed_packet = !guess_ok;
            debug!(guess_ok, "Server sent a guessed key exchange packet");
        }

        let algo = registry.kex(&negotiated.kex).ok_or_else(|| {
            Error::protocol(format!("kex method '{}' missing from registry", negotiated.kex))
        })?;
        let mut method = (algo.make)(&ctx.config.group_range);
        let first = method.start()?;

        self.server_kexinit = Some(server.to_bytes());
        self.negotiated = Some(negotiated);
        self.method = Some(method);
        Ok(first)
    }

    /// Feeds a server method message. Returns the message to send, if any;
    /// once the exchange completes this is `NEWKEYS`.
    pub fn handle_method_message(
        &mut self,
        msg: &KexMethodMessage,
        ctx: &KexContext<'_>,
    ) -> Result<Option<Message>> {
        if self.skip_guessed_packet {
            self.skip_guessed_packet = false;
            trace!(code = msg.code, "Ignoring wrongly guessed kex packet");
            return Ok(None);
        }
        let (Some(method), Some(server_kexinit)) = (self.method.as_mut(), &self.server_kexinit)
        else {
            return Err(Error::protocol(format!(
                "key exchange message {} before SSH_MSG_KEXINIT",
                msg.code
            )));
        };
        if self.keys.is_some() {
            return Err(Error::protocol(format!(
                "key exchange message {} after exchange completed",
                msg.code
            )));
        }

        let input = ExchangeInput {
            client_id: ctx.client_id.as_bytes(),
            server_id: ctx.server_id.as_bytes(),
            client_kexinit: &self.client_kexinit,
            server_kexinit,
        };
        match method.handle(msg, &input)? {
            KexStep::Send(reply) => Ok(Some(reply)),
            KexStep::Done(output) => {
                let hash = method.hash();
                self.complete(output, hash, ctx)?;
                Ok(Some(Message::NewKeys))
            }
        }
    }

    fn complete(
        &mut self,
        output: crate::ssh::kex_dh::KexOutput,
        hash: crate::ssh::kex_dh::HashAlgorithm,
        ctx: &KexContext<'_>,
    ) -> Result<()> {
        let negotiated = self
            .negotiated
            .clone()
            .ok_or_else(|| Error::protocol("key exchange finished before negotiation"))?;
        let registry = &ctx.config.registry;

        // The signature is checked before anything else about the key
        let host_key_algo = registry.host_key(&negotiated.host_key).ok_or_else(|| {
            Error::HostKeyVerification(format!(
                "host key algorithm '{}' missing from registry",
                negotiated.host_key
            ))
        })?;
        (host_key_algo.verify)(&output.host_key, &output.exchange_hash, &output.signature)?;

        if let Some(previous) = ctx.previous_host_key {
            if previous != output.host_key.as_slice() {
                return Err(Error::HostKeyVerification(
                    "server host key changed during rekey".into(),
                ));
            }
        }
        let info = HostKeyInfo::new(&negotiated.host_key, &output.host_key);
        if !(ctx.config.host_key_callback)(&info) {
            return Err(Error::HostKeyVerification(format!(
                "host key {} rejected",
                info.fingerprint
            )));
        }

        let session_id = ctx
            .session_id
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| output.exchange_hash.clone());

        let cipher_len = |name: &str| {
            registry
                .cipher(name)
                .map(|c| (c.iv_len, c.key_len, c.aead))
                .ok_or_else(|| Error::protocol(format!("cipher '{}' missing from registry", name)))
        };
        let mac_len = |name: &str, aead: bool| -> Result<usize> {
            if aead {
                return Ok(0);
            }
            registry
                .mac(name)
                .map(|m| m.key_len)
                .ok_or_else(|| Error::protocol(format!("MAC '{}' missing from registry", name)))
        };
        let (iv_c2s, key_c2s, aead_c2s) = cipher_len(&negotiated.cipher_c2s)?;
        let (iv_s2c, key_s2c, aead_s2c) = cipher_len(&negotiated.cipher_s2c)?;
        let mac_c2s = mac_len(&negotiated.mac_c2s, aead_c2s)?;
        let mac_s2c = mac_len(&negotiated.mac_s2c, aead_s2c)?;

        let k = &output.shared_secret;
        let h = &output.exchange_hash;
        let derive = |letter: u8, len: usize| {
            Zeroizing::new(derive_key(hash, k, h, &session_id, letter, len))
        };
        self.keys = Some(DerivedKeys {
            iv_c2s: derive(b'A', iv_c2s),
            iv_s2c: derive(b'B', iv_s2c),
            key_c2s: derive(b'C', key_c2s),
            key_s2c: derive(b'D', key_s2c),
            mac_c2s: derive(b'E', mac_c2s),
            mac_s2c: derive(b'F', mac_s2c),
        });
        self.outcome = Some(KexOutcome {
            algorithms: negotiated,
            session_id: session_id.clone(),
            exchange_hash: output.exchange_hash.clone(),
            host_key: output.host_key.clone(),
        });
        self.method = None;
        debug!(fingerprint = %info.fingerprint, "Host key accepted");
        Ok(())
    }

    fn build_keys(
        registry: &AlgorithmRegistry,
        cipher: &str,
        mac: &str,
        compression: &str,
        iv: &[u8],
        key: &[u8],
        mac_key: &[u8],
    ) -> Result<DirectionalKeys> {
        let missing = |what: &str, name: &str| {
            Error::protocol(format!("{} '{}' missing from registry", what, name))
        };
        let cipher_algo = registry.cipher(cipher).ok_or_else(|| missing("cipher", cipher))?;
        let compression_algo = registry
            .compression(compression)
            .ok_or_else(|| missing("compression", compression))?;

        let (mac, etm) = if cipher_algo.aead {
            (None, false)
        } else {
            let mac_algo = registry.mac(mac).ok_or_else(|| missing("MAC", mac))?;
            (Some((mac_algo.make)(mac_key)?), mac_algo.etm)
        };

        Ok(DirectionalKeys {
            cipher: (cipher_algo.make)(key, iv)?,
            mac,
            etm,
            compression: (compression_algo.make)(),
        })
    }

    /// Client-to-server keys, installed right after our NEWKEYS is written.
    pub fn take_outbound_keys(&mut self, registry: &AlgorithmRegistry) -> Result<DirectionalKeys> {
        let (Some(keys), Some(outcome)) = (&self.keys, &self.outcome) else {
            return Err(Error::protocol("NEWKEYS before key exchange completed"));
        };
        if self.outbound_installed {
            return Err(Error::protocol("outbound keys already installed"));
        }
        let algos = &outcome.algorithms;
        let built = Self::build_keys(
            registry,
            &algos.cipher_c2s,
            &algos.mac_c2s,
            &algos.compression_c2s,
            &keys.iv_c2s,
            &keys.key_c2s,
            &keys.mac_c2s,
        )?;
        self.outbound_installed = true;
        Ok(built)
    }

    /// Server-to-client keys, installed right after the peer's NEWKEYS.
    pub fn take_inbound_keys(&mut self, registry: &AlgorithmRegistry) -> Result<DirectionalKeys> {
        let (Some(keys), Some(outcome)) = (&self.keys, &self.outcome) else {
            return Err(Error::protocol(
                "SSH_MSG_NEWKEYS received before key exchange completed",
            ));
        };
        if self.inbound_installed {
            return Err(Error::protocol("duplicate SSH_MSG_NEWKEYS"));
        }
        let algos = &outcome.algorithms;
        let built = Self::build_keys(
            registry,
            &algos.cipher_s2c,
            &algos.mac_s2c,
            &algos.compression_s2c,
            &keys.iv_s2c,
            &keys.key_s2c,
            &keys.mac_s2c,
        )?;
        self.inbound_installed = true;
        Ok(built)
    }

    /// Whether both directions switched to the new keys.
    pub fn is_finished(&self) -> bool {
        self.outbound_installed && self.inbound_installed
    }

    /// Consumes the finished exchange; key material is wiped.
    pub fn into_outcome(self) -> Option<KexOutcome> {
        if self.is_finished() {
            self.outcome
        } else {
            None
        }
    }
}
