//! Scripted in-process SSH server for integration tests.
//!
//! Speaks just enough of the server side of RFC 4253/4254 over a
//! `tokio::io::duplex` pipe: version exchange, `curve25519-sha256` key
//! exchange signed with an Ed25519 host key, and raw message I/O. Tests
//! drive it step by step next to the real client session.

#![allow(dead_code)]

use ed25519_dalek::{Signer, SigningKey};
use kestrel_proto::ssh::config::SessionConfig;
use kestrel_proto::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
};
use kestrel_proto::ssh::hostkey::{ed25519_key_blob, ed25519_signature_blob};
use kestrel_proto::ssh::kex::{KexInit, NegotiatedAlgorithms};
use kestrel_proto::ssh::kex_dh::{derive_key, ExchangeHash, ExchangeInput, HashAlgorithm};
use kestrel_proto::ssh::message::{KexMethodMessage, Message};
use kestrel_proto::ssh::packet::{DirectionalKeys, PacketOpener, PacketSealer};
use kestrel_proto::ssh::registry::{AlgorithmRegistry, Preferences, COMPRESSION_NONE};
use kestrel_proto::ssh::session::Session;
use kestrel_proto::ssh::version::{self, Version};
use kestrel_proto::ssh::wire::{self, Reader};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

/// Upper bound for any single scripted step.
pub const STEP: Duration = Duration::from_secs(5);

const KEX_ECDH_INIT: u8 = 30;
const KEX_ECDH_REPLY: u8 = 31;

/// Installs a test subscriber once; output is captured by the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client configuration with short timeouts for tests.
pub fn test_config() -> SessionConfig {
    SessionConfig::builder()
        .with_handshake_timeout(STEP)
        .with_operation_timeout(Duration::from_secs(2))
        .build()
        .expect("valid test config")
}

/// Key exchange results waiting for the client's NEWKEYS.
pub struct PendingKeys {
    negotiated: NegotiatedAlgorithms,
    shared: Vec<u8>,
    exchange_hash: Vec<u8>,
    session_id: Vec<u8>,
}

/// Server half of a scripted connection.
pub struct FakeServer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    sealer: PacketSealer,
    opener: PacketOpener,
    registry: AlgorithmRegistry,
    /// Algorithms the server proposes
    pub preferences: Preferences,
    host_key: SigningKey,
    server_version: Version,
    client_version: Option<Version>,
    session_id: Option<Vec<u8>>,
    /// Non-kex messages read while a key exchange was running
    backlog: VecDeque<Message>,
    /// Algorithms agreed by the latest key exchange
    pub negotiated: Option<NegotiatedAlgorithms>,
}

impl FakeServer {
    /// Creates a connected (client stream, server) pair.
    pub fn pair() -> (DuplexStream, FakeServer) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (read_half, write_half) = tokio::io::split(server);
        let registry = AlgorithmRegistry::default();
        let preferences = Preferences::from_registry(&registry);
        let server = FakeServer {
            reader: BufReader::new(read_half),
            writer: write_half,
            sealer: PacketSealer::new(),
            opener: PacketOpener::default(),
            registry,
            preferences,
            host_key: SigningKey::from_bytes(&[7u8; 32]),
            server_version: Version::new("FakeSSH_1.0", None),
            client_version: None,
            session_id: None,
            backlog: VecDeque::new(),
            negotiated: None,
        };
        (client, server)
    }

    /// Host key blob the server presents.
    pub fn host_key_blob(&self) -> Vec<u8> {
        ed25519_key_blob(&self.host_key.verifying_key().to_bytes())
    }

    /// Replaces the host key, e.g. to present a different key on rekey.
    pub fn set_host_key(&mut self, seed: [u8; 32]) {
        self.host_key = SigningKey::from_bytes(&seed);
    }

    /// Session identifier agreed with the client.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Next `(outbound, inbound)` sequence numbers of the server.
    pub fn sequence_numbers(&self) -> (u32, u32) {
        (self.sealer.sequence_number(), self.opener.sequence_number())
    }

    /// Version exchange only.
    pub async fn version_exchange(&mut self) {
        let client = timeout(
            STEP,
            version::exchange(&mut self.reader, &mut self.writer, &self.server_version),
        )
        .await
        .expect("version exchange timed out")
        .expect("version exchange failed");
        self.client_version = Some(client);
    }

    /// Version exchange followed by the first key exchange.
    pub async fn handshake(&mut self) {
        self.version_exchange().await;
        self.send_kexinit_and_exchange().await;
    }

    /// Sends our KEXINIT and returns it.
    pub async fn send_kexinit(&mut self) -> KexInit {
        let server_kexinit = KexInit::from_preferences(&self.preferences);
        self.send(&Message::KexInit(Box::new(server_kexinit.clone())))
            .await;
        server_kexinit
    }

    /// Sends our KEXINIT and runs one complete key exchange.
    pub async fn send_kexinit_and_exchange(&mut self) {
        let started = self.begin_rekey().await;
        self.complete_rekey(started).await;
    }

    /// Sends our KEXINIT and waits for the client's, leaving the exchange
    /// open. Returns both KEXINITs for [`FakeServer::complete_rekey`].
    pub async fn begin_rekey(&mut self) -> (KexInit, Vec<u8>) {
        let server_kexinit = self.send_kexinit().await;
        let client_payload = self.recv_kex_payload(20).await;
        (server_kexinit, client_payload)
    }

    /// Finishes an exchange started with [`FakeServer::begin_rekey`].
    pub async fn complete_rekey(&mut self, (server_kexinit, client_payload): (KexInit, Vec<u8>)) {
        let pending = self.send_reply(client_payload, server_kexinit).await;
        self.finish_exchange(pending).await;
    }

    /// Server-initiated rekey while the session is established.
    pub async fn rekey(&mut self) {
        self.send_kexinit_and_exchange().await;
    }

    /// Answers a client-initiated rekey (client KEXINIT first).
    pub async fn answer_rekey(&mut self) {
        let pending = self.answer_rekey_until_newkeys().await;
        self.finish_exchange(pending).await;
    }

    /// Answers a client-initiated rekey up to and including our NEWKEYS.
    pub async fn answer_rekey_until_newkeys(&mut self) -> PendingKeys {
        let client_payload = self.recv_kex_payload(20).await;
        let server_kexinit = self.send_kexinit().await;
        self.send_reply(client_payload, server_kexinit).await
    }

    /// Sends the ECDH reply and our NEWKEYS, then switches outbound keys.
    async fn send_reply(&mut self, client_payload: Vec<u8>, server_kexinit: KexInit) -> PendingKeys {
        let client_kexinit = KexInit::from_bytes(&client_payload).expect("client KEXINIT");
        let negotiated =
            NegotiatedAlgorithms::negotiate(&client_kexinit, &server_kexinit, &self.registry)
                .expect("negotiation");
        assert!(
            negotiated.kex.starts_with("curve25519-sha256"),
            "fake server only speaks curve25519, got {}",
            negotiated.kex
        );

        let init = self.recv_kex_payload(KEX_ECDH_INIT).await;
        let mut reader = Reader::new(&init[1..]);
        let q_c = reader.read_string().expect("Q_C").to_vec();

        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng).expect("ephemeral key");
        let q_s = private_key.compute_public_key().expect("public key");
        let peer = UnparsedPublicKey::new(&X25519, q_c.clone());
        let shared = agree_ephemeral(private_key, &peer, |k| k.to_vec()).expect("agreement");

        let client_id = self.client_version.as_ref().expect("version exchanged");
        let server_payload = server_kexinit.to_bytes();
        let input = ExchangeInput {
            client_id: client_id.identification().as_bytes(),
            server_id: self.server_version.identification().as_bytes(),
            client_kexinit: &client_payload,
            server_kexinit: &server_payload,
        };
        let host_blob = self.host_key_blob();
        let h = ExchangeHash::new(&input, &host_blob)
            .put_string(&q_c)
            .put_string(q_s.as_ref())
            .put_mpint(&shared)
            .finish(HashAlgorithm::Sha256);
        let signature = ed25519_signature_blob(&self.host_key.sign(&h).to_bytes());

        let mut body = bytes::BytesMut::new();
        wire::put_string(&mut body, &host_blob);
        wire::put_string(&mut body, q_s.as_ref());
        wire::put_string(&mut body, &signature);
        self.send(&Message::KexMethod(KexMethodMessage {
            code: KEX_ECDH_REPLY,
            body: body.to_vec(),
        }))
        .await;

        let session_id = self.session_id.clone().unwrap_or_else(|| h.clone());
        self.send(&Message::NewKeys).await;
        let outbound = self.build_keys(
            &negotiated.cipher_s2c,
            &negotiated.mac_s2c,
            [b'B', b'D', b'F'],
            &shared,
            &h,
            &session_id,
        );
        self.sealer.install(outbound);

        PendingKeys {
            negotiated,
            shared,
            exchange_hash: h,
            session_id,
        }
    }

    /// Waits for the client's NEWKEYS and switches inbound keys.
    pub async fn finish_exchange(&mut self, pending: PendingKeys) {
        self.recv_kex_payload(21).await;
        let inbound = self.build_keys(
            &pending.negotiated.cipher_c2s,
            &pending.negotiated.mac_c2s,
            [b'A', b'C', b'E'],
            &pending.shared,
            &pending.exchange_hash,
            &pending.session_id,
        );
        self.opener.install(inbound);
        self.session_id = Some(pending.session_id);
        self.negotiated = Some(pending.negotiated);
    }

    fn build_keys(
        &self,
        cipher: &str,
        mac: &str,
        letters: [u8; 3],
        shared: &[u8],
        h: &[u8],
        session_id: &[u8],
    ) -> DirectionalKeys {
        let derive = |letter, len| derive_key(HashAlgorithm::Sha256, shared, h, session_id, letter, len);
        let cipher = self.registry.cipher(cipher).expect("cipher");
        let iv = derive(letters[0], cipher.iv_len);
        let key = derive(letters[1], cipher.key_len);
        let (mac, etm) = if cipher.aead {
            (None, false)
        } else {
            let mac = self.registry.mac(mac).expect("mac");
            let mac_key = derive(letters[2], mac.key_len);
            (Some((mac.make)(&mac_key).expect("mac key")), mac.etm)
        };
        DirectionalKeys {
            cipher: (cipher.make)(&key, &iv).expect("cipher key"),
            mac,
            etm,
            compression: (COMPRESSION_NONE.make)(),
        }
    }

    /// Reads until a kex message with type `code`, stashing anything else.
    async fn recv_kex_payload(&mut self, code: u8) -> Vec<u8> {
        loop {
            let payload = self.recv_payload().await;
            if payload.first() == Some(&code) {
                return payload;
            }
            let msg = Message::decode(&payload).expect("client message");
            assert!(
                !msg.is_kex(),
                "expected kex message {}, got {}",
                code,
                msg.name()
            );
            self.backlog.push_back(msg);
        }
    }

    /// Seals and writes one message.
    pub async fn send(&mut self, msg: &Message) {
        self.send_payload(&msg.encode()).await;
    }

    /// Seals and writes a raw payload.
    pub async fn send_payload(&mut self, payload: &[u8]) {
        let packet = self.sealer.seal(payload).expect("seal");
        self.writer.write_all(&packet).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Writes a packet whose last byte (part of the MAC or tag) is flipped.
    pub async fn send_corrupted(&mut self, msg: &Message) {
        let mut packet = self.sealer.seal(&msg.encode()).expect("seal");
        if let Some(last) = packet.last_mut() {
            *last ^= 0x01;
        }
        self.writer.write_all(&packet).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Reads one payload.
    pub async fn recv_payload(&mut self) -> Vec<u8> {
        timeout(STEP, self.opener.read_packet(&mut self.reader))
            .await
            .expect("server read timed out")
            .expect("server read failed")
            .payload
    }

    /// Reads one message, skipping IGNORE.
    pub async fn recv(&mut self) -> Message {
        if let Some(msg) = self.backlog.pop_front() {
            return msg;
        }
        loop {
            let msg = Message::decode(&self.recv_payload().await).expect("client message");
            if !matches!(msg, Message::Ignore(_)) {
                return msg;
            }
        }
    }

    /// Reads one payload or the error that ended the stream.
    pub async fn try_recv(&mut self) -> kestrel_proto::ssh::Result<Message> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(msg);
        }
        let packet = timeout(STEP, self.opener.read_packet(&mut self.reader))
            .await
            .expect("server read timed out")?;
        Message::decode(&packet.payload)
    }

    /// Answers SERVICE_REQUEST with SERVICE_ACCEPT.
    pub async fn accept_service(&mut self) -> String {
        match self.recv().await {
            Message::ServiceRequest(name) => {
                self.send(&Message::ServiceAccept(name.clone())).await;
                name
            }
            other => panic!("expected SERVICE_REQUEST, got {:?}", other),
        }
    }

    /// Reads a CHANNEL_OPEN.
    pub async fn expect_channel_open(&mut self) -> ChannelOpen {
        match self.recv().await {
            Message::ChannelOpen(open) => open,
            other => panic!("expected CHANNEL_OPEN, got {:?}", other),
        }
    }

    /// Reads a CHANNEL_OPEN and confirms it with `server_id`.
    pub async fn confirm_channel(&mut self, server_id: u32, window: u32, max_packet: u32) -> ChannelOpen {
        let open = self.expect_channel_open().await;
        self.send(&Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
            open.sender_channel,
            server_id,
            window,
            max_packet,
        )))
        .await;
        open
    }

    /// Reads a CHANNEL_OPEN and refuses it.
    pub async fn refuse_channel(&mut self, reason: ChannelOpenFailureReason) -> ChannelOpen {
        let open = self.expect_channel_open().await;
        self.send(&Message::ChannelOpenFailure(ChannelOpenFailure::new(
            open.sender_channel,
            reason,
        )))
        .await;
        open
    }

    /// Closes the server side of the pipe.
    pub async fn hang_up(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Connects a client session to a fresh fake server.
pub async fn connect(config: SessionConfig) -> (Session, FakeServer) {
    let (stream, mut server) = FakeServer::pair();
    let (session, ()) = tokio::join!(Session::connect(stream, config), server.handshake());
    (session.expect("client handshake"), server)
}
