//! Integration tests for the client session against a scripted server.
//!
//! These tests validate the complete client flow including:
//! - Version exchange and key exchange with signature verification
//! - Rekeying (server- and client-initiated) with channels open
//! - Fatal transport errors and their broadcast to channels
//! - Service requests, authentication and global requests

mod support;

use kestrel_proto::ssh::auth::{authenticate_none, authenticate_password, AuthStatus};
use kestrel_proto::ssh::connection::ChannelOpenFailureReason;
use kestrel_proto::ssh::kex::IMPLICIT_MAC;
use kestrel_proto::ssh::message::{Disconnect, DisconnectReason, GlobalRequest, Message, UserauthBanner, UserauthFailure};
use kestrel_proto::ssh::registry::{AlgorithmRegistry, Preferences};
use kestrel_proto::ssh::wire::Reader;
use kestrel_proto::ssh::{Error, GlobalReply, Session, SessionConfig, SessionState};
use support::{connect, test_config, FakeServer, STEP};
use tokio::time::timeout;

#[tokio::test]
async fn test_handshake_establishes_session() {
    support::init_tracing();
    let (session, server) = connect(test_config()).await;

    assert_eq!(session.state(), SessionState::Established);
    assert!(!session.is_authenticated());
    assert_eq!(session.server_version().software(), "FakeSSH_1.0");
    assert_eq!(session.key_exchanges(), 1);

    let session_id = session.session_id().expect("session id");
    assert_eq!(Some(session_id.as_slice()), server.session_id());
    assert_eq!(session.host_key(), Some(server.host_key_blob()));

    let algorithms = session.algorithms().expect("algorithms");
    assert_eq!(algorithms.kex, "curve25519-sha256");
    assert_eq!(algorithms.host_key, "ssh-ed25519");
    assert_eq!(algorithms.cipher_c2s, "aes256-gcm@openssh.com");
    assert_eq!(algorithms.mac_c2s, IMPLICIT_MAC);

    // KEXINIT, ECDH_INIT, NEWKEYS each way
    let (client_out, client_in) = session.sequence_numbers().await;
    let (server_out, server_in) = server.sequence_numbers();
    assert_eq!((client_out, client_in), (3, 3));
    assert_eq!((client_out, client_in), (server_in, server_out));
}

#[tokio::test]
async fn test_cipher_negotiation_follows_client_order() {
    let registry = AlgorithmRegistry::default();
    let mut prefs = Preferences::from_registry(&registry);
    prefs.cipher_c2s = vec!["aes128-ctr".into(), "aes256-ctr".into()];
    prefs.cipher_s2c = prefs.cipher_c2s.clone();
    let config = SessionConfig::builder()
        .with_preferences(prefs)
        .with_handshake_timeout(STEP)
        .build()
        .unwrap();

    let (stream, mut server) = FakeServer::pair();
    server.preferences.cipher_c2s = vec!["aes256-ctr".into(), "aes128-ctr".into()];
    server.preferences.cipher_s2c = server.preferences.cipher_c2s.clone();
    let (session, ()) = tokio::join!(Session::connect(stream, config), server.handshake());
    let session = session.unwrap();

    let algorithms = session.algorithms().unwrap();
    assert_eq!(algorithms.cipher_c2s, "aes128-ctr");
    assert_eq!(algorithms.cipher_s2c, "aes128-ctr");
    assert_eq!(algorithms.mac_c2s, "hmac-sha2-256-etm@openssh.com");

    // CTR + ETM traffic flows both ways
    let (reply, ()) = tokio::join!(session.request_service("ssh-userauth"), async {
        server.accept_service().await;
    });
    reply.unwrap();
}

#[tokio::test]
async fn test_negotiation_failure_disconnects() {
    let registry = AlgorithmRegistry::default();
    let mut prefs = Preferences::from_registry(&registry);
    prefs.cipher_c2s = vec!["aes128-ctr".into()];
    let config = SessionConfig::builder()
        .with_preferences(prefs)
        .with_handshake_timeout(STEP)
        .build()
        .unwrap();

    let (stream, mut server) = FakeServer::pair();
    server.preferences.cipher_c2s = vec!["aes256-gcm@openssh.com".into()];

    let server_side = async {
        server.version_exchange().await;
        server.send_kexinit().await;
        assert!(matches!(server.recv().await, Message::KexInit(_)));
        server.recv().await
    };
    let (result, last) = tokio::join!(Session::connect(stream, config), server_side);

    match result {
        Err(Error::AlgorithmNegotiation { category, .. }) => {
            assert_eq!(category, "encryption client->server")
        }
        other => panic!("expected negotiation failure, got {:?}", other),
    }
    match last {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::KeyExchangeFailed),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_before_kex_is_protocol_violation() {
    let (stream, mut server) = FakeServer::pair();
    let server_side = async {
        server.version_exchange().await;
        server.send(&Message::ServiceAccept("ssh-userauth".into())).await;
    };
    let (result, ()) = tokio::join!(Session::connect(stream, test_config()), server_side);
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_rejected_host_key_fails_handshake() {
    let config = SessionConfig::builder()
        .with_host_key_callback(|_| false)
        .with_handshake_timeout(STEP)
        .build()
        .unwrap();
    let (stream, mut server) = FakeServer::pair();
    let server_side = async {
        server.version_exchange().await;
        let _pending = server.answer_rekey_until_newkeys().await;
        server.recv().await
    };
    let (result, last) = tokio::join!(Session::connect(stream, config), server_side);

    assert!(matches!(result, Err(Error::HostKeyVerification(_))));
    match last {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::HostKeyNotVerifiable),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_open_refused_keeps_session_usable() {
    let (session, mut server) = connect(test_config()).await;

    let (result, _) = tokio::join!(
        session.open_session(),
        server.refuse_channel(ChannelOpenFailureReason::AdministrativelyProhibited)
    );
    match result {
        Err(Error::ChannelOpenRefused {
            reason,
            description,
        }) => {
            assert_eq!(reason, 1);
            assert_eq!(description, "administratively prohibited");
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    let (channel, open) = tokio::join!(session.open_session(), server.confirm_channel(7, 1024, 512));
    let channel = channel.unwrap();
    assert_eq!(channel.remote_id(), 7);
    assert_eq!(channel.local_id(), open.sender_channel);
    assert_eq!(session.state(), SessionState::Established);
}

#[tokio::test]
async fn test_window_exhaustion_closes_only_that_channel() {
    let config = SessionConfig::builder()
        .with_window_size(5)
        .with_channel_max_packet(5)
        .with_window_low_water(0)
        .with_handshake_timeout(STEP)
        .build()
        .unwrap();
    let (session, mut server) = connect(config).await;

    let (channel, open) = tokio::join!(session.open_session(), server.confirm_channel(40, 1024, 1024));
    let mut channel = channel.unwrap();
    assert_eq!(open.initial_window_size, 5);

    server
        .send(&Message::ChannelData(kestrel_proto::ssh::connection::ChannelData::new(
            channel.local_id(),
            b"12345".to_vec(),
        )))
        .await;
    match channel.recv().await {
        Some(kestrel_proto::ssh::ChannelEvent::Data(data)) => assert_eq!(data, b"12345"),
        other => panic!("expected data, got {:?}", other),
    }
    assert_eq!(channel.windows().map(|(local, _)| local), Some(0));

    // One byte past the window
    server
        .send(&Message::ChannelData(kestrel_proto::ssh::connection::ChannelData::new(
            channel.local_id(),
            b"6".to_vec(),
        )))
        .await;
    match channel.recv().await {
        Some(kestrel_proto::ssh::ChannelEvent::Error(Error::ProtocolViolation(_))) => {}
        other => panic!("expected violation, got {:?}", other),
    }
    match server.recv().await {
        Message::ChannelClose(close) => assert_eq!(close.recipient_channel, 40),
        other => panic!("expected CHANNEL_CLOSE, got {:?}", other),
    }

    // The session survives
    assert_eq!(session.state(), SessionState::Established);
    let (second, _) = tokio::join!(session.open_session(), server.confirm_channel(41, 1024, 1024));
    assert!(second.is_ok());
}

#[tokio::test]
async fn test_send_respects_remote_window_and_packet_size() {
    let (session, mut server) = connect(test_config()).await;
    let (channel, _) = tokio::join!(session.open_session(), server.confirm_channel(3, 10, 4));
    let channel = channel.unwrap();

    channel.send(b"0123456789").await.unwrap();
    let mut sizes = Vec::new();
    for _ in 0..3 {
        match server.recv().await {
            Message::ChannelData(data) => {
                assert_eq!(data.recipient_channel, 3);
                sizes.push(data.data.len());
            }
            other => panic!("expected data, got {:?}", other),
        }
    }
    assert_eq!(sizes, vec![4, 4, 2]);
    assert_eq!(channel.windows().map(|(_, remote)| remote), Some(0));

    // Blocked until the server grants credit
    let (sent, ()) = tokio::join!(channel.send(b"abc"), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server
            .send(&Message::ChannelWindowAdjust(
                kestrel_proto::ssh::connection::ChannelWindowAdjust::new(channel.local_id(), 5),
            ))
            .await;
    });
    sent.unwrap();
    match server.recv().await {
        Message::ChannelData(data) => assert_eq!(data.data, b"abc"),
        other => panic!("expected data, got {:?}", other),
    }
    assert_eq!(channel.windows().map(|(_, remote)| remote), Some(2));
}

#[tokio::test]
async fn test_mac_failure_tears_down_all_channels() {
    let config = SessionConfig::builder()
        .with_handshake_timeout(STEP)
        .with_operation_timeout(STEP)
        .build()
        .unwrap();
    let (session, mut server) = connect(config).await;

    let (first, _) = tokio::join!(session.open_session(), server.confirm_channel(1, 0, 1024));
    let (second, _) = tokio::join!(session.open_session(), server.confirm_channel(2, 0, 1024));
    let (first, second) = (first.unwrap(), second.unwrap());

    // Both sends block on a zero window
    let corrupt = async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.send_corrupted(&Message::Ignore(vec![1, 2, 3])).await;
        server.recv().await
    };
    let (a, b, last) = tokio::join!(first.send(b"stuck"), second.send(b"stuck"), corrupt);

    assert!(matches!(a, Err(Error::ConnectionLost(_))), "{:?}", a);
    assert!(matches!(b, Err(Error::ConnectionLost(_))), "{:?}", b);
    match last {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::MacError),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }

    let cause = timeout(STEP, session.closed()).await.unwrap();
    assert!(matches!(cause, Some(Error::CorruptPacket(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(
        session.open_session().await,
        Err(Error::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn test_server_rekey_preserves_channels() {
    let (session, mut server) = connect(test_config()).await;
    let session_id = session.session_id();

    let mut channels = Vec::new();
    for server_id in [100, 101, 102] {
        let (channel, _) = tokio::join!(session.open_session(), server.confirm_channel(server_id, 4096, 1024));
        channels.push(channel.unwrap());
    }
    let before: Vec<_> = channels
        .iter()
        .map(|c| (c.local_id(), c.remote_id(), c.windows()))
        .collect();

    server.rekey().await;
    // Waits on the kex gate, so the exchange is finished afterwards
    session.send_ignore(Vec::new()).await.unwrap();

    assert_eq!(session.key_exchanges(), 2);
    assert_eq!(session.session_id(), session_id);
    let after: Vec<_> = channels
        .iter()
        .map(|c| (c.local_id(), c.remote_id(), c.windows()))
        .collect();
    assert_eq!(before, after);

    // Traffic flows under the new keys
    for channel in &channels {
        channel.send(b"ping").await.unwrap();
        match server.recv().await {
            Message::ChannelData(data) => {
                assert_eq!(data.recipient_channel, channel.remote_id());
                assert_eq!(data.data, b"ping");
            }
            other => panic!("expected data, got {:?}", other),
        }
    }
    let (client_out, client_in) = session.sequence_numbers().await;
    let (server_out, server_in) = server.sequence_numbers();
    assert_eq!((client_out, client_in), (server_in, server_out));
}

#[tokio::test]
async fn test_client_rekey() {
    let (session, mut server) = connect(test_config()).await;
    let session_id = session.session_id();

    let (result, ()) = tokio::join!(session.rekey(), server.answer_rekey());
    result.unwrap();

    assert_eq!(session.key_exchanges(), 2);
    assert_eq!(session.session_id(), session_id);
    assert_eq!(session.state(), SessionState::Established);
}

#[tokio::test]
async fn test_host_key_change_on_rekey_is_fatal() {
    let (session, mut server) = connect(test_config()).await;
    server.set_host_key([9u8; 32]);

    let server_side = async {
        let _pending = server.answer_rekey_until_newkeys().await;
        server.recv().await
    };
    let (result, last) = tokio::join!(session.rekey(), server_side);

    assert!(result.is_err());
    match last {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::HostKeyNotVerifiable),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    let cause = timeout(STEP, session.closed()).await.unwrap();
    assert!(matches!(cause, Some(Error::HostKeyVerification(_))));
}

#[tokio::test]
async fn test_unknown_message_answered_with_unimplemented() {
    let (session, mut server) = connect(test_config()).await;

    let (seq, _) = server.sequence_numbers();
    server.send_payload(&[199, 1, 2, 3]).await;
    match server.recv().await {
        Message::Unimplemented(rejected) => assert_eq!(rejected, seq),
        other => panic!("expected UNIMPLEMENTED, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Established);
}

#[tokio::test]
async fn test_peer_disconnect() {
    let (session, mut server) = connect(test_config()).await;

    server
        .send(&Message::Disconnect(Disconnect::new(
            DisconnectReason::ByApplication,
            "bye",
        )))
        .await;

    let cause = timeout(STEP, session.closed()).await.unwrap();
    match cause {
        Some(Error::ConnectionLost(msg)) => assert!(msg.contains("bye")),
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.incoming_channel().await.is_none());
}

#[tokio::test]
async fn test_local_disconnect() {
    let (session, mut server) = connect(test_config()).await;

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.closed().await.is_none());

    match server.recv().await {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::ByApplication),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert!(server.try_recv().await.is_err());
}

#[tokio::test]
async fn test_dropping_session_disconnects() {
    let (session, mut server) = connect(test_config()).await;
    drop(session);

    match server.recv().await {
        Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::ByApplication),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_password_authentication() {
    let (session, mut server) = connect(test_config()).await;

    let server_side = async {
        assert_eq!(server.accept_service().await, "ssh-userauth");
        let request = match server.recv().await {
            Message::UserauthRequest(request) => request,
            other => panic!("expected USERAUTH_REQUEST, got {:?}", other),
        };
        assert_eq!(request.user, "alice");
        assert_eq!(request.service, "ssh-connection");
        assert_eq!(request.method, "password");
        let mut fields = Reader::new(&request.method_data);
        assert!(!fields.read_bool().unwrap());
        assert_eq!(fields.read_string().unwrap(), b"secret");

        server
            .send(&Message::UserauthBanner(UserauthBanner {
                message: "Authorized use only".into(),
                language: String::new(),
            }))
            .await;
        server.send(&Message::UserauthSuccess).await;
    };
    let (reply, ()) = tokio::join!(authenticate_password(&session, "alice", "secret"), server_side);

    let reply = reply.unwrap();
    assert!(reply.is_success());
    assert_eq!(reply.banners, vec!["Authorized use only".to_string()]);
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn test_none_authentication_lists_methods() {
    let (session, mut server) = connect(test_config()).await;

    let server_side = async {
        server.accept_service().await;
        assert!(matches!(server.recv().await, Message::UserauthRequest(_)));
        server
            .send(&Message::UserauthFailure(UserauthFailure {
                methods: vec!["publickey".into(), "password".into()],
                partial_success: false,
            }))
            .await;
    };
    let (reply, ()) = tokio::join!(authenticate_none(&session, "bob"), server_side);

    assert_eq!(
        reply.unwrap().status,
        AuthStatus::Failure {
            methods: vec!["publickey".into(), "password".into()],
            partial_success: false,
        }
    );
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_global_requests() {
    let (session, mut server) = connect(test_config()).await;

    let server_side = async {
        match server.recv().await {
            Message::GlobalRequest(request) => {
                assert_eq!(request.name, "tcpip-forward");
                assert!(request.want_reply);
            }
            other => panic!("expected GLOBAL_REQUEST, got {:?}", other),
        }
        server.send(&Message::RequestSuccess(vec![0, 0, 0x1f, 0x90])).await;
    };
    let (reply, ()) = tokio::join!(session.global_request("tcpip-forward", Vec::new(), true), server_side);
    assert_eq!(reply.unwrap(), GlobalReply::Success(vec![0, 0, 0x1f, 0x90]));

    // Server-initiated requests are refused
    server
        .send(&Message::GlobalRequest(GlobalRequest {
            name: "keepalive@openssh.com".into(),
            want_reply: true,
            data: Vec::new(),
        }))
        .await;
    assert_eq!(server.recv().await, Message::RequestFailure);
}

#[tokio::test]
async fn test_execute_collects_output() {
    use kestrel_proto::ssh::connection::{
        ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelRequest,
        ChannelRequestType, ChannelSuccess,
    };

    let (session, mut server) = connect(test_config()).await;

    let server_side = async {
        let open = server.confirm_channel(9, 1 << 16, 1 << 14).await;
        let local = open.sender_channel;
        match server.recv().await {
            Message::ChannelRequest(request) => {
                assert_eq!(
                    request.request_type,
                    ChannelRequestType::Exec {
                        command: "echo hi".into()
                    }
                );
                assert!(request.want_reply);
            }
            other => panic!("expected exec, got {:?}", other),
        }
        server.send(&Message::ChannelSuccess(ChannelSuccess::new(local))).await;
        assert!(matches!(server.recv().await, Message::ChannelEof(_)));

        server
            .send(&Message::ChannelData(ChannelData::new(local, b"hi\n".to_vec())))
            .await;
        server
            .send(&Message::ChannelExtendedData(ChannelExtendedData::new(
                local,
                1,
                b"warn\n".to_vec(),
            )))
            .await;
        server
            .send(&Message::ChannelRequest(ChannelRequest::new(
                local,
                ChannelRequestType::ExitStatus { exit_status: 3 },
                false,
            )))
            .await;
        server.send(&Message::ChannelEof(ChannelEof::new(local))).await;
        server.send(&Message::ChannelClose(ChannelClose::new(local))).await;
        match server.recv().await {
            Message::ChannelClose(close) => assert_eq!(close.recipient_channel, 9),
            other => panic!("expected CHANNEL_CLOSE, got {:?}", other),
        }
    };
    let (output, ()) = tokio::join!(session.execute("echo hi"), server_side);

    let output = output.unwrap();
    assert_eq!(output.stdout, b"hi\n");
    assert_eq!(output.stderr, b"warn\n");
    assert_eq!(output.exit_status, Some(3));
    assert_eq!(output.exit_signal, None);
}

#[tokio::test]
async fn test_incoming_channels() {
    use kestrel_proto::ssh::connection::{ChannelOpen, ChannelType};

    let forwarded = |sender| {
        Message::ChannelOpen(ChannelOpen::new(
            ChannelType::ForwardedTcpip {
                connected_address: "0.0.0.0".into(),
                connected_port: 8080,
                originator_address: "10.0.0.2".into(),
                originator_port: 50000,
            },
            sender,
            1 << 16,
            1 << 14,
        ))
    };

    // Refused unless enabled
    let (session, mut server) = connect(test_config()).await;
    server.send(&forwarded(50)).await;
    match server.recv().await {
        Message::ChannelOpenFailure(failure) => {
            assert_eq!(failure.recipient_channel, 50);
            assert_eq!(failure.reason, ChannelOpenFailureReason::AdministrativelyProhibited);
        }
        other => panic!("expected CHANNEL_OPEN_FAILURE, got {:?}", other),
    }
    drop(session);

    let config = SessionConfig::builder()
        .accept_incoming_channels(true)
        .with_handshake_timeout(STEP)
        .build()
        .unwrap();
    let (session, mut server) = connect(config).await;
    server.send(&forwarded(51)).await;
    let confirmation = match server.recv().await {
        Message::ChannelOpenConfirmation(confirmation) => confirmation,
        other => panic!("expected confirmation, got {:?}", other),
    };
    assert_eq!(confirmation.recipient_channel, 51);

    let channel = timeout(STEP, session.incoming_channel()).await.unwrap().unwrap();
    assert_eq!(channel.remote_id(), 51);
    assert_eq!(channel.local_id(), confirmation.sender_channel);
    assert_eq!(channel.channel_type().name(), "forwarded-tcpip");
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let config = SessionConfig::builder()
        .with_handshake_timeout(STEP)
        .with_operation_timeout(std::time::Duration::from_millis(200))
        .build()
        .unwrap();
    let (session, mut server) = connect(config).await;
    let (channel, _) = tokio::join!(session.open_session(), server.confirm_channel(5, 1024, 1024));
    let channel = channel.unwrap();

    let result = channel.shell().await;
    assert!(matches!(result, Err(Error::OperationTimedOut(_))), "{:?}", result);
    // Only the caller is affected
    assert_eq!(session.state(), SessionState::Established);
}

#[tokio::test]
async fn test_send_timed_out_by_rekey_keeps_window() {
    let config = SessionConfig::builder()
        .with_handshake_timeout(STEP)
        .with_operation_timeout(std::time::Duration::from_millis(200))
        .build()
        .unwrap();
    let (session, mut server) = connect(config).await;
    let (channel, _) = tokio::join!(session.open_session(), server.confirm_channel(8, 10, 1024));
    let channel = channel.unwrap();
    let before = channel.windows();

    // The server holds the exchange open past the operation timeout
    let started = server.begin_rekey().await;
    let result = channel.send(b"abc").await;
    assert!(matches!(result, Err(Error::OperationTimedOut(_))), "{:?}", result);
    assert_eq!(channel.windows(), before);

    server.complete_rekey(started).await;
    session.send_ignore(Vec::new()).await.unwrap();
    assert_eq!(channel.windows(), before);

    channel.send(b"abc").await.unwrap();
    match server.recv().await {
        Message::ChannelData(data) => assert_eq!(data.data, b"abc"),
        other => panic!("expected data, got {:?}", other),
    }
    assert_eq!(channel.windows().unwrap().1, 7);
}
