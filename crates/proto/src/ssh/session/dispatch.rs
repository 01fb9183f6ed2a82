//! The per-session read loop.
//!
//! One task per session reads packets, runs the key exchange and routes
//! everything else to its waiter or to the channel multiplexer. It is the
//! only reader of the stream and the only task that tears the session down.

use super::{BoxedReader, Exit, GlobalReply, SessionInner};
use crate::ssh::error::{Error, Result};
use crate::ssh::logging;
use crate::ssh::message::Message;
use crate::ssh::packet::{InboundPacket, PacketOpener};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, trace, warn};

pub(super) async fn run(
    inner: Arc<SessionInner>,
    mut reader: BufReader<BoxedReader>,
    mut opener: PacketOpener,
) {
    debug!("Dispatch loop started");

    let exit = loop {
        let packet = tokio::select! {
            biased;
            _ = inner.shutdown.notified() => {
                break match inner.cause() {
                    Some(cause) => Exit::Fatal(cause),
                    None => Exit::Local,
                };
            }
            read = opener.read_packet(&mut reader) => read,
        };

        let flow = match packet {
            Ok(packet) => handle_packet(&inner, &mut opener, packet).await,
            Err(e) => Err(e),
        };
        match flow {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(peer)) => break Exit::Peer(peer),
            Err(e) => break Exit::Fatal(e),
        }

        if let Ok(mut transport) = inner.transport.try_lock() {
            if let Err(e) = inner.maybe_rekey_locked(&mut transport).await {
                break Exit::Fatal(e);
            }
        }
    };

    debug!(?exit, "Dispatch loop finished");
    inner.teardown(exit).await;
}

/// Handles one inbound packet. `Break` carries the error reported for a
/// peer DISCONNECT.
async fn handle_packet(
    inner: &Arc<SessionInner>,
    opener: &mut PacketOpener,
    packet: InboundPacket,
) -> Result<ControlFlow<Error>> {
    inner.note_inbound(packet.wire_len, opener.sequence_number());

    let msg = match Message::decode(&packet.payload) {
        Ok(msg) => msg,
        Err(Error::UnsupportedMessage(code)) => {
            warn!(code, seq = packet.seq, "Unsupported message type, replying UNIMPLEMENTED");
            inner.reply(Message::Unimplemented(packet.seq)).await?;
            return Ok(ControlFlow::Continue(()));
        }
        Err(e) => return Err(e),
    };
    logging::log_packet("in", packet.seq, msg.name(), packet.wire_len);

    if !inner.first_kex_done() && !(msg.is_kex() || msg.is_transport_generic()) {
        return Err(Error::protocol(format!(
            "{} received before the first key exchange completed",
            msg.name()
        )));
    }

    match msg {
        Message::Disconnect(disconnect) => {
            logging::log_peer_disconnect(disconnect.reason.code(), &disconnect.description);
            return Ok(ControlFlow::Break(Error::ConnectionLost(format!(
                "peer disconnected (reason {}): {}",
                disconnect.reason.code(),
                disconnect.description
            ))));
        }
        Message::Ignore(data) => trace!(len = data.len(), "Ignoring SSH_MSG_IGNORE"),
        Message::Debug(debug_msg) => debug!(
            always_display = debug_msg.always_display,
            message = %debug_msg.message,
            "Peer debug message"
        ),
        Message::Unimplemented(seq) => warn!(seq, "Peer did not implement one of our messages"),

        Message::KexInit(server) => {
            let mut transport = inner.transport.lock().await;
            inner.begin_kex_locked(&mut transport).await?;
            let first = inner.with_kex_context(|ctx| match transport.kex.as_mut() {
                Some(kex) => kex.handle_server_kexinit(&server, ctx),
                None => Err(Error::protocol("no key exchange running")),
            })?;
            transport.write_message(&first).await?;
        }
        Message::KexMethod(method_msg) => {
            let mut transport = inner.transport.lock().await;
            let step = inner.with_kex_context(|ctx| match transport.kex.as_mut() {
                Some(kex) => kex.handle_method_message(&method_msg, ctx),
                None => Err(Error::protocol(format!(
                    "key exchange message {} outside a key exchange",
                    method_msg.code
                ))),
            })?;
            match step {
                Some(Message::NewKeys) => {
                    transport.write_message(&Message::NewKeys).await?;
                    let keys = match transport.kex.as_mut() {
                        Some(kex) => kex.take_outbound_keys(&inner.config.registry)?,
                        None => return Err(Error::protocol("no key exchange running")),
                    };
                    transport.sealer.install(keys);
                    debug!("Outbound keys installed");
                }
                Some(reply) => transport.write_message(&reply).await?,
                None => {}
            }
        }
        Message::NewKeys => {
            let mut transport = inner.transport.lock().await;
            let Some(kex) = transport.kex.as_mut() else {
                return Err(Error::protocol("SSH_MSG_NEWKEYS outside a key exchange"));
            };
            opener.install(kex.take_inbound_keys(&inner.config.registry)?);
            debug!("Inbound keys installed");
            if kex.is_finished() {
                inner.finish_kex_locked(&mut transport).await?;
            }
        }

        Message::ServiceAccept(name) => inner.complete_service(name)?,
        Message::GlobalRequest(request) => {
            debug!(name = %request.name, want_reply = request.want_reply, "Server global request");
            if request.want_reply {
                inner.reply(Message::RequestFailure).await?;
            }
        }
        Message::RequestSuccess(data) => inner.complete_global(GlobalReply::Success(data))?,
        Message::RequestFailure => inner.complete_global(GlobalReply::Failure)?,

        msg @ (Message::UserauthFailure(_)
        | Message::UserauthSuccess
        | Message::UserauthBanner(_)
        | Message::UserauthMethod(_)) => inner.deliver_auth(msg),

        // Server-side messages have no meaning for a client
        other @ (Message::ServiceRequest(_) | Message::UserauthRequest(_)) => {
            warn!(msg = other.name(), "Unexpected server-side message");
            inner.reply(Message::Unimplemented(packet.seq)).await?;
        }

        msg => {
            let output = inner.mux.handle(msg)?;
            for reply in output.replies {
                inner.reply(reply).await?;
            }
            if let Some(incoming) = output.incoming {
                inner.queue_incoming(incoming);
            }
        }
    }

    Ok(ControlFlow::Continue(()))
}
