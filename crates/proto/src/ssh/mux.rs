//! Channel multiplexer.
//!
//! Routes channel-scoped messages (RFC 4254 Section 5) to the channel they
//! name and keeps the per-channel bookkeeping: windows, pending open and
//! request replies, EOF/CLOSE flags. The table is only touched under a
//! short synchronous lock; every reply the dispatch loop must send is
//! returned to it rather than written from here.

use crate::ssh::channel::{ChannelEvent, ChannelState, ReceiveWindow, SendWindow};
use crate::ssh::config::SessionConfig;
use crate::ssh::connection::{
    ChannelClose, ChannelEof, ChannelFailure, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequestType, ChannelType,
    ChannelWindowAdjust,
};
use crate::ssh::error::{Error, Result};
use crate::ssh::logging;
use crate::ssh::message::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

/// State shared between a [`Channel`](crate::ssh::channel::Channel) handle
/// and its table entry.
#[derive(Debug, Default)]
pub(crate) struct ChannelShared {
    /// Signalled on WINDOW_ADJUST, close and teardown
    pub(crate) credit: Notify,
    /// Serializes sends and requests issued through the handle
    pub(crate) ops: tokio::sync::Mutex<()>,
}

/// Peer parameters from CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Opened {
    pub(crate) remote_id: u32,
    pub(crate) remote_window: u32,
    pub(crate) remote_max_packet: u32,
}

/// A locally initiated open awaiting the peer's answer.
pub(crate) struct Registration {
    pub(crate) local_id: u32,
    pub(crate) message: Message,
    pub(crate) events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub(crate) opened: oneshot::Receiver<Result<Opened>>,
    pub(crate) shared: Arc<ChannelShared>,
}

/// A server-initiated channel we accepted.
pub(crate) struct Incoming {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) channel_type: ChannelType,
    pub(crate) events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub(crate) shared: Arc<ChannelShared>,
}

/// What the dispatch loop must do after a channel message.
#[derive(Default)]
pub(crate) struct MuxOutput {
    pub(crate) replies: Vec<Message>,
    pub(crate) incoming: Option<Incoming>,
}

struct Slot {
    channel_type: String,
    state: ChannelState,
    remote_id: u32,
    recv: ReceiveWindow,
    send: SendWindow,
    events: mpsc::UnboundedSender<ChannelEvent>,
    opening: Option<oneshot::Sender<Result<Opened>>>,
    requests: VecDeque<oneshot::Sender<bool>>,
    eof_sent: bool,
    close_sent: bool,
    close_received: bool,
    violated: bool,
    shared: Arc<ChannelShared>,
}

impl Slot {
    fn new(
        channel_type: &str,
        recv: ReceiveWindow,
        shared: Arc<ChannelShared>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let slot = Self {
            channel_type: channel_type.to_string(),
            state: ChannelState::Opening,
            remote_id: 0,
            recv,
            send: SendWindow::new(0, 0),
            events,
            opening: None,
            requests: VecDeque::new(),
            eof_sent: false,
            close_sent: false,
            close_received: false,
            violated: false,
            shared,
        };
        (slot, rx)
    }

    fn deliver(&self, event: ChannelEvent) {
        // A departed consumer just stops receiving
        let _ = self.events.send(event);
    }

    /// Sends CLOSE (once) and reports `err` to the consumer.
    fn violate(&mut self, local_id: u32, err: Error, replies: &mut Vec<Message>) {
        logging::log_channel_violation(local_id, &err.to_string());
        self.deliver(ChannelEvent::Error(err));
        self.violated = true;
        self.state = ChannelState::Closing;
        if !self.close_sent {
            self.close_sent = true;
            replies.push(Message::ChannelClose(ChannelClose::new(self.remote_id)));
        }
        self.shared.credit.notify_waiters();
    }
}

struct Table {
    slots: HashMap<u32, Slot>,
    terminated: Option<Error>,
}

/// The channel table of one session.
pub(crate) struct Mux {
    next_id: AtomicU32,
    table: Mutex<Table>,
    window_size: u32,
    max_packet: u32,
    low_water: u32,
    accept_incoming: bool,
}

impl Mux {
    pub(crate) fn new(config: &SessionConfig) -> Self {
        Self {
            next_id: AtomicU32::new(0),
            table: Mutex::new(Table {
                slots: HashMap::new(),
                terminated: None,
            }),
            window_size: config.window_size,
            max_packet: config.channel_max_packet,
            low_water: config.window_low_water,
            accept_incoming: config.accept_incoming_channels,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A poisoned table still holds consistent counters
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn receive_window(&self) -> ReceiveWindow {
        ReceiveWindow::new(self.window_size, self.max_packet, self.low_water)
    }

    /// Allocates a channel and builds its CHANNEL_OPEN.
    pub(crate) fn register(&self, channel_type: ChannelType) -> Result<Registration> {
        let mut table = self.lock();
        if let Some(err) = &table.terminated {
            return Err(err.clone());
        }

        let local_id = self.allocate_id();
        let shared = Arc::new(ChannelShared::default());
        let (mut slot, events) =
            Slot::new(channel_type.name(), self.receive_window(), Arc::clone(&shared));
        let (tx, opened) = oneshot::channel();
        slot.opening = Some(tx);
        table.slots.insert(local_id, slot);

        debug!(local_id, channel_type = channel_type.name(), "Opening channel");
        let message = Message::ChannelOpen(ChannelOpen::new(
            channel_type,
            local_id,
            self.window_size,
            self.max_packet,
        ));
        Ok(Registration {
            local_id,
            message,
            events,
            opened,
            shared,
        })
    }

    /// Number of channels in the table.
    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub(crate) fn windows(&self, local_id: u32) -> Option<(u32, u32)> {
        self.lock()
            .slots
            .get(&local_id)
            .map(|s| (s.recv.available(), s.send.available()))
    }

    pub(crate) fn state(&self, local_id: u32) -> ChannelState {
        self.lock()
            .slots
            .get(&local_id)
            .map_or(ChannelState::Closed, |s| s.state)
    }

    /// Error for an operation on a channel that is gone.
    pub(crate) fn channel_error(&self, local_id: u32) -> Error {
        match &self.lock().terminated {
            Some(err) => err.clone(),
            None => Error::ChannelClosed(local_id),
        }
    }

    fn sendable<'a>(table: &'a mut Table, local_id: u32) -> Result<&'a mut Slot> {
        if let Some(err) = &table.terminated {
            return Err(err.clone());
        }
        match table.slots.get_mut(&local_id) {
            Some(slot) if slot.state == ChannelState::Open && !slot.eof_sent && !slot.close_sent => {
                Ok(slot)
            }
            _ => Err(Error::ChannelClosed(local_id)),
        }
    }

    pub(crate) fn ensure_sendable(&self, local_id: u32) -> Result<()> {
        Self::sendable(&mut self.lock(), local_id).map(|_| ())
    }

    /// Takes up to `want` bytes of send credit; 0 means wait for an adjust.
    pub(crate) fn reserve_send(&self, local_id: u32, want: usize) -> Result<u32> {
        let mut table = self.lock();
        let slot = Self::sendable(&mut table, local_id)?;
        Ok(slot.send.reserve(want))
    }

    /// Returns credit taken by [`Mux::reserve_send`] for data that never
    /// reached the wire.
    pub(crate) fn refund_send(&self, local_id: u32, n: u32) {
        if let Some(slot) = self.lock().slots.get_mut(&local_id) {
            slot.send.refund(n);
            slot.shared.credit.notify_waiters();
        }
    }

    /// Forgets a channel whose CHANNEL_OPEN never reached the wire.
    pub(crate) fn cancel_open(&self, local_id: u32) {
        let mut table = self.lock();
        if table
            .slots
            .get(&local_id)
            .is_some_and(|s| s.state == ChannelState::Opening)
        {
            table.slots.remove(&local_id);
            debug!(local_id, "Channel open cancelled");
        }
    }

    /// Stops waiting for the answer to a CHANNEL_OPEN already sent.
    ///
    /// The slot stays so the peer's late answer still matches it: a
    /// confirmation is closed straight away, a failure removes it, and
    /// teardown retires it if neither comes.
    pub(crate) fn abandon_open(&self, local_id: u32) {
        if let Some(slot) = self.lock().slots.get_mut(&local_id) {
            if slot.state == ChannelState::Opening && slot.opening.take().is_some() {
                debug!(local_id, "Channel open abandoned");
            }
        }
    }

    /// Queues a reply waiter for a want-reply request.
    pub(crate) fn push_request(&self, local_id: u32) -> Result<oneshot::Receiver<bool>> {
        let mut table = self.lock();
        let slot = Self::sendable(&mut table, local_id)?;
        let (tx, rx) = oneshot::channel();
        slot.requests.push_back(tx);
        Ok(rx)
    }

    /// Marks EOF sent; returns the message unless it was already sent.
    pub(crate) fn begin_eof(&self, local_id: u32) -> Result<Option<Message>> {
        let mut table = self.lock();
        if let Some(err) = &table.terminated {
            return Err(err.clone());
        }
        let slot = table
            .slots
            .get_mut(&local_id)
            .ok_or(Error::ChannelClosed(local_id))?;
        if slot.eof_sent || slot.close_sent {
            return Ok(None);
        }
        slot.eof_sent = true;
        Ok(Some(Message::ChannelEof(ChannelEof::new(slot.remote_id))))
    }

    /// Marks CLOSE sent; returns the message unless it was already sent.
    pub(crate) fn begin_close(&self, local_id: u32) -> Result<Option<Message>> {
        let mut table = self.lock();
        if let Some(err) = &table.terminated {
            return Err(err.clone());
        }
        let Some(slot) = table.slots.get_mut(&local_id) else {
            return Ok(None);
        };
        if slot.close_sent || slot.state == ChannelState::Opening {
            return Ok(None);
        }
        slot.close_sent = true;
        slot.state = ChannelState::Closing;
        slot.shared.credit.notify_waiters();
        let msg = Message::ChannelClose(ChannelClose::new(slot.remote_id));
        if slot.close_received {
            Self::retire(&mut table, local_id);
        }
        Ok(Some(msg))
    }

    fn retire(table: &mut Table, local_id: u32) {
        if let Some(slot) = table.slots.remove(&local_id) {
            logging::log_channel_closed(local_id, slot.recv.received(), slot.send.sent());
            if !slot.violated {
                slot.deliver(ChannelEvent::Closed);
            }
            slot.shared.credit.notify_waiters();
        }
    }

    fn slot_mut<'a>(table: &'a mut Table, local_id: u32, what: &str) -> Result<&'a mut Slot> {
        table
            .slots
            .get_mut(&local_id)
            .ok_or_else(|| Error::protocol(format!("{} for unknown channel {}", what, local_id)))
    }

    /// Applies one inbound channel-scope message.
    ///
    /// # Errors
    ///
    /// Only session-fatal violations (unknown channel numbers, replies
    /// nothing asked for) are returned; channel-level violations close the
    /// channel and are reported on it.
    pub(crate) fn handle(&self, msg: Message) -> Result<MuxOutput> {
        let mut out = MuxOutput::default();
        let mut table = self.lock();

        match msg {
            Message::ChannelOpen(open) => {
                out = self.handle_open(&mut table, open);
            }
            Message::ChannelOpenConfirmation(confirm) => {
                let local_id = confirm.recipient_channel;
                let slot = Self::slot_mut(&mut table, local_id, "open confirmation")?;
                if slot.state != ChannelState::Opening {
                    return Err(Error::protocol(format!(
                        "open confirmation for channel {} which is not opening",
                        local_id
                    )));
                }
                slot.remote_id = confirm.sender_channel;
                slot.send = SendWindow::new(confirm.initial_window_size, confirm.maximum_packet_size);
                slot.state = ChannelState::Open;
                logging::log_channel_open(
                    local_id,
                    confirm.sender_channel,
                    &slot.channel_type,
                    confirm.initial_window_size,
                );

                let opened = Opened {
                    remote_id: confirm.sender_channel,
                    remote_window: confirm.initial_window_size,
                    remote_max_packet: confirm.maximum_packet_size,
                };
                let delivered = slot
                    .opening
                    .take()
                    .map_or(false, |tx| tx.send(Ok(opened)).is_ok());
                if !delivered {
                    // The opener gave up waiting; close what it no longer wants
                    debug!(local_id, "Closing channel confirmed after its opener left");
                    slot.close_sent = true;
                    slot.state = ChannelState::Closing;
                    out.replies
                        .push(Message::ChannelClose(ChannelClose::new(slot.remote_id)));
                }
            }
            Message::ChannelOpenFailure(failure) => {
                let local_id = failure.recipient_channel;
                let slot = Self::slot_mut(&mut table, local_id, "open failure")?;
                if slot.state != ChannelState::Opening {
                    return Err(Error::protocol(format!(
                        "open failure for channel {} which is not opening",
                        local_id
                    )));
                }
                logging::log_channel_refused(local_id, failure.reason.code(), &failure.description);
                if let Some(slot) = table.slots.remove(&local_id) {
                    if let Some(tx) = slot.opening {
                        let _ = tx.send(Err(Error::ChannelOpenRefused {
                            reason: failure.reason.code(),
                            description: failure.description,
                        }));
                    }
                }
            }
            Message::ChannelWindowAdjust(adjust) => {
                let local_id = adjust.recipient_channel;
                let slot = Self::slot_mut(&mut table, local_id, "window adjust")?;
                if slot.violated {
                    return Ok(out);
                }
                match slot.send.adjust(adjust.bytes_to_add) {
                    Ok(()) => {
                        trace!(local_id, bytes = adjust.bytes_to_add, "Send window credited");
                        slot.shared.credit.notify_waiters();
                    }
                    Err(e) => slot.violate(local_id, e, &mut out.replies),
                }
            }
            Message::ChannelData(data) => {
                self.on_data(&mut table, data.recipient_channel, None, data.data, &mut out)?;
            }
            Message::ChannelExtendedData(data) => {
                self.on_data(
                    &mut table,
                    data.recipient_channel,
                    Some(data.data_type_code),
                    data.data,
                    &mut out,
                )?;
            }
            Message::ChannelEof(eof) => {
                let slot = Self::slot_mut(&mut table, eof.recipient_channel, "EOF")?;
                if !slot.violated {
                    slot.deliver(ChannelEvent::Eof);
                }
            }
            Message::ChannelClose(close) => {
                let local_id = close.recipient_channel;
                let slot = Self::slot_mut(&mut table, local_id, "CLOSE")?;
                if slot.state == ChannelState::Opening {
                    return Err(Error::protocol(format!(
                        "CLOSE for channel {} before it was confirmed",
                        local_id
                    )));
                }
                slot.close_received = true;
                if !slot.close_sent {
                    slot.close_sent = true;
                    out.replies
                        .push(Message::ChannelClose(ChannelClose::new(slot.remote_id)));
                }
                Self::retire(&mut table, local_id);
            }
            Message::ChannelRequest(request) => {
                let local_id = request.recipient_channel;
                let slot = Self::slot_mut(&mut table, local_id, "request")?;
                let exit_report = matches!(
                    request.request_type,
                    ChannelRequestType::ExitStatus { .. } | ChannelRequestType::ExitSignal { .. }
                );
                debug!(local_id, request = request.request_type.name(), "Channel request from peer");
                if request.want_reply && !exit_report && !slot.close_sent {
                    out.replies
                        .push(Message::ChannelFailure(ChannelFailure::new(slot.remote_id)));
                }
                if !slot.violated {
                    slot.deliver(ChannelEvent::Request {
                        request: request.request_type,
                        want_reply: request.want_reply,
                    });
                }
            }
            Message::ChannelSuccess(reply) => {
                self.on_reply(&mut table, reply.recipient_channel, true)?;
            }
            Message::ChannelFailure(reply) => {
                self.on_reply(&mut table, reply.recipient_channel, false)?;
            }
            other => {
                return Err(Error::protocol(format!(
                    "{} is not a channel message",
                    other.name()
                )));
            }
        }
        Ok(out)
    }

    fn handle_open(&self, table: &mut Table, open: ChannelOpen) -> MuxOutput {
        let mut out = MuxOutput::default();
        let refuse = |reason| {
            Message::ChannelOpenFailure(ChannelOpenFailure::new(open.sender_channel, reason))
        };

        let supported = matches!(
            open.channel_type,
            ChannelType::ForwardedTcpip { .. } | ChannelType::X11 { .. }
        );
        if !supported {
            debug!(channel_type = open.channel_type.name(), "Refusing unknown channel type");
            out.replies
                .push(refuse(ChannelOpenFailureReason::UnknownChannelType));
            return out;
        }
        if !self.accept_incoming || table.terminated.is_some() {
            debug!(channel_type = open.channel_type.name(), "Refusing incoming channel");
            out.replies
                .push(refuse(ChannelOpenFailureReason::AdministrativelyProhibited));
            return out;
        }

        let local_id = self.allocate_id();
        let shared = Arc::new(ChannelShared::default());
        let (mut slot, events) =
            Slot::new(open.channel_type.name(), self.receive_window(), Arc::clone(&shared));
        slot.remote_id = open.sender_channel;
        slot.send = SendWindow::new(open.initial_window_size, open.maximum_packet_size);
        slot.state = ChannelState::Open;
        table.slots.insert(local_id, slot);

        logging::log_channel_open(
            local_id,
            open.sender_channel,
            open.channel_type.name(),
            open.initial_window_size,
        );
        out.replies.push(Message::ChannelOpenConfirmation(
            ChannelOpenConfirmation::new(
                open.sender_channel,
                local_id,
                self.window_size,
                self.max_packet,
            ),
        ));
        out.incoming = Some(Incoming {
            local_id,
            remote_id: open.sender_channel,
            channel_type: open.channel_type,
            events,
            shared,
        });
        out
    }

    fn on_data(
        &self,
        table: &mut Table,
        local_id: u32,
        code: Option<u32>,
        data: Vec<u8>,
        out: &mut MuxOutput,
    ) -> Result<()> {
        let slot = Self::slot_mut(table, local_id, "data")?;
        if slot.state == ChannelState::Opening {
            return Err(Error::protocol(format!(
                "data for channel {} before it was confirmed",
                local_id
            )));
        }
        if slot.violated {
            return Ok(());
        }

        match slot.recv.consume(data.len()) {
            Ok(adjust) => {
                if let Some(bytes) = adjust {
                    if !slot.close_sent {
                        logging::log_window_adjust(local_id, bytes);
                        out.replies.push(Message::ChannelWindowAdjust(
                            ChannelWindowAdjust::new(slot.remote_id, bytes),
                        ));
                    }
                }
                slot.deliver(match code {
                    None => ChannelEvent::Data(data),
                    Some(code) => ChannelEvent::ExtendedData { code, data },
                });
            }
            Err(e) => slot.violate(local_id, e, &mut out.replies),
        }
        Ok(())
    }

    fn on_reply(&self, table: &mut Table, local_id: u32, success: bool) -> Result<()> {
        let slot = Self::slot_mut(table, local_id, "request reply")?;
        let waiter = slot.requests.pop_front().ok_or_else(|| {
            Error::protocol(format!(
                "request reply on channel {} with no request pending",
                local_id
            ))
        })?;
        // The requester may have timed out
        let _ = waiter.send(success);
        Ok(())
    }

    /// Fails every channel with `err`; later operations return it too.
    pub(crate) fn terminate(&self, err: Error) {
        let mut table = self.lock();
        if table.terminated.is_none() {
            table.terminated = Some(err.clone());
        }
        for (local_id, mut slot) in table.slots.drain() {
            if let Some(tx) = slot.opening.take() {
                let _ = tx.send(Err(err.clone()));
            }
            if !slot.violated {
                slot.deliver(ChannelEvent::Error(err.clone()));
            }
            slot.shared.credit.notify_waiters();
            trace!(local_id, "Channel force-retired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::{ChannelData, ChannelRequest, ChannelSuccess};

    fn config(window: u32, max_packet: u32, low_water: u32) -> SessionConfig {
        SessionConfig {
            window_size: window,
            channel_max_packet: max_packet,
            window_low_water: low_water,
            ..SessionConfig::default()
        }
    }

    fn open(mux: &Mux, remote_id: u32, remote_window: u32) -> (u32, mpsc::UnboundedReceiver<ChannelEvent>) {
        let mut reg = mux.register(ChannelType::Session).unwrap();
        mux.handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
            reg.local_id,
            remote_id,
            remote_window,
            1024,
        )))
        .unwrap();
        let opened = reg.opened.try_recv().unwrap().unwrap();
        assert_eq!(opened.remote_id, remote_id);
        (reg.local_id, reg.events)
    }

    fn data(local_id: u32, len: usize) -> Message {
        Message::ChannelData(ChannelData::new(local_id, vec![0x61; len]))
    }

    #[test]
    fn test_local_ids_are_monotonic() {
        let mux = Mux::new(&SessionConfig::default());
        let ids: Vec<u32> = (0..3).map(|_| mux.register(ChannelType::Session).unwrap().local_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_window_violation_closes_channel_only() {
        let mux = Mux::new(&config(5, 5, 0));
        let (a, mut events_a) = open(&mux, 100, 1000);
        let (b, _events_b) = open(&mux, 101, 1000);

        let out = mux.handle(data(a, 5)).unwrap();
        assert!(out.replies.is_empty());
        assert_eq!(mux.windows(a), Some((0, 1000)));
        assert_eq!(events_a.try_recv().unwrap(), ChannelEvent::Data(vec![0x61; 5]));

        let out = mux.handle(data(a, 1)).unwrap();
        assert_eq!(
            out.replies,
            vec![Message::ChannelClose(ChannelClose::new(100))]
        );
        assert!(matches!(
            events_a.try_recv().unwrap(),
            ChannelEvent::Error(Error::ProtocolViolation(_))
        ));
        assert_eq!(mux.state(a), ChannelState::Closing);
        assert!(matches!(mux.reserve_send(a, 1), Err(Error::ChannelClosed(_))));

        // The other channel is untouched
        assert_eq!(mux.state(b), ChannelState::Open);
        assert_eq!(mux.reserve_send(b, 10).unwrap(), 10);

        // The peer's CLOSE retires it
        let out = mux.handle(Message::ChannelClose(ChannelClose::new(a))).unwrap();
        assert!(out.replies.is_empty());
        assert_eq!(mux.state(a), ChannelState::Closed);
    }

    #[test]
    fn test_window_adjust_sent_below_low_water() {
        let mux = Mux::new(&config(100, 50, 50));
        let (a, _events) = open(&mux, 7, 1000);

        assert!(mux.handle(data(a, 50)).unwrap().replies.is_empty());
        let out = mux.handle(data(a, 1)).unwrap();
        assert_eq!(
            out.replies,
            vec![Message::ChannelWindowAdjust(ChannelWindowAdjust::new(7, 51))]
        );
        assert_eq!(mux.windows(a), Some((100, 1000)));
    }

    #[test]
    fn test_open_refused() {
        let mux = Mux::new(&SessionConfig::default());
        let mut reg = mux.register(ChannelType::Session).unwrap();
        let mut failure =
            ChannelOpenFailure::new(reg.local_id, ChannelOpenFailureReason::AdministrativelyProhibited);
        failure.description = "no sessions".into();
        mux.handle(Message::ChannelOpenFailure(failure)).unwrap();

        match reg.opened.try_recv().unwrap() {
            Err(Error::ChannelOpenRefused { reason, description }) => {
                assert_eq!(reason, 1);
                assert_eq!(description, "no sessions");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_close_handshake_either_order() {
        let mux = Mux::new(&SessionConfig::default());

        // Local first
        let (a, mut events) = open(&mux, 1, 1000);
        assert!(mux.begin_close(a).unwrap().is_some());
        assert!(mux.begin_close(a).unwrap().is_none());
        assert_eq!(mux.state(a), ChannelState::Closing);
        let out = mux.handle(Message::ChannelClose(ChannelClose::new(a))).unwrap();
        assert!(out.replies.is_empty());
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Closed);

        // Peer first: answered with our CLOSE
        let (b, mut events) = open(&mux, 2, 1000);
        let out = mux.handle(Message::ChannelClose(ChannelClose::new(b))).unwrap();
        assert_eq!(out.replies, vec![Message::ChannelClose(ChannelClose::new(2))]);
        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Closed);
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_request_replies_fifo() {
        let mux = Mux::new(&SessionConfig::default());
        let (a, _events) = open(&mux, 9, 1000);
        let mut first = mux.push_request(a).unwrap();
        let mut second = mux.push_request(a).unwrap();

        mux.handle(Message::ChannelFailure(ChannelFailure::new(a))).unwrap();
        mux.handle(Message::ChannelSuccess(ChannelSuccess::new(a))).unwrap();
        assert_eq!(first.try_recv().unwrap(), false);
        assert_eq!(second.try_recv().unwrap(), true);

        // Unsolicited reply is fatal
        assert!(mux
            .handle(Message::ChannelSuccess(ChannelSuccess::new(a)))
            .is_err());
    }

    #[test]
    fn test_inbound_request_want_reply_answered_with_failure() {
        let mux = Mux::new(&SessionConfig::default());
        let (a, mut events) = open(&mux, 3, 1000);

        let keepalive = ChannelRequest::new(
            a,
            ChannelRequestType::Other {
                name: "keepalive@openssh.com".into(),
                data: vec![],
            },
            true,
        );
        let out = mux.handle(Message::ChannelRequest(keepalive)).unwrap();
        assert_eq!(out.replies, vec![Message::ChannelFailure(ChannelFailure::new(3))]);
        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Request { want_reply: true, .. }));

        let status = ChannelRequest::new(a, ChannelRequestType::ExitStatus { exit_status: 0 }, false);
        let out = mux.handle(Message::ChannelRequest(status)).unwrap();
        assert!(out.replies.is_empty());
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let mux = Mux::new(&SessionConfig::default());
        assert!(matches!(
            mux.handle(data(42, 1)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_incoming_open_refused_unless_enabled() {
        let open_msg = || {
            Message::ChannelOpen(ChannelOpen::new(
                ChannelType::ForwardedTcpip {
                    connected_address: "127.0.0.1".into(),
                    connected_port: 8080,
                    originator_address: "10.0.0.1".into(),
                    originator_port: 5555,
                },
                77,
                4096,
                1024,
            ))
        };

        let mux = Mux::new(&SessionConfig::default());
        let out = mux.handle(open_msg()).unwrap();
        assert_eq!(
            out.replies,
            vec![Message::ChannelOpenFailure(ChannelOpenFailure::new(
                77,
                ChannelOpenFailureReason::AdministrativelyProhibited
            ))]
        );
        assert!(out.incoming.is_none());

        let mux = Mux::new(&SessionConfig {
            accept_incoming_channels: true,
            ..SessionConfig::default()
        });
        let out = mux.handle(open_msg()).unwrap();
        let incoming = out.incoming.unwrap();
        assert_eq!(incoming.remote_id, 77);
        assert!(matches!(
            out.replies[0],
            Message::ChannelOpenConfirmation(ChannelOpenConfirmation { recipient_channel: 77, .. })
        ));
        assert_eq!(
            mux.windows(incoming.local_id),
            Some((SessionConfig::default().window_size, 4096))
        );
    }

    #[test]
    fn test_refund_send_restores_window() {
        let mux = Mux::new(&SessionConfig::default());
        let (a, _events) = open(&mux, 1, 10);
        assert_eq!(mux.reserve_send(a, 3), Ok(3));
        assert_eq!(mux.windows(a).unwrap().1, 7);

        mux.refund_send(a, 3);
        assert_eq!(mux.windows(a).unwrap().1, 10);
    }

    #[test]
    fn test_cancel_open_forgets_unsent_channel() {
        let mux = Mux::new(&SessionConfig::default());
        let (a, _events) = open(&mux, 1, 10);
        let pending = mux.register(ChannelType::Session).unwrap();

        mux.cancel_open(pending.local_id);
        // Open channels are left alone
        mux.cancel_open(a);
        assert_eq!(mux.len(), 1);
        assert!(mux.windows(pending.local_id).is_none());
    }

    #[test]
    fn test_abandoned_open_closed_on_late_confirmation() {
        let mux = Mux::new(&SessionConfig::default());
        let reg = mux.register(ChannelType::Session).unwrap();
        let local_id = reg.local_id;
        mux.abandon_open(local_id);
        assert_eq!(mux.len(), 1);

        let out = mux
            .handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                local_id, 9, 1000, 1024,
            )))
            .unwrap();
        assert_eq!(out.replies, vec![Message::ChannelClose(ChannelClose::new(9))]);

        mux.handle(Message::ChannelClose(ChannelClose::new(local_id))).unwrap();
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_abandoned_open_removed_on_late_failure() {
        let mux = Mux::new(&SessionConfig::default());
        let reg = mux.register(ChannelType::Session).unwrap();
        mux.abandon_open(reg.local_id);

        mux.handle(Message::ChannelOpenFailure(ChannelOpenFailure::new(
            reg.local_id,
            ChannelOpenFailureReason::ConnectFailed,
        )))
        .unwrap();
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_terminate_fails_everything() {
        let mux = Mux::new(&SessionConfig::default());
        let (a, mut events) = open(&mux, 1, 1000);
        let mut pending = mux.register(ChannelType::Session).unwrap();

        let lost = Error::ConnectionLost("MAC failure".into());
        mux.terminate(lost.clone());

        assert_eq!(events.try_recv().unwrap(), ChannelEvent::Error(lost.clone()));
        assert_eq!(pending.opened.try_recv().unwrap(), Err(lost.clone()));
        assert_eq!(mux.reserve_send(a, 1), Err(lost.clone()));
        assert!(mux.register(ChannelType::Session).is_err());
    }
}
