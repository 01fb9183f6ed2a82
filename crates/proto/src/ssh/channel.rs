//! SSH Channel management.
//!
//! A [`Channel`] is the consumer side of one logical channel multiplexed
//! over a session (RFC 4254 Section 5). Inbound traffic arrives as
//! [`ChannelEvent`]s on an unbounded queue filled by the dispatch loop, so a
//! slow consumer never stalls other channels. Outbound data is chunked to the
//! peer's window and maximum packet size.
//!
//! # Flow Control
//!
//! - [`ReceiveWindow`]: credit we granted the peer. Data beyond it is a
//!   protocol violation that closes the channel; falling below the low-water
//!   mark triggers a WINDOW_ADJUST back to the initial size.
//! - [`SendWindow`]: credit the peer granted us. Senders wait while it is 0.

use crate::ssh::connection::{
    ChannelData, ChannelExtendedData, ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR,
};
use crate::ssh::error::{Error, Result};
use crate::ssh::message::Message;
use crate::ssh::mux::ChannelShared;
use crate::ssh::session::SessionInner;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// SSH Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is opening
    Opening,
    /// Channel is open and ready
    Open,
    /// CLOSE sent or received, waiting for the other
    Closing,
    /// Channel is closed
    Closed,
}

/// Event delivered to a channel consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Data received on this channel
    Data(Vec<u8>),
    /// Extended data (stderr when `code` is 1)
    ExtendedData {
        /// Data type code
        code: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// Peer will send no more data
    Eof,
    /// Request sent by the peer (exit-status, exit-signal, ...)
    Request {
        /// Request type and parameters
        request: ChannelRequestType,
        /// Whether the peer asked for a reply (answered with failure)
        want_reply: bool,
    },
    /// CLOSE both sent and received; no further events follow
    Closed,
    /// Channel-level violation or session loss; the channel is finished
    Error(Error),
}

/// Credit granted to the peer for data it sends us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveWindow {
    initial: u32,
    available: u32,
    low_water: u32,
    max_packet: u32,
    received: u64,
}

impl ReceiveWindow {
    /// Creates a window of `initial` bytes.
    pub fn new(initial: u32, max_packet: u32, low_water: u32) -> Self {
        Self {
            initial,
            available: initial,
            low_water,
            max_packet,
            received: 0,
        }
    }

    /// Remaining credit.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Total bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Accounts for `len` bytes of inbound data.
    ///
    /// Returns the WINDOW_ADJUST increment to send, if the window dropped
    /// below the low-water mark.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] if the data exceeds the remaining
    /// window or the advertised maximum packet size.
    pub fn consume(&mut self, len: usize) -> Result<Option<u32>> {
        if len > self.max_packet as usize {
            return Err(Error::protocol(format!(
                "channel data of {} bytes exceeds maximum packet {}",
                len, self.max_packet
            )));
        }
        if len > self.available as usize {
            return Err(Error::protocol(format!(
                "channel data of {} bytes exceeds window of {}",
                len, self.available
            )));
        }
        // len <= available <= u32::MAX
        self.available -= len as u32;
        self.received += len as u64;

        if self.available < self.low_water {
            let adjust = self.initial - self.available;
            self.available = self.initial;
            return Ok(Some(adjust));
        }
        Ok(None)
    }
}

/// Credit the peer granted us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWindow {
    available: u32,
    max_packet: u32,
    sent: u64,
}

impl SendWindow {
    /// Creates a window from the peer's open parameters.
    pub fn new(initial: u32, max_packet: u32) -> Self {
        Self {
            available: initial,
            max_packet,
            sent: 0,
        }
    }

    /// Remaining credit.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Peer's maximum packet size.
    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    /// Total bytes reserved so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Takes up to `want` bytes of credit, bounded by the maximum packet.
    /// Returns 0 when the window is exhausted.
    pub fn reserve(&mut self, want: usize) -> u32 {
        let n = want
            .min(self.available as usize)
            .min(self.max_packet as usize) as u32;
        self.available -= n;
        self.sent += n as u64;
        n
    }

    /// Gives back credit reserved for data that was never sent.
    pub fn refund(&mut self, n: u32) {
        self.available = self.available.saturating_add(n);
        self.sent = self.sent.saturating_sub(n as u64);
    }

    /// Adds credit from a WINDOW_ADJUST.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] if the window would exceed 2^32 - 1.
    pub fn adjust(&mut self, bytes: u32) -> Result<()> {
        self.available = self.available.checked_add(bytes).ok_or_else(|| {
            Error::protocol(format!(
                "window adjust of {} overflows window of {}",
                bytes, self.available
            ))
        })?;
        Ok(())
    }
}

/// An open SSH channel.
///
/// Dropping a channel that was not closed sends CLOSE in the background.
pub struct Channel {
    session: Arc<SessionInner>,
    local_id: u32,
    remote_id: u32,
    channel_type: ChannelType,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    shared: Arc<ChannelShared>,
    finished: bool,
}

impl Channel {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        local_id: u32,
        remote_id: u32,
        channel_type: ChannelType,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        shared: Arc<ChannelShared>,
    ) -> Self {
        Self {
            session,
            local_id,
            remote_id,
            channel_type,
            events,
            shared,
            finished: false,
        }
    }

    /// Returns the local channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Current `(receive window, send window)`, or `None` once retired.
    pub fn windows(&self) -> Option<(u32, u32)> {
        self.session.mux.windows(self.local_id)
    }

    /// Current state as seen by the multiplexer.
    pub fn state(&self) -> ChannelState {
        self.session.mux.state(self.local_id)
    }

    /// Waits for the next event. Returns `None` after `Closed` or `Error`
    /// has been delivered.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await;
        if matches!(
            event,
            None | Some(ChannelEvent::Closed) | Some(ChannelEvent::Error(_))
        ) {
            self.finished = true;
        }
        event
    }

    /// Sends data, waiting for window credit as needed.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationTimedOut`] if no credit arrives in time
    /// - [`Error::ChannelClosed`] after EOF or CLOSE
    /// - [`Error::ConnectionLost`] if the session ends
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_data(None, data).await
    }

    /// Sends extended data (`code` 1 is stderr).
    pub async fn send_extended(&self, code: u32, data: &[u8]) -> Result<()> {
        self.send_data(Some(code), data).await
    }

    /// Sends data on the stderr stream.
    pub async fn send_stderr(&self, data: &[u8]) -> Result<()> {
        self.send_data(Some(EXTENDED_DATA_STDERR), data).await
    }

    async fn send_data(&self, code: Option<u32>, mut data: &[u8]) -> Result<()> {
        let _ops = self.shared.ops.lock().await;
        let wait = self.session.config.operation_timeout;

        while !data.is_empty() {
            let credit = self.shared.credit.notified();
            let n = self.session.mux.reserve_send(self.local_id, data.len())? as usize;
            if n == 0 {
                debug!(local_id = self.local_id, "Send window exhausted, waiting");
                timeout(wait, credit).await.map_err(|_| {
                    Error::OperationTimedOut(format!(
                        "no window credit on channel {}",
                        self.local_id
                    ))
                })?;
                continue;
            }

            let (chunk, rest) = data.split_at(n);
            let msg = match code {
                None => Message::ChannelData(ChannelData::new(self.remote_id, chunk.to_vec())),
                Some(code) => Message::ChannelExtendedData(ChannelExtendedData::new(
                    self.remote_id,
                    code,
                    chunk.to_vec(),
                )),
            };
            if let Err(e) = self.session.send(msg).await {
                // Nothing reached the peer, so the credit is still ours
                self.session.mux.refund_send(self.local_id, n as u32);
                return Err(e);
            }
            data = rest;
        }
        Ok(())
    }

    /// Sends a channel request.
    ///
    /// With `want_reply` this waits for CHANNEL_SUCCESS (`true`) or
    /// CHANNEL_FAILURE (`false`); without it, returns `true` once sent.
    pub async fn request(&self, request: ChannelRequestType, want_reply: bool) -> Result<bool> {
        let _ops = self.shared.ops.lock().await;
        let msg = Message::ChannelRequest(crate::ssh::connection::ChannelRequest::new(
            self.remote_id,
            request,
            want_reply,
        ));

        if !want_reply {
            self.session.mux.ensure_sendable(self.local_id)?;
            self.session.send(msg).await?;
            return Ok(true);
        }

        let reply = self.session.mux.push_request(self.local_id)?;
        self.session.send(msg).await?;
        match timeout(self.session.config.operation_timeout, reply).await {
            Err(_) => Err(Error::OperationTimedOut(format!(
                "no reply to request on channel {}",
                self.local_id
            ))),
            Ok(Err(_)) => Err(self.session.mux.channel_error(self.local_id)),
            Ok(Ok(success)) => Ok(success),
        }
    }

    /// Starts `command` (want-reply).
    pub async fn exec(&self, command: &str) -> Result<bool> {
        self.request(
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        )
        .await
    }

    /// Starts the user's shell (want-reply).
    pub async fn shell(&self) -> Result<bool> {
        self.request(ChannelRequestType::Shell, true).await
    }

    /// Starts a subsystem such as `sftp` (want-reply).
    pub async fn subsystem(&self, name: &str) -> Result<bool> {
        self.request(
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        )
        .await
    }

    /// Requests a pseudo-terminal (want-reply).
    pub async fn request_pty(&self, term: &str, width_chars: u32, height_rows: u32) -> Result<bool> {
        self.request(
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
                modes: vec![0], // TTY_OP_END
            },
            true,
        )
        .await
    }

    /// Reports a terminal size change.
    pub async fn window_change(&self, width_chars: u32, height_rows: u32) -> Result<()> {
        self.request(
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Delivers a signal (name without the "SIG" prefix).
    pub async fn signal(&self, name: &str) -> Result<()> {
        self.request(
            ChannelRequestType::Signal {
                name: name.to_string(),
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Sets an environment variable for the session.
    pub async fn env(&self, name: &str, value: &str) -> Result<()> {
        self.request(
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Sends EOF. Further sends fail with [`Error::ChannelClosed`].
    pub async fn eof(&self) -> Result<()> {
        let _ops = self.shared.ops.lock().await;
        if let Some(msg) = self.session.mux.begin_eof(self.local_id)? {
            self.session.send(msg).await?;
        }
        Ok(())
    }

    /// Sends CLOSE. The channel is retired once the peer's CLOSE arrives,
    /// which is reported as [`ChannelEvent::Closed`].
    pub async fn close(&self) -> Result<()> {
        let _ops = self.shared.ops.lock().await;
        if let Some(msg) = self.session.mux.begin_close(self.local_id)? {
            self.session.send(msg).await?;
        }
        Ok(())
    }

    /// Closes the channel and waits for it to be retired, discarding any
    /// remaining events.
    pub async fn close_and_wait(mut self) -> Result<()> {
        self.close().await?;
        let wait = self.session.config.operation_timeout;
        let local_id = self.local_id;
        timeout(wait, async {
            while let Some(event) = self.recv().await {
                match event {
                    ChannelEvent::Closed => return Ok(()),
                    ChannelEvent::Error(e) => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::OperationTimedOut(format!("channel {} did not close", local_id)))?
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("channel_type", &self.channel_type.name())
            .finish_non_exhaustive()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.finished || self.session.is_closing() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let local_id = self.local_id;
        handle.spawn(async move {
            if let Ok(Some(msg)) = session.mux.begin_close(local_id) {
                let _ = session.send(msg).await;
            }
        });
    }
}
