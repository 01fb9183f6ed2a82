//! SSH Transport Layer State Machine (RFC 4253).
//!
//! This module holds the pieces of the transport layer that are independent
//! of the dispatch loop: the session lifecycle state machine, the rekey
//! limits, and the outbound half of the connection (the "writer").
//!
//! # Session States
//!
//! 1. **Disconnected** - No identification exchanged yet, or torn down
//! 2. **VersionExchanged** - Both identification lines seen
//! 3. **KeyExchanging** - A key exchange is running (initial or rekey)
//! 4. **Established** - Keys installed; channels may be used
//! 5. **Disconnecting** - Teardown in progress
//!
//! `Established -> KeyExchanging -> Established` repeats for every rekey.
//!
//! # Rekeying
//!
//! A rekey is started automatically once either limit is reached:
//! - Data transferred (1 GiB by default)
//! - Time elapsed (1 hour by default)
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::transport::SessionState;
//!
//! let mut state = SessionState::Disconnected;
//! state.transition(SessionState::VersionExchanged).unwrap();
//! state.transition(SessionState::KeyExchanging).unwrap();
//! assert!(state.transition(SessionState::VersionExchanged).is_err());
//! ```

use crate::ssh::error::{Error, Result};
use crate::ssh::kex::KeyExchange;
use crate::ssh::logging;
use crate::ssh::message::Message;
use crate::ssh::packet::PacketSealer;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Write half of the byte stream, type-erased.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Lifecycle state of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not connected (initial and terminal state)
    Disconnected,
    /// Identification lines exchanged
    VersionExchanged,
    /// Key exchange in progress
    KeyExchanging,
    /// Keys installed, connection layer usable
    Established,
    /// Teardown in progress
    Disconnecting,
}

impl SessionState {
    /// Returns the state name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::VersionExchanged => "VersionExchanged",
            SessionState::KeyExchanging => "KeyExchanging",
            SessionState::Established => "Established",
            SessionState::Disconnecting => "Disconnecting",
        }
    }

    /// Whether the session is being or has been torn down.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnecting | SessionState::Disconnected
        )
    }

    /// Transitions to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if the transition is invalid
    /// (e.g. `VersionExchanged -> Established`).
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        use SessionState::*;

        let valid = match (*self, next) {
            // Normal progression
            (Disconnected, VersionExchanged) => true,
            (VersionExchanged, KeyExchanging) => true,
            (KeyExchanging, Established) => true,
            // Rekeying
            (Established, KeyExchanging) => true,
            // Teardown from any live state
            (Disconnected, Disconnecting) => false,
            (_, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            // Stay in same state
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(Error::protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self, next
            )));
        }

        if *self != next {
            logging::log_state_transition(self.name(), next.name());
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks traffic and time since the last key exchange.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    bytes_limit: u64,
    interval: Duration,
    bytes_transferred: u64,
    last_kex: Instant,
}

impl RekeyTracker {
    /// Creates a tracker with the given limits, starting now.
    pub fn new(bytes_limit: u64, interval: Duration) -> Self {
        Self {
            bytes_limit,
            interval,
            bytes_transferred: 0,
            last_kex: Instant::now(),
        }
    }

    /// Records bytes sent or received.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    /// Returns bytes counted since the last key exchange.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Checks if either limit has been reached at `now`.
    pub fn needs_rekey(&self, now: Instant) -> bool {
        self.bytes_transferred >= self.bytes_limit
            || now.saturating_duration_since(self.last_kex) >= self.interval
    }

    /// Resets the counters after a completed key exchange.
    pub fn reset(&mut self, now: Instant) {
        self.bytes_transferred = 0;
        self.last_kex = now;
    }
}

/// Outbound half of a session, guarded by the writer lock.
///
/// Holds everything that must change atomically with a write: the stream,
/// the packet sealer (outbound sequence number and keys), the running key
/// exchange and the messages deferred while it runs.
pub(crate) struct Transport {
    writer: BoxedWriter,
    pub(crate) sealer: PacketSealer,
    pub(crate) kex: Option<KeyExchange>,
    pub(crate) kex_started: Option<Instant>,
    deferred: VecDeque<Message>,
    pub(crate) rekey: RekeyTracker,
    shut_down: bool,
}

impl Transport {
    pub(crate) fn new(writer: BoxedWriter, rekey: RekeyTracker) -> Self {
        Self {
            writer,
            sealer: PacketSealer::new(),
            kex: None,
            kex_started: None,
            deferred: VecDeque::new(),
            rekey,
            shut_down: false,
        }
    }

    /// Whether a key exchange is running.
    pub(crate) fn kex_in_progress(&self) -> bool {
        self.kex.is_some()
    }

    /// Seals and writes one message.
    pub(crate) async fn write_message(&mut self, msg: &Message) -> Result<()> {
        if self.shut_down {
            return Err(Error::ConnectionLost("transport already shut down".into()));
        }
        let payload = msg.encode();
        let seq = self.sealer.sequence_number();
        let bytes = self.sealer.seal(&payload)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        self.rekey.add_bytes(bytes.len() as u64);
        logging::log_packet("out", seq, msg.name(), bytes.len());
        Ok(())
    }

    /// Writes `msg` now, or queues it until the running key exchange ends.
    ///
    /// Only transport-generic and key exchange messages may cross a key
    /// exchange; everything else keeps its relative order in the queue.
    pub(crate) async fn write_or_defer(&mut self, msg: Message) -> Result<()> {
        if self.kex.is_some() && !(msg.is_transport_generic() || msg.is_kex()) {
            debug!(msg = msg.name(), "Deferring message until key exchange completes");
            self.deferred.push_back(msg);
            return Ok(());
        }
        self.write_message(&msg).await
    }

    /// Writes every deferred message in order.
    pub(crate) async fn flush_deferred(&mut self) -> Result<()> {
        while let Some(msg) = self.deferred.pop_front() {
            self.write_message(&msg).await?;
        }
        Ok(())
    }

    /// Number of messages waiting for the key exchange to end.
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Shuts the write half down; later writes fail.
    pub(crate) async fn shutdown(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.deferred.clear();
            let _ = self.writer.shutdown().await;
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("sealer", &self.sealer)
            .field("kex", &self.kex)
            .field("deferred", &self.deferred.len())
            .field("rekey", &self.rekey)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::ChannelWindowAdjust;
    use crate::ssh::kex::KexInit;
    use crate::ssh::packet::PacketOpener;
    use crate::ssh::registry::Preferences;

    #[test]
    fn test_state_transition_valid() {
        let mut state = SessionState::Disconnected;

        assert!(state.transition(SessionState::VersionExchanged).is_ok());
        assert!(state.transition(SessionState::KeyExchanging).is_ok());
        assert!(state.transition(SessionState::Established).is_ok());
        assert_eq!(state, SessionState::Established);
    }

    #[test]
    fn test_state_transition_rekey() {
        let mut state = SessionState::Established;
        assert!(state.transition(SessionState::KeyExchanging).is_ok());
        assert!(state.transition(SessionState::Established).is_ok());
    }

    #[test]
    fn test_state_transition_teardown() {
        for from in [
            SessionState::VersionExchanged,
            SessionState::KeyExchanging,
            SessionState::Established,
        ] {
            let mut state = from;
            state.transition(SessionState::Disconnecting).unwrap();
            state.transition(SessionState::Disconnected).unwrap();
            assert!(state.is_closing());
        }
    }

    #[test]
    fn test_state_transition_invalid() {
        let mut state = SessionState::Disconnected;

        // Can't jump directly to Established
        let result = state.transition(SessionState::Established);
        match result {
            Err(Error::ProtocolViolation(msg)) => {
                assert!(msg.contains("Invalid state transition"));
            }
            _ => panic!("Expected ProtocolViolation"),
        }
        assert_eq!(state, SessionState::Disconnected);

        let mut state = SessionState::Disconnected;
        assert!(state.transition(SessionState::Disconnecting).is_err());
        let mut state = SessionState::Disconnecting;
        assert!(state.transition(SessionState::Established).is_err());
    }

    #[test]
    fn test_needs_rekey_bytes() {
        let now = Instant::now();
        let mut tracker = RekeyTracker::new(1000, Duration::from_secs(3600));
        tracker.reset(now);

        tracker.add_bytes(600);
        assert!(!tracker.needs_rekey(now));
        tracker.add_bytes(400);
        assert!(tracker.needs_rekey(now));

        tracker.reset(now);
        assert_eq!(tracker.bytes_transferred(), 0);
        assert!(!tracker.needs_rekey(now));
    }

    #[test]
    fn test_needs_rekey_time() {
        let start = Instant::now();
        let mut tracker = RekeyTracker::new(u64::MAX, Duration::from_secs(60));
        tracker.reset(start);

        assert!(!tracker.needs_rekey(start + Duration::from_secs(59)));
        assert!(tracker.needs_rekey(start + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_defer_during_kex_and_flush_in_order() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut transport = Transport::new(
            Box::new(client),
            RekeyTracker::new(u64::MAX, Duration::from_secs(3600)),
        );
        transport.kex = Some(KeyExchange::new(KexInit::from_preferences(
            &Preferences::default(),
        )));

        let adjust = |n| Message::ChannelWindowAdjust(ChannelWindowAdjust::new(0, n));
        transport.write_or_defer(adjust(1)).await.unwrap();
        transport.write_or_defer(adjust(2)).await.unwrap();
        // Transport-generic messages go straight out
        transport
            .write_or_defer(Message::Ignore(vec![]))
            .await
            .unwrap();
        assert_eq!(transport.deferred_len(), 2);

        transport.kex = None;
        transport.flush_deferred().await.unwrap();
        assert_eq!(transport.deferred_len(), 0);

        let mut opener = PacketOpener::default();
        let first = opener.read_packet(&mut server).await.unwrap();
        assert_eq!(Message::decode(&first.payload).unwrap(), Message::Ignore(vec![]));
        for n in [1, 2] {
            let packet = opener.read_packet(&mut server).await.unwrap();
            assert_eq!(Message::decode(&packet.payload).unwrap(), adjust(n));
        }
        assert_eq!(transport.sealer.sequence_number(), 3);
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut transport = Transport::new(
            Box::new(client),
            RekeyTracker::new(u64::MAX, Duration::from_secs(3600)),
        );
        transport.shutdown().await;
        assert!(transport.is_shut_down());
        assert!(matches!(
            transport.write_message(&Message::Ignore(vec![])).await,
            Err(Error::ConnectionLost(_))
        ));
    }
}
