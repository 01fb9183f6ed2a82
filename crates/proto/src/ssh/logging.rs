//! Structured logging for SSH sessions
//!
//! Groups the recurring session events behind small functions so field
//! names stay consistent across the codebase. Secrets never reach these
//! functions; identifiers such as the session id are hex-encoded.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets and messages
//! - **DEBUG**: Channel lifecycle, window adjustments, deferred sends
//! - **INFO**: State transitions, key exchange completion
//! - **WARN**: Peer disconnects, refused channels, channel-level violations
//! - **ERROR**: Fatal session errors
//!
//! # Example
//!
//! ```no_run
//! use kestrel_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("kestrel_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition("KeyExchanging", "Established");
//! ```

use crate::ssh::kex::NegotiatedAlgorithms;
use tracing::{debug, error, info, trace, warn};

/// Log session state transition
pub fn log_state_transition(from: &str, to: &str) {
    info!(state_from = from, state_to = to, "Session state transition");
}

/// Log negotiated algorithm set
pub fn log_negotiated(algorithms: &NegotiatedAlgorithms) {
    debug!(
        kex = %algorithms.kex,
        host_key = %algorithms.host_key,
        cipher_c2s = %algorithms.cipher_c2s,
        cipher_s2c = %algorithms.cipher_s2c,
        mac_c2s = %algorithms.mac_c2s,
        mac_s2c = %algorithms.mac_s2c,
        "Algorithms negotiated"
    );
}

/// Log key exchange start
///
/// # Arguments
///
/// * `initiator` - "client" or "server"
/// * `rekey` - Whether a session id already exists
pub fn log_kex_start(initiator: &str, rekey: bool) {
    info!(initiator = initiator, rekey = rekey, "Key exchange started");
}

/// Log key exchange completion
///
/// # Arguments
///
/// * `session_id` - Session identifier (first exchange hash)
/// * `kex` - Key exchange method used
/// * `duration_ms` - Time from KEXINIT to the second NEWKEYS
pub fn log_kex_complete(session_id: &[u8], kex: &str, duration_ms: u64) {
    info!(
        session_id = %hex::encode(session_id),
        kex = kex,
        duration_ms = duration_ms,
        "Key exchange completed"
    );
}

/// Log a packet sent or received
pub fn log_packet(direction: &str, seq: u32, msg: &str, len: usize) {
    trace!(
        direction = direction,
        seq = seq,
        msg = msg,
        len = len,
        "Packet"
    );
}

/// Log channel opened
pub fn log_channel_open(local_id: u32, remote_id: u32, channel_type: &str, remote_window: u32) {
    debug!(
        local_id = local_id,
        remote_id = remote_id,
        channel_type = channel_type,
        remote_window = remote_window,
        "Channel opened"
    );
}

/// Log channel open refused
pub fn log_channel_refused(local_id: u32, reason: u32, description: &str) {
    warn!(
        local_id = local_id,
        reason = reason,
        description = description,
        "Channel open refused"
    );
}

/// Log channel retired
pub fn log_channel_closed(local_id: u32, bytes_received: u64, bytes_sent: u64) {
    debug!(
        local_id = local_id,
        bytes_received = bytes_received,
        bytes_sent = bytes_sent,
        "Channel closed"
    );
}

/// Log window adjustment sent
pub fn log_window_adjust(local_id: u32, bytes_to_add: u32) {
    debug!(
        local_id = local_id,
        bytes_to_add = bytes_to_add,
        "Window adjust"
    );
}

/// Log channel-level protocol violation
pub fn log_channel_violation(local_id: u32, error: &str) {
    warn!(local_id = local_id, error = error, "Channel protocol violation");
}

/// Log DISCONNECT received from the peer
pub fn log_peer_disconnect(reason: u32, description: &str) {
    warn!(
        reason = reason,
        description = description,
        "Peer disconnected"
    );
}

/// Log fatal session error
pub fn log_fatal(error: &str) {
    error!(error = error, "Session terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions_compile() {
        // These just verify the logging functions compile and don't panic
        log_state_transition("Disconnected", "VersionExchanged");
        log_kex_start("client", false);
        log_kex_complete(&[0xab; 32], "curve25519-sha256", 12);
        log_packet("in", 3, "SSH_MSG_CHANNEL_DATA", 64);
        log_channel_open(0, 7, "session", 2097152);
        log_channel_refused(1, 1, "administratively prohibited");
        log_channel_closed(0, 10, 20);
        log_window_adjust(0, 1024);
        log_channel_violation(0, "window exceeded");
        log_peer_disconnect(11, "bye");
        log_fatal("MAC verification failed");
    }
}
