//! Fuzz target for SSH message decoding.
//!
//! Every payload that decodes must encode back to something that decodes
//! to the same message.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_message -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::message::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = Message::decode(data) {
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(decoded, msg);
    }
});
