//! Fuzz target for SSH packet framing.
//!
//! Feeds arbitrary bytes to the cleartext packet reader and to the
//! unframed packet parser, looking for panics or unbounded allocation.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::packet::{Packet, PacketOpener, PacketSealer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Packet::from_bytes(data);

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(_) => return,
    };
    runtime.block_on(async {
        let mut reader = data;
        let mut opener = PacketOpener::default();
        while let Ok(packet) = opener.read_packet(&mut reader).await {
            // Anything accepted must survive a re-seal under the same keys
            let mut sealer = PacketSealer::new();
            let sealed = sealer.seal(&packet.payload).expect("cleartext seal");
            let mut resealed = sealed.as_slice();
            let reopened = PacketOpener::default()
                .read_packet(&mut resealed)
                .await
                .expect("resealed packet must open");
            assert_eq!(reopened.payload, packet.payload);
        }
    });
});
