//! Fuzz target for the parsers that see untrusted downstream bytes.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use piper_proto::ssh::piper::{HookChain, DropHostkeysMessage, ReplyPing};
use piper_proto::ssh::{AuthRequest, Packet};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let reparsed = Packet::from_bytes(&packet.to_bytes())
            .expect("round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    if let Ok(request) = AuthRequest::from_bytes(data) {
        let reparsed = AuthRequest::from_bytes(&request.to_bytes())
            .expect("re-encoded request should parse");
        assert_eq!(request, reparsed);
    }

    if !data.is_empty() {
        let chain = HookChain::new()
            .with(Arc::new(DropHostkeysMessage))
            .with(Arc::new(ReplyPing));
        let _ = chain.run(data.to_vec());
    }
});
