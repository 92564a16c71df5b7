//! Fuzz target for envelope decoding and tmux session names.
//!
//! Arbitrary frames must decode or fail cleanly, and a decoded message must
//! survive a re-encode.

#![no_main]

use gt_bridge::client::Stores;
use gt_bridge::discovery::parse_session_name;
use gt_bridge::protocol::{Decoded, decode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(Decoded::Known(message)) = decode(text) {
        let _ = decode(&message.encode());
    }

    // Stores must ignore anything they cannot use.
    Stores::new().dispatch_text(text);

    let _ = parse_session_name(text, &["tw", "tw-extra"]);
});
