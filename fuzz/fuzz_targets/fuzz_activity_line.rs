//! Fuzz target for the activity feed parser.
//!
//! The feed is long-lived; no line may panic the parser, and whatever parses
//! must serialize.

#![no_main]

use gt_bridge::parse_activity_line;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let Some(event) = parse_activity_line(&line) {
        serde_json::to_string(&event).expect("event serializes");
    }
});
