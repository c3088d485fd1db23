#![no_main]

use arbor_core::wire::SwitchMsg;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Peers send these unauthenticated; decoding must never panic
    let Ok(msg) = SwitchMsg::decode(data) else {
        return;
    };

    // Whatever decodes must survive a trip through the canonical encoding
    let reencoded = msg.encode();
    match SwitchMsg::decode(&reencoded) {
        Ok(again) => assert_eq!(msg, again),
        Err(e) => panic!("re-encoded switch message failed to decode: {}", e),
    }
});
