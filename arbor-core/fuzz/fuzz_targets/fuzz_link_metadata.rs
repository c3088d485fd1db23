#![no_main]

use arbor_core::core_link::LinkMetadata;
use arbor_core::wire::{decode_uint64, encode_uint64};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First bytes a remote sends on a fresh connection
    if let Ok(meta) = LinkMetadata::decode(data) {
        assert_eq!(LinkMetadata::decode(&meta.encode()).ok(), Some(meta));
    }

    if let Ok((v, used)) = decode_uint64(data) {
        assert!(used <= data.len());
        assert_eq!(decode_uint64(&encode_uint64(v)).ok().map(|(x, _)| x), Some(v));
    }
});
