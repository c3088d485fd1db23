#![no_main]

use arbor_core::wire::{
    packet_coords, peek_type, LinkProtocolPacket, PacketType, ProtocolMessage,
    ProtocolTrafficPacket, TrafficPacket,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Mirrors what the switch and router do with a frame from a peer
    let Ok(ty) = peek_type(data) else {
        return;
    };
    let _ = packet_coords(data);

    match ty {
        PacketType::Traffic => {
            if let Ok(p) = TrafficPacket::decode(data) {
                assert_eq!(TrafficPacket::decode(&p.encode()).ok(), Some(p));
            }
        }
        PacketType::ProtocolTraffic => {
            if let Ok(p) = ProtocolTrafficPacket::decode(data) {
                assert_eq!(ProtocolTrafficPacket::decode(&p.encode()).ok(), Some(p.clone()));
                // sealed payloads are opaque here; parse them as if already opened
                let _ = ProtocolMessage::decode(&p.payload);
            }
        }
        PacketType::LinkProtocolTraffic => {
            let _ = LinkProtocolPacket::decode(data);
        }
        _ => {
            let _ = ProtocolMessage::decode(data);
        }
    }
});
