//! Binary wire formats: varints, coordinates, packets and control messages.

mod error;
mod messages;
mod packet;
mod varint;

pub use error::WireError;
pub use messages::{
    hop_signing_bytes, DhtRequest, DhtResponse, DhtResponseInfo, ProtocolMessage, SessionPing,
    SwitchMsg, SwitchMsgHop, SwitchPort, DEFAULT_SESSION_MTU,
};
pub use packet::{
    packet_coords, peek_type, LinkProtocolPacket, PacketType, ProtocolTrafficPacket,
    TrafficPacket,
};
pub use varint::{
    decode_uint64, encode_coords, encode_uint64, put_coords, put_int64, put_uint64, uint64_len,
    zigzag_decode, zigzag_encode, WireReader, MAX_VARINT_LEN,
};
