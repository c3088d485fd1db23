//! Switch-level packets.
//!
//! Every packet begins with a varint type tag. The two routed kinds
//! (traffic and protocol traffic) carry the destination coordinates right
//! after the tag, so the switch can forward them without decoding further.

use super::error::WireError;
use super::varint::{put_coords, put_uint64, WireReader};
use crate::crypto::{BoxNonce, BoxPublicKey, Handle, BOX_NONCE_LEN, BOX_PUBLIC_KEY_LEN, HANDLE_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Session data, sealed with the session key
    Traffic = 0,
    /// Pings and DHT messages, sealed with the permanent-key shared key
    ProtocolTraffic = 1,
    /// Link-local control (switch announcements), sealed with the link key
    LinkProtocolTraffic = 2,
    SwitchMsg = 3,
    SessionPing = 4,
    SessionPong = 5,
    DhtLookupRequest = 6,
    DhtLookupResponse = 7,
}

impl PacketType {
    pub fn from_u64(v: u64) -> Result<Self, WireError> {
        Ok(match v {
            0 => PacketType::Traffic,
            1 => PacketType::ProtocolTraffic,
            2 => PacketType::LinkProtocolTraffic,
            3 => PacketType::SwitchMsg,
            4 => PacketType::SessionPing,
            5 => PacketType::SessionPong,
            6 => PacketType::DhtLookupRequest,
            7 => PacketType::DhtLookupResponse,
            other => return Err(WireError::UnknownType(other)),
        })
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Read only the type tag.
pub fn peek_type(packet: &[u8]) -> Result<PacketType, WireError> {
    PacketType::from_u64(WireReader::new(packet).uint64()?)
}

/// Read the destination coordinates of a routed packet.
pub fn packet_coords(packet: &[u8]) -> Result<Vec<u64>, WireError> {
    let mut r = WireReader::new(packet);
    match PacketType::from_u64(r.uint64()?)? {
        PacketType::Traffic | PacketType::ProtocolTraffic => r.coords(),
        other => Err(WireError::UnexpectedType(other.as_u64())),
    }
}

fn expect_type(r: &mut WireReader<'_>, want: PacketType) -> Result<(), WireError> {
    let got = r.uint64()?;
    if got == want.as_u64() {
        Ok(())
    } else {
        Err(WireError::UnexpectedType(got))
    }
}

/// Session data: `type || coords || handle || nonce || sealed payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPacket {
    pub coords: Vec<u64>,
    pub handle: Handle,
    pub nonce: BoxNonce,
    pub payload: Vec<u8>,
}

impl TrafficPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + HANDLE_LEN + BOX_NONCE_LEN + self.payload.len());
        put_uint64(&mut out, PacketType::Traffic.as_u64());
        put_coords(&mut out, &self.coords);
        out.extend_from_slice(self.handle.as_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        expect_type(&mut r, PacketType::Traffic)?;
        let coords = r.coords()?;
        let handle = Handle::from_bytes(r.array::<HANDLE_LEN>()?);
        let nonce = BoxNonce::from_bytes(r.array::<BOX_NONCE_LEN>()?);
        let payload = r.rest().to_vec();
        Ok(Self {
            coords,
            handle,
            nonce,
            payload,
        })
    }
}

/// Node-to-node control traffic:
/// `type || coords || to key || from key || nonce || sealed payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTrafficPacket {
    pub coords: Vec<u64>,
    pub to_key: BoxPublicKey,
    pub from_key: BoxPublicKey,
    pub nonce: BoxNonce,
    pub payload: Vec<u8>,
}

impl ProtocolTrafficPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(16 + 2 * BOX_PUBLIC_KEY_LEN + BOX_NONCE_LEN + self.payload.len());
        put_uint64(&mut out, PacketType::ProtocolTraffic.as_u64());
        put_coords(&mut out, &self.coords);
        out.extend_from_slice(self.to_key.as_bytes());
        out.extend_from_slice(self.from_key.as_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        expect_type(&mut r, PacketType::ProtocolTraffic)?;
        let coords = r.coords()?;
        let to_key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
        let from_key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
        let nonce = BoxNonce::from_bytes(r.array::<BOX_NONCE_LEN>()?);
        let payload = r.rest().to_vec();
        Ok(Self {
            coords,
            to_key,
            from_key,
            nonce,
            payload,
        })
    }
}

/// Link-local control traffic: `type || nonce || sealed payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProtocolPacket {
    pub nonce: BoxNonce,
    pub payload: Vec<u8>,
}

impl LinkProtocolPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + BOX_NONCE_LEN + self.payload.len());
        put_uint64(&mut out, PacketType::LinkProtocolTraffic.as_u64());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        expect_type(&mut r, PacketType::LinkProtocolTraffic)?;
        let nonce = BoxNonce::from_bytes(r.array::<BOX_NONCE_LEN>()?);
        let payload = r.rest().to_vec();
        Ok(Self { nonce, payload })
    }
}
