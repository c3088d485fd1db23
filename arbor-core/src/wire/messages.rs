//! Control messages carried inside sealed packets.

use super::error::WireError;
use super::packet::PacketType;
use super::varint::{put_coords, put_int64, put_uint64, WireReader};
use crate::crypto::{
    BoxPublicKey, Handle, NodeId, SigPublicKey, Signature, BOX_PUBLIC_KEY_LEN, HANDLE_LEN,
    NODE_ID_LEN, SIGNATURE_LEN, SIG_PUBLIC_KEY_LEN,
};

/// Local switch port number. Port 0 is the node itself.
pub type SwitchPort = u64;

/// Session MTU assumed when a ping does not carry one.
pub const DEFAULT_SESSION_MTU: u16 = 1280;

fn read_type(r: &mut WireReader<'_>) -> Result<PacketType, WireError> {
    PacketType::from_u64(r.uint64()?)
}

/// One signed hop of a switch announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMsgHop {
    /// Port the signer uses for the link this hop went over
    pub port: SwitchPort,
    /// Signing key of the node the announcement is being sent to
    pub next: SigPublicKey,
    pub sig: Signature,
}

/// A spanning-tree announcement: the root, its timestamp and the signed path
/// from the root to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMsg {
    pub root: SigPublicKey,
    pub tstamp: i64,
    pub hops: Vec<SwitchMsgHop>,
}

impl SwitchMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.hops.len() * 100);
        put_uint64(&mut out, PacketType::SwitchMsg.as_u64());
        out.extend_from_slice(self.root.as_bytes());
        put_int64(&mut out, self.tstamp);
        for hop in &self.hops {
            put_uint64(&mut out, hop.port);
            out.extend_from_slice(hop.next.as_bytes());
            out.extend_from_slice(hop.sig.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let ty = read_type(&mut r)?;
        if ty != PacketType::SwitchMsg {
            return Err(WireError::UnexpectedType(ty.as_u64()));
        }
        let root = SigPublicKey::from_bytes(r.array::<SIG_PUBLIC_KEY_LEN>()?);
        let tstamp = r.int64()?;
        let mut hops = Vec::new();
        while !r.is_empty() {
            let port = r.uint64()?;
            let next = SigPublicKey::from_bytes(r.array::<SIG_PUBLIC_KEY_LEN>()?);
            let sig = Signature::from_bytes(r.array::<SIGNATURE_LEN>()?);
            hops.push(SwitchMsgHop { port, next, sig });
        }
        Ok(Self { root, tstamp, hops })
    }

    /// Ports along the announced path.
    pub fn coords(&self) -> Vec<SwitchPort> {
        self.hops.iter().map(|hop| hop.port).collect()
    }

    /// Bytes signed by the sender of hop `idx`.
    pub fn bytes_for_hop(&self, idx: usize) -> Option<Vec<u8>> {
        let hop = self.hops.get(idx)?;
        let previous: Vec<SwitchPort> = self.hops[..idx].iter().map(|h| h.port).collect();
        Some(hop_signing_bytes(&hop.next, &self.root, self.tstamp, &previous))
    }
}

/// `next || root || tstamp || coords-so-far`, the message each hop signs.
pub fn hop_signing_bytes(
    next: &SigPublicKey,
    root: &SigPublicKey,
    tstamp: i64,
    previous_ports: &[SwitchPort],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * SIG_PUBLIC_KEY_LEN + 16 + previous_ports.len() * 2);
    out.extend_from_slice(next.as_bytes());
    out.extend_from_slice(root.as_bytes());
    put_int64(&mut out, tstamp);
    put_coords(&mut out, previous_ports);
    out
}

/// Session handshake message. The same layout serves as ping and pong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPing {
    /// Sender's handle, to be put on traffic sent back to it
    pub handle: Handle,
    /// Sender's ephemeral session key
    pub session_key: BoxPublicKey,
    pub tstamp: i64,
    /// Sender's current coordinates
    pub coords: Vec<SwitchPort>,
    pub is_pong: bool,
    pub mtu: u16,
}

impl SessionPing {
    pub fn encode(&self) -> Vec<u8> {
        let ty = if self.is_pong {
            PacketType::SessionPong
        } else {
            PacketType::SessionPing
        };
        let mut out = Vec::with_capacity(1 + HANDLE_LEN + BOX_PUBLIC_KEY_LEN + 16);
        put_uint64(&mut out, ty.as_u64());
        out.extend_from_slice(self.handle.as_bytes());
        out.extend_from_slice(self.session_key.as_bytes());
        put_int64(&mut out, self.tstamp);
        put_coords(&mut out, &self.coords);
        put_uint64(&mut out, self.mtu as u64);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let is_pong = match read_type(&mut r)? {
            PacketType::SessionPing => false,
            PacketType::SessionPong => true,
            other => return Err(WireError::UnexpectedType(other.as_u64())),
        };
        let handle = Handle::from_bytes(r.array::<HANDLE_LEN>()?);
        let session_key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
        let tstamp = r.int64()?;
        let coords = r.coords()?;
        let mtu = if r.is_empty() {
            DEFAULT_SESSION_MTU
        } else {
            u16::try_from(r.uint64()?).unwrap_or(u16::MAX)
        };
        Ok(Self {
            handle,
            session_key,
            tstamp,
            coords,
            is_pong,
            mtu,
        })
    }
}

/// "Who do you know near `dest`?" The requester's key comes from the
/// enclosing protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtRequest {
    /// Requester's coordinates, so the response can be routed back
    pub coords: Vec<SwitchPort>,
    pub dest: NodeId,
}

impl DhtRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + NODE_ID_LEN);
        put_uint64(&mut out, PacketType::DhtLookupRequest.as_u64());
        put_coords(&mut out, &self.coords);
        out.extend_from_slice(self.dest.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let ty = read_type(&mut r)?;
        if ty != PacketType::DhtLookupRequest {
            return Err(WireError::UnexpectedType(ty.as_u64()));
        }
        let coords = r.coords()?;
        let dest = NodeId::from_bytes(r.array::<NODE_ID_LEN>()?);
        r.finish()?;
        Ok(Self { coords, dest })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtResponseInfo {
    pub key: BoxPublicKey,
    pub coords: Vec<SwitchPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtResponse {
    /// Responder's coordinates
    pub coords: Vec<SwitchPort>,
    pub dest: NodeId,
    pub infos: Vec<DhtResponseInfo>,
}

impl DhtResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + NODE_ID_LEN + self.infos.len() * 40);
        put_uint64(&mut out, PacketType::DhtLookupResponse.as_u64());
        put_coords(&mut out, &self.coords);
        out.extend_from_slice(self.dest.as_bytes());
        for info in &self.infos {
            out.extend_from_slice(info.key.as_bytes());
            put_coords(&mut out, &info.coords);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let ty = read_type(&mut r)?;
        if ty != PacketType::DhtLookupResponse {
            return Err(WireError::UnexpectedType(ty.as_u64()));
        }
        let coords = r.coords()?;
        let dest = NodeId::from_bytes(r.array::<NODE_ID_LEN>()?);
        let mut infos = Vec::new();
        while !r.is_empty() {
            let key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
            let coords = r.coords()?;
            infos.push(DhtResponseInfo { key, coords });
        }
        Ok(Self {
            coords,
            dest,
            infos,
        })
    }
}

/// Decoded payload of a protocol traffic packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Ping(SessionPing),
    DhtRequest(DhtRequest),
    DhtResponse(DhtResponse),
}

impl ProtocolMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match WireReader::new(bytes).uint64().and_then(PacketType::from_u64)? {
            PacketType::SessionPing | PacketType::SessionPong => {
                SessionPing::decode(bytes).map(ProtocolMessage::Ping)
            }
            PacketType::DhtLookupRequest => DhtRequest::decode(bytes).map(ProtocolMessage::DhtRequest),
            PacketType::DhtLookupResponse => {
                DhtResponse::decode(bytes).map(ProtocolMessage::DhtResponse)
            }
            other => Err(WireError::UnexpectedType(other.as_u64())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BoxKeyPair, SigKeyPair};

    fn sample_msg() -> (SwitchMsg, SigKeyPair, SigKeyPair) {
        let root = SigKeyPair::generate();
        let next = SigKeyPair::generate();
        let bytes = hop_signing_bytes(&next.public, &root.public, 1234, &[]);
        let msg = SwitchMsg {
            root: root.public,
            tstamp: 1234,
            hops: vec![SwitchMsgHop {
                port: 3,
                next: next.public,
                sig: root.secret.sign(&bytes),
            }],
        };
        (msg, root, next)
    }

    #[test]
    fn test_switch_msg_decode_and_verify() {
        let (msg, root, _) = sample_msg();
        let decoded = SwitchMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.coords(), vec![3]);

        let signed = decoded.bytes_for_hop(0).unwrap();
        assert!(root.public.verify(&signed, &decoded.hops[0].sig).is_ok());
        assert!(decoded.bytes_for_hop(1).is_none());
    }

    #[test]
    fn test_switch_msg_negative_tstamp() {
        let (mut msg, _, _) = sample_msg();
        msg.tstamp = -5;
        msg.hops.clear();
        assert_eq!(SwitchMsg::decode(&msg.encode()).unwrap().tstamp, -5);
    }

    #[test]
    fn test_session_ping_mtu_defaults() {
        let ping = SessionPing {
            handle: Handle::random(),
            session_key: BoxKeyPair::generate().public,
            tstamp: 99,
            coords: vec![1, 4],
            is_pong: true,
            mtu: 9000,
        };
        let mut bytes = ping.encode();
        assert_eq!(SessionPing::decode(&bytes).unwrap(), ping);

        // strip the two-byte mtu varint
        bytes.truncate(bytes.len() - 2);
        let old = SessionPing::decode(&bytes).unwrap();
        assert_eq!(old.mtu, DEFAULT_SESSION_MTU);
        assert!(old.is_pong);
    }

    #[test]
    fn test_dht_messages() {
        let dest = NodeId::for_key(&BoxKeyPair::generate().public);
        let req = DhtRequest {
            coords: vec![2, 7],
            dest,
        };
        assert_eq!(
            ProtocolMessage::decode(&req.encode()).unwrap(),
            ProtocolMessage::DhtRequest(req.clone())
        );

        let res = DhtResponse {
            coords: vec![1],
            dest,
            infos: vec![
                DhtResponseInfo {
                    key: BoxKeyPair::generate().public,
                    coords: vec![],
                },
                DhtResponseInfo {
                    key: BoxKeyPair::generate().public,
                    coords: vec![5, 6, 300],
                },
            ],
        };
        assert_eq!(DhtResponse::decode(&res.encode()).unwrap(), res);
    }

    #[test]
    fn test_protocol_message_rejects_traffic_types() {
        assert_eq!(
            ProtocolMessage::decode(&[0]),
            Err(WireError::UnexpectedType(0))
        );
        let mut req = DhtRequest {
            coords: vec![],
            dest: NodeId::full_mask(),
        }
        .encode();
        req.push(1);
        assert_eq!(DhtRequest::decode(&req), Err(WireError::TrailingBytes(1)));
    }
}
