//! Local delivery
//!
//! The switch hands every packet addressed to us (port 0) to the router.
//! Session traffic goes to the session manager by handle; protocol traffic
//! is opened with the permanent-key shared secret and split between the
//! session manager (pings) and the DHT (lookups).

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core_dht::DhtHandle;
use crate::core_session::SessionManager;
use crate::crypto::{BoxPublicKey, SharedKeyCache};
use crate::shutdown::ShutdownSignal;
use crate::wire::{
    peek_type, PacketType, ProtocolMessage, ProtocolTrafficPacket, TrafficPacket,
};

use super::RouterError;

pub struct Router {
    our_key: BoxPublicKey,
    shared: Arc<SharedKeyCache>,
    dht: DhtHandle,
    sessions: SessionManager,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Router {
    pub fn new(
        our_key: BoxPublicKey,
        shared: Arc<SharedKeyCache>,
        dht: DhtHandle,
        sessions: SessionManager,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            our_key,
            shared,
            dht,
            sessions,
            rx,
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        loop {
            tokio::select! {
                packet = self.rx.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = self.handle_packet(packet).await {
                            debug!(error = %e, "Dropping local packet");
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("Router stopped");
    }

    async fn handle_packet(&mut self, packet: Vec<u8>) -> Result<(), RouterError> {
        match peek_type(&packet)? {
            PacketType::Traffic => {
                let traffic = TrafficPacket::decode(&packet)?;
                self.sessions.handle_traffic(traffic).await;
            }
            PacketType::ProtocolTraffic => {
                let proto = ProtocolTrafficPacket::decode(&packet)?;
                self.handle_protocol(proto).await?;
            }
            other => {
                trace!(kind = ?other, "Unexpected packet type for local delivery");
            }
        }
        Ok(())
    }

    async fn handle_protocol(&mut self, packet: ProtocolTrafficPacket) -> Result<(), RouterError> {
        if packet.to_key != self.our_key {
            trace!(to = ?packet.to_key, "Protocol packet for another node");
            return Ok(());
        }
        let from = packet.from_key;
        let key = self.shared.get(&from);
        let payload = key.open(&packet.payload, &packet.nonce)?;

        match ProtocolMessage::decode(&payload)? {
            ProtocolMessage::Ping(ping) => self.sessions.handle_ping(from, ping).await,
            ProtocolMessage::DhtRequest(req) => {
                if self.dht.handle_request(from, req).await.is_err() {
                    return Err(RouterError::Stopped);
                }
            }
            ProtocolMessage::DhtResponse(res) => {
                if self.dht.handle_response(from, res).await.is_err() {
                    return Err(RouterError::Stopped);
                }
            }
        }
        Ok(())
    }
}
