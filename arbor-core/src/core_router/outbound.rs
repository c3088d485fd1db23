//! Sending protocol traffic
//!
//! Pings and DHT messages travel as protocol traffic: sealed under the
//! shared key of both permanent box keys and routed by the switch towards
//! the recipient's coordinates. `Outbound` is the cloneable sender used by
//! the DHT and by sessions.

use std::sync::Arc;

use super::RouterError;
use crate::core_switch::SwitchHandle;
use crate::crypto::{BoxPublicKey, SharedKeyCache};
use crate::wire::{ProtocolTrafficPacket, SwitchPort};

#[derive(Clone)]
pub struct Outbound {
    our_key: BoxPublicKey,
    shared: Arc<SharedKeyCache>,
    switch: SwitchHandle,
}

impl Outbound {
    pub fn new(our_key: BoxPublicKey, shared: Arc<SharedKeyCache>, switch: SwitchHandle) -> Self {
        Self {
            our_key,
            shared,
            switch,
        }
    }

    pub fn our_key(&self) -> &BoxPublicKey {
        &self.our_key
    }

    /// Our current coordinates.
    pub fn coords(&self) -> Vec<SwitchPort> {
        self.switch.coords()
    }

    pub fn switch(&self) -> &SwitchHandle {
        &self.switch
    }

    /// Seal `payload` for `to` and hand it to the switch for delivery
    /// towards `coords`.
    pub async fn send_protocol(
        &self,
        to: &BoxPublicKey,
        coords: Vec<SwitchPort>,
        payload: &[u8],
    ) -> Result<(), RouterError> {
        let key = self.shared.get(to);
        let (sealed, nonce) = key.seal_fresh(payload)?;
        let packet = ProtocolTrafficPacket {
            coords,
            to_key: *to,
            from_key: self.our_key,
            nonce,
            payload: sealed,
        };
        self.switch.send_packet(0, packet.encode()).await?;
        Ok(())
    }

    /// Route an already encoded packet.
    pub async fn send_packet(&self, packet: Vec<u8>) -> Result<(), RouterError> {
        self.switch.send_packet(0, packet).await?;
        Ok(())
    }
}
