/*
    Link - one peer connection

    Workflow:
      1. `establish`: exchange metadata, check version / self-link / allow
         list, derive the link key from both ephemeral keys, register with
         the switch (duplicate peers are refused there)
      2. `EstablishedLink::run`: split the stream into
           - a writer task: control commands first (biased), then queued
             packets, then a keep-alive frame after write silence
           - the reader loop: frames -> switch (routed packets) or
             verification -> switch + DHT (announcements)
      3. Any read error, bad announcement, idle timeout, `Close` or node
         shutdown ends the link and unregisters the port

    Announcements are the only link-protocol payload. Each hop is signed by
    the node that sent it over `(next key, root, tstamp, ports so far)`; the
    final hop must be addressed to us and signed by this peer.
*/

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::metadata::{exchange, LinkMetadata};
use super::manager::AllowedKeys;
use super::stream::{write_frame, FrameReader};
use super::{LinkCommand, LinkError, LinkSender};
use crate::config::LinkConfig;
use crate::core_dht::DhtHandle;
use crate::core_switch::SwitchHandle;
use crate::crypto::{BoxKeyPair, NodeId, NodeKeys, SharedKey, SigCache, SigPublicKey, SigSecretKey};
use crate::metrics;
use crate::shutdown::CancelToken;
use crate::wire::{
    hop_signing_bytes, peek_type, LinkProtocolPacket, PacketType, SwitchMsg, SwitchMsgHop,
    SwitchPort,
};

/// Everything a link needs from the node.
#[derive(Clone)]
pub struct LinkContext {
    pub keys: Arc<NodeKeys>,
    pub switch: SwitchHandle,
    pub dht: DhtHandle,
    pub sig_cache: Arc<SigCache>,
    pub allowed: AllowedKeys,
    pub config: LinkConfig,
    /// Fires at node shutdown
    pub token: CancelToken,
}

/// A link whose handshake succeeded and which holds a switch port.
pub struct EstablishedLink<S> {
    stream: S,
    ctx: LinkContext,
    remote: String,
    port: SwitchPort,
    peer: LinkMetadata,
    shared: Arc<SharedKey>,
    control_rx: mpsc::Receiver<LinkCommand>,
    packets_rx: mpsc::Receiver<Vec<u8>>,
}

/// Run the handshake on `stream` and register the peer with the switch.
pub async fn establish<S>(
    mut stream: S,
    ctx: LinkContext,
    remote: String,
    inbound: bool,
) -> Result<EstablishedLink<S>, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link_keys = BoxKeyPair::generate();
    let ours = LinkMetadata::new(
        ctx.keys.box_keys.public,
        ctx.keys.sig_keys.public,
        link_keys.public,
    );

    let checked = async {
        let theirs = exchange(&mut stream, &ours, ctx.config.handshake_timeout).await?;
        theirs.check_version()?;
        if theirs.sig_key == ours.sig_key || theirs.box_key == ours.box_key {
            return Err(LinkError::SelfLink);
        }
        if inbound && !ctx.allowed.is_allowed(&theirs.box_key) {
            return Err(LinkError::NotAllowed(theirs.box_key));
        }
        Ok(theirs)
    }
    .await;
    let peer = match checked {
        Ok(peer) => peer,
        Err(e) => {
            metrics::link_handshake(e.kind());
            debug!(remote = %remote, error = %e, "Link handshake failed");
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let shared = Arc::new(SharedKey::derive(&link_keys.secret, &peer.link_key));
    let (control_tx, control_rx) = mpsc::channel(32);
    let (packets_tx, packets_rx) = mpsc::channel(ctx.config.send_queue.max(1));
    let sender = LinkSender {
        remote: remote.clone(),
        control: control_tx,
        packets: packets_tx,
    };

    let port = match ctx.switch.add_peer(peer.sig_key, peer.box_key, sender).await {
        Ok(port) => port,
        Err(e) => {
            let e = LinkError::from(e);
            metrics::link_handshake(e.kind());
            debug!(remote = %remote, error = %e, "Link refused by switch");
            return Err(e);
        }
    };

    metrics::link_handshake("ok");
    info!(
        port,
        remote = %remote,
        inbound,
        node_id = ?NodeId::for_key(&peer.box_key),
        "Link up"
    );

    Ok(EstablishedLink {
        stream,
        ctx,
        remote,
        port,
        peer,
        shared,
        control_rx,
        packets_rx,
    })
}

impl<S> EstablishedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn port(&self) -> SwitchPort {
        self.port
    }

    pub fn peer(&self) -> &LinkMetadata {
        &self.peer
    }

    /// Relay traffic until the link ends. The port is released on return.
    pub async fn run(self) -> Result<(), LinkError> {
        let EstablishedLink {
            stream,
            ctx,
            remote,
            port,
            peer,
            shared,
            control_rx,
            packets_rx,
        } = self;

        let (rd, wr) = tokio::io::split(stream);
        let writer = LinkWriter {
            writer: wr,
            shared: shared.clone(),
            sig_secret: ctx.keys.sig_keys.secret.clone(),
            peer_sig: peer.sig_key,
            port,
            keepalive: ctx.config.keepalive_interval,
        };
        let mut write_task = tokio::spawn(writer.run(control_rx, packets_rx));

        let mut reader = LinkReader {
            frames: FrameReader::new(rd),
            ctx: ctx.clone(),
            port,
            peer,
            shared,
            meter: BandwidthMeter::new(),
        };

        let result = tokio::select! {
            r = reader.run() => r,
            w = &mut write_task => match w {
                Ok(r) => r,
                Err(_) => Err(LinkError::Closed),
            },
            _ = ctx.token.cancelled() => Ok(()),
        };
        write_task.abort();

        let _ = ctx.switch.remove_peer(port).await;
        match &result {
            Ok(()) => info!(port, remote = %remote, "Link down"),
            Err(e) => info!(port, remote = %remote, error = %e, "Link down"),
        }
        result
    }
}

struct LinkReader<R> {
    frames: FrameReader<R>,
    ctx: LinkContext,
    port: SwitchPort,
    peer: LinkMetadata,
    shared: Arc<SharedKey>,
    meter: BandwidthMeter,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    async fn run(&mut self) -> Result<(), LinkError> {
        let idle = self.ctx.config.idle_timeout;
        loop {
            let frame = tokio::time::timeout(idle, self.frames.read_frame())
                .await
                .map_err(|_| LinkError::IdleTimeout(idle))?
                .inspect_err(|e| {
                    if matches!(e, LinkError::BadMagic | LinkError::FrameTooLarge { .. }) {
                        metrics::link_frame_rejected();
                    }
                })?;

            metrics::link_bytes("in", frame.len());
            if let Some(rate) = self.meter.record(frame.len(), Instant::now()) {
                self.ctx.switch.report_bandwidth(self.port, rate);
            }
            if frame.is_empty() {
                trace!(port = self.port, "Keep-alive");
                continue;
            }
            self.handle_frame(frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        match peek_type(&frame) {
            Ok(PacketType::LinkProtocolTraffic) => {
                let packet = LinkProtocolPacket::decode(&frame)?;
                let plain = self.shared.open(&packet.payload, &packet.nonce)?;
                let msg = SwitchMsg::decode(&plain)?;
                self.verify(&msg)?;

                let mut peer_coords = msg.coords();
                peer_coords.pop();
                let same_root = self.ctx.switch.handle_msg(self.port, msg).await?;
                if same_root {
                    self.ctx.dht.insert_peer(self.peer.box_key, peer_coords);
                }
                Ok(())
            }
            Ok(PacketType::Traffic | PacketType::ProtocolTraffic) => {
                self.ctx.switch.send_packet(self.port, frame).await?;
                Ok(())
            }
            Ok(other) => {
                debug!(port = self.port, kind = ?other, "Unexpected packet type on link");
                metrics::link_frame_rejected();
                Ok(())
            }
            Err(e) => {
                debug!(port = self.port, error = %e, "Undecodable frame");
                metrics::link_frame_rejected();
                Ok(())
            }
        }
    }

    fn verify(&self, msg: &SwitchMsg) -> Result<(), LinkError> {
        verify_announcement(
            msg,
            &self.ctx.keys.sig_keys.public,
            &self.peer.sig_key,
            &self.ctx.sig_cache,
        )
    }
}

/// Check the hop signature chain of an announcement received from `sender`.
pub fn verify_announcement(
    msg: &SwitchMsg,
    ours: &SigPublicKey,
    sender: &SigPublicKey,
    cache: &SigCache,
) -> Result<(), LinkError> {
    let last = msg
        .hops
        .last()
        .ok_or(LinkError::BadAnnouncement("no hops"))?;
    if last.next != *ours {
        return Err(LinkError::BadAnnouncement("not addressed to us"));
    }

    let mut signer = msg.root;
    for (idx, hop) in msg.hops.iter().enumerate() {
        let bytes = msg
            .bytes_for_hop(idx)
            .ok_or(LinkError::BadAnnouncement("hop out of range"))?;
        if !cache.check(&signer, &hop.sig, &bytes) {
            return Err(LinkError::BadAnnouncement("bad hop signature"));
        }
        if idx + 1 < msg.hops.len() {
            signer = hop.next;
        }
    }
    if signer != *sender {
        return Err(LinkError::BadAnnouncement("last hop not signed by peer"));
    }
    Ok(())
}

struct LinkWriter<W> {
    writer: W,
    shared: Arc<SharedKey>,
    sig_secret: SigSecretKey,
    peer_sig: SigPublicKey,
    port: SwitchPort,
    keepalive: Duration,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<LinkCommand>,
        mut packets: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), LinkError> {
        let mut last_write = tokio::time::Instant::now();
        loop {
            let frame = tokio::select! {
                biased;
                cmd = control.recv() => match cmd {
                    Some(LinkCommand::SendSwitchMsg(msg)) => self.seal_announcement(msg)?,
                    Some(LinkCommand::Close) | None => {
                        let _ = self.writer.shutdown().await;
                        return Ok(());
                    }
                },
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(last_write + self.keepalive) => Vec::new(),
            };
            write_frame(&mut self.writer, &frame).await?;
            metrics::link_bytes("out", frame.len());
            last_write = tokio::time::Instant::now();
        }
    }

    /// Append our signed hop and seal under the link key.
    fn seal_announcement(&self, mut msg: SwitchMsg) -> Result<Vec<u8>, LinkError> {
        let bytes = hop_signing_bytes(&self.peer_sig, &msg.root, msg.tstamp, &msg.coords());
        msg.hops.push(SwitchMsgHop {
            port: self.port,
            next: self.peer_sig,
            sig: self.sig_secret.sign(&bytes),
        });
        let (payload, nonce) = self.shared.seal_fresh(&msg.encode())?;
        Ok(LinkProtocolPacket { nonce, payload }.encode())
    }
}

/// Exponentially weighted receive rate, sampled about once a second.
struct BandwidthMeter {
    window_start: Instant,
    bytes: usize,
    rate: f64,
}

impl BandwidthMeter {
    const WINDOW: Duration = Duration::from_secs(1);
    const WEIGHT: f64 = 0.2;

    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes: 0,
            rate: 0.0,
        }
    }

    fn record(&mut self, bytes: usize, now: Instant) -> Option<f64> {
        self.bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }
        let sample = self.bytes as f64 / elapsed.as_secs_f64();
        self.rate = if self.rate == 0.0 {
            sample
        } else {
            (1.0 - Self::WEIGHT) * self.rate + Self::WEIGHT * sample
        };
        self.bytes = 0;
        self.window_start = now;
        Some(self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigKeyPair;

    fn signed_msg(root: &SigKeyPair, path: &[(&SigKeyPair, u64)], dest: &SigPublicKey) -> SwitchMsg {
        // path[i] is the signer of hop i; the next key is the following signer, or dest
        let mut msg = SwitchMsg {
            root: root.public,
            tstamp: 42,
            hops: Vec::new(),
        };
        for (idx, (signer, port)) in path.iter().enumerate() {
            let next = path.get(idx + 1).map(|(k, _)| k.public).unwrap_or(*dest);
            let bytes = hop_signing_bytes(&next, &msg.root, msg.tstamp, &msg.coords());
            msg.hops.push(SwitchMsgHop {
                port: *port,
                next,
                sig: signer.secret.sign(&bytes),
            });
        }
        msg
    }

    #[test]
    fn test_verify_chain() {
        let cache = SigCache::default();
        let root = SigKeyPair::generate();
        let mid = SigKeyPair::generate();
        let me = SigKeyPair::generate();

        let msg = signed_msg(&root, &[(&root, 1), (&mid, 3)], &me.public);
        assert!(verify_announcement(&msg, &me.public, &mid.public, &cache).is_ok());

        // right chain, wrong sender
        assert!(verify_announcement(&msg, &me.public, &root.public, &cache).is_err());
        // not for us
        let other = SigKeyPair::generate().public;
        assert!(verify_announcement(&msg, &other, &mid.public, &cache).is_err());
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let cache = SigCache::default();
        let root = SigKeyPair::generate();
        let me = SigKeyPair::generate();

        let mut msg = signed_msg(&root, &[(&root, 1)], &me.public);
        msg.hops[0].port = 2;
        assert!(matches!(
            verify_announcement(&msg, &me.public, &root.public, &cache),
            Err(LinkError::BadAnnouncement(_))
        ));

        let mut msg = signed_msg(&root, &[(&root, 1)], &me.public);
        msg.tstamp += 1;
        assert!(verify_announcement(&msg, &me.public, &root.public, &cache).is_err());

        let empty = SwitchMsg {
            root: root.public,
            tstamp: 1,
            hops: Vec::new(),
        };
        assert!(verify_announcement(&empty, &me.public, &root.public, &cache).is_err());
    }

    #[test]
    fn test_bandwidth_meter() {
        let start = Instant::now();
        let mut meter = BandwidthMeter {
            window_start: start,
            bytes: 0,
            rate: 0.0,
        };
        assert_eq!(meter.record(500, start + Duration::from_millis(500)), None);
        let first = meter.record(500, start + Duration::from_secs(1)).unwrap();
        assert!((first - 1000.0).abs() < 1e-6);

        let second = meter
            .record(2000, start + Duration::from_secs(2))
            .unwrap();
        assert!(second > first && second < 2000.0);
    }
}
