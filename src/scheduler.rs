//! Fair scheduling of coded packets across several overlay peers.
//!
//! A multipath source spreads each block over all peers in proportion to how much of
//!  the previous blocks actually arrived through each of them. The receiver counts
//!  innovative packets per peer and reports the counts back in a [StatusReport]; the
//!  sender turns each peer's share into a per-block packet ratio, clamped between a
//!  low and a high watermark so a momentarily dead path keeps getting probed and a
//!  perfect path cannot monopolize the block.

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::block_id::BlockId;
use crate::send_pipeline::PacketSink;

/// Per-peer send/receive bookkeeping.
pub struct PeerCounters {
    symbols: usize,
    redundant: usize,
    wm_low: usize,
    wm_high: usize,

    pub sent_packets: usize,
    pub received_packets: u16,
    pub ratio_packets: usize,
}

impl PeerCounters {
    pub fn new(symbols: usize, redundancy: f64) -> PeerCounters {
        let redundant = (symbols as f64 * (redundancy / 2.0)) as usize;
        PeerCounters {
            symbols,
            redundant,
            wm_low: 2,
            wm_high: symbols + (symbols as f64 * 0.05) as usize,
            sent_packets: 0,
            received_packets: 0,
            // optimistic starting share until the first report arrives
            ratio_packets: (symbols as f64 * 0.8) as usize + redundant,
        }
    }

    /// Recomputes this peer's share of the next block from a reported receive count.
    ///  A zero interval counts as an empty report.
    pub fn set_ratio(&mut self, packets: u16, interval: u16) -> usize {
        let ratio = if interval == 0 { 0.0 } else { packets as f64 / interval as f64 };
        let unclamped = (ratio * self.symbols as f64) as usize + self.redundant;
        self.ratio_packets = unclamped.clamp(self.wm_low, self.wm_high);
        self.ratio_packets
    }

    pub fn set_max_ratio(&mut self) {
        self.ratio_packets = self.wm_high;
    }

    pub fn ratio_spent(&self) -> bool {
        self.sent_packets > self.ratio_packets
    }

    /// True once this peer alone has carried a whole block's worth of packets.
    pub fn is_alone(&self) -> bool {
        self.sent_packets >= self.wm_high
    }
}

/// Receive counts for one reporting interval, sent from decoder to encoder. Counts
///  are ordered by peer address, ascending, on both sides.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatusReport {
    pub block: BlockId,
    pub interval: u16,
    pub counts: Vec<u16>,
}

impl StatusReport {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.block.to_raw());
        buf.put_u16(self.interval);
        for count in &self.counts {
            buf.put_u16(*count);
        }
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<StatusReport> {
        let block = BlockId::from_raw(buf.try_get_u8()?);
        let interval = buf.try_get_u16()?;
        if interval == 0 {
            bail!("status report with a zero interval");
        }

        if buf.remaining() % 2 != 0 {
            bail!("status report counts are truncated");
        }
        let mut counts = Vec::with_capacity(buf.remaining() / 2);
        while buf.remaining() > 0 {
            counts.push(buf.try_get_u16()?);
        }

        Ok(StatusReport { block, interval, counts })
    }
}

pub struct FairScheduler {
    peers: FxHashMap<SocketAddr, PeerCounters>,
    symbols: usize,
    redundancy: f64,
    status_interval: u16,
    received_since_report: u16,
    max_packets: usize,
}

impl FairScheduler {
    pub fn new(symbols: usize, redundancy: f64, status_interval: u16, max_packets: usize) -> FairScheduler {
        FairScheduler {
            peers: FxHashMap::default(),
            symbols,
            redundancy,
            status_interval,
            received_since_report: 0,
            max_packets,
        }
    }

    pub fn add_peer(&mut self, addr: SocketAddr) {
        self.peers.insert(addr, PeerCounters::new(self.symbols, self.redundancy));
    }

    pub fn counters(&self, addr: &SocketAddr) -> Option<&PeerCounters> {
        self.peers.get(addr)
    }

    pub fn record_sent(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.sent_packets += 1;
        }
    }

    pub fn record_received(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.received_packets = peer.received_packets.saturating_add(1);
            self.received_since_report += 1;
        }
    }

    /// Peer with the smallest unspent share, i.e. the one furthest behind its quota.
    pub fn pick(&self) -> Option<SocketAddr> {
        self.peers.iter()
            .filter(|(_, p)| !p.ratio_spent())
            .min_by_key(|(addr, p)| (p.ratio_packets, **addr))
            .map(|(addr, _)| *addr)
    }

    /// Alternative to `current`, e.g. because its link blocked mid-block. Without
    ///  `consider_ratio` the chosen peer's quota is lifted to the high watermark so
    ///  it can absorb the rest of the block.
    pub fn pick_next(&mut self, current: &SocketAddr, consider_ratio: bool) -> Option<SocketAddr> {
        let next = self.peers.iter()
            .filter(|(addr, _)| *addr != current)
            .filter(|(_, p)| !consider_ratio || !p.ratio_spent())
            .min_by_key(|(addr, p)| (p.ratio_packets, **addr))
            .map(|(addr, _)| *addr)?;

        if !consider_ratio {
            if let Some(peer) = self.peers.get_mut(&next) {
                peer.set_max_ratio();
            }
        }
        Some(next)
    }

    /// Resets per-block send counts when a block advances.
    pub fn start_round(&mut self) {
        for peer in self.peers.values_mut() {
            peer.sent_packets = 0;
        }
    }

    /// Total number of coded packets the current block may spend across all peers.
    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    fn sorted_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Once enough innovative packets arrived, drains the per-peer receive counts
    ///  into a report together with the best-receiving peer to carry it.
    pub fn status_report(&mut self, block: BlockId) -> Option<(SocketAddr, StatusReport)> {
        if self.received_since_report < self.status_interval {
            return None;
        }

        let addrs = self.sorted_addrs();
        let best = *addrs.iter()
            .max_by_key(|addr| self.peers[addr].received_packets)?;

        let mut counts = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let peer = self.peers.get_mut(addr).expect("addresses come from the peer map itself");
            counts.push(peer.received_packets);
            peer.received_packets = 0;
        }
        self.received_since_report = 0;

        Some((best, StatusReport {
            block,
            interval: self.status_interval,
            counts,
        }))
    }

    /// Feeds a received report into the per-peer ratios. Returns the new total
    ///  packet quota for the next block.
    pub fn apply_status_report(&mut self, report: &StatusReport) -> usize {
        let addrs = self.sorted_addrs();
        if report.counts.len() != addrs.len() {
            debug!("status report for {} peers, have {} locally - ignoring", report.counts.len(), addrs.len());
            return self.max_packets;
        }

        let mut max = 0;
        for (addr, count) in addrs.iter().zip(&report.counts) {
            let peer = self.peers.get_mut(addr).expect("addresses come from the peer map itself");
            max += peer.set_ratio(*count, report.interval);
        }
        self.max_packets = max;
        max
    }
}

/// A [PacketSink] spreading outgoing packets over several peers according to the
///  fair-share ratios. When every peer has spent its quota a fresh round starts, so
///  send bursts never stall; the total per-block volume is capped by the sender's
///  budget, not here.
pub struct MultipathSink {
    sinks: Vec<(SocketAddr, Arc<dyn PacketSink>)>,
    scheduler: Mutex<FairScheduler>,
}

impl MultipathSink {
    pub fn new(sinks: Vec<Arc<dyn PacketSink>>, symbols: usize, redundancy: f64, status_interval: u16, max_packets: usize) -> MultipathSink {
        let mut scheduler = FairScheduler::new(symbols, redundancy, status_interval, max_packets);
        let sinks: Vec<(SocketAddr, Arc<dyn PacketSink>)> = sinks.into_iter()
            .map(|sink| (sink.peer_addr(), sink))
            .collect();
        for (addr, _) in &sinks {
            scheduler.add_peer(*addr);
        }
        MultipathSink {
            sinks,
            scheduler: Mutex::new(scheduler),
        }
    }

    pub async fn apply_status_report(&self, report: &StatusReport) -> usize {
        self.scheduler.lock().await
            .apply_status_report(report)
    }

    pub async fn start_round(&self) {
        self.scheduler.lock().await
            .start_round();
    }
}

#[async_trait]
impl PacketSink for MultipathSink {
    async fn send_packet(&self, packet_buf: &[u8]) {
        let addr = {
            let mut scheduler = self.scheduler.lock().await;
            let addr = match scheduler.pick() {
                Some(addr) => addr,
                None => {
                    scheduler.start_round();
                    match scheduler.pick() {
                        Some(addr) => addr,
                        None => return,
                    }
                }
            };
            scheduler.record_sent(&addr);
            addr
        };

        if let Some((_, sink)) = self.sinks.iter().find(|(a, _)| *a == addr) {
            sink.send_packet(packet_buf).await;
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.sinks[0].0
    }
}
