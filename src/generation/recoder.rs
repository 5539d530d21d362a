use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::block_id::BlockId;
use crate::budget::Budget;
use crate::coding::BlockDecoder;
use crate::config::RlncConfig;
use crate::packet_header::{HeaderSequencer, PacketHeader, PacketKind};
use crate::rank_header::RankFeedback;
use crate::send_pipeline::SendPipeline;

/// Relay between source and destination.
///
/// Ingests coded packets into its own coder and emits fresh combinations of what it
///  holds, without ever decoding to plaintext. Innovative packets earn send credits;
///  a per-block cap keeps a relay from flooding the next hop no matter how much
///  traffic reaches it.
pub struct GenerationRecoder {
    symbols: usize,
    symbol_size: usize,
    coder: BlockDecoder,
    sequencer: HeaderSequencer,
    budget: Budget,
    send: SendPipeline,
    encoder_rank: usize,
    decoder_rank: usize,
    sent_this_block: usize,
    stopped: bool,
}

impl GenerationRecoder {
    pub fn new(config: &RlncConfig, group: u8, send: SendPipeline) -> GenerationRecoder {
        GenerationRecoder {
            symbols: config.symbols,
            symbol_size: config.symbol_size,
            coder: BlockDecoder::new(config.symbols, config.symbol_size),
            sequencer: HeaderSequencer::new(group),
            budget: Budget::relay(config.symbols, &config.errors, config.overshoot),
            send,
            encoder_rank: 0,
            decoder_rank: 0,
            sent_this_block: 0,
            stopped: false,
        }
    }

    pub fn block(&self) -> BlockId {
        self.sequencer.block()
    }

    pub fn rank(&self) -> usize {
        self.coder.rank()
    }

    pub fn sent_this_block(&self) -> usize {
        self.sent_this_block
    }

    pub fn is_complete(&self) -> bool {
        self.coder.is_complete()
    }

    pub async fn on_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> anyhow::Result<()> {
        match header.kind {
            PacketKind::Enc | PacketKind::Rec | PacketKind::Hlp => {}
            other => {
                debug!("packet of kind {:?} is not recodable - dropping", other);
                return Ok(());
            }
        }

        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            debug!("packet for stale block {:?} (local {:?}) - dropping", header.block, self.sequencer.block());
            return Ok(());
        }
        if diff != 0 {
            warn!("packet for block {:?} while relaying {:?} - skipping ahead at rank {}",
                header.block, self.sequencer.block(), self.coder.rank());
            self.reset_to(header.block);
        }

        if self.coder.is_complete() {
            return Ok(());
        }
        if payload.len() < self.coder.payload_len() {
            debug!("undersized coded payload ({} bytes, need {}) - dropping", payload.len(), self.coder.payload_len());
            return Ok(());
        }

        let innovative = self.coder.decode(payload)?;
        self.encoder_rank = self.coder.remote_rank();
        if innovative {
            self.budget.increase();
        }
        trace!("relay rank {} of {} advertised for block {:?}", self.coder.rank(), self.encoder_rank, self.sequencer.block());

        if !self.stopped {
            self.spend_budget().await;
        }
        Ok(())
    }

    async fn spend_budget(&mut self) {
        while self.sent_this_block < self.budget.max_packets() {
            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.coder.payload_len());
            self.sequencer.stamp(PacketKind::Rec, &mut buf);
            self.coder.recode(&mut buf);
            self.send.send_packet(&buf).await;
            self.sent_this_block += 1;

            if !self.budget.decrease() {
                break;
            }
        }
    }

    pub async fn on_ack(&mut self, header: &PacketHeader, body: &mut impl Buf) -> anyhow::Result<()> {
        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            debug!("ack for stale block {:?} (local {:?}) - dropping", header.block, self.sequencer.block());
            return Ok(());
        }
        if diff != 0 {
            warn!("ack for block {:?} while relaying {:?} - skipping ahead", header.block, self.sequencer.block());
            self.reset_to(header.block);
            return Ok(());
        }

        let feedback = RankFeedback::deser(body)?;
        self.decoder_rank = feedback.rank as usize;

        if self.decoder_rank >= self.symbols {
            debug!("block {:?} acked complete - advancing", self.sequencer.block());
            let next = self.sequencer.block().next();
            self.reset_to(next);
        }
        Ok(())
    }

    pub fn on_stop(&mut self) {
        debug!("stop received for block {:?}", self.sequencer.block());
        self.stopped = true;
    }

    /// A STOP packet for the current block, asking the upstream side to pause
    ///  producing. Sent backwards to the packet origin, not on the downstream sink.
    pub fn stop_packet(&mut self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
        self.sequencer.stamp(PacketKind::Stop, &mut buf);
        buf
    }

    /// While the downstream rank lags what the source has advertised, keep feeding
    ///  fresh combinations.
    pub async fn on_timer(&mut self) {
        if self.decoder_rank == self.encoder_rank {
            return;
        }
        if self.stopped {
            return;
        }

        self.budget.increase();
        self.spend_budget().await;
    }

    fn reset_to(&mut self, block: BlockId) {
        self.sequencer.advance_block_to(block);
        self.coder = BlockDecoder::new(self.symbols, self.symbol_size);
        self.budget.reset();
        self.encoder_rank = 0;
        self.decoder_rank = 0;
        self.sent_this_block = 0;
        self.stopped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::budget::LinkErrors;
    use crate::generation::test_util::{coded_payload, lossless_config, CapturingSink};

    /// Lossy last hop, so the relay actually earns budget (a lossless relay has none).
    fn lossy_relay(sink: &Arc<CapturingSink>, symbols: usize, symbol_size: usize) -> GenerationRecoder {
        let mut config = lossless_config(symbols, symbol_size);
        config.errors = LinkErrors { e1: 0.0, e2: 0.0, e3: 0.0, e4: 0.9 };
        GenerationRecoder::new(&config, 0, SendPipeline::new(sink.clone()))
    }

    fn enc_header(block: u8) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Enc,
            group: 0,
            block: BlockId::from_raw(block),
            seq: 0,
        }
    }

    fn ack_body(rank: u16, feedback_len: usize) -> Vec<u8> {
        let mut body = rank.to_be_bytes().to_vec();
        body.extend(std::iter::repeat(0u8).take(feedback_len));
        body
    }

    #[tokio::test]
    async fn test_innovative_packet_triggers_rec_packets() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 4, 16);

        let payload = coded_payload(4, 0, &[7u8; 16], 1);
        recoder.on_packet(&enc_header(0), &payload).await.unwrap();

        assert_eq!(recoder.rank(), 1);
        let packets = sink.take();
        assert!(!packets.is_empty());
        let mut b: &[u8] = &packets[0];
        let header = PacketHeader::deser(&mut b).unwrap();
        assert_eq!(header.kind, PacketKind::Rec);
        assert_eq!(b.len(), 2 + 4 + 16);
    }

    #[tokio::test]
    async fn test_per_block_cap_limits_recoded_packets() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 4, 16);
        let cap = recoder.budget.max_packets();
        assert!(cap > 0);

        for i in 0..4u8 {
            let payload = coded_payload(4, i as usize, &[i; 16], i as u16 + 1);
            recoder.on_packet(&enc_header(0), &payload).await.unwrap();
        }
        // flood with redundant traffic; the cap has to hold
        let dup = coded_payload(4, 0, &[0u8; 16], 4);
        for _ in 0..50 {
            recoder.on_packet(&enc_header(0), &dup).await.unwrap();
            recoder.on_timer().await;
        }

        assert!(sink.take().len() <= cap);
        assert!(recoder.sent_this_block() <= cap);
    }

    #[tokio::test]
    async fn test_complete_ack_resets_the_block() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 2, 16);
        recoder.on_packet(&enc_header(0), &coded_payload(2, 0, &[1u8; 16], 1)).await.unwrap();
        sink.take();

        let mut body: &[u8] = &ack_body(2, 1);
        recoder.on_ack(&enc_header(0), &mut body).await.unwrap();

        assert_eq!(recoder.block(), BlockId::from_raw(1));
        assert_eq!(recoder.rank(), 0);
        assert_eq!(recoder.sent_this_block(), 0);
    }

    #[tokio::test]
    async fn test_stop_suppresses_recoding() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 2, 16);

        recoder.on_stop();
        recoder.on_packet(&enc_header(0), &coded_payload(2, 0, &[1u8; 16], 1)).await.unwrap();
        recoder.on_timer().await;

        assert_eq!(recoder.rank(), 1);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_timer_is_quiet_when_ranks_agree() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 2, 16);

        recoder.on_timer().await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_stop_packet_is_stamped_for_the_current_block() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 2, 16);

        let packet = recoder.stop_packet();

        let mut b: &[u8] = &packet;
        let header = PacketHeader::deser(&mut b).unwrap();
        assert_eq!(header.kind, PacketKind::Stop);
        assert_eq!(header.block, recoder.block());
    }

    #[tokio::test]
    async fn test_packet_ahead_of_window_skips_the_relay_forward() {
        let sink = CapturingSink::new();
        let mut recoder = lossy_relay(&sink, 2, 16);
        recoder.on_packet(&enc_header(0), &coded_payload(2, 0, &[1u8; 16], 1)).await.unwrap();

        recoder.on_packet(&enc_header(3), &coded_payload(2, 0, &[2u8; 16], 1)).await.unwrap();
        assert_eq!(recoder.block(), BlockId::from_raw(3));
        assert_eq!(recoder.rank(), 1);
    }
}
