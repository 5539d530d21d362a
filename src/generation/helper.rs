use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::block_id::BlockId;
use crate::budget::Budget;
use crate::coding::BlockDecoder;
use crate::config::RlncConfig;
use crate::packet_header::{HeaderSequencer, PacketHeader, PacketKind};
use crate::rank_header::RankFeedback;
use crate::send_pipeline::SendPipeline;

/// Overhearing helper node.
///
/// Like the relay it recombines received packets, but it stays quiet until its rank
///  passes the configured threshold, so it only speaks up once it can contribute
///  combinations the destination is unlikely to have. Unmixed passthrough of freshly
///  heard ENC packets is allowed for the very first block only; after that every
///  emitted packet is a recombination.
pub struct GenerationHelper {
    symbols: usize,
    symbol_size: usize,
    coder: BlockDecoder,
    sequencer: HeaderSequencer,
    budget: Budget,
    send: SendPipeline,
    decoder_rank: usize,
    passthrough: bool,
}

impl GenerationHelper {
    pub fn new(config: &RlncConfig, group: u8, send: SendPipeline) -> GenerationHelper {
        GenerationHelper {
            symbols: config.symbols,
            symbol_size: config.symbol_size,
            coder: BlockDecoder::new(config.symbols, config.symbol_size),
            sequencer: HeaderSequencer::new(group),
            budget: Budget::helper(config.symbols, &config.errors, config.overshoot),
            send,
            decoder_rank: 0,
            passthrough: true,
        }
    }

    pub fn block(&self) -> BlockId {
        self.sequencer.block()
    }

    pub fn rank(&self) -> usize {
        self.coder.rank()
    }

    pub async fn on_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> anyhow::Result<()> {
        match header.kind {
            PacketKind::Enc | PacketKind::Rec => {}
            other => {
                debug!("packet of kind {:?} is not helpable - dropping", other);
                return Ok(());
            }
        }

        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            debug!("packet for stale block {:?} (local {:?}) - dropping", header.block, self.sequencer.block());
            return Ok(());
        }
        if diff != 0 {
            warn!("packet for block {:?} while helping {:?} - skipping ahead", header.block, self.sequencer.block());
            self.reset_to(header.block);
            return Ok(());
        }

        if payload.len() < self.coder.payload_len() {
            debug!("undersized coded payload ({} bytes, need {}) - dropping", payload.len(), self.coder.payload_len());
            return Ok(());
        }

        let innovative = self.coder.decode(payload)?;
        if innovative {
            self.budget.increase();
        }
        trace!("helper rank {} for block {:?}", self.coder.rank(), self.sequencer.block());

        if (self.coder.rank() as f64) < self.budget.threshold() {
            return Ok(());
        }

        // the first heard copy of a fresh symbol may go out unmixed while
        //  passthrough is still allowed
        let mut forward = if self.passthrough && innovative && header.kind == PacketKind::Enc {
            Some(payload.to_vec())
        } else {
            None
        };

        loop {
            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.coder.payload_len());
            self.sequencer.stamp(PacketKind::Hlp, &mut buf);
            match forward.take() {
                Some(payload) => buf.put_slice(&payload),
                None => self.coder.recode(&mut buf),
            }
            self.send.send_packet(&buf).await;

            if !self.budget.decrease() {
                break;
            }
        }
        Ok(())
    }

    pub async fn on_ack(&mut self, header: &PacketHeader, body: &mut impl Buf) -> anyhow::Result<()> {
        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            debug!("ack for stale block {:?} (local {:?}) - dropping", header.block, self.sequencer.block());
            return Ok(());
        }
        if diff != 0 {
            warn!("ack for block {:?} while helping {:?} - skipping ahead", header.block, self.sequencer.block());
            self.reset_to(header.block);
            return Ok(());
        }

        let feedback = RankFeedback::deser(body)?;
        self.decoder_rank = feedback.rank as usize;

        if self.decoder_rank >= self.symbols {
            debug!("block {:?} acked complete - advancing", self.sequencer.block());
            self.passthrough = false;
            let next = self.sequencer.block().next();
            self.reset_to(next);
        }
        Ok(())
    }

    fn reset_to(&mut self, block: BlockId) {
        self.sequencer.advance_block_to(block);
        self.coder = BlockDecoder::new(self.symbols, self.symbol_size);
        self.budget.reset();
        self.decoder_rank = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::budget::LinkErrors;
    use crate::generation::test_util::{coded_payload, lossless_config, CapturingSink};

    /// e1 = 0.5 halves the threshold: with 4 symbols the helper starts contributing
    ///  at rank 2, earning two credits per innovative packet.
    fn helper(sink: &Arc<CapturingSink>) -> GenerationHelper {
        let mut config = lossless_config(4, 16);
        config.errors = LinkErrors { e1: 0.5, e2: 0.0, e3: 0.0, e4: 0.0 };
        GenerationHelper::new(&config, 0, SendPipeline::new(sink.clone()))
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
    async fn test_quiet_below_threshold_then_bursts() {
        let sink = CapturingSink::new();
        let mut helper = helper(&sink);

        helper.on_packet(&enc_header(0), &coded_payload(4, 0, &[1u8; 16], 1)).await.unwrap();
        assert_eq!(helper.rank(), 1);
        assert!(sink.take().is_empty());

        helper.on_packet(&enc_header(0), &coded_payload(4, 1, &[2u8; 16], 2)).await.unwrap();
        assert_eq!(helper.rank(), 2);
        let packets = sink.take();
        assert!(!packets.is_empty());
        let mut b: &[u8] = &packets[0];
        assert_eq!(PacketHeader::deser(&mut b).unwrap().kind, PacketKind::Hlp);
    }

    #[tokio::test]
    async fn test_first_block_forwards_fresh_enc_payloads_unmixed() {
        let sink = CapturingSink::new();
        let mut helper = helper(&sink);

        helper.on_packet(&enc_header(0), &coded_payload(4, 0, &[1u8; 16], 1)).await.unwrap();
        let payload = coded_payload(4, 1, &[2u8; 16], 2);
        helper.on_packet(&enc_header(0), &payload).await.unwrap();

        let packets = sink.take();
        assert_eq!(&packets[0][PacketHeader::SERIALIZED_LEN..], &payload[..]);
    }

    #[tokio::test]
    async fn test_passthrough_is_disabled_after_the_first_completed_block() {
        let sink = CapturingSink::new();
        let mut helper = helper(&sink);

        let mut body: &[u8] = &ack_body(4, 1);
        helper.on_ack(&enc_header(0), &mut body).await.unwrap();
        assert_eq!(helper.block(), BlockId::from_raw(1));
        assert!(!helper.passthrough);

        helper.on_packet(&enc_header(1), &coded_payload(4, 0, &[1u8; 16], 1)).await.unwrap();
        let payload = coded_payload(4, 1, &[2u8; 16], 2);
        helper.on_packet(&enc_header(1), &payload).await.unwrap();

        // every emitted payload is a recombination now
        for packet in sink.take() {
            assert_ne!(&packet[PacketHeader::SERIALIZED_LEN..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_nearby_block_mismatch_skips_ahead_and_drops_the_packet() {
        let sink = CapturingSink::new();
        let mut helper = helper(&sink);

        helper.on_packet(&enc_header(2), &coded_payload(4, 0, &[1u8; 16], 1)).await.unwrap();
        assert_eq!(helper.block(), BlockId::from_raw(2));
        assert_eq!(helper.rank(), 0);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_stale_packet_is_dropped_without_resync() {
        let sink = CapturingSink::new();
        let mut helper = helper(&sink);

        helper.on_packet(&enc_header(15), &coded_payload(4, 0, &[1u8; 16], 1)).await.unwrap();
        assert_eq!(helper.block(), BlockId::ZERO);
        assert_eq!(helper.rank(), 0);
        assert!(sink.take().is_empty());
    }
}
