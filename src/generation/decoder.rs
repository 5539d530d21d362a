use std::sync::Arc;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::block_id::BlockId;
use crate::coding::BlockDecoder;
use crate::config::RlncConfig;
use crate::frame_dispatcher::FrameDispatcher;
use crate::packet_header::{HeaderSequencer, PacketHeader, PacketKind};
use crate::send_pipeline::SendPipeline;

/// A run of this many consecutive non-innovative packets triggers an emergency ACK
///  even when the block looks unfinished from here.
const LINEAR_STREAK_LIMIT: usize = 50;

/// Packets for already-completed blocks are answered with a full-rank ACK once per
///  this many late packets, in case the final ACK was lost.
const STALE_ACK_INTERVAL: usize = 5;

/// Destination side of one coded generation.
///
/// Symbols are released to the [FrameDispatcher] strictly in insertion order, each
///  as soon as it becomes decodable. Completion sends a final full-rank ACK and
///  rebuilds the block state in place.
pub struct GenerationDecoder {
    symbols: usize,
    symbol_size: usize,
    coder: BlockDecoder,
    sequencer: HeaderSequencer,
    send: SendPipeline,
    dispatcher: Arc<dyn FrameDispatcher>,
    decoded: usize,
    linear: usize,
    stale_packets: usize,
}

impl GenerationDecoder {
    pub fn new(config: &RlncConfig, group: u8, send: SendPipeline, dispatcher: Arc<dyn FrameDispatcher>) -> GenerationDecoder {
        GenerationDecoder {
            symbols: config.symbols,
            symbol_size: config.symbol_size,
            coder: BlockDecoder::new(config.symbols, config.symbol_size),
            sequencer: HeaderSequencer::new(group),
            send,
            dispatcher,
            decoded: 0,
            linear: 0,
            stale_packets: 0,
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
            PacketKind::Enc | PacketKind::Rec | PacketKind::Hlp => {}
            other => {
                debug!("packet of kind {:?} is not decodable - dropping", other);
                return Ok(());
            }
        }

        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            // a block we already completed; the sender apparently missed the final ack
            self.stale_packets += 1;
            if self.stale_packets % STALE_ACK_INTERVAL == 1 {
                debug!("late packet for completed block {:?} - re-acking", header.block);
                self.send_ack(header.block, self.symbols).await;
            }
            return Ok(());
        }
        if diff != 0 {
            warn!("packet for block {:?} while decoding {:?} - skipping ahead, block failed at rank {}",
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
        if innovative {
            self.linear = 0;
        } else {
            self.linear += 1;
        }
        trace!("rank {} after packet for block {:?} (linear run {})", self.coder.rank(), self.sequencer.block(), self.linear);

        self.maybe_emergency_ack().await;
        self.emit_decoded().await;

        if self.decoded == self.symbols {
            self.finish_block().await;
        }
        Ok(())
    }

    /// Whether the incoming packet advanced the rank (for per-peer receive accounting).
    pub fn is_innovative_run(&self) -> bool {
        self.linear == 0
    }

    /// Everything the sender has produced so far is decoded here, but the block is
    ///  not complete. Non-innovative deliveries in this state mean the sender spins
    ///  without hearing our rank.
    fn is_partial_done(&self) -> bool {
        let rank = self.coder.rank();
        let decoded_symbols = (0..self.symbols)
            .filter(|i| self.coder.is_symbol_decoded(*i))
            .count();

        rank == self.coder.remote_rank() && rank == decoded_symbols
    }

    async fn maybe_emergency_ack(&mut self) {
        if self.linear >= LINEAR_STREAK_LIMIT {
            warn!("{} non-innovative packets in a row for block {:?} - re-acking rank {}", self.linear, self.sequencer.block(), self.coder.rank());
            self.linear = 0;
            let block = self.sequencer.block();
            let rank = self.coder.rank();
            self.send_ack(block, rank).await;
            return;
        }

        if self.linear < 1 || !self.is_partial_done() || self.coder.is_complete() {
            return;
        }

        let block = self.sequencer.block();
        let rank = self.coder.rank();
        self.send_ack(block, rank).await;
    }

    async fn emit_decoded(&mut self) {
        while self.decoded < self.symbols && self.coder.is_symbol_decoded(self.decoded) {
            let frame = self.coder.symbol(self.decoded)
                .and_then(Self::unwrap_frame);
            self.decoded += 1;

            match frame {
                Some(frame) => self.dispatcher.on_frame(frame).await,
                None => warn!("corrupt frame length in decoded symbol {} of block {:?} - skipping", self.decoded - 1, self.sequencer.block()),
            }
        }
    }

    fn unwrap_frame(symbol: &[u8]) -> Option<Vec<u8>> {
        if symbol.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([symbol[0], symbol[1], symbol[2], symbol[3]]) as usize;
        symbol.get(4..4 + len).map(|frame| frame.to_vec())
    }

    async fn finish_block(&mut self) {
        debug!("block {:?} complete (linear packets seen: {})", self.sequencer.block(), self.linear);
        let block = self.sequencer.block();
        self.send_ack(block, self.symbols).await;

        let next = self.sequencer.block().next();
        self.reset_to(next);
    }

    fn reset_to(&mut self, block: BlockId) {
        self.sequencer.advance_block_to(block);
        self.coder = BlockDecoder::new(self.symbols, self.symbol_size);
        self.decoded = 0;
        self.linear = 0;
        self.stale_packets = 0;
    }

    async fn send_ack(&mut self, block: BlockId, rank: usize) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + 2 + self.coder.feedback_len());
        self.sequencer.stamp_for_block(PacketKind::Ack, block, &mut buf);
        buf.put_u16(rank as u16);
        self.coder.write_feedback(&mut buf);
        self.send.send_packet(&buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::test_util::{coded_payload, lossless_config, CapturingDispatcher, CapturingSink};
    use crate::rank_header::RankFeedback;

    fn decoder(sink: &Arc<CapturingSink>, dispatcher: &Arc<CapturingDispatcher>, symbols: usize, symbol_size: usize) -> GenerationDecoder {
        let config = lossless_config(symbols, symbol_size);
        GenerationDecoder::new(&config, 0, SendPipeline::new(sink.clone()), dispatcher.clone())
    }

    fn enc_header(block: u8) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Enc,
            group: 0,
            block: BlockId::from_raw(block),
            seq: 0,
        }
    }

    fn parse_ack(packet: &[u8]) -> (PacketHeader, RankFeedback) {
        let mut b: &[u8] = packet;
        let header = PacketHeader::deser(&mut b).unwrap();
        let feedback = RankFeedback::deser(&mut b).unwrap();
        (header, feedback)
    }

    /// Symbol payload as the encoder would build it: length prefix plus frame,
    ///  zero-padded to the symbol size.
    fn symbol_data(frame: &[u8], symbol_size: usize) -> Vec<u8> {
        let mut data = (frame.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(frame);
        data.resize(symbol_size, 0);
        data
    }

    #[tokio::test]
    async fn test_unit_payloads_are_emitted_in_order() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 3, 16);

        // symbol 1 arrives first: nothing can be released yet
        let payload = coded_payload(3, 1, &symbol_data(b"second", 16), 3);
        decoder.on_packet(&enc_header(0), &payload).await.unwrap();
        assert!(dispatcher.take().is_empty());

        // symbol 0 unlocks both
        let payload = coded_payload(3, 0, &symbol_data(b"first", 16), 3);
        decoder.on_packet(&enc_header(0), &payload).await.unwrap();
        assert_eq!(dispatcher.take(), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_completion_sends_final_ack_and_resets() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        decoder.on_packet(&enc_header(0), &coded_payload(2, 0, &symbol_data(b"a", 16), 1)).await.unwrap();
        decoder.on_packet(&enc_header(0), &coded_payload(2, 1, &symbol_data(b"b", 16), 2)).await.unwrap();

        assert_eq!(dispatcher.take(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(decoder.block(), BlockId::from_raw(1));
        assert_eq!(decoder.rank(), 0);

        let packets = sink.take();
        assert_eq!(packets.len(), 1);
        let (header, feedback) = parse_ack(&packets[0]);
        assert_eq!(header.kind, PacketKind::Ack);
        assert_eq!(header.block, BlockId::ZERO);
        assert_eq!(feedback.rank, 2);
    }

    #[tokio::test]
    async fn test_reset_decoder_behaves_like_a_fresh_one() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        // complete block 0, then replay the same shape of traffic for block 1
        for block in 0..2u8 {
            decoder.on_packet(&enc_header(block), &coded_payload(2, 1, &symbol_data(b"tail", 16), 2)).await.unwrap();
            assert!(dispatcher.take().is_empty());
            decoder.on_packet(&enc_header(block), &coded_payload(2, 0, &symbol_data(b"head", 16), 2)).await.unwrap();

            assert_eq!(dispatcher.take(), vec![b"head".to_vec(), b"tail".to_vec()]);
            assert_eq!(decoder.block(), BlockId::from_raw(block + 1));
            assert_eq!(decoder.rank(), 0);

            let packets = sink.take();
            let (header, feedback) = parse_ack(packets.last().unwrap());
            assert_eq!(header.block, BlockId::from_raw(block));
            assert_eq!(feedback.rank, 2);
        }
    }

    #[tokio::test]
    async fn test_non_decodable_kinds_are_dropped() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        let header = PacketHeader { kind: PacketKind::Ack, ..enc_header(0) };
        decoder.on_packet(&header, &coded_payload(2, 0, &symbol_data(b"a", 16), 1)).await.unwrap();
        assert_eq!(decoder.rank(), 0);
    }

    #[tokio::test]
    async fn test_undersized_payload_is_dropped() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        decoder.on_packet(&enc_header(0), &[0u8; 5]).await.unwrap();
        assert_eq!(decoder.rank(), 0);
    }

    #[tokio::test]
    async fn test_late_packets_for_old_blocks_reack_every_fifth() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        let payload = coded_payload(2, 0, &symbol_data(b"a", 16), 1);
        for _ in 0..6 {
            decoder.on_packet(&enc_header(15), &payload).await.unwrap();
        }

        let packets = sink.take();
        assert_eq!(packets.len(), 2);
        for packet in &packets {
            let (header, feedback) = parse_ack(packet);
            assert_eq!(header.block, BlockId::from_raw(15));
            assert_eq!(feedback.rank, 2);
        }
        assert_eq!(decoder.rank(), 0);
    }

    #[tokio::test]
    async fn test_block_reset_restarts_the_stale_ack_cadence() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        let late = coded_payload(2, 0, &symbol_data(b"late", 16), 2);
        for _ in 0..3 {
            decoder.on_packet(&enc_header(15), &late).await.unwrap();
        }
        assert_eq!(sink.take().len(), 1);

        // completing the block resets all per-block counters
        decoder.on_packet(&enc_header(0), &coded_payload(2, 0, &symbol_data(b"a", 16), 2)).await.unwrap();
        decoder.on_packet(&enc_header(0), &coded_payload(2, 1, &symbol_data(b"b", 16), 2)).await.unwrap();
        assert_eq!(decoder.block(), BlockId::from_raw(1));
        sink.take();

        // the first late packet after the reset is acked right away again
        decoder.on_packet(&enc_header(15), &late).await.unwrap();
        let packets = sink.take();
        assert_eq!(packets.len(), 1);
        let (header, feedback) = parse_ack(&packets[0]);
        assert_eq!(header.block, BlockId::from_raw(15));
        assert_eq!(feedback.rank, 2);
    }

    #[tokio::test]
    async fn test_packet_ahead_of_window_forces_the_block_forward() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);
        decoder.reset_to(BlockId::from_raw(3));

        let payload = coded_payload(2, 0, &symbol_data(b"skip", 16), 1);
        decoder.on_packet(&enc_header(5), &payload).await.unwrap();

        assert_eq!(decoder.block(), BlockId::from_raw(5));
        assert_eq!(decoder.rank(), 1);
        assert_eq!(dispatcher.take(), vec![b"skip".to_vec()]);
    }

    #[tokio::test]
    async fn test_emergency_ack_when_sender_spins_on_partial_block() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        // the sender has one symbol so far and we decoded it
        let payload = coded_payload(2, 0, &symbol_data(b"a", 16), 1);
        decoder.on_packet(&enc_header(0), &payload).await.unwrap();
        assert!(sink.take().is_empty());

        // a duplicate of it means our ack got lost
        decoder.on_packet(&enc_header(0), &payload).await.unwrap();
        let packets = sink.take();
        assert_eq!(packets.len(), 1);
        let (header, feedback) = parse_ack(&packets[0]);
        assert_eq!(header.block, BlockId::ZERO);
        assert_eq!(feedback.rank, 1);
    }

    #[tokio::test]
    async fn test_emergency_ack_after_a_long_linear_streak() {
        let sink = CapturingSink::new();
        let dispatcher = CapturingDispatcher::new();
        let mut decoder = decoder(&sink, &dispatcher, 2, 16);

        decoder.on_packet(&enc_header(0), &coded_payload(2, 0, &symbol_data(b"a", 16), 1)).await.unwrap();

        // duplicates advertising a second symbol we never receive: not partial-done,
        //  so only the streak limit fires
        let dup = coded_payload(2, 0, &symbol_data(b"a", 16), 2);
        for _ in 0..LINEAR_STREAK_LIMIT {
            decoder.on_packet(&enc_header(0), &dup).await.unwrap();
        }

        let packets = sink.take();
        assert_eq!(packets.len(), 1);
        let (_, feedback) = parse_ack(&packets[0]);
        assert_eq!(feedback.rank, 1);
    }
}
