use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::block_id::BlockId;
use crate::budget::Budget;
use crate::coding::BlockEncoder;
use crate::config::RlncConfig;
use crate::packet_header::{HeaderSequencer, PacketHeader, PacketKind};
use crate::rank_header::RankFeedback;
use crate::send_pipeline::SendPipeline;

/// Source side of one coded generation.
///
/// Frames accumulate as symbols of the current block; every accepted frame funds a
///  budgeted burst of ENC packets. The block advances when rank feedback from the
///  decoder reaches the block size, and the whole per-block state is rebuilt in
///  place - nothing survives a block boundary.
pub struct GenerationEncoder {
    symbols: usize,
    symbol_size: usize,
    coder: BlockEncoder,
    sequencer: HeaderSequencer,
    budget: Budget,
    send: SendPipeline,
    decoder_rank: usize,
    stopped: bool,
}

impl GenerationEncoder {
    pub fn new(config: &RlncConfig, group: u8, send: SendPipeline) -> GenerationEncoder {
        GenerationEncoder {
            symbols: config.symbols,
            symbol_size: config.symbol_size,
            coder: BlockEncoder::new(config.symbols, config.symbol_size),
            sequencer: HeaderSequencer::new(group),
            budget: Budget::source(config.symbols, &config.errors, config.overshoot),
            send,
            decoder_rank: 0,
            stopped: false,
        }
    }

    pub fn block(&self) -> BlockId {
        self.sequencer.block()
    }

    pub fn rank(&self) -> usize {
        self.coder.rank()
    }

    /// True while the current block cannot accept further frames. Callers are
    ///  expected to check this before [put] and apply backpressure upstream.
    pub fn is_full(&self) -> bool {
        self.stopped || self.coder.rank() == self.symbols
    }

    /// Accepts one application frame into the current block and bursts coded packets.
    pub async fn put(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        if self.is_full() {
            bail!("block {:?} is full", self.sequencer.block());
        }
        if frame.len() > self.symbol_size - 4 {
            bail!("frame of {} bytes exceeds the symbol capacity of {}", frame.len(), self.symbol_size - 4);
        }

        let mut symbol = BytesMut::with_capacity(4 + frame.len());
        symbol.put_u32(frame.len() as u32);
        symbol.put_slice(frame);
        self.coder.set_next_symbol(&symbol)?;

        self.budget.increase();
        self.send_burst().await;
        Ok(())
    }

    async fn send_burst(&mut self) {
        loop {
            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.coder.payload_len());
            self.sequencer.stamp(PacketKind::Enc, &mut buf);
            self.coder.encode(&mut buf);
            self.send.send_packet(&buf).await;

            if !self.budget.decrease() {
                break;
            }
        }
    }

    /// Rank feedback from the decoder. Completion of the block advances it; an ACK
    ///  for a different nearby block means the decoder moved on without us, so the
    ///  current block is abandoned and the encoder skips ahead.
    pub async fn on_ack(&mut self, header: &PacketHeader, body: &mut impl Buf) -> anyhow::Result<()> {
        let diff = self.sequencer.block_diff(header.block);
        if diff > BlockId::TOLERANCE {
            debug!("ack for stale block {:?} (local {:?}) - dropping", header.block, self.sequencer.block());
            return Ok(());
        }
        if diff != 0 {
            warn!("ack for block {:?} while sending {:?} - abandoning the current block", header.block, self.sequencer.block());
            self.advance_to(header.block);
            return Ok(());
        }

        let feedback = RankFeedback::deser(body)?;
        self.coder.read_feedback(&feedback.feedback);
        self.decoder_rank = feedback.rank as usize;
        trace!("decoder rank {} for block {:?}", self.decoder_rank, self.sequencer.block());

        if self.decoder_rank >= self.symbols {
            debug!("block {:?} acked complete - advancing", self.sequencer.block());
            let next = self.sequencer.block().next();
            self.advance_to(next);
        }
        Ok(())
    }

    pub fn on_stop(&mut self) {
        debug!("stop received for block {:?}", self.sequencer.block());
        self.stopped = true;
    }

    /// Periodic retransmission substitute: while the decoder's rank lags and the
    ///  block is live, fund and send another burst of fresh combinations.
    pub async fn on_timer(&mut self) {
        if self.coder.symbols_initialized() == 0 {
            return;
        }
        if self.decoder_rank >= self.coder.rank() {
            return;
        }
        if self.stopped {
            return;
        }

        self.budget.increase();
        self.send_burst().await;
    }

    fn advance_to(&mut self, block: BlockId) {
        self.sequencer.advance_block_to(block);
        self.coder = BlockEncoder::new(self.symbols, self.symbol_size);
        self.budget.reset();
        self.decoder_rank = 0;
        self.stopped = false;
    }
}
