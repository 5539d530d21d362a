use crate::coding::gf256;
use anyhow::bail;
use bit_set::BitSet;
use bytes::{BufMut, BytesMut};
use rand::Rng;

/// Encoder side of one block: accumulates up to `symbols` fixed-size symbols and emits
///  coded payloads - systematic (identity) combinations first, random combinations
///  afterwards and on every revisit.
pub struct BlockEncoder {
    symbols: Vec<Option<Vec<u8>>>,
    symbol_size: usize,
    initialized: usize,
    systematic: bool,
    next_systematic: usize,
    /// symbol slots the decoder has confirmed as decoded - skipped in random combinations
    acked: BitSet,
}

impl BlockEncoder {
    pub fn new(symbols: usize, symbol_size: usize) -> BlockEncoder {
        BlockEncoder {
            symbols: vec![None; symbols],
            symbol_size,
            initialized: 0,
            systematic: true,
            next_systematic: 0,
            acked: BitSet::with_capacity(symbols),
        }
    }

    pub fn symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }

    pub fn payload_len(&self) -> usize {
        super::payload_len(self.symbols.len(), self.symbol_size)
    }

    pub fn symbols_initialized(&self) -> usize {
        self.initialized
    }

    /// The encoder's rank is the number of symbols it holds.
    pub fn rank(&self) -> usize {
        self.initialized
    }

    pub fn is_full(&self) -> bool {
        self.initialized == self.symbols.len()
    }

    pub fn set_systematic(&mut self, systematic: bool) {
        self.systematic = systematic;
    }

    /// Store `data` (zero-padded to the symbol size) in the next uninitialized slot.
    pub fn set_next_symbol(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.is_full() {
            bail!("all {} symbols of the block are initialized", self.symbols.len());
        }
        if data.len() > self.symbol_size {
            bail!("symbol data of {} bytes exceeds the symbol size of {}", data.len(), self.symbol_size);
        }

        let mut symbol = vec![0u8; self.symbol_size];
        symbol[..data.len()].copy_from_slice(data);
        self.symbols[self.initialized] = Some(symbol);
        self.initialized += 1;
        Ok(())
    }

    /// Append one coded payload to `buf`. While in systematic mode each held symbol goes
    ///  out once as an identity combination; after that (and whenever systematic mode is
    ///  off) a fresh random combination over the held, not-yet-acked symbols is produced.
    pub fn encode(&mut self, buf: &mut BytesMut) {
        let g = self.symbols.len();
        buf.put_u16(self.initialized as u16);

        if self.systematic && self.next_systematic < self.initialized {
            let index = self.next_systematic;
            self.next_systematic += 1;

            for i in 0..g {
                buf.put_u8(if i == index { 1 } else { 0 });
            }
            buf.put_slice(self.symbols[index].as_ref().expect("initialized symbols are stored in order"));
            return;
        }

        let mut rng = rand::rng();
        let all_acked = (0..self.initialized).all(|i| self.acked.contains(i));
        let mut coeffs = vec![0u8; g];
        let mut data = vec![0u8; self.symbol_size];

        for (i, slot) in self.symbols.iter().enumerate().take(self.initialized) {
            if !all_acked && self.acked.contains(i) {
                continue;
            }
            let c: u8 = rng.random_range(1..=255);
            coeffs[i] = c;
            gf256::mul_acc(&mut data, c, slot.as_ref().expect("initialized symbols are stored in order"));
        }

        buf.put_slice(&coeffs);
        buf.put_slice(&data);
    }

    /// Apply the decoder's feedback bitmap: bit `i` set means symbol `i` is decoded on
    ///  the far side and need not be part of future combinations.
    pub fn read_feedback(&mut self, feedback: &[u8]) {
        for i in 0..self.symbols.len() {
            let byte = i / 8;
            if byte >= feedback.len() {
                break;
            }
            if feedback[byte] & (1 << (i % 8)) != 0 {
                self.acked.insert(i);
            }
        }
    }
}
