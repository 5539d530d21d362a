use crate::coding::gf256;
use anyhow::bail;
use bit_set::BitSet;
use bytes::{BufMut, BytesMut};
use rand::Rng;

struct Row {
    coeffs: Vec<u8>,
    data: Vec<u8>,
}

/// Decoder side of one block: incremental Gaussian elimination over received coded
///  payloads, kept in reduced row echelon form so individual symbols become readable
///  as soon as their row collapses to an identity vector - before the whole block is
///  complete.
///
/// The same structure serves recoding: a relay holds received combinations and can emit
///  fresh random re-combinations of them without ever recovering the original symbols.
pub struct BlockDecoder {
    symbols: usize,
    symbol_size: usize,
    /// rows indexed by pivot column
    rows: Vec<Option<Row>>,
    rank: usize,
    remote_rank: usize,
    decoded: BitSet,
}

impl BlockDecoder {
    pub fn new(symbols: usize, symbol_size: usize) -> BlockDecoder {
        BlockDecoder {
            symbols,
            symbol_size,
            rows: (0..symbols).map(|_| None).collect(),
            rank: 0,
            remote_rank: 0,
            decoded: BitSet::with_capacity(symbols),
        }
    }

    pub fn symbols(&self) -> usize {
        self.symbols
    }

    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }

    pub fn payload_len(&self) -> usize {
        super::payload_len(self.symbols, self.symbol_size)
    }

    pub fn feedback_len(&self) -> usize {
        super::feedback_len(self.symbols)
    }

    /// Number of linearly independent combinations received for this block.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Highest rank the sending side advertised in any payload seen so far.
    pub fn remote_rank(&self) -> usize {
        self.remote_rank
    }

    pub fn is_complete(&self) -> bool {
        self.rank == self.symbols
    }

    pub fn is_symbol_decoded(&self, index: usize) -> bool {
        self.decoded.contains(index)
    }

    /// The decoded symbol data, available once `is_symbol_decoded(index)`.
    pub fn symbol(&self, index: usize) -> Option<&[u8]> {
        if !self.decoded.contains(index) {
            return None;
        }
        self.rows[index].as_ref().map(|row| row.data.as_slice())
    }

    /// Ingest one coded payload. Returns whether it was innovative (increased the rank).
    pub fn decode(&mut self, payload: &[u8]) -> anyhow::Result<bool> {
        if payload.len() < self.payload_len() {
            bail!("coded payload of {} bytes is shorter than the expected {}", payload.len(), self.payload_len());
        }

        let advertised = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        self.remote_rank = self.remote_rank.max(advertised.min(self.symbols));

        let mut coeffs = payload[2..2 + self.symbols].to_vec();
        let mut data = payload[2 + self.symbols..2 + self.symbols + self.symbol_size].to_vec();

        // reduce against every pivot already held; rows are in reduced echelon form, so
        //  a single left-to-right pass zeroes all occupied pivot columns
        for col in 0..self.symbols {
            if coeffs[col] == 0 {
                continue;
            }
            if let Some(row) = &self.rows[col] {
                let factor = coeffs[col];
                gf256::mul_acc(&mut coeffs, factor, &row.coeffs);
                gf256::mul_acc(&mut data, factor, &row.data);
            }
        }

        // fully reduced to zero: linearly dependent on what is already held
        let Some(pivot) = coeffs.iter().position(|&c| c != 0) else {
            return Ok(false);
        };

        // normalize the new pivot row, then clear its column from all other rows
        let inv = gf256::inv(coeffs[pivot]);
        gf256::scale(&mut coeffs, inv);
        gf256::scale(&mut data, inv);

        for other in self.rows.iter_mut().flatten() {
            let factor = other.coeffs[pivot];
            if factor != 0 {
                gf256::mul_acc(&mut other.coeffs, factor, &coeffs);
                gf256::mul_acc(&mut other.data, factor, &data);
            }
        }

        self.rows[pivot] = Some(Row { coeffs, data });
        self.rank += 1;
        self.refresh_decoded();
        Ok(true)
    }

    fn refresh_decoded(&mut self) {
        for (pivot, slot) in self.rows.iter().enumerate() {
            if self.decoded.contains(pivot) {
                continue;
            }
            if let Some(row) = slot {
                let unit = row.coeffs.iter().enumerate()
                    .all(|(i, &c)| if i == pivot { c == 1 } else { c == 0 });
                if unit {
                    self.decoded.insert(pivot);
                }
            }
        }
    }

    /// Append a fresh random combination of the held rows to `buf` - recoding. The
    ///  original symbols are never exposed; the advertised rank passes through from
    ///  the upstream sender.
    pub fn recode(&self, buf: &mut BytesMut) {
        let mut rng = rand::rng();
        let mut coeffs = vec![0u8; self.symbols];
        let mut data = vec![0u8; self.symbol_size];

        for row in self.rows.iter().flatten() {
            let w: u8 = rng.random_range(1..=255);
            gf256::mul_acc(&mut coeffs, w, &row.coeffs);
            gf256::mul_acc(&mut data, w, &row.data);
        }

        buf.put_u16(self.remote_rank as u16);
        buf.put_slice(&coeffs);
        buf.put_slice(&data);
    }

    /// Append the decoded-pivot bitmap (bit `i` set when symbol `i` is decoded).
    pub fn write_feedback(&self, buf: &mut BytesMut) {
        let mut bitmap = vec![0u8; self.feedback_len()];
        for i in self.decoded.iter() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
        buf.put_slice(&bitmap);
    }
}
