//! The symbol coder capability: random linear coding over GF(256) within one block.
//!
//! One coded payload is self-describing:
//! ```ascii
//! 0:     encoder rank (u16 BE) - how many symbols the sender held when coding
//! 2:     coefficients (g bytes) - one GF(256) coefficient per symbol slot
//! 2+g:   coded data (symbol_size bytes)
//! ```
//!
//! The generation components depend only on this module's surface (`set_symbol`,
//!  `encode`, `decode`, `recode`, `rank`, completion and feedback queries); the
//!  Gaussian-elimination internals are not part of any protocol contract.

pub mod gf256;

mod encoder;
mod decoder;

pub use decoder::BlockDecoder;
pub use encoder::BlockEncoder;

/// Total on-wire length of one coded payload.
pub fn payload_len(symbols: usize, symbol_size: usize) -> usize {
    2 + symbols + symbol_size
}

/// Length of the decoded-pivot feedback bitmap carried on ACKs.
pub fn feedback_len(symbols: usize) -> usize {
    symbols.div_ceil(8)
}
