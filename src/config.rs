use std::time::Duration;
use anyhow::bail;

use crate::budget::LinkErrors;
use crate::coding;

pub struct RlncConfig {
    /// Number of source symbols per block. Each block is encoded, acked and advanced as a
    ///  unit, so this is also the maximum number of frames in flight per block.
    pub symbols: usize,

    /// Size of one coded symbol in bytes. Application frames carry a four byte length
    ///  prefix inside the symbol, so the usable frame size is `symbol_size - 4`.
    ///
    /// The coded packet on the wire is `4 + 2 + symbols + symbol_size` bytes (packet
    ///  header, encoder rank, coefficient vector, symbol data). Choosing this value so
    ///  that the packet fits the path MTU is the application's responsibility; the
    ///  protocol does not discover or guess MTUs.
    pub symbol_size: usize,

    /// Loss probabilities of the overlay links, used to size send budgets. These are
    ///  configured expectations, not measurements.
    pub errors: LinkErrors,

    /// Granularity of the retransmission timer.
    pub timeout: Duration,

    /// Multiplier on earned credits, > 1.0 trades bandwidth for latency under loss.
    pub overshoot: f64,

    /// A multipath receiver reports per-peer receive counts once every this many
    ///  innovative packets.
    pub status_interval: u16,

    /// Synthetic Bernoulli loss applied to outgoing packets. For tests and demos.
    pub loss: Option<f64>,
}

impl Default for RlncConfig {
    fn default() -> Self {
        RlncConfig {
            symbols: 100,
            symbol_size: 1450,
            errors: LinkErrors { e1: 0.1, e2: 0.1, e3: 0.5, e4: 0.75 },
            timeout: Duration::from_millis(20),
            overshoot: 1.0,
            status_interval: 50,
            loss: None,
        }
    }
}

impl RlncConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbols == 0 || self.symbols > u16::MAX as usize {
            bail!("symbols per block must be in 1..={}", u16::MAX);
        }
        if self.symbol_size <= 4 {
            bail!("symbol size must leave room for the frame length prefix");
        }
        for p in [self.errors.e1, self.errors.e2, self.errors.e3, self.errors.e4] {
            if !(0.0..1.0).contains(&p) {
                bail!("link error probabilities must be in [0, 1)");
            }
        }
        if let Some(loss) = self.loss {
            if !(0.0..1.0).contains(&loss) {
                bail!("synthetic loss probability must be in [0, 1)");
            }
        }
        if self.overshoot < 1.0 {
            bail!("overshoot must be >= 1.0");
        }
        Ok(())
    }

    /// Usable application frame length inside one symbol.
    pub fn max_frame_len(&self) -> usize {
        self.symbol_size - 4
    }

    pub fn coded_payload_len(&self) -> usize {
        coding::payload_len(self.symbols, self.symbol_size)
    }

    pub fn feedback_len(&self) -> usize {
        coding::feedback_len(self.symbols)
    }
}
