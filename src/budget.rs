//! Credit-based pacing, derived analytically from assumed per-link error rates.
//!
//! The formulas follow the analytic model of the two-hop helper topology: `e1` is the
//!  loss probability source->helper, `e2` helper->relay, `e3` relay->neighbor and `e4`
//!  the two-hop path. They are a configured assumption, not a live measurement.

/// Per-link synthetic error probabilities, in `[0, 1)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkErrors {
    pub e1: f64,
    pub e2: f64,
    pub e3: f64,
    pub e4: f64,
}

impl LinkErrors {
    pub const NONE: LinkErrors = LinkErrors { e1: 0.0, e2: 0.0, e3: 0.0, e4: 0.0 };

    pub fn as_array(&self) -> [f64; 4] {
        [self.e1, self.e2, self.e3, self.e4]
    }
}

/// Divide with the denominator clamped away from zero, so degenerate error vectors
///  (e.g. `e2 + e3 -> 2`) yield large finite budgets instead of NaN/Inf.
fn safe_div(nom: f64, denom: f64) -> f64 {
    const MIN_DENOM: f64 = 1e-6;

    let denom = if denom.abs() < MIN_DENOM {
        MIN_DENOM.copysign(if denom == 0.0 { 1.0 } else { denom })
    }
    else {
        denom
    };
    (nom / denom).max(0.0)
}

fn r_test(e: &LinkErrors) -> bool {
    (1.0 - e.e2) < (e.e3 - e.e1 * e.e3)
}

/// Helper-relative auxiliary value used by the source and helper budgets.
fn r_val(g: usize, e: &LinkErrors) -> f64 {
    let g = g as f64;

    if r_test(e) {
        return safe_div(1.0, e.e3 - e.e1 * e.e3);
    }

    let nom = g - g * e.e2 - g * e.e3 + g * e.e1 * e.e3;
    let denom = 1.0 + e.e1 * e.e2 * e.e3 - e.e2 - e.e1 * e.e3;
    safe_div(nom, denom)
}

pub fn source_credits(e: &LinkErrors) -> f64 {
    safe_div(1.0, 1.0 - e.e3 * e.e1)
}

pub fn source_budget(g: usize, e: &LinkErrors) -> f64 {
    let r = r_val(g, e);
    safe_div(g as f64 + r - r * e.e2, 2.0 - e.e3 - e.e2)
}

pub fn helper_credits(e: &LinkErrors) -> f64 {
    safe_div(1.0, 1.0 - e.e1)
}

pub fn helper_threshold(g: usize, e: &LinkErrors) -> f64 {
    let r = r_val(g, e);
    r - r * e.e1
}

pub fn helper_budget(g: usize, e: &LinkErrors) -> f64 {
    let r = r_val(g, e);
    safe_div(e.e3 * r - r + g as f64, 2.0 - e.e2 - e.e3)
}

pub fn relay_credits(_e: &LinkErrors) -> f64 {
    1.0
}

pub fn relay_budget(g: usize, e: &LinkErrors) -> f64 {
    (source_budget(g, e) - g as f64 * (1.0 - e.e4)).max(0.0)
}

/// Mutable per-connection budget state. `budget` is the fractional remaining send
///  allowance, `credits` the per-replenishment amount (fixed at construction),
///  `threshold` the minimum rank before a helper may transmit and `max` the
///  role-specific per-block ceiling.
#[derive(Clone, Debug)]
pub struct Budget {
    budget: f64,
    credits: f64,
    threshold: f64,
    max: f64,
}

impl Budget {
    pub fn source(g: usize, errors: &LinkErrors, overshoot: f64) -> Budget {
        Budget {
            budget: 0.0,
            credits: source_credits(errors) * overshoot,
            threshold: 0.0,
            max: source_budget(g, errors) * overshoot,
        }
    }

    pub fn helper(g: usize, errors: &LinkErrors, overshoot: f64) -> Budget {
        Budget {
            budget: 0.0,
            credits: helper_credits(errors) * overshoot,
            threshold: helper_threshold(g, errors),
            max: helper_budget(g, errors) * overshoot,
        }
    }

    pub fn relay(g: usize, errors: &LinkErrors, overshoot: f64) -> Budget {
        Budget {
            budget: 0.0,
            credits: relay_credits(errors) * overshoot,
            threshold: 0.0,
            max: relay_budget(g, errors) * overshoot,
        }
    }

    /// Spend one packet's worth of budget. Returns whether at least one full packet of
    ///  allowance remains - this drives the 'keep sending' burst loops, which terminate
    ///  once the budget drops below 1.
    pub fn decrease(&mut self) -> bool {
        self.budget -= 1.0;
        self.budget >= 1.0
    }

    /// Replenish by one credit unit - once per accepted frame (source) or per
    ///  innovative packet (helper/relay).
    pub fn increase(&mut self) {
        self.budget += self.credits;
    }

    /// Block advance resets the allowance.
    pub fn reset(&mut self) {
        self.budget = 0.0;
    }

    pub fn value(&self) -> f64 {
        self.budget
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Per-block ceiling on packets sent, rounded up.
    pub fn max_packets(&self) -> usize {
        self.max.ceil().max(0.0) as usize
    }
}
