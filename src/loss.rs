use rand::Rng;

/// Synthetic Bernoulli packet loss, applied on the send path so every component sees
///  the same loss it would see from a real lossy link.
pub struct LossInjector {
    prob: f64,
}

impl LossInjector {
    pub fn new(prob: f64) -> LossInjector {
        LossInjector {
            prob: prob.clamp(0.0, 1.0),
        }
    }

    pub fn should_drop(&self) -> bool {
        self.prob > 0.0 && rand::rng().random_bool(self.prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_drops_at_zero() {
        let injector = LossInjector::new(0.0);
        assert!((0..1000).all(|_| !injector.should_drop()));
    }

    #[test]
    fn test_always_drops_at_one() {
        let injector = LossInjector::new(1.0);
        assert!((0..1000).all(|_| injector.should_drop()));
    }

    #[test]
    fn test_drop_rate_roughly_matches_probability() {
        let injector = LossInjector::new(0.3);
        let dropped = (0..10_000).filter(|_| injector.should_drop()).count();
        assert!((2_000..4_000).contains(&dropped), "dropped {} of 10000", dropped);
    }

    #[test]
    fn test_out_of_range_probability_is_clamped() {
        assert!(LossInjector::new(7.0).should_drop());
        assert!(!LossInjector::new(-1.0).should_drop());
    }
}
