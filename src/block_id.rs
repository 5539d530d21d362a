use std::fmt::{Display, Formatter};

/// Ordinal of one coding round ("generation"). The on-wire representation is 4 bits,
///  so all arithmetic wraps modulo 16.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockId(u8);

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockId {
    pub const ZERO: BlockId = BlockId(0);

    /// Number of distinct block ids before wrap-around.
    pub const MODULO: u8 = 16;

    /// The forward circular distance up to which a remote block is considered 'near', i.e.
    ///  either current or recoverable by advancing. Anything farther is stale traffic from a
    ///  previous wrap and is dropped.
    pub const TOLERANCE: u8 = 8;

    pub fn from_raw(value: u8) -> BlockId {
        BlockId(value & 0x0F)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// Forward circular distance from `self` to `remote`: `(remote - self) mod 16`.
    ///
    /// This is the freshness classifier used everywhere: 0 is the current block, `1..=8`
    ///  means the remote is ahead (we fell behind), `> 8` means the packet is from an old
    ///  block that has already wrapped out of the window.
    pub fn diff(&self, remote: BlockId) -> u8 {
        remote.0.wrapping_sub(self.0) & 0x0F
    }

    pub fn is_stale(&self, remote: BlockId) -> bool {
        self.diff(remote) > Self::TOLERANCE
    }

    pub fn next(&self) -> BlockId {
        BlockId((self.0 + 1) & 0x0F)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0, 0)]
    #[case(0, 1, 1)]
    #[case(1, 0, 15)]
    #[case(3, 5, 2)]
    #[case(5, 3, 14)]
    #[case(15, 0, 1)]
    #[case(0, 15, 15)]
    #[case(7, 15, 8)]
    fn test_diff(#[case] local: u8, #[case] remote: u8, #[case] expected: u8) {
        assert_eq!(BlockId::from_raw(local).diff(BlockId::from_raw(remote)), expected);
    }

    #[test]
    fn test_diff_antisymmetric_mod_16() {
        for a in 0..16u8 {
            for b in 0..16u8 {
                let a = BlockId::from_raw(a);
                let b = BlockId::from_raw(b);
                if a == b {
                    assert_eq!(a.diff(b), 0);
                    assert_eq!(b.diff(a), 0);
                }
                else {
                    assert_eq!((a.diff(b) + b.diff(a)) % 16, 0);
                }
            }
        }
    }

    #[rstest]
    #[case(0, 8, false)]
    #[case(0, 9, true)]
    #[case(3, 5, false)]
    #[case(5, 3, true)]
    #[case(15, 7, false)]
    fn test_is_stale(#[case] local: u8, #[case] remote: u8, #[case] expected: bool) {
        assert_eq!(BlockId::from_raw(local).is_stale(BlockId::from_raw(remote)), expected);
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(BlockId::from_raw(15).next(), BlockId::ZERO);
        assert_eq!(BlockId::from_raw(4).next(), BlockId::from_raw(5));
    }
}
