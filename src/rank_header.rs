use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Rank/status payload carried on ACK packets, flowing backwards from decoder to
///  encoder/relay/helper.
///
/// Wire layout:
/// ```ascii
/// 0: rank        (u16 BE) - the decoder's current rank for the acked block
/// 2: feedback[N]          - opaque coder feedback (decoded-pivot bitmap), read to end of packet
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RankFeedback {
    pub rank: u16,
    pub feedback: Vec<u8>,
}

impl RankFeedback {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.rank);
        buf.put_slice(&self.feedback);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RankFeedback> {
        let rank = buf.try_get_u16()?;
        let mut feedback = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut feedback);
        Ok(RankFeedback { rank, feedback })
    }
}
