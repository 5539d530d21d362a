use crate::block_id::BlockId;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The kind of an RLNC overlay packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    /// reserved / uninitialized
    None = 0,
    /// encoded symbol produced by a source
    Enc = 1,
    /// recoded symbol produced by a relay
    Rec = 2,
    /// recoded symbol injected by a helper
    Hlp = 3,
    /// rank feedback from a decoder
    Ack = 4,
    /// halt production for the current block
    Stop = 5,
    /// per-peer receive counts from a multipath receiver
    Status = 6,
}

/// Fixed-size framing header in front of every overlay packet.
///
/// Wire layout (network byte order):
/// ```ascii
/// 0: type (u8)             - see PacketKind
/// 1: id   (u8)             - (group << 4) | (block & 0xF)
/// 2: seq  (u16 BE)         - monotonically increasing per sender
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub group: u8,
    pub block: BlockId,
    pub seq: u16,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8((self.group << 4) | (self.block.to_raw() & 0x0F));
        buf.put_u16(self.seq);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let kind = PacketKind::try_from(buf.try_get_u8()?)?;
        let id = buf.try_get_u8()?;
        let seq = buf.try_get_u16()?;
        Ok(PacketHeader {
            kind,
            group: id >> 4,
            block: BlockId::from_raw(id),
            seq,
        })
    }
}

/// Owns the sender-side header counters: the group this sender belongs to, the current
///  block and the per-sender sequence number. All outgoing packets of a generation
///  component are stamped through this.
pub struct HeaderSequencer {
    group: u8,
    block: BlockId,
    seq: u16,
}

impl HeaderSequencer {
    pub fn new(group: u8) -> HeaderSequencer {
        HeaderSequencer {
            group,
            block: BlockId::ZERO,
            seq: 0,
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn block_diff(&self, remote: BlockId) -> u8 {
        self.block.diff(remote)
    }

    pub fn advance_block(&mut self) {
        self.block = self.block.next();
    }

    pub fn advance_block_to(&mut self, remote: BlockId) {
        self.block = remote;
    }

    /// Stamp a header for the current block, consuming one sequence number.
    pub fn stamp(&mut self, kind: PacketKind, buf: &mut BytesMut) {
        self.stamp_for_block(kind, self.block, buf);
    }

    /// Stamp a header referring to an explicit block - ACKs carry the *remote* block
    ///  being acknowledged, which is not necessarily the local one.
    pub fn stamp_for_block(&mut self, kind: PacketKind, block: BlockId, buf: &mut BytesMut) {
        let header = PacketHeader {
            kind,
            group: self.group,
            block,
            seq: self.seq,
        };
        self.seq = self.seq.wrapping_add(1);
        header.ser(buf);
    }
}
