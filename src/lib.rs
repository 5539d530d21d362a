//! An overlay transport that moves a stream of frames across lossy links using random
//!  linear network coding (RLNC). The application's frames are grouped into fixed-size
//!  blocks of symbols; what goes on the wire are linear combinations of those symbols
//!  over GF(256), so any sufficiently large subset of coded packets reconstructs the
//!  block regardless of which individual packets were lost.
//!
//! ## Roles
//!
//! An [EndPoint](end_point::EndPoint) plays one of four roles:
//! * *source* - accepts frames, encodes them and bursts coded packets, with a repair
//!    timer re-bursting until the destination acknowledges full rank
//! * *destination* - performs incremental Gaussian elimination on incoming packets,
//!    delivering decoded frames eagerly and in order, and acknowledges progress
//! * *relay* - sits on the path and recodes received packets without decoding them,
//!    spending a per-block packet budget
//! * *helper* - overhears traffic on a side path and injects recombinations towards
//!    the destination once it holds enough of the block to be useful
//!
//! A source with several peers spreads its packets over them, balancing per-peer
//!  quotas from the destination's periodic status reports.
//!
//! ## Wire format
//!
//! Packet header - all numbers in network byte order (BE):
//! ```ascii
//! 0: packet kind (u8) - see [PacketKind](packet_header::PacketKind)
//! 1: id (u8): bits 4-7 group, bits 0-3 block (wrapping, mod 16)
//! 2: seq (u16) - per-endpoint stamp counter
//! ```
//!
//! Coded packets (Enc / Rec / Hlp) carry after the header:
//! ```ascii
//! 0: encoder rank (u16)  - how many symbols the sender's block holds
//! 2: coefficients [g]    - one GF(256) coefficient per symbol of the block
//! g+2: data [symbol_size] - the linear combination of the block's symbols
//! ```
//!
//! Ack packets carry a [RankFeedback](rank_header::RankFeedback): the decoder's rank
//!  plus a bitmap of decoded pivots so the encoder can skip acked symbols. Status
//!  packets carry per-peer receive counts for multipath scheduling.
//!
//! Frames travel inside symbols with a `u32` BE length prefix, so symbol boundaries
//!  are independent of frame boundaries.

pub mod block_id;
pub mod budget;
pub mod coding;
pub mod config;
pub mod end_point;
pub mod frame_dispatcher;
pub mod framing;
pub mod generation;
pub mod loss;
pub mod packet_header;
pub mod rank_header;
pub mod scheduler;
pub mod send_pipeline;
pub mod shutdown;

pub use config::RlncConfig;
pub use end_point::EndPoint;
pub use frame_dispatcher::FrameDispatcher;
pub use shutdown::{ShutdownSignal, ShutdownToken};
