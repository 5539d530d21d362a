//! Per-role generation state machines: one coded block in flight at a time, advanced
//!  in lock step by rank feedback.

mod decoder;
mod encoder;
mod helper;
mod recoder;

pub use decoder::GenerationDecoder;
pub use encoder::GenerationEncoder;
pub use helper::GenerationHelper;
pub use recoder::GenerationRecoder;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;

    use crate::budget::LinkErrors;
    use crate::config::RlncConfig;
    use crate::frame_dispatcher::FrameDispatcher;
    use crate::send_pipeline::PacketSink;

    pub fn lossless_config(symbols: usize, symbol_size: usize) -> RlncConfig {
        RlncConfig {
            symbols,
            symbol_size,
            errors: LinkErrors::NONE,
            ..RlncConfig::default()
        }
    }

    /// Unit-coefficient payload for one symbol, with an explicit advertised rank.
    pub fn coded_payload(symbols: usize, index: usize, data: &[u8], rank: u16) -> Vec<u8> {
        let mut payload = rank.to_be_bytes().to_vec();
        let mut coeffs = vec![0u8; symbols];
        coeffs[index] = 1;
        payload.extend_from_slice(&coeffs);
        payload.extend_from_slice(data);
        payload
    }

    pub struct CapturingSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturingSink {
        pub fn new() -> Arc<CapturingSink> {
            Arc::new(CapturingSink {
                packets: Mutex::new(Vec::new()),
            })
        }

        pub fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.packets.lock().unwrap())
        }
    }

    #[async_trait]
    impl PacketSink for CapturingSink {
        async fn send_packet(&self, packet_buf: &[u8]) {
            self.packets.lock().unwrap().push(packet_buf.to_vec());
        }

        fn peer_addr(&self) -> std::net::SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
    }

    pub struct CapturingDispatcher {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturingDispatcher {
        pub fn new() -> Arc<CapturingDispatcher> {
            Arc::new(CapturingDispatcher {
                frames: Mutex::new(Vec::new()),
            })
        }

        pub fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.frames.lock().unwrap())
        }
    }

    #[async_trait]
    impl FrameDispatcher for CapturingDispatcher {
        async fn on_frame(&self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
        }
    }
}
