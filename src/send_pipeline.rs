use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::loss::LossInjector;

/// Abstraction for sending a finished packet to one peer, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet_buf: &[u8]);

    fn peer_addr(&self) -> SocketAddr;
}

pub struct UdpPacketSink {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
}

impl UdpPacketSink {
    pub fn new(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> UdpPacketSink {
        UdpPacketSink { socket, peer_addr }
    }
}

#[async_trait]
impl PacketSink for UdpPacketSink {
    async fn send_packet(&self, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", self.peer_addr);

        if let Err(e) = self.socket.send_to(packet_buf, self.peer_addr).await {
            error!("error sending UDP packet to {:?}: {}", self.peer_addr, e);
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Send path of one overlay link: a [PacketSink] plus optional synthetic loss.
#[derive(Clone)]
pub struct SendPipeline {
    sink: Arc<dyn PacketSink>,
    loss: Option<Arc<LossInjector>>,
}

impl SendPipeline {
    pub fn new(sink: Arc<dyn PacketSink>) -> SendPipeline {
        SendPipeline { sink, loss: None }
    }

    pub fn with_loss(sink: Arc<dyn PacketSink>, loss_prob: f64) -> SendPipeline {
        SendPipeline {
            sink,
            loss: Some(Arc::new(LossInjector::new(loss_prob))),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.sink.peer_addr()
    }

    pub async fn send_packet(&self, packet_buf: &[u8]) {
        if let Some(loss) = &self.loss {
            if loss.should_drop() {
                debug!("synthetic loss: dropping outgoing packet to {:?}", self.peer_addr());
                return;
            }
        }
        self.sink.send_packet(packet_buf).await;
    }
}
