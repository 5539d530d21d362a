use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::block_id::BlockId;
use crate::config::RlncConfig;
use crate::frame_dispatcher::FrameDispatcher;
use crate::generation::{GenerationDecoder, GenerationEncoder, GenerationHelper, GenerationRecoder};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::scheduler::{FairScheduler, MultipathSink, StatusReport};
use crate::send_pipeline::{PacketSink, SendPipeline, UdpPacketSink};
use crate::shutdown::ShutdownSignal;

enum Role {
    Source {
        encoder: GenerationEncoder,
        multipath: Option<Arc<MultipathSink>>,
    },
    Destination {
        decoder: GenerationDecoder,
        counters: FairScheduler,
    },
    Relay(GenerationRecoder),
    Helper(GenerationHelper),
}

/// EndPoint is the place where all other parts of the protocol come together: it
///  listens on a UdpSocket, feeds incoming packets to its role's generation state
///  machine, and drives the periodic timer.
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    role: RwLock<Role>,
    config: Arc<RlncConfig>,
    shutdown: ShutdownSignal,
    /// woken whenever the source's block advances and frames can flow again
    block_advanced: Notify,
}

impl EndPoint {
    /// A frame source sending to one or more peers. With several peers, coded
    ///  packets are spread over them by the fair scheduler.
    pub async fn new_source(
        bind_addr: impl ToSocketAddrs,
        peer_addrs: &[SocketAddr],
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        Self::source_on(Self::bind(bind_addr).await?, peer_addrs, config, shutdown)
    }

    /// Like [Self::new_source] but on a pre-bound socket, e.g. for custom socket options.
    pub fn source_on(
        socket: Arc<UdpSocket>,
        peer_addrs: &[SocketAddr],
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        if peer_addrs.is_empty() {
            anyhow::bail!("a source needs at least one peer");
        }

        let (sink, multipath): (Arc<dyn PacketSink>, Option<Arc<MultipathSink>>) = if peer_addrs.len() == 1 {
            (Arc::new(UdpPacketSink::new(socket.clone(), peer_addrs[0])), None)
        }
        else {
            let sinks = peer_addrs.iter()
                .map(|addr| Arc::new(UdpPacketSink::new(socket.clone(), *addr)) as Arc<dyn PacketSink>)
                .collect();
            let multipath = Arc::new(MultipathSink::new(
                sinks,
                config.symbols,
                config.overshoot - 1.0,
                config.status_interval,
                (config.symbols as f64 * config.overshoot) as usize,
            ));
            (multipath.clone(), Some(multipath))
        };

        let encoder = GenerationEncoder::new(&config, 0, Self::pipeline(&config, sink));
        Ok(EndPoint {
            socket,
            role: RwLock::new(Role::Source { encoder, multipath }),
            config,
            shutdown,
            block_advanced: Notify::new(),
        })
    }

    /// A frame destination delivering decoded frames to the dispatcher.
    pub async fn new_destination(
        bind_addr: impl ToSocketAddrs,
        ack_addr: SocketAddr,
        dispatcher: Arc<dyn FrameDispatcher>,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        Self::destination_on(Self::bind(bind_addr).await?, ack_addr, dispatcher, config, shutdown)
    }

    pub fn destination_on(
        socket: Arc<UdpSocket>,
        ack_addr: SocketAddr,
        dispatcher: Arc<dyn FrameDispatcher>,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let sink: Arc<dyn PacketSink> = Arc::new(UdpPacketSink::new(socket.clone(), ack_addr));
        let decoder = GenerationDecoder::new(&config, 0, Self::pipeline(&config, sink), dispatcher);
        let counters = FairScheduler::new(
            config.symbols,
            config.overshoot - 1.0,
            config.status_interval,
            (config.symbols as f64 * config.overshoot) as usize,
        );

        Ok(EndPoint {
            socket,
            role: RwLock::new(Role::Destination { decoder, counters }),
            config,
            shutdown,
            block_advanced: Notify::new(),
        })
    }

    /// A relay forwarding recoded traffic towards the destination.
    pub async fn new_relay(
        bind_addr: impl ToSocketAddrs,
        peer_addr: SocketAddr,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        Self::relay_on(Self::bind(bind_addr).await?, peer_addr, config, shutdown)
    }

    pub fn relay_on(
        socket: Arc<UdpSocket>,
        peer_addr: SocketAddr,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let sink: Arc<dyn PacketSink> = Arc::new(UdpPacketSink::new(socket.clone(), peer_addr));
        let recoder = GenerationRecoder::new(&config, 0, Self::pipeline(&config, sink));

        Ok(EndPoint {
            socket,
            role: RwLock::new(Role::Relay(recoder)),
            config,
            shutdown,
            block_advanced: Notify::new(),
        })
    }

    /// An overhearing helper injecting recombinations towards the destination.
    pub async fn new_helper(
        bind_addr: impl ToSocketAddrs,
        peer_addr: SocketAddr,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        Self::helper_on(Self::bind(bind_addr).await?, peer_addr, config, shutdown)
    }

    pub fn helper_on(
        socket: Arc<UdpSocket>,
        peer_addr: SocketAddr,
        config: Arc<RlncConfig>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let sink: Arc<dyn PacketSink> = Arc::new(UdpPacketSink::new(socket.clone(), peer_addr));
        let helper = GenerationHelper::new(&config, 0, Self::pipeline(&config, sink));

        Ok(EndPoint {
            socket,
            role: RwLock::new(Role::Helper(helper)),
            config,
            shutdown,
            block_advanced: Notify::new(),
        })
    }

    async fn bind(bind_addr: impl ToSocketAddrs) -> anyhow::Result<Arc<UdpSocket>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);
        Ok(socket)
    }

    fn pipeline(config: &RlncConfig, sink: Arc<dyn PacketSink>) -> SendPipeline {
        match config.loss {
            Some(prob) => SendPipeline::with_loss(sink, prob),
            None => SendPipeline::new(sink),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Hands one application frame to the source, waiting while the current block
    ///  is full. Errors on non-source endpoints and on oversized frames.
    pub async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        loop {
            // registered before the check so a block advance in between is not lost
            let advanced = self.block_advanced.notified();
            {
                let mut role = self.role.write().await;
                let Role::Source { encoder, .. } = &mut *role else {
                    anyhow::bail!("only a source endpoint accepts frames");
                };
                if !encoder.is_full() {
                    return encoder.put(frame).await;
                }
            }
            trace!("block full - waiting for it to advance");
            advanced.await;
        }
    }

    /// Receives and dispatches packets until shutdown. Dropped silently on parse
    ///  errors, terminated on socket errors.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut shutdown = self.shutdown.clone();
        let mut timer = tokio::time::interval(self.config.timeout);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut buf = vec![0u8; PacketHeader::SERIALIZED_LEN + self.config.coded_payload_len()];
        loop {
            let (num_read, from) = tokio::select! {
                _ = shutdown.wait() => {
                    info!("shutdown requested - leaving receive loop");
                    return;
                }
                _ = timer.tick() => {
                    self.on_timer().await;
                    continue;
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {} - leaving receive loop", e);
                        return;
                    }
                },
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received {} bytes from {:?}", num_read, from);

            let parse_buf = &mut &buf[..num_read];
            let header = match PacketHeader::deser(parse_buf) {
                Ok(header) => header,
                Err(_) => {
                    warn!("received packet with unparsable header from {:?} - dropping", from);
                    continue;
                }
            };

            if let Err(e) = self.dispatch(&header, parse_buf, from).await {
                debug!("error handling {:?} packet from {:?}: {}", header.kind, from, e);
            }
        }
    }

    async fn dispatch(&self, header: &PacketHeader, parse_buf: &mut &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let mut role = self.role.write().await;
        match &mut *role {
            Role::Source { encoder, multipath } => match header.kind {
                PacketKind::Ack => {
                    let before = encoder.block();
                    encoder.on_ack(header, parse_buf).await?;
                    if encoder.block() != before {
                        if let Some(multipath) = multipath {
                            multipath.start_round().await;
                        }
                        self.block_advanced.notify_waiters();
                    }
                }
                PacketKind::Stop => encoder.on_stop(),
                PacketKind::Status => {
                    let report = StatusReport::deser(parse_buf)?;
                    if let Some(multipath) = multipath {
                        let max = multipath.apply_status_report(&report).await;
                        debug!("status report applied, {} packets per round", max);
                    }
                }
                other => debug!("source ignores {:?} packets", other),
            },

            Role::Destination { decoder, counters } => match header.kind {
                PacketKind::Enc | PacketKind::Rec | PacketKind::Hlp => {
                    let rank_before = decoder.rank();
                    decoder.on_packet(header, parse_buf).await?;
                    if decoder.rank() != rank_before {
                        if counters.counters(&from).is_none() {
                            counters.add_peer(from);
                        }
                        counters.record_received(&from);
                        self.maybe_send_status(counters, decoder.block()).await;
                    }
                }
                other => debug!("destination ignores {:?} packets", other),
            },

            Role::Relay(recoder) => match header.kind {
                PacketKind::Enc | PacketKind::Rec | PacketKind::Hlp => {
                    let was_complete = recoder.is_complete();
                    recoder.on_packet(header, parse_buf).await?;
                    if recoder.is_complete() && !was_complete {
                        // the relay holds the whole block, tell the origin to pause
                        let stop = recoder.stop_packet();
                        if let Err(e) = self.socket.send_to(&stop, from).await {
                            error!("error sending stop to {:?}: {}", from, e);
                        }
                    }
                }
                PacketKind::Ack => recoder.on_ack(header, parse_buf).await?,
                PacketKind::Stop => recoder.on_stop(),
                other => debug!("relay ignores {:?} packets", other),
            },

            Role::Helper(helper) => match header.kind {
                PacketKind::Enc | PacketKind::Rec => helper.on_packet(header, parse_buf).await?,
                PacketKind::Ack => helper.on_ack(header, parse_buf).await?,
                other => debug!("helper ignores {:?} packets", other),
            },
        }
        Ok(())
    }

    async fn maybe_send_status(&self, counters: &mut FairScheduler, block: BlockId) {
        let Some((best, report)) = counters.status_report(block) else {
            return;
        };

        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + 3 + 2 * report.counts.len());
        PacketHeader {
            kind: PacketKind::Status,
            group: 0,
            block,
            seq: 0,
        }.ser(&mut buf);
        report.ser(&mut buf);

        trace!("sending status report to best peer {:?}", best);
        if let Err(e) = self.socket.send_to(&buf, best).await {
            error!("error sending status report to {:?}: {}", best, e);
        }
    }

    async fn on_timer(&self) {
        let mut role = self.role.write().await;
        match &mut *role {
            Role::Source { encoder, .. } => encoder.on_timer().await,
            Role::Relay(recoder) => recoder.on_timer().await,
            Role::Destination { .. } | Role::Helper(_) => {}
        }
    }
}
