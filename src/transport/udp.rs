//! Local-mesh transport over UDP datagrams
//!
//! One frame per datagram. Neighbors are the configured seed sockets plus
//! every socket a frame has been received from.

use crate::peer::PeerId;
use crate::transport::codec::{decode_frame, MAX_FRAME_SIZE};
use crate::transport::error::TransportResult;
use crate::transport::types::{
    InboundFrame, InboundSink, LinkDestination, SendOutcome, TransportKind, UdpMeshConfig,
};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub struct UdpMeshTransport {
    local: PeerId,
    socket: Arc<UdpSocket>,
    seeds: Vec<SocketAddr>,
    /// Last socket each transmitter was heard from
    routes: Arc<DashMap<PeerId, SocketAddr>>,
    sinks: Arc<Mutex<Vec<InboundSink>>>,
    open: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMeshTransport {
    /// Bind the datagram socket and start the receive loop
    pub async fn bind(config: &UdpMeshConfig, local: PeerId) -> TransportResult<Arc<Self>> {
        let socket = Socket::new(
            Domain::for_address(config.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&config.bind_addr.into())?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        let transport = Arc::new(Self {
            local,
            socket,
            seeds: config.seeds.clone(),
            routes: Arc::new(DashMap::new()),
            sinks: Arc::new(Mutex::new(Vec::new())),
            open: AtomicBool::new(true),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::receive_loop(
            transport.local,
            transport.socket.clone(),
            transport.routes.clone(),
            transport.sinks.clone(),
        ));
        *transport.recv_task.lock() = Some(task);

        tracing::info!(
            addr = %transport.local_addr()?,
            seeds = transport.seeds.len(),
            "UDP mesh transport bound"
        );
        Ok(transport)
    }

    async fn receive_loop(
        local: PeerId,
        socket: Arc<UdpSocket>,
        routes: Arc<DashMap<PeerId, SocketAddr>>,
        sinks: Arc<Mutex<Vec<InboundSink>>>,
    ) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("UDP receive error: {}", e);
                    continue;
                }
            };

            let (from, envelope) = match decode_frame(&buf[..len]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!(%addr, "Dropping malformed datagram: {}", e);
                    continue;
                }
            };
            // Our own broadcast echoed back
            if from == local {
                continue;
            }

            routes.insert(from, addr);
            let frame = InboundFrame {
                envelope,
                from,
                via: TransportKind::LocalMesh,
                address: addr.to_string(),
            };

            fan_out(&sinks, frame);
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sockets a broadcast would currently reach
    pub fn neighbor_sockets(&self, exclude: &[PeerId]) -> Vec<SocketAddr> {
        let excluded: BTreeSet<SocketAddr> = exclude
            .iter()
            .filter_map(|id| self.routes.get(id).map(|entry| *entry.value()))
            .collect();

        let mut targets: BTreeSet<SocketAddr> = self.seeds.iter().copied().collect();
        targets.extend(self.routes.iter().map(|entry| *entry.value()));
        targets.retain(|addr| !excluded.contains(addr));
        targets.into_iter().collect()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

fn fan_out(sinks: &Mutex<Vec<InboundSink>>, frame: InboundFrame) {
    let mut sinks = sinks.lock();
    sinks.retain(|sink| !sink.is_closed());
    for sink in sinks.iter() {
        let _ = sink.send(frame.clone());
    }
}

impl Drop for UdpMeshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for UdpMeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalMesh
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn send(&self, frame: Bytes, destination: &LinkDestination) -> SendOutcome {
        if !self.is_available() {
            return SendOutcome::TransportUnavailable;
        }

        let targets = match destination {
            LinkDestination::Peer(peer) => match self.routes.get(peer) {
                Some(addr) => vec![*addr.value()],
                None => return SendOutcome::DestinationUnreachable,
            },
            LinkDestination::Broadcast { exclude } => self.neighbor_sockets(exclude),
        };

        let mut failures = 0;
        for addr in &targets {
            if let Err(e) = self.socket.send_to(&frame, addr).await {
                tracing::debug!(%addr, "UDP send failed: {}", e);
                failures += 1;
            }
        }

        if !targets.is_empty() && failures == targets.len() {
            SendOutcome::TransportUnavailable
        } else {
            SendOutcome::AcceptedForTransmission
        }
    }

    fn subscribe(&self, sink: InboundSink) {
        self.sinks.lock().push(sink);
    }
}
