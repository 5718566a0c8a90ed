//! Forwarding engine: one listen port relayed to a backend over TCP and UDP
//!
//! Each accepted TCP connection gets its own upstream connection. UDP
//! datagrams are relayed per client address through a dedicated upstream
//! socket, which is dropped after the configured idle time.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rf_core::error::{ForwarderError, Transport};

use crate::telemetry::{StatsHandle, TrafficDelta};

/// Largest UDP payload relayed
const MAX_DATAGRAM: usize = 65_535;

/// What a forwarder binds and where it relays to
#[derive(Clone)]
pub struct ForwarderSpec {
    pub listen_port: u16,
    pub bind_address: IpAddr,
    pub backend_host: String,
    pub backend_port: u16,
    pub connect_timeout: Duration,
    pub udp_idle: Duration,
    pub stats: Option<StatsHandle>,
}

impl ForwarderSpec {
    fn backend(&self) -> (String, u16) {
        (self.backend_host.clone(), self.backend_port)
    }
}

/// Decrements the active gauge when dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(gauge))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running forwarder bound to one listen port
pub struct ForwarderInstance {
    spec: ForwarderSpec,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
    loops: Arc<AtomicUsize>,
}

impl ForwarderInstance {
    /// Bind the TCP and UDP listen sockets and start relaying.
    ///
    /// The instance stops when `parent` is cancelled or [`close`](Self::close)
    /// is called.
    pub async fn launch(
        mut spec: ForwarderSpec,
        parent: &CancellationToken,
    ) -> Result<Self, ForwarderError> {
        let addr = SocketAddr::new(spec.bind_address, spec.listen_port);
        let port = spec.listen_port;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(port, Transport::Tcp, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ForwarderError::Launch { port, source })?;
        // Port 0 resolves to the TCP port so both protocols share it
        spec.listen_port = local_addr.port();
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| bind_error(spec.listen_port, Transport::Udp, e))?;

        let instance = Self {
            spec,
            local_addr,
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            loops: Arc::new(AtomicUsize::new(0)),
        };

        instance.spawn_loop(tcp_accept_loop(
            listener,
            instance.spec.clone(),
            instance.cancel.clone(),
            instance.tracker.clone(),
            Arc::clone(&instance.active),
        ));
        instance.spawn_loop(udp_relay_loop(
            Arc::new(socket),
            instance.spec.clone(),
            instance.cancel.clone(),
            instance.tracker.clone(),
            Arc::clone(&instance.active),
        ));

        tracing::info!(
            "Forwarder listening on {} -> {}:{}",
            local_addr,
            instance.spec.backend_host,
            instance.spec.backend_port
        );
        Ok(instance)
    }

    fn spawn_loop<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let loops = Arc::clone(&self.loops);
        loops.fetch_add(1, Ordering::SeqCst);
        self.tracker.spawn(async move {
            fut.await;
            loops.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub fn backend_host(&self) -> &str {
        &self.spec.backend_host
    }

    /// Address a local liveness probe should connect to
    pub fn probe_addr(&self) -> SocketAddr {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local_addr.port())
    }

    /// Whether both relay loops are still running
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && self.loops.load(Ordering::SeqCst) == 2
    }

    /// Open TCP connections plus live UDP sessions
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Token cancelled when this instance stops
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop relaying without waiting, leaving the instance dead in place
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Stop relaying and wait until the listen sockets are released
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Forwarder on port {} closed", self.spec.listen_port);
    }
}

fn bind_error(port: u16, transport: Transport, source: std::io::Error) -> ForwarderError {
    if source.kind() == std::io::ErrorKind::AddrInUse {
        ForwarderError::PortInUse {
            port,
            transport,
            source,
        }
    } else {
        ForwarderError::Launch { port, source }
    }
}

async fn tcp_accept_loop(
    listener: TcpListener,
    spec: ForwarderSpec,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = ActiveGuard::new(&active);
                    let spec = spec.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        let _guard = guard;
                        tokio::select! {
                            _ = relay_tcp(stream, peer, &spec) => {}
                            _ = cancel.cancelled() => {}
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed on port {}: {}", spec.listen_port, e);
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

async fn relay_tcp(mut client: TcpStream, peer: SocketAddr, spec: &ForwarderSpec) {
    let upstream = tokio::time::timeout(spec.connect_timeout, TcpStream::connect(spec.backend())).await;
    let mut upstream = match upstream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(
                "Backend {}:{} unreachable for {}: {}",
                spec.backend_host,
                spec.backend_port,
                peer,
                e
            );
            return;
        }
        Err(_) => {
            tracing::debug!("Backend connect timed out for {}", peer);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, to_client)) => {
            tracing::trace!(
                peer = %peer,
                bytes_in = from_client,
                bytes_out = to_client,
                "TCP relay finished"
            );
            if let Some(stats) = &spec.stats {
                stats
                    .record(TrafficDelta {
                        bytes_sent: to_client,
                        bytes_received: from_client,
                        ..Default::default()
                    })
                    .await;
            }
        }
        Err(e) => tracing::debug!("TCP relay for {} ended: {}", peer, e),
    }
}

/// State of one UDP client
struct UdpSession {
    upstream: Arc<UdpSocket>,
    /// Milliseconds after `epoch` of the last datagram in either direction
    last_active: Arc<AtomicU64>,
    counters: Arc<UdpCounters>,
}

#[derive(Default)]
struct UdpCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

impl UdpCounters {
    fn take(&self) -> TrafficDelta {
        TrafficDelta {
            bytes_sent: self.bytes_out.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_in.swap(0, Ordering::Relaxed),
            packets_sent: self.packets_out.swap(0, Ordering::Relaxed),
            packets_received: self.packets_in.swap(0, Ordering::Relaxed),
        }
    }
}

async fn udp_relay_loop(
    socket: Arc<UdpSocket>,
    spec: ForwarderSpec,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
) {
    let sessions: Arc<DashMap<SocketAddr, UdpSession>> = Arc::new(DashMap::new());
    let epoch = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, client) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("UDP receive on port {} failed: {}", spec.listen_port, e);
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let existing = sessions.get(&client).map(|s| {
            (
                Arc::clone(&s.upstream),
                Arc::clone(&s.last_active),
                Arc::clone(&s.counters),
            )
        });
        let (upstream, last_active, counters) = match existing {
            Some(session) => session,
            None => match open_udp_session(&spec).await {
                Ok(upstream) => {
                    let session = UdpSession {
                        upstream: Arc::new(upstream),
                        last_active: Arc::new(AtomicU64::new(0)),
                        counters: Arc::new(UdpCounters::default()),
                    };
                    let handles = (
                        Arc::clone(&session.upstream),
                        Arc::clone(&session.last_active),
                        Arc::clone(&session.counters),
                    );
                    sessions.insert(client, session);
                    tracker.spawn(udp_reply_loop(
                        client,
                        Arc::clone(&socket),
                        Arc::clone(&sessions),
                        spec.clone(),
                        cancel.child_token(),
                        ActiveGuard::new(&active),
                        epoch,
                    ));
                    handles
                }
                Err(e) => {
                    tracing::debug!("No UDP session for {}: {}", client, e);
                    continue;
                }
            },
        };

        last_active.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        counters.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        counters.packets_in.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = upstream.send(&buf[..len]).await {
            tracing::debug!("UDP send upstream for {} failed: {}", client, e);
        }
    }
}

async fn open_udp_session(spec: &ForwarderSpec) -> std::io::Result<UdpSocket> {
    let backend = tokio::net::lookup_host(spec.backend())
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "backend did not resolve"))?;
    let local: SocketAddr = if backend.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(backend).await?;
    Ok(upstream)
}

/// Relay backend replies to one client until the session goes idle
async fn udp_reply_loop(
    client: SocketAddr,
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, UdpSession>>,
    spec: ForwarderSpec,
    cancel: CancellationToken,
    _guard: ActiveGuard,
    epoch: Instant,
) {
    let Some((upstream, last_active, counters)) = sessions.get(&client).map(|s| {
        (
            Arc::clone(&s.upstream),
            Arc::clone(&s.last_active),
            Arc::clone(&s.counters),
        )
    }) else {
        return;
    };
    let idle_millis = spec.udp_idle.as_millis() as u64;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = tokio::time::timeout(spec.udp_idle, upstream.recv(&mut buf)) => match received {
                Ok(Ok(len)) => {
                    last_active.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                    counters.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
                    counters.packets_out.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = socket.send_to(&buf[..len], client).await {
                        tracing::debug!("UDP reply to {} failed: {}", client, e);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!("UDP upstream for {} failed: {}", client, e);
                    break;
                }
                Err(_) => {
                    let idle = (epoch.elapsed().as_millis() as u64)
                        .saturating_sub(last_active.load(Ordering::Relaxed));
                    if idle >= idle_millis {
                        tracing::trace!("UDP session for {} idle, dropping", client);
                        break;
                    }
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    sessions.remove(&client);
    if let Some(stats) = &spec.stats {
        stats.record(counters.take()).await;
    }
}
