//! SOOD discovery of Cores on the local network.
//!
//! A background task keeps one receive/send socket pair per local IPv4
//! interface plus one unicast send socket, and:
//!
//! 1. Queries for the Core service id on start, then on a quieting schedule
//!    (see [`QuerySchedule`]).
//! 2. Re-scans the interface list every few seconds.  Sockets of interfaces
//!    that vanished are dropped; a changed interface set triggers an extra
//!    query.
//! 3. Decodes every datagram any socket receives and emits a
//!    [`DiscoveredCore`] for each Core announcement.
//!
//! # How SOOD works (for beginners)
//!
//! A query is a small UDP datagram sent to the multicast group
//! `239.255.90.90:9003` and to each interface's broadcast address.  Every
//! Core on the LAN answers with a reply datagram, unicast back to the socket
//! the query came from, carrying its `unique_id` and the `http_port` its
//! WebSocket listens on.  That is why the send sockets are read too: replies
//! arrive on them, not on the multicast receive sockets.
//!
//! Deduplicating announcements (a Core answers every query, on every
//! interface) is the caller's job; see [`PeerTracker`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moo_core::sood::{CORE_SERVICE_ID, SOOD_MULTICAST_IP, SOOD_PORT};
use moo_core::{decode_datagram, encode_datagram, ServiceAnnouncement, SoodMessage};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::infrastructure::storage::config::DiscoveryConfig;

/// Queries sent every tick before the schedule slows down.
const EAGER_QUERIES: i64 = 6;

/// Largest SOOD datagram accepted.
const MAX_DATAGRAM: usize = 65_535;

/// Error type for discovery start-up.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to list network interfaces: {0}")]
    Interfaces(#[source] io::Error),
}

/// A Core announcement and the address to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCore {
    pub announcement: ServiceAnnouncement,
    pub address: IpAddr,
}

/// Timer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub rescan_interval: Duration,
    pub query_interval: Duration,
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            rescan_interval: config.rescan_interval(),
            query_interval: config.query_interval(),
        }
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Decides which periodic ticks send a query.
///
/// The first six ticks all query; after that only every sixth does.  Nothing
/// is sent while the extension is paired.
#[derive(Debug)]
pub struct QuerySchedule {
    scan_count: i64,
}

impl Default for QuerySchedule {
    fn default() -> Self {
        Self { scan_count: -1 }
    }
}

impl QuerySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances one tick and reports whether to query on it.
    pub fn tick(&mut self, paired: bool) -> bool {
        self.scan_count += 1;
        if paired {
            return false;
        }
        self.scan_count < EAGER_QUERIES || self.scan_count % EAGER_QUERIES == 0
    }
}

/// Directed broadcast address of the subnet `ip/netmask`.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Address to dial for a reply from `source`.
///
/// A reply sent from one of this host's own interfaces is a Core running on
/// the same machine and is dialled over loopback.  This assumes the Core
/// listens on all interfaces, which holds for a single-host setup but not in
/// general.
pub fn connect_address(source: IpAddr, local: &[Ipv4Addr]) -> IpAddr {
    match source {
        IpAddr::V4(v4) if local.contains(&v4) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other,
    }
}

/// Suppresses a second connection attempt to a Core while the first one is
/// alive.
#[derive(Debug, Default)]
pub struct PeerTracker {
    active: HashSet<String>,
}

impl PeerTracker {
    /// Returns `true` and starts tracking `unique_id` if it is not tracked yet.
    pub fn try_begin(&mut self, unique_id: &str) -> bool {
        self.active.insert(unique_id.to_string())
    }

    /// Forgets `unique_id` so the next announcement connects again.
    pub fn release(&mut self, unique_id: &str) {
        self.active.remove(unique_id);
    }

    pub fn is_active(&self, unique_id: &str) -> bool {
        self.active.contains(unique_id)
    }
}

// ── Interfaces and sockets ────────────────────────────────────────────────────

/// One local IPv4 interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Lists every IPv4 interface, loopback included.
///
/// # Errors
///
/// Returns the OS error if the interface list cannot be read.
pub fn local_interfaces() -> io::Result<Vec<LocalInterface>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(LocalInterface {
                name: iface.name,
                ip: v4.ip,
                netmask: v4.netmask,
            }),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect())
}

type Datagram = (Vec<u8>, SocketAddr);

/// A bound socket and the task reading it.  Dropping it stops the reader.
struct SocketSlot {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

impl SocketSlot {
    fn start(socket: std::net::UdpSocket, label: String, tx: mpsc::UnboundedSender<Datagram>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let reader = tokio::spawn(read_datagrams(Arc::clone(&socket), label, tx));
        Ok(Self { socket, reader })
    }

    /// False once the reader hit a socket error; the slot is then rebuilt on
    /// the next rescan.
    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, label: String, tx: mpsc::UnboundedSender<Datagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if tx.send((buf[..len].to_vec(), src)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("SOOD {label}: receive failed: {e}");
                return;
            }
        }
    }
}

fn bind_recv_socket(iface: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SOOD_PORT).into())?;
    socket.join_multicast_v4(&SOOD_MULTICAST_IP, &iface)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_send_socket(iface: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_multicast_ttl_v4(1)?;
    if !iface.is_unspecified() {
        socket.set_multicast_if_v4(&iface)?;
    }
    socket.bind(&SocketAddrV4::new(iface, 0).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct InterfaceSockets {
    broadcast: Ipv4Addr,
    generation: u64,
    recv: Option<SocketSlot>,
    send: Option<SocketSlot>,
}

/// Every discovery socket, keyed by interface address.
struct SoodSockets {
    interfaces: HashMap<Ipv4Addr, InterfaceSockets>,
    unicast: Option<SocketSlot>,
    generation: u64,
    tx: mpsc::UnboundedSender<Datagram>,
}

impl SoodSockets {
    fn new(tx: mpsc::UnboundedSender<Datagram>) -> Self {
        Self {
            interfaces: HashMap::new(),
            unicast: None,
            generation: 0,
            tx,
        }
    }

    fn local_addresses(&self) -> Vec<Ipv4Addr> {
        self.interfaces.keys().copied().collect()
    }

    /// Brings the socket set in line with `list`.  Returns `true` if an
    /// interface appeared or disappeared.
    fn apply_interfaces(&mut self, list: &[LocalInterface]) -> bool {
        self.generation += 1;
        let generation = self.generation;
        let mut changed = false;

        for iface in list {
            let entry = self.interfaces.entry(iface.ip).or_insert_with(|| {
                info!("SOOD: listening on {} ({})", iface.ip, iface.name);
                changed = true;
                InterfaceSockets {
                    broadcast: broadcast_address(iface.ip, iface.netmask),
                    generation,
                    recv: None,
                    send: None,
                }
            });
            entry.generation = generation;
            entry.broadcast = broadcast_address(iface.ip, iface.netmask);

            if !entry.recv.as_ref().is_some_and(SocketSlot::is_alive) {
                entry.recv = open_slot(bind_recv_socket(iface.ip), format!("recv {}", iface.ip), &self.tx);
            }
            if !entry.send.as_ref().is_some_and(SocketSlot::is_alive) {
                entry.send = open_slot(bind_send_socket(iface.ip), format!("send {}", iface.ip), &self.tx);
            }
        }

        self.interfaces.retain(|ip, entry| {
            let keep = entry.generation == generation;
            if !keep {
                info!("SOOD: interface {ip} went away");
                changed = true;
            }
            keep
        });

        if !self.unicast.as_ref().is_some_and(SocketSlot::is_alive) {
            self.unicast = open_slot(bind_send_socket(Ipv4Addr::UNSPECIFIED), "unicast".to_string(), &self.tx);
        }
        changed
    }

    /// Sends `bytes` to the multicast group and every subnet broadcast
    /// address.  Individual send failures are logged and skipped.
    async fn query(&self, bytes: &[u8]) {
        let group = SocketAddr::from((SOOD_MULTICAST_IP, SOOD_PORT));
        for (ip, iface) in &self.interfaces {
            let Some(send) = &iface.send else { continue };
            let broadcast = SocketAddr::from((iface.broadcast, SOOD_PORT));
            for target in [group, broadcast] {
                if let Err(e) = send.socket.send_to(bytes, target).await {
                    debug!("SOOD: query via {ip} to {target} failed: {e}");
                }
            }
        }
        if let Some(unicast) = &self.unicast {
            if let Err(e) = unicast.socket.send_to(bytes, group).await {
                debug!("SOOD: unicast query failed: {e}");
            }
        }
    }
}

fn open_slot(
    bound: io::Result<std::net::UdpSocket>,
    label: String,
    tx: &mpsc::UnboundedSender<Datagram>,
) -> Option<SocketSlot> {
    match bound.and_then(|socket| SocketSlot::start(socket, label.clone(), tx.clone())) {
        Ok(slot) => Some(slot),
        Err(e) => {
            warn!("SOOD {label}: socket unavailable: {e}");
            None
        }
    }
}

/// Parses one datagram into a Core announcement.
fn announcement(bytes: &[u8], src: SocketAddr, local: &[Ipv4Addr]) -> Option<DiscoveredCore> {
    let message = match decode_datagram(bytes) {
        Ok(message) => message,
        Err(e) => {
            trace!("SOOD: ignoring datagram from {src}: {e}");
            return None;
        }
    };
    let announcement = ServiceAnnouncement::from_message(&message)?;
    Some(DiscoveredCore {
        address: connect_address(src.ip(), local),
        announcement,
    })
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// Starts discovery.  Returns the announcement channel and the task handle.
///
/// The task stops when `running` is cleared (checked on every timer tick) or
/// when the receiver is dropped.  Queries are suppressed while `paired` is
/// set.
///
/// # Errors
///
/// Returns [`DiscoveryError::Interfaces`] if the initial interface scan fails.
pub fn start_discovery(
    options: DiscoveryOptions,
    paired: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) -> Result<(mpsc::UnboundedReceiver<DiscoveredCore>, JoinHandle<()>), DiscoveryError> {
    let interfaces = local_interfaces().map_err(DiscoveryError::Interfaces)?;
    let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
    let (found_tx, found_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut sockets = SoodSockets::new(datagram_tx);
        sockets.apply_interfaces(&interfaces);
        run_discovery(sockets, datagram_rx, options, paired, running, found_tx).await;
    });
    Ok((found_rx, handle))
}

async fn run_discovery(
    mut sockets: SoodSockets,
    mut datagrams: mpsc::UnboundedReceiver<Datagram>,
    options: DiscoveryOptions,
    paired: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    found: mpsc::UnboundedSender<DiscoveredCore>,
) {
    let query = match encode_datagram(&SoodMessage::query(CORE_SERVICE_ID)) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("SOOD: cannot encode query: {e}");
            return;
        }
    };
    sockets.query(&query).await;

    let mut rescan = interval_at(Instant::now() + options.rescan_interval, options.rescan_interval);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut periodic = interval(options.query_interval);
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial query already went out.
    periodic.tick().await;
    let mut schedule = QuerySchedule::new();

    info!("SOOD discovery started");
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = rescan.tick() => match local_interfaces() {
                Ok(list) => {
                    if sockets.apply_interfaces(&list) {
                        sockets.query(&query).await;
                    }
                }
                Err(e) => warn!("SOOD: interface scan failed: {e}"),
            },
            _ = periodic.tick() => {
                if schedule.tick(paired.load(Ordering::Relaxed)) {
                    debug!("SOOD: periodic query");
                    sockets.query(&query).await;
                }
            }
            Some((bytes, src)) = datagrams.recv() => {
                if let Some(core) = announcement(&bytes, src, &sockets.local_addresses()) {
                    debug!(
                        "SOOD: core {} at {}:{}",
                        core.announcement.unique_id, core.address, core.announcement.http_port
                    );
                    if found.send(core).is_err() {
                        break;
                    }
                }
            }
        }
    }
    info!("SOOD discovery stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
