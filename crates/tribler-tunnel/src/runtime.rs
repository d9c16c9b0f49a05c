//! Tokio event loop driving a [`TunnelEngine`].
//!
//! One task owns the engine and multiplexes the overlay socket, exit-socket
//! replies, handle commands, engine events and the periodic timers
//! (request expiry, keepalive, stats sampling, top-up, crawling). Handles
//! talk to the loop over a bounded command channel.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use tribler_crypto::x25519::X25519StaticSecret;
use tribler_wire::HostPort;

use crate::engine::{EngineIo, TunnelCounters, TunnelEngine};
use crate::exit::{ExitFactory, ExitSocket};
use crate::observer::{ChannelObserver, TunnelEvent, TunnelObserver};
use crate::overlay::{CandidateSource, Endpoint};
use crate::peer::{LinkKey, Peer};
use crate::pool::{ReservationPool, SessionId};
use crate::settings::{SelectionPolicy, TunnelSettings};
use crate::strategy::{CircuitSummary, SelectionStrategy};
use crate::tables::SharedTables;
use crate::{Result, TunnelError, STATS_SAMPLE_INTERVAL};

/// Capacity of the handle command channel.
const COMMAND_QUEUE: usize = 1024;

/// Datagrams buffered per session before new ones are dropped.
const SESSION_QUEUE: usize = 256;

/// Granularity of request-cache expiry and reservation polling.
const TICK: Duration = Duration::from_millis(100);

const MAX_DATAGRAM: usize = 65_536;

/// Tunnel data delivered to a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelDatagram {
    pub circuit_id: u32,
    /// Where the exit received it from.
    pub origin: Option<HostPort>,
    pub payload: Vec<u8>,
}

enum Command {
    OpenSession {
        circuits: usize,
        grace: Duration,
        selection: SelectionPolicy,
        reply: oneshot::Sender<Result<TunnelSession>>,
    },
    SendTo {
        session: SessionId,
        destination: HostPort,
        payload: Vec<u8>,
    },
    Release {
        session: SessionId,
    },
    CreateCircuit {
        goal_hops: Option<usize>,
        reply: oneshot::Sender<Result<u32>>,
    },
    ReadyCircuits {
        reply: oneshot::Sender<Vec<CircuitSummary>>,
    },
    Counters {
        reply: oneshot::Sender<TunnelCounters>,
    },
    RequestStats {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Cloneable handle on a running tunnel loop.
#[derive(Clone, Debug)]
pub struct TunnelHandle {
    commands: mpsc::Sender<Command>,
    own: Peer,
    tables: SharedTables,
    default_selection: SelectionPolicy,
}

impl TunnelHandle {
    pub fn own_peer(&self) -> Peer {
        self.own
    }

    /// Circuit and relay tables, for readers off the loop.
    pub fn tables(&self) -> SharedTables {
        Arc::clone(&self.tables)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| TunnelError::Stopped)?;
        rx.await.map_err(|_| TunnelError::Stopped)
    }

    /// Reserve `circuits` READY circuits for a new session, waiting up to
    /// `grace` for them to be built.
    pub async fn open_session(&self, circuits: usize, grace: Duration) -> Result<TunnelSession> {
        let selection = self.default_selection;
        self.request(|reply| Command::OpenSession {
            circuits,
            grace,
            selection,
            reply,
        })
        .await?
    }

    pub async fn create_circuit(&self, goal_hops: Option<usize>) -> Result<u32> {
        self.request(|reply| Command::CreateCircuit { goal_hops, reply })
            .await?
    }

    pub async fn ready_circuits(&self) -> Result<Vec<CircuitSummary>> {
        self.request(|reply| Command::ReadyCircuits { reply }).await
    }

    pub async fn counters(&self) -> Result<TunnelCounters> {
        self.request(|reply| Command::Counters { reply }).await
    }

    /// Send STATS requests to every verified candidate.
    pub async fn request_stats(&self) -> Result<usize> {
        self.request(|reply| Command::RequestStats { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// A client session holding reserved circuits.
///
/// Dropping the session returns its circuits to the pool.
#[derive(Debug)]
pub struct TunnelSession {
    id: SessionId,
    circuits: Vec<u32>,
    commands: mpsc::Sender<Command>,
    data: mpsc::Receiver<TunnelDatagram>,
}

impl TunnelSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Circuits reserved when the session was opened.
    pub fn circuits(&self) -> &[u32] {
        &self.circuits
    }

    /// Queue a datagram for `destination`. A full queue drops it.
    pub fn send_to(&self, destination: HostPort, payload: Vec<u8>) -> Result<()> {
        match self.commands.try_send(Command::SendTo {
            session: self.id,
            destination,
            payload,
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(session = self.id, "command queue full, datagram dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TunnelError::Stopped),
        }
    }

    /// Next datagram from the tunnel. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<TunnelDatagram> {
        self.data.recv().await
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Release { session: self.id });
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OpenSession { .. } => "OpenSession",
            Self::SendTo { .. } => "SendTo",
            Self::Release { .. } => "Release",
            Self::CreateCircuit { .. } => "CreateCircuit",
            Self::ReadyCircuits { .. } => "ReadyCircuits",
            Self::Counters { .. } => "Counters",
            Self::RequestStats { .. } => "RequestStats",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// A running tunnel loop.
pub struct TunnelRuntime {
    handle: TunnelHandle,
    task: JoinHandle<()>,
}

impl TunnelRuntime {
    /// Spawn the loop on the current tokio runtime.
    pub fn start(
        socket: UdpSocket,
        secret: X25519StaticSecret,
        settings: TunnelSettings,
        candidates: Arc<dyn CandidateSource>,
        observers: Vec<Box<dyn TunnelObserver>>,
    ) -> Result<Self> {
        let own_address = socket.local_addr()?;
        // Sends go through a std clone so they never wait on tokio readiness.
        let std_socket = socket.into_std()?;
        let sender = std_socket.try_clone()?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let io = EngineIo {
            endpoint: Box::new(UdpEndpoint { socket: sender }),
            candidates,
            exits: Box::new(UdpExitFactory { events: exit_tx }),
        };
        let mut engine = TunnelEngine::new(
            secret,
            own_address,
            settings.clone(),
            io,
            StdRng::from_entropy(),
            Instant::now(),
        );
        engine.add_observer(Box::new(ChannelObserver::new(event_tx)));
        for observer in observers {
            engine.add_observer(observer);
        }

        let handle = TunnelHandle {
            commands: command_tx.clone(),
            own: engine.own_peer(),
            tables: engine.tables(),
            default_selection: settings.selection,
        };
        info!(address = %own_address, "tunnel runtime started");

        let event_loop = EventLoop {
            engine,
            settings,
            socket,
            commands: command_rx,
            command_tx: command_tx.downgrade(),
            events: event_rx,
            exit_events: exit_rx,
            pool: ReservationPool::new(),
            sessions: HashMap::new(),
            pending: Vec::new(),
            next_session: 1,
        };
        let task = tokio::spawn(event_loop.run());
        Ok(Self { handle, task })
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "tunnel loop ended abnormally");
        }
    }
}

struct ActiveSession {
    wanted: usize,
    selector: Box<dyn SelectionStrategy>,
    data: mpsc::Sender<TunnelDatagram>,
    grace: Duration,
    starved_since: Option<Instant>,
}

struct PendingSession {
    id: SessionId,
    wanted: usize,
    grace: Duration,
    deadline: Instant,
    selection: SelectionPolicy,
    reply: oneshot::Sender<Result<TunnelSession>>,
}

struct EventLoop {
    engine: TunnelEngine,
    settings: TunnelSettings,
    socket: Arc<UdpSocket>,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::WeakSender<Command>,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
    exit_events: mpsc::UnboundedReceiver<ExitEvent>,
    pool: ReservationPool,
    sessions: HashMap<SessionId, ActiveSession>,
    pending: Vec<PendingSession>,
    next_session: SessionId,
}

impl EventLoop {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut tick = interval(TICK);
        let mut keepalive = interval(self.settings.keepalive_interval);
        let mut stats = interval(STATS_SAMPLE_INTERVAL);
        let mut top_up = interval(self.settings.top_up_interval);
        let crawling = self.settings.crawl_interval.is_some();
        let mut crawl = interval(self.settings.crawl_interval.unwrap_or(Duration::from_secs(3600)));
        for timer in [&mut tick, &mut keepalive, &mut stats, &mut top_up, &mut crawl] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => self.engine.on_datagram(source, &buf[..len], Instant::now()),
                    Err(e) => debug!(error = %e, "overlay receive failed"),
                },
                Some(exit) = self.exit_events.recv() => match exit {
                    ExitEvent::Reply { link, from, payload } => {
                        self.engine.on_exit_reply(link, from, &payload, Instant::now());
                    }
                    ExitEvent::Failed { link, bytes } => self.engine.on_exit_failure(link, bytes),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command, Instant::now()),
                },
                Some(event) = self.events.recv() => self.on_event(event, Instant::now()),
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.engine.on_tick(now);
                    self.poll_sessions(now);
                }
                _ = keepalive.tick() => self.engine.keepalive(Instant::now()),
                _ = stats.tick() => self.engine.sample_stats(Instant::now()),
                _ = top_up.tick() => {
                    self.engine.top_up(Instant::now());
                }
                _ = crawl.tick(), if crawling => {
                    self.engine.request_stats();
                }
            }
        }
        info!("tunnel runtime stopped");
    }

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::OpenSession {
                circuits,
                grace,
                selection,
                reply,
            } => self.open_session(circuits, grace, selection, reply, now),
            Command::SendTo {
                session,
                destination,
                payload,
            } => self.send_to(session, destination, &payload, now),
            Command::Release { session } => self.release(session),
            Command::CreateCircuit { goal_hops, reply } => {
                let _ = reply.send(self.engine.create_circuit(goal_hops, now));
            }
            Command::ReadyCircuits { reply } => {
                let _ = reply.send(self.engine.ready_circuits());
            }
            Command::Counters { reply } => {
                let _ = reply.send(self.engine.counters());
            }
            Command::RequestStats { reply } => {
                let _ = reply.send(self.engine.request_stats());
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: TunnelEvent, now: Instant) {
        match event {
            TunnelEvent::CircuitReady { .. } => self.poll_sessions(now),
            TunnelEvent::BreakCircuit { circuit_id, .. } => {
                if let Some(session) = self.pool.forget_circuit(circuit_id) {
                    debug!(session, circuit_id, "reserved circuit broke");
                }
            }
            TunnelEvent::TunnelData {
                circuit_id,
                origin,
                payload,
            } => {
                let Some(session) = self.pool.owner(circuit_id) else {
                    trace!(circuit_id, "tunnel data for no session");
                    return;
                };
                if let Some(active) = self.sessions.get(&session) {
                    let datagram = TunnelDatagram {
                        circuit_id,
                        origin,
                        payload,
                    };
                    if active.data.try_send(datagram).is_err() {
                        trace!(session, circuit_id, "session queue full, datagram dropped");
                    }
                }
            }
            TunnelEvent::TunnelStats { .. } | TunnelEvent::ExitingFromTunnel { .. } => {}
        }
    }

    fn open_session(
        &mut self,
        wanted: usize,
        grace: Duration,
        selection: SelectionPolicy,
        reply: oneshot::Sender<Result<TunnelSession>>,
        now: Instant,
    ) {
        let id = self.next_session;
        self.next_session += 1;

        let ready = self.engine.ready_circuits();
        let held = self.pool.reserve(id, wanted, &ready).map(|c| c.len()).unwrap_or(0);
        let extending = self.engine.extending_circuits();
        let missing = wanted.saturating_sub(held + extending);
        for _ in 0..missing {
            if let Err(e) = self.engine.create_circuit(None, now) {
                debug!(session = id, error = %e, "cannot build circuit for session");
                break;
            }
        }
        debug!(session = id, wanted, held, "session opening");
        self.pending.push(PendingSession {
            id,
            wanted,
            grace,
            deadline: now + grace,
            selection,
            reply,
        });
        self.poll_sessions(now);
    }

    /// Complete pending sessions and refill active ones.
    fn poll_sessions(&mut self, now: Instant) {
        let ready = self.engine.ready_circuits();

        let pending = std::mem::take(&mut self.pending);
        for session in pending {
            let held = self
                .pool
                .reserve(session.id, session.wanted, &ready)
                .map(|c| c.len())
                .unwrap_or(0);
            if held >= session.wanted || (now >= session.deadline && held > 0) {
                self.activate(session);
            } else if now >= session.deadline {
                self.pool.release(session.id);
                info!(session = session.id, wanted = session.wanted, "session starved");
                let _ = session.reply.send(Err(TunnelError::NotEnoughCircuits {
                    wanted: session.wanted,
                    available: 0,
                }));
            } else {
                self.pending.push(session);
            }
        }

        let mut starved = Vec::new();
        let mut gone = Vec::new();
        for (id, active) in &mut self.sessions {
            // The handle dropped without its Release getting through.
            if active.data.is_closed() {
                gone.push(*id);
                continue;
            }
            if self.pool.is_short(*id, active.wanted) {
                let _ = self.pool.reserve(*id, active.wanted, &ready);
            }
            if self.pool.circuits(*id).is_empty() {
                let since = *active.starved_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= active.grace {
                    starved.push(*id);
                }
            } else {
                active.starved_since = None;
            }
        }
        for id in gone {
            self.release(id);
        }
        for id in starved {
            info!(session = id, "session lost all circuits");
            self.release(id);
        }
    }

    fn activate(&mut self, pending: PendingSession) {
        let Some(commands) = self.command_tx.upgrade() else {
            return;
        };
        let (data_tx, data_rx) = mpsc::channel(SESSION_QUEUE);
        let circuits = self.pool.circuits(pending.id).to_vec();
        let session = TunnelSession {
            id: pending.id,
            circuits: circuits.clone(),
            commands,
            data: data_rx,
        };
        self.sessions.insert(
            pending.id,
            ActiveSession {
                wanted: pending.wanted,
                selector: pending.selection.build(),
                data: data_tx,
                grace: pending.grace,
                starved_since: None,
            },
        );
        info!(session = pending.id, ?circuits, "session open");
        // If the caller went away the returned session is dropped, which
        // releases it again.
        let _ = pending.reply.send(Ok(session));
    }

    fn send_to(&mut self, session: SessionId, destination: HostPort, payload: &[u8], now: Instant) {
        let Some(active) = self.sessions.get_mut(&session) else {
            return;
        };
        let allowed = self.pool.circuits(session);
        if let Err(e) = self
            .engine
            .send_via(destination, payload, allowed, active.selector.as_mut(), now)
        {
            trace!(session, error = %e, "session datagram dropped");
        }
    }

    fn release(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        self.pending.retain(|p| p.id != session);
        let circuits = self.pool.release(session);
        if !circuits.is_empty() {
            debug!(session, ?circuits, "session released");
        }
    }
}

/// Overlay endpoint writing straight to the socket.
struct UdpEndpoint {
    socket: std::net::UdpSocket,
}

impl Endpoint for UdpEndpoint {
    fn send(&self, to: SocketAddr, datagram: &[u8]) {
        if let Err(e) = self.socket.send_to(datagram, to) {
            debug!(%to, error = %e, "overlay send failed");
        }
    }
}

/// What exit sockets report back to the loop.
#[derive(Debug)]
enum ExitEvent {
    /// A datagram received by the exit socket of `link`.
    Reply {
        link: LinkKey,
        from: SocketAddr,
        payload: Vec<u8>,
    },
    /// A send that was accepted but failed after resolution.
    Failed { link: LinkKey, bytes: usize },
}

struct UdpExitFactory {
    events: mpsc::UnboundedSender<ExitEvent>,
}

impl ExitFactory for UdpExitFactory {
    fn open(&mut self, link: LinkKey) -> io::Result<Box<dyn ExitSocket>> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        let reader_socket = UdpSocket::from_std(socket.try_clone()?)?;

        let replies = self.events.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let reply = ExitEvent::Reply {
                            link,
                            from,
                            payload: buf[..len].to_vec(),
                        };
                        if replies.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%link, error = %e, "exit receive failed");
                    }
                }
            }
        });
        Ok(Box::new(UdpExitSocket {
            link,
            socket: Arc::new(socket),
            events: self.events.clone(),
            reader,
        }))
    }
}

struct UdpExitSocket {
    link: LinkKey,
    socket: Arc<std::net::UdpSocket>,
    events: mpsc::UnboundedSender<ExitEvent>,
    reader: JoinHandle<()>,
}

impl ExitSocket for UdpExitSocket {
    fn send_to(&mut self, destination: &HostPort, payload: &[u8]) -> io::Result<usize> {
        if let Some(address) = destination.to_socket_addr() {
            return self.socket.send_to(payload, address);
        }
        // DNS names resolve off the loop; failures come back as ExitEvent::Failed.
        let socket = Arc::clone(&self.socket);
        let events = self.events.clone();
        let link = self.link;
        let target = destination.to_string();
        let payload = payload.to_vec();
        let len = payload.len();
        tokio::spawn(async move {
            let sent = match tokio::net::lookup_host(&target).await.map(|mut a| a.next()) {
                Ok(Some(address)) => socket.send_to(&payload, address).map(|_| ()),
                Ok(None) => Err(io::Error::new(io::ErrorKind::NotFound, "no address")),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!(%target, error = %e, "exit send failed");
                let _ = events.send(ExitEvent::Failed { link, bytes: len });
            }
        });
        Ok(len)
    }
}

impl Drop for UdpExitSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
