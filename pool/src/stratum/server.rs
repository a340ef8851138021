/// Stratum server - one listener per difficulty tier
///
/// Every accepted socket gets its own task owning a `Connection` state
/// machine, plus a writer task fed through an unbounded channel. The task
/// multiplexes three inputs: client lines, job snapshots from the `JobBoard`
/// watch channel and the idle deadline. A fault in one connection ends only
/// that task.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::connection::Connection;
use super::protocol::{
    to_line, ClientMessage, StratumError, StratumNotification, StratumRequest, StratumResponse,
};
use super::Tier;
use crate::config::Config;
use crate::error::{PoolError, ProtocolError, Result};
use crate::jobs::{JobBoard, JobSnapshot};
use crate::metrics::prometheus as metrics;
use crate::shares::ShareProcessor;

/// Longest accepted request line, newline excluded
pub const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_host: String,
    pub extranonce2_size: usize,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub banned_ips: HashSet<IpAddr>,
}

impl ServerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bind_host: cfg.bind_host.clone(),
            extranonce2_size: cfg.extranonce2_size,
            idle_timeout: cfg.idle_timeout(),
            max_connections: cfg.max_connections,
            max_connections_per_ip: cfg.max_connections_per_ip,
            banned_ips: cfg.banned_ips.iter().copied().collect(),
        }
    }
}

/// A tier whose socket is bound and listening
pub struct BoundTier {
    pub tier: Arc<Tier>,
    listener: TcpListener,
}

impl BoundTier {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Releases the connection slots when the connection task ends
struct Admission {
    server: Arc<StratumServer>,
    ip: IpAddr,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.server.release(self.ip);
    }
}

/// Frames client input into lines of at most `MAX_LINE_BYTES`. A partial
/// line stays in the codec buffer when a pending read is dropped.
fn line_reader<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
}

/// Next line without its terminator, `None` at EOF. A final unterminated
/// line still counts.
async fn next_line<R>(lines: &mut FramedRead<R, LinesCodec>) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match lines.next().await {
        None => Ok(None),
        Some(Ok(line)) => Ok(Some(line)),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            Err(ProtocolError::LineTooLong(MAX_LINE_BYTES).into())
        }
        Some(Err(LinesCodecError::Io(e))) => Err(e.into()),
    }
}

pub struct StratumServer {
    settings: ServerSettings,
    processor: Arc<ShareProcessor>,
    board: Arc<JobBoard>,
    connection_count: AtomicUsize,
    connections_per_ip: Mutex<HashMap<IpAddr, usize>>,
    next_session: AtomicU64,
}

impl StratumServer {
    pub fn new(settings: ServerSettings, processor: Arc<ShareProcessor>, board: Arc<JobBoard>) -> Self {
        Self {
            settings,
            processor,
            board,
            connection_count: AtomicUsize::new(0),
            connections_per_ip: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.connections_per_ip.lock().get(&ip).copied().unwrap_or(0)
    }

    /// Bind every tier's port. Fails if any port cannot be bound.
    pub fn bind(&self, tiers: &[Tier]) -> Result<Vec<BoundTier>> {
        let host: IpAddr = self
            .settings
            .bind_host
            .parse()
            .map_err(|e| PoolError::Config(format!("bind_host {:?}: {}", self.settings.bind_host, e)))?;

        tiers
            .iter()
            .map(|tier| -> Result<BoundTier> {
                let addr = SocketAddr::new(host, tier.port);
                let listener = bind_listener(addr)?;
                tracing::info!(
                    "Stratum tier {} listening on {} (difficulty {})",
                    tier.name,
                    listener.local_addr()?,
                    tier.difficulty
                );
                Ok(BoundTier {
                    tier: Arc::new(tier.clone()),
                    listener,
                })
            })
            .collect()
    }

    /// Spawn one accept loop per bound tier
    pub fn serve(
        self: &Arc<Self>,
        bound: Vec<BoundTier>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        bound
            .into_iter()
            .map(|b| {
                let server = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { server.accept_loop(b, shutdown).await })
            })
            .collect()
    }

    pub fn start(
        self: &Arc<Self>,
        tiers: &[Tier],
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let bound = self.bind(tiers)?;
        Ok(self.serve(bound, shutdown))
    }

    async fn accept_loop(self: Arc<Self>, bound: BoundTier, mut shutdown: watch::Receiver<bool>) {
        let BoundTier { tier, listener } = bound;
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.changed() => {
                    tracing::info!("Tier {} listener stopping", tier.name);
                    return;
                }
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let admission = match self.admit(peer_addr.ip()) {
                        Ok(a) => a,
                        Err(reason) => {
                            metrics::inc_connections_refused(reason);
                            tracing::warn!("Refusing {} on tier {}: {}", peer_addr, tier.name, reason);
                            drop(socket);
                            continue;
                        }
                    };

                    tracing::debug!("New connection from {} on tier {}", peer_addr, tier.name);
                    let server = Arc::clone(&self);
                    let tier = tier.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr, tier, shutdown).await {
                            tracing::debug!("Connection {} ended: {}", peer_addr, e);
                        }
                        drop(admission);
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection on tier {}: {}", tier.name, e);
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, ip: IpAddr) -> std::result::Result<Admission, &'static str> {
        if self.settings.banned_ips.contains(&ip) {
            return Err("banned");
        }
        let mut per_ip = self.connections_per_ip.lock();
        if self.connection_count.load(Ordering::Relaxed) >= self.settings.max_connections {
            return Err("max_connections");
        }
        let count = per_ip.get(&ip).copied().unwrap_or(0);
        if count >= self.settings.max_connections_per_ip {
            return Err("per_ip_limit");
        }
        per_ip.insert(ip, count + 1);
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        metrics::inc_active_connections();
        Ok(Admission {
            server: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut per_ip = self.connections_per_ip.lock();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        metrics::dec_active_connections();
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        tier: Arc<Tier>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(session_id, peer_addr, tier);
        let mut jobs = self.board.subscribe();

        let _ = socket.set_nodelay(true);
        let (reader, mut writer) = socket.into_split();
        let mut lines = line_reader(reader);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let result = loop {
            let idle_left = self.settings.idle_timeout.saturating_sub(conn.idle_for());
            tokio::select! {
                read = next_line(&mut lines) => {
                    match read {
                        Ok(None) => break Ok(()),
                        Ok(Some(line)) => {
                            conn.touch();
                            let request = line.trim();
                            if request.is_empty() {
                                continue;
                            }
                            if let Err(e) = self.handle_line(&mut conn, request, &jobs, &tx) {
                                metrics::inc_protocol_errors();
                                tracing::warn!("Protocol error from {}: {}", peer_addr, e);
                                break Err(e.into());
                            }
                        }
                        Err(e) => {
                            if let PoolError::Protocol(p) = &e {
                                metrics::inc_protocol_errors();
                                let _ = tx.send(to_line(&StratumResponse::error(
                                    serde_json::Value::Null,
                                    StratumError::from(p),
                                )));
                            }
                            break Err(e);
                        }
                    }
                }
                changed = jobs.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let snapshot = jobs.borrow_and_update().clone();
                    self.notify_job(&mut conn, &snapshot, &tx);
                }
                _ = tokio::time::sleep(idle_left) => {
                    tracing::info!("Closing idle connection {} after {:?}", peer_addr, conn.idle_for());
                    break Ok(());
                }
                _ = shutdown.changed() => break Ok(()),
            }
        };

        conn.close();
        drop(tx);
        let _ = writer_task.await;

        tracing::info!(
            "Connection {} closed: worker={} tier={} uptime={}s accepted={} rejected={}",
            peer_addr,
            conn.worker_id().unwrap_or_else(|| "-".to_string()),
            conn.tier.name,
            conn.uptime().as_secs(),
            conn.counters.accepted,
            conn.counters.stale
                + conn.counters.duplicate
                + conn.counters.low_difficulty
                + conn.counters.invalid
        );
        result
    }

    /// Handle one request line. An error means the connection must close;
    /// the error reply has already been queued.
    fn handle_line(
        &self,
        conn: &mut Connection,
        line: &str,
        jobs: &watch::Receiver<JobSnapshot>,
        tx: &mpsc::UnboundedSender<String>,
    ) -> std::result::Result<(), ProtocolError> {
        let send = |msg: String| {
            let _ = tx.send(msg);
        };
        let reject = |id: serde_json::Value, err: ProtocolError| {
            send(to_line(&StratumResponse::error(id, StratumError::from(&err))));
            Err(err)
        };

        let request = match StratumRequest::parse(line) {
            Ok(r) => r,
            Err(e) => return reject(serde_json::Value::Null, e),
        };
        let id = request.id.clone();
        let message = match ClientMessage::from_request(&request) {
            Ok(m) => m,
            Err(e) => return reject(id, e),
        };

        match message {
            ClientMessage::Subscribe { user_agent } => {
                match conn.subscribe(user_agent, self.settings.extranonce2_size) {
                    Ok(result) => send(to_line(&StratumResponse::success(id, result))),
                    Err(e) => return reject(id, e),
                }
            }
            ClientMessage::Authorize { username } => {
                if let Err(e) = conn.authorize(&username) {
                    return reject(id, e);
                }
                tracing::info!(
                    "Authorized {} on tier {} from {}",
                    username,
                    conn.tier.name,
                    conn.peer_addr
                );
                send(to_line(&StratumResponse::success(id, serde_json::Value::Bool(true))));
                send(to_line(&StratumNotification::set_difficulty(conn.tier.difficulty)));
                let snapshot = jobs.borrow().clone();
                self.notify_job(conn, &snapshot, tx);
            }
            ClientMessage::Submit(params) => {
                let outcome = match self.processor.process(conn, &params) {
                    Ok(o) => o,
                    Err(e) => return reject(id, e),
                };
                match &outcome.rejection {
                    None => send(to_line(&StratumResponse::success(id, serde_json::Value::Bool(true)))),
                    Some(rejection) => {
                        tracing::debug!(
                            "Share from {} rejected: {}",
                            params.worker,
                            rejection
                        );
                        send(to_line(&StratumResponse::error(id, StratumError::from(rejection))));
                    }
                }
            }
            ClientMessage::Unsupported(method) => {
                tracing::debug!("Unsupported method {} from {}", method, conn.peer_addr);
                send(to_line(&StratumResponse::error(id, StratumError::unknown_method(&method))));
            }
        }
        Ok(())
    }

    fn notify_job(&self, conn: &mut Connection, snapshot: &JobSnapshot, tx: &mpsc::UnboundedSender<String>) {
        let Some(job) = snapshot.live_job() else {
            return;
        };
        if conn.issue_job(job.clone()) {
            let _ = tx.send(to_line(&StratumNotification::notify(job.notify_params())));
            metrics::inc_job_broadcasts();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    // SO_REUSEADDR avoids "Address already in use" on restart
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::template_manager::test_support::MockNode;
    use crate::bus::{EventPublisher, MemoryBus, RetryPolicy};
    use crate::jobs::test_support::template;
    use crate::payout::{BlockTracker, MaturitySettings};
    use crate::pplns::WindowClock;
    use crate::shares::ShareValidator;
    use tokio::sync::Notify;

    fn server(max: usize, per_ip: usize, banned: &[&str]) -> Arc<StratumServer> {
        let bus = Arc::new(MemoryBus::new());
        let (publisher, _handle) = EventPublisher::spawn(bus, RetryPolicy::default());
        let tracker = BlockTracker::new(
            Arc::new(MockNode::serving(template(1, 1, 0))),
            publisher.clone(),
            Arc::new(Notify::new()),
            MaturitySettings {
                confirmations: 0,
                poll_interval: Duration::from_secs(1),
            },
        );
        let processor = Arc::new(ShareProcessor::new(
            ShareValidator::new(600),
            Arc::new(WindowClock::new(0)),
            publisher,
            tracker,
        ));
        let settings = ServerSettings {
            bind_host: "127.0.0.1".to_string(),
            extranonce2_size: 4,
            idle_timeout: Duration::from_secs(60),
            max_connections: max,
            max_connections_per_ip: per_ip,
            banned_ips: banned.iter().map(|s| s.parse().unwrap()).collect(),
        };
        Arc::new(StratumServer::new(settings, processor, Arc::new(JobBoard::new())))
    }

    #[tokio::test]
    async fn test_admission_limits() {
        let server = server(3, 2, &["10.0.0.9"]);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert_eq!(server.admit("10.0.0.9".parse().unwrap()).err(), Some("banned"));

        let first = server.admit(a).unwrap();
        let _second = server.admit(a).unwrap();
        assert_eq!(server.admit(a).err(), Some("per_ip_limit"));

        let _third = server.admit(b).unwrap();
        assert_eq!(server.admit(b).err(), Some("max_connections"));
        assert_eq!(server.connection_count(), 3);

        drop(first);
        assert_eq!(server.connection_count(), 2);
        assert_eq!(server.connections_from(a), 1);
        assert!(server.admit(b).is_ok());
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = server(10, 10, &[]);
        let tiers = vec![Tier::from_config(&crate::config::TierConfig {
            name: "low".into(),
            port: 0,
            difficulty: 1,
        })];
        let bound = server.bind(&tiers).unwrap();
        assert_eq!(bound.len(), 1);
        assert_ne!(bound[0].local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_long_line_is_rejected() {
        let (mut client, srv) = tokio::io::duplex(64 * 1024);
        let payload = "x".repeat(MAX_LINE_BYTES + 10);
        client.write_all(payload.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let mut lines = line_reader(srv);
        let err = next_line(&mut lines).await.err().unwrap();
        assert!(matches!(err, PoolError::Protocol(ProtocolError::LineTooLong(_))));
    }

    #[tokio::test]
    async fn test_lines_and_eof() {
        let (mut client, srv) = tokio::io::duplex(1024);
        client.write_all(b"{\"id\":1}\r\npartial").await.unwrap();
        drop(client);

        let mut lines = line_reader(srv);
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("{\"id\":1}"));
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("partial"));
        assert!(next_line(&mut lines).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_line_survives_interrupted_read() {
        let (mut client, srv) = tokio::io::duplex(1024);
        let mut lines = line_reader(srv);

        client.write_all(b"{\"id\":1,").await.unwrap();
        tokio::select! {
            read = next_line(&mut lines) => panic!("read finished early: {:?}", read.ok()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        client.write_all(b"\"method\":\"mining.subscribe\",\"params\":[]}\n").await.unwrap();
        let line = next_line(&mut lines).await.unwrap().unwrap();
        assert_eq!(line, "{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}");
        assert!(StratumRequest::parse(&line).is_ok());
    }
}
