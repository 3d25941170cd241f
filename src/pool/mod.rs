//! Connection pool
//!
//! Keeps a set of live tunnel sessions across the configured servers and
//! opens each requested stream on the least loaded one. A new session is only
//! created when every live session is at its stream limit; creation walks the
//! server list in order and falls through on failure.

use crate::config::ClientConfig;
use crate::transport::{Connection, Dialer, Network, TcpDialer, TransportConfig};
use crate::tunnel::{Session, SessionCreator, TunnelClientCreator, TunnelError};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No servers configured")]
    NoServers,

    #[error("All servers failed: {}", .0.join("; "))]
    AllServersFailed(Vec<String>),

    #[error("No usable session after {0} attempts")]
    Exhausted(usize),
}

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions kept alive regardless of demand
    pub min_sess: usize,
    /// Idle sessions above `min_sess` are closed after this long
    pub idle_timeout: Duration,
    /// Maintenance tick
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sess: 0,
            idle_timeout: Duration::from_secs(crate::protocol::IDLE_TIMEOUT),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

/// Snapshot of one pooled session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub id: u64,
    pub server: String,
    pub open_streams: usize,
}

/// Snapshot of the pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub sessions: Vec<SessionStats>,
    pub total_streams: usize,
}

#[derive(Clone)]
struct PooledSession {
    session: Session,
    server: String,
}

struct PoolInner {
    creators: Vec<Arc<dyn SessionCreator>>,
    sessions: RwLock<Vec<PooledSession>>,
    /// Held while deciding to create a session
    create_lock: Mutex<()>,
    config: PoolConfig,
}

/// Tunnel session pool; cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool over `creators`, tried in the given order
    pub fn new(creators: Vec<Arc<dyn SessionCreator>>, config: PoolConfig) -> Result<Self, PoolError> {
        if creators.is_empty() {
            return Err(PoolError::NoServers);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                creators,
                sessions: RwLock::new(Vec::new()),
                create_lock: Mutex::new(()),
                config,
            }),
        })
    }

    /// Build creators for every configured server
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        let base: Arc<dyn Dialer> = Arc::new(TcpDialer::new(TransportConfig::from(&config.timeouts)));
        let creators = config
            .servers
            .iter()
            .map(|define| {
                let creator = TunnelClientCreator::new(
                    define.clone(),
                    base.clone(),
                    config.max_conn,
                    &config.timeouts,
                )?;
                Ok(Arc::new(creator) as Arc<dyn SessionCreator>)
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let pool_config = PoolConfig {
            min_sess: config.min_sess,
            idle_timeout: config.timeouts.idle(),
            maintenance_interval: config.timeouts.maintenance(),
        };
        Ok(Self::new(creators, pool_config)?)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PooledSession>> {
        self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PooledSession>> {
        self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Least loaded live session with spare capacity
    fn pick(&self) -> Option<Session> {
        self.read()
            .iter()
            .map(|p| &p.session)
            .filter(|s| !s.is_closed() && s.open_streams() < s.max_streams())
            .min_by_key(|s| s.open_streams())
            .cloned()
    }

    fn live_sessions(&self) -> usize {
        self.read().iter().filter(|p| !p.session.is_closed()).count()
    }

    fn forget(&self, id: u64) {
        self.write().retain(|p| p.session.id() != id);
    }

    /// Try every server in order; the first success joins the pool.
    /// Callers hold `create_lock`.
    async fn create_session(&self) -> Result<Session, PoolError> {
        let mut failures = Vec::with_capacity(self.inner.creators.len());

        for creator in &self.inner.creators {
            match creator.create().await {
                Ok(session) => {
                    info!(
                        "Session {} created to {} ({} live)",
                        session.id(),
                        creator.server(),
                        self.live_sessions() + 1
                    );
                    self.write().push(PooledSession {
                        session: session.clone(),
                        server: creator.server().to_string(),
                    });
                    return Ok(session);
                }
                Err(e) => {
                    warn!("Failed to create session to {}: {}", creator.server(), e);
                    failures.push(format!("{}: {}", creator.server(), e));
                }
            }
        }

        Err(PoolError::AllServersFailed(failures))
    }

    /// A session with capacity, creating one if needed
    async fn acquire(&self) -> Result<Session, PoolError> {
        if let Some(session) = self.pick() {
            return Ok(session);
        }

        let _guard = self.inner.create_lock.lock().await;
        // someone may have created one while we waited
        if let Some(session) = self.pick() {
            return Ok(session);
        }
        self.create_session().await
    }

    /// Open a stream to `addr` through the pool
    pub async fn open(&self, addr: &str) -> crate::Result<Connection> {
        let attempts = self.inner.creators.len() + 3;

        for _ in 0..attempts {
            let session = self.acquire().await?;
            match session.open_stream(addr).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) if e.is_session_unavailable() => {
                    trace!("Session {} unavailable for {}: {}", session.id(), addr, e);
                    if session.is_closed() {
                        self.forget(session.id());
                    }
                }
                // the server answers unreachable destinations itself, so
                // silence means the session is dead
                Err(TunnelError::Timeout) => {
                    warn!(
                        "Session {} to {} did not answer, dropping it",
                        session.id(),
                        session.peer()
                    );
                    session.close();
                    self.forget(session.id());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PoolError::Exhausted(attempts).into())
    }

    /// One maintenance pass: drop dead sessions, close surplus idle ones and
    /// top the pool up to `min_sess`
    pub async fn run_once(&self) {
        let min_sess = self.inner.config.min_sess;
        let idle_timeout = self.inner.config.idle_timeout;

        {
            let mut sessions = self.write();
            sessions.retain(|p| !p.session.is_closed());

            let mut live = sessions.len();
            sessions.retain(|p| {
                let idle = p
                    .session
                    .idle_for()
                    .map_or(false, |idle| idle >= idle_timeout);
                if live > min_sess && idle {
                    debug!("Closing idle session {} to {}", p.session.id(), p.server);
                    p.session.close();
                    live -= 1;
                    return false;
                }
                true
            });
        }

        if self.live_sessions() >= min_sess {
            return;
        }
        let _guard = self.inner.create_lock.lock().await;
        while self.live_sessions() < min_sess {
            if let Err(e) = self.create_session().await {
                warn!("Pool below minimum of {} sessions: {}", min_sess, e);
                break;
            }
        }
    }

    /// Run [`Pool::run_once`] on the configured interval
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.config.maintenance_interval);
            loop {
                ticker.tick().await;
                pool.run_once().await;
                let stats = pool.stats();
                trace!(
                    "Pool: {} sessions, {} streams",
                    stats.sessions.len(),
                    stats.total_streams
                );
            }
        })
    }

    /// Snapshot of live sessions
    pub fn stats(&self) -> PoolStats {
        let sessions: Vec<SessionStats> = self
            .read()
            .iter()
            .filter(|p| !p.session.is_closed())
            .map(|p| SessionStats {
                id: p.session.id(),
                server: p.server.clone(),
                open_streams: p.session.open_streams(),
            })
            .collect();
        let total_streams = sessions.iter().map(|s| s.open_streams).sum();
        PoolStats {
            sessions,
            total_streams,
        }
    }

    /// Close every session
    pub fn close(&self) {
        for p in self.write().drain(..) {
            p.session.close();
        }
    }
}

#[async_trait]
impl Dialer for Pool {
    async fn dial(&self, _network: Network, addr: &str) -> crate::Result<Connection> {
        // the server picks the address family
        self.open(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolError;
    use crate::tunnel::{Role, SessionConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// In-memory creator: sessions talk to a server-role session that echoes
    struct MockCreator {
        name: String,
        fail: bool,
        max_conn: usize,
        created: AtomicUsize,
        /// Sessions still to hand out whose peer never answers
        silent: AtomicUsize,
    }

    impl MockCreator {
        fn ok(name: &str, max_conn: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                max_conn,
                created: AtomicUsize::new(0),
                silent: AtomicUsize::new(0),
            })
        }

        /// The first `count` sessions go dead silent after creation
        fn silent_first(name: &str, count: usize) -> Arc<Self> {
            let creator = Self::ok(name, 4);
            creator.silent.store(count, Ordering::SeqCst);
            creator
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                max_conn: 1,
                created: AtomicUsize::new(0),
                silent: AtomicUsize::new(0),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionCreator for MockCreator {
        async fn create(&self) -> crate::Result<Session> {
            if self.fail {
                return Err(ProtocolError::BadCredentials.into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);

            let silent = self
                .silent
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if silent {
                let (a, mut b) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = b.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
                let (client, _) = Session::spawn(
                    Box::new(a),
                    self.name.clone(),
                    Role::Client,
                    SessionConfig {
                        max_streams: self.max_conn,
                        handshake_timeout: Duration::from_millis(100),
                        keepalive: None,
                        ..SessionConfig::default()
                    },
                );
                return Ok(client);
            }

            let (a, b) = tokio::io::duplex(64 * 1024);
            let (_server, mut incoming) = Session::spawn(
                Box::new(b),
                "client",
                Role::Server,
                SessionConfig {
                    max_streams: 1024,
                    ..SessionConfig::default()
                },
            );
            tokio::spawn(async move {
                while let Some(incoming) = incoming.recv().await {
                    if incoming.destination().starts_with("refuse") {
                        incoming.reject("connection refused");
                        continue;
                    }
                    let mut stream = incoming.accept();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });

            let (client, _) = Session::spawn(
                Box::new(a),
                self.name.clone(),
                Role::Client,
                SessionConfig {
                    max_streams: self.max_conn,
                    ..SessionConfig::default()
                },
            );
            Ok(client)
        }

        fn server(&self) -> &str {
            &self.name
        }
    }

    fn pool(creators: Vec<Arc<MockCreator>>, config: PoolConfig) -> Pool {
        let creators = creators
            .into_iter()
            .map(|c| c as Arc<dyn SessionCreator>)
            .collect();
        Pool::new(creators, config).unwrap()
    }

    #[tokio::test]
    async fn test_failover_to_second_server() {
        let bad = MockCreator::failing("bad");
        let good = MockCreator::ok("good", 4);
        let pool = pool(vec![bad.clone(), good.clone()], PoolConfig::default());

        let mut conn = pool.dial(Network::Tcp, "example.com:80").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(good.created(), 1);
        let stats = pool.stats();
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.sessions[0].server, "good");
        assert_eq!(stats.total_streams, 1);
    }

    #[tokio::test]
    async fn test_all_servers_failed() {
        let pool = pool(
            vec![MockCreator::failing("a"), MockCreator::failing("b")],
            PoolConfig::default(),
        );

        let err = pool.dial(Network::Tcp, "example.com:80").await.err().unwrap();
        match err {
            crate::Error::Pool(PoolError::AllServersFailed(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("a:"));
                assert!(failures[1].starts_with("b:"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scales_out_at_capacity() {
        let creator = MockCreator::ok("s", 2);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        let dials = (0..3).map(|i| {
            let pool = pool.clone();
            async move { pool.dial(Network::Tcp, &format!("host{}:80", i)).await }
        });
        let conns: Vec<_> = futures::future::join_all(dials)
            .await
            .into_iter()
            .map(|r| r.ok().unwrap())
            .collect();

        assert_eq!(conns.len(), 3);
        assert_eq!(creator.created(), 2);
        let stats = pool.stats();
        assert_eq!(stats.total_streams, 3);
        assert!(stats.sessions.iter().all(|s| s.open_streams <= 2));
    }

    #[tokio::test]
    async fn test_reuses_session_below_capacity() {
        let creator = MockCreator::ok("s", 8);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        let _a = pool.dial(Network::Tcp, "a:1").await.unwrap();
        let _b = pool.dial(Network::Tcp, "b:1").await.unwrap();
        assert_eq!(creator.created(), 1);
    }

    #[tokio::test]
    async fn test_rejected_destination_is_not_retried() {
        let creator = MockCreator::ok("s", 8);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        let err = pool.dial(Network::Tcp, "refuse.me:1").await.err().unwrap();
        assert!(matches!(
            err,
            crate::Error::Tunnel(crate::tunnel::TunnelError::StreamRejected(_))
        ));
        assert_eq!(creator.created(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let creator = MockCreator::ok("s", 8);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        drop(pool.dial(Network::Tcp, "a:1").await.unwrap());
        let first = pool.stats().sessions[0].id;
        pool.inner.sessions.read().unwrap()[0].session.close();

        let _conn = pool.dial(Network::Tcp, "a:1").await.unwrap();
        assert_eq!(creator.created(), 2);
        let stats = pool.stats();
        assert_eq!(stats.sessions.len(), 1);
        assert_ne!(stats.sessions[0].id, first);
    }

    #[tokio::test]
    async fn test_silent_session_is_dropped_and_replaced() {
        let creator = MockCreator::silent_first("s", 1);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        let mut conn = pool.dial(Network::Tcp, "a:1").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(creator.created(), 2);
        let stats = pool.stats();
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.total_streams, 1);
    }

    #[tokio::test]
    async fn test_silent_sessions_are_not_kept() {
        let creator = MockCreator::silent_first("s", usize::MAX);
        let pool = pool(vec![creator.clone()], PoolConfig::default());

        for _ in 0..3 {
            assert!(pool.dial(Network::Tcp, "a:1").await.is_err());
            assert!(pool.stats().sessions.is_empty());
        }
    }

    #[tokio::test]
    async fn test_maintenance_keeps_min_sessions() {
        let creator = MockCreator::ok("s", 4);
        let pool = pool(
            vec![creator.clone()],
            PoolConfig {
                min_sess: 2,
                ..PoolConfig::default()
            },
        );

        pool.run_once().await;
        assert_eq!(pool.stats().sessions.len(), 2);

        pool.inner.sessions.read().unwrap()[0].session.close();
        pool.run_once().await;
        assert_eq!(pool.stats().sessions.len(), 2);
        assert_eq!(creator.created(), 3);
    }

    #[tokio::test]
    async fn test_maintenance_closes_surplus_idle_sessions() {
        let creator = MockCreator::ok("s", 1);
        let pool = pool(
            vec![creator.clone()],
            PoolConfig {
                min_sess: 1,
                idle_timeout: Duration::ZERO,
                ..PoolConfig::default()
            },
        );

        let a = pool.dial(Network::Tcp, "a:1").await.unwrap();
        let b = pool.dial(Network::Tcp, "b:1").await.unwrap();
        assert_eq!(pool.stats().sessions.len(), 2);

        // busy sessions are kept
        pool.run_once().await;
        assert_eq!(pool.stats().sessions.len(), 2);

        drop(a);
        drop(b);
        pool.run_once().await;
        assert_eq!(pool.stats().sessions.len(), 1);
    }
}
