//! Session creators: one full dial + handshake per call

use super::session::{Session, SessionConfig};
use crate::config::{ServerDefine, Timeouts};
use crate::protocol::Credentials;
use crate::transport::{encrypted_dialer, Dialer, Network, TransportConfig};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Produces new authenticated sessions for one server
#[async_trait]
pub trait SessionCreator: Send + Sync {
    /// Dial, run the transport and tunnel handshakes, and start a session.
    ///
    /// Failures are returned as-is; retry and failover belong to the caller.
    async fn create(&self) -> crate::Result<Session>;

    /// Server label used in logs and pool statistics
    fn server(&self) -> &str;
}

/// Creator bound to one configured server
pub struct TunnelClientCreator {
    define: ServerDefine,
    dialer: Arc<dyn Dialer>,
    credentials: Credentials,
    config: SessionConfig,
    rng: Mutex<StdRng>,
}

impl TunnelClientCreator {
    /// Build the encrypted transport for `define` on top of `base`
    pub fn new(
        define: ServerDefine,
        base: Arc<dyn Dialer>,
        max_conn: usize,
        timeouts: &Timeouts,
    ) -> crate::Result<Self> {
        let dialer = encrypted_dialer(&define, base, &TransportConfig::from(timeouts))?;
        let credentials = Credentials::new(define.username.clone(), define.password.clone());

        Ok(Self {
            define,
            dialer,
            credentials,
            config: SessionConfig::from_timeouts(max_conn, timeouts),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Replace the port selection source, e.g. with a seeded one
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Override session tuning
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    fn pick_addr(&self) -> crate::Result<String> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.define.server_addr(&mut *rng)?)
    }
}

#[async_trait]
impl SessionCreator for TunnelClientCreator {
    async fn create(&self) -> crate::Result<Session> {
        let addr = self.pick_addr()?;
        debug!("Creating session to {} ({})", addr, self.define.server);

        let conn = self.dialer.dial(Network::Tcp, &addr).await?;
        Session::client(conn, addr, &self.credentials, self.config.clone()).await
    }

    fn server(&self) -> &str {
        &self.define.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, TcpDialer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the addresses it was asked to dial and fails
    #[derive(Default)]
    struct RecordingDialer {
        calls: AtomicUsize,
        last: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, _network: Network, addr: &str) -> crate::Result<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(addr.to_string());
            Err(crate::transport::TransportError::Closed.into())
        }
    }

    #[tokio::test]
    async fn test_port_range_used_per_attempt() {
        let base = Arc::new(RecordingDialer::default());
        let creator = TunnelClientCreator::new(
            ServerDefine::with_key("127.0.0.1:4000-4010", "secret"),
            base.clone(),
            4,
            &Timeouts::default(),
        )
        .unwrap()
        .with_rng(StdRng::seed_from_u64(7));

        for _ in 0..20 {
            assert!(creator.create().await.is_err());
            let addr = base.last.lock().unwrap().clone().unwrap();
            let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();
            assert!((4000..4010).contains(&port));
        }
        assert_eq!(base.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_malformed_range_fails_at_dial_time() {
        let creator = TunnelClientCreator::new(
            ServerDefine::with_key("127.0.0.1:abc-def", "secret"),
            Arc::new(TcpDialer::default()),
            4,
            &Timeouts::default(),
        )
        .unwrap();

        let err = creator.create().await.unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
        assert_eq!(creator.server(), "127.0.0.1:abc-def");
    }
}
