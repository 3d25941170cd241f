//! Routing filter
//!
//! Every dial is checked against the prohibited list first, then the direct
//! list; anything unmatched goes to the wrapped dialer (normally the pool).
//! A list that is not configured is skipped entirely.

mod rules;

pub use rules::RuleSet;

use crate::config::{split_host_port, ClientConfig};
use crate::dns::Resolver;
use crate::transport::{Connection, Dialer, FalseDialer, Network};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Rule loading errors
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("{file}:{line}: invalid rule '{entry}'")]
    InvalidRule {
        file: String,
        line: usize,
        entry: String,
    },

    #[error("Failed to read rule file {file}: {error}")]
    Read { file: String, error: std::io::Error },
}

/// Where a destination is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Blocked,
    Direct,
    Default,
}

/// Dialer applying prohibited and direct route lists
pub struct FilteredDialer {
    prohibited: Option<RuleSet>,
    direct: Option<(RuleSet, Arc<dyn Dialer>)>,
    default: Arc<dyn Dialer>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl FilteredDialer {
    /// Send everything to `default` until lists are added
    pub fn new(default: Arc<dyn Dialer>) -> Self {
        Self {
            prohibited: None,
            direct: None,
            default,
            resolver: None,
        }
    }

    pub fn with_prohibited(mut self, rules: RuleSet) -> Self {
        self.prohibited = Some(rules);
        self
    }

    pub fn with_direct(mut self, rules: RuleSet, dialer: Arc<dyn Dialer>) -> Self {
        self.direct = Some((rules, dialer));
        self
    }

    /// Resolver used to check address rules against hostnames
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build from `direct_routes` / `prohibited_routes`; `None` when neither is set
    pub fn from_config(
        config: &ClientConfig,
        default: Arc<dyn Dialer>,
        direct: Arc<dyn Dialer>,
        resolver: Arc<dyn Resolver>,
    ) -> crate::Result<Option<Self>> {
        if config.direct_routes.is_none() && config.prohibited_routes.is_none() {
            return Ok(None);
        }

        let mut filter = FilteredDialer::new(default).with_resolver(resolver);
        if let Some(path) = &config.prohibited_routes {
            let rules = RuleSet::load(path)?;
            debug!("Loaded {} prohibited rules from {}", rules.len(), path);
            filter = filter.with_prohibited(rules);
        }
        if let Some(path) = &config.direct_routes {
            let rules = RuleSet::load(path)?;
            debug!("Loaded {} direct rules from {}", rules.len(), path);
            filter = filter.with_direct(rules, direct);
        }
        Ok(Some(filter))
    }

    /// Decide the route for `addr` (`host:port`)
    pub async fn route(&self, addr: &str) -> Route {
        let host = split_host_port(addr).map(|(host, _)| host).unwrap_or(addr);
        let mut resolved = None;

        if let Some(rules) = &self.prohibited {
            if self.matches(rules, host, &mut resolved).await {
                return Route::Blocked;
            }
        }
        if let Some((rules, _)) = &self.direct {
            if self.matches(rules, host, &mut resolved).await {
                return Route::Direct;
            }
        }
        Route::Default
    }

    async fn matches(&self, rules: &RuleSet, host: &str, resolved: &mut Option<Vec<IpAddr>>) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return rules.matches_ip(ip);
        }
        if rules.matches_domain(host) {
            return true;
        }
        if !rules.has_ip_rules() {
            return false;
        }

        if resolved.is_none() {
            let addrs = match &self.resolver {
                Some(resolver) => resolver.resolve(host).await.unwrap_or_else(|e| {
                    trace!("Resolving {} for route rules failed: {}", host, e);
                    Vec::new()
                }),
                None => Vec::new(),
            };
            *resolved = Some(addrs);
        }
        resolved
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|ip| rules.matches_ip(*ip))
    }
}

#[async_trait]
impl Dialer for FilteredDialer {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection> {
        match self.route(addr).await {
            Route::Blocked => {
                debug!("{} is prohibited", addr);
                FalseDialer.dial(network, addr).await
            }
            Route::Direct => {
                debug!("{} routed direct", addr);
                match &self.direct {
                    Some((_, dialer)) => dialer.dial(network, addr).await,
                    None => self.default.dial(network, addr).await,
                }
            }
            Route::Default => self.default.dial(network, addr).await,
        }
    }
}
