//! FreeIPA server discovery
//!
//! Servers are discovered through DNS SRV records under the directory domain
//! and fall back to a static host list when DNS has nothing to offer.

use crate::endpoint::{order_srv_records, parse_static_hosts, DirectoryEndpoint, SrvRecord, Transport};
use crate::error::IpaError;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverOpts;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default SRV service label used to find FreeIPA servers.
pub const DEFAULT_SRV_SERVICE: &str = "_kerberos._tcp";

/// SRV lookup seam, so discovery can be exercised without a DNS server.
#[async_trait::async_trait]
pub trait SrvLookup: Send + Sync {
    /// Return the SRV answers for `name`. An empty vector means no records.
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, IpaError>;
}

/// SRV lookups through the system resolver configuration.
pub struct HickorySrvLookup {
    resolver: TokioResolver,
}

impl HickorySrvLookup {
    /// Build a resolver from `/etc/resolv.conf` with the given query timeout.
    pub fn from_system_conf(timeout: Duration) -> Result<Self, IpaError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| IpaError::Dns(e.to_string()))?
            .with_options(opts)
            .build();
        Ok(Self { resolver })
    }
}

#[async_trait::async_trait]
impl SrvLookup for HickorySrvLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, IpaError> {
        let lookup = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| IpaError::Dns(e.to_string()))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }
}

/// Produces the ordered candidate list consumed by the client for failover.
#[derive(Clone)]
pub struct DirectoryServerResolver {
    lookup: Arc<dyn SrvLookup>,
    srv_service: String,
    rpc_port: u16,
}

impl DirectoryServerResolver {
    /// Create a resolver.
    ///
    /// # Arguments
    /// * `lookup` - SRV lookup implementation
    /// * `srv_service` - service label, e.g. `_kerberos._tcp`
    /// * `rpc_port` - HTTPS port of the JSON-RPC API on discovered servers
    pub fn new(lookup: Arc<dyn SrvLookup>, srv_service: impl Into<String>, rpc_port: u16) -> Self {
        Self {
            lookup,
            srv_service: srv_service.into(),
            rpc_port,
        }
    }

    /// Resolve the ordered server list for `domain`.
    ///
    /// DNS answers win; the comma-separated `static_fallback` list is used
    /// only when the query fails or returns nothing. An empty result is not
    /// an error here, the caller decides how to fail.
    pub async fn resolve(&self, domain: &str, static_fallback: &str) -> Vec<DirectoryEndpoint> {
        let records = self.lookup_records(domain).await;
        // The thread-local rng is not Send; it must only exist after the lookup
        self.order_or_fallback(records, static_fallback, &mut rand::rng())
    }

    /// [`resolve`](Self::resolve) with an explicit random source.
    pub async fn resolve_with_rng<R: rand::Rng + Send + ?Sized>(
        &self,
        domain: &str,
        static_fallback: &str,
        rng: &mut R,
    ) -> Vec<DirectoryEndpoint> {
        let records = self.lookup_records(domain).await;
        self.order_or_fallback(records, static_fallback, rng)
    }

    /// Query the SRV records of `domain`. `None` when there is nothing usable.
    async fn lookup_records(&self, domain: &str) -> Option<Vec<SrvRecord>> {
        let domain = domain.trim().trim_end_matches('.');
        if domain.is_empty() {
            return None;
        }
        let query = format!("{}.{}.", self.srv_service, domain);
        match self.lookup.lookup_srv(&query).await {
            Ok(records) if !records.is_empty() => Some(records),
            Ok(_) => {
                debug!("No SRV records found for {}", query);
                None
            }
            Err(e) => {
                debug!("SRV lookup for {} failed: {}", query, e);
                None
            }
        }
    }

    fn order_or_fallback<R: rand::Rng + ?Sized>(
        &self,
        records: Option<Vec<SrvRecord>>,
        static_fallback: &str,
        rng: &mut R,
    ) -> Vec<DirectoryEndpoint> {
        if let Some(records) = records {
            let endpoints = order_srv_records(records, self.rpc_port, Transport::Https, rng);
            if !endpoints.is_empty() {
                info!(
                    "Discovered FreeIPA servers via DNS: {:?}",
                    endpoints.iter().map(|e| e.host.as_str()).collect::<Vec<_>>()
                );
                return endpoints;
            }
        }

        let endpoints = parse_static_hosts(static_fallback);
        debug!("Using {} statically configured FreeIPA server(s)", endpoints.len());
        endpoints
    }
}
