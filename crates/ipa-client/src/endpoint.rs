//! Directory server endpoints and their SRV-style ordering.

use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;

/// Priority assigned to hosts from the static fallback list.
pub const STATIC_PRIORITY: u16 = 0;

/// Weight assigned to hosts from the static fallback list.
pub const STATIC_WEIGHT: u16 = 1;

/// URL scheme used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Https,
    Http,
}

impl Transport {
    /// Scheme string for URLs.
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Https => "https",
            Transport::Http => "http",
        }
    }

    /// Port used when none is given.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Https => 443,
            Transport::Http => 80,
        }
    }
}

/// A FreeIPA server candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEndpoint {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub transport: Transport,
}

impl DirectoryEndpoint {
    /// Base URL of the server, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.port == self.transport.default_port() {
            format!("{}://{}", self.transport.scheme(), self.host)
        } else {
            format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
        }
    }
}

impl fmt::Display for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A raw SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Order SRV answers for connection attempts.
///
/// Records are grouped by ascending priority. Inside a group, hosts are drawn
/// one at a time with probability proportional to their weight; zero-weight
/// hosts only come up once every weighted host of the group is drawn, and are
/// then shuffled uniformly. Duplicate targets keep their first occurrence.
pub fn order_srv_records<R: Rng + ?Sized>(
    records: Vec<SrvRecord>,
    rpc_port: u16,
    transport: Transport,
    rng: &mut R,
) -> Vec<DirectoryEndpoint> {
    let mut tiers: BTreeMap<u16, Vec<SrvRecord>> = BTreeMap::new();
    for mut record in records {
        record.target = record.target.trim_end_matches('.').to_string();
        if record.target.is_empty() {
            continue;
        }
        tiers.entry(record.priority).or_default().push(record);
    }

    let mut ordered: Vec<DirectoryEndpoint> = Vec::new();
    for (_, tier) in tiers {
        for record in weighted_shuffle(tier, rng) {
            if ordered.iter().any(|e| e.host == record.target) {
                continue;
            }
            ordered.push(DirectoryEndpoint {
                host: record.target,
                port: rpc_port,
                priority: record.priority,
                weight: record.weight,
                transport,
            });
        }
    }
    ordered
}

fn weighted_shuffle<R: Rng + ?Sized>(mut remaining: Vec<SrvRecord>, rng: &mut R) -> Vec<SrvRecord> {
    let mut out = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let total: u32 = remaining.iter().map(|r| u32::from(r.weight)).sum();
        let index = if total == 0 {
            rng.random_range(0..remaining.len())
        } else {
            let mut pick = rng.random_range(0..total);
            let mut chosen = 0;
            for (i, record) in remaining.iter().enumerate() {
                let weight = u32::from(record.weight);
                if pick < weight {
                    chosen = i;
                    break;
                }
                pick -= weight;
            }
            chosen
        };
        out.push(remaining.swap_remove(index));
    }
    out
}

/// Parse the static fallback list (`"ipa1.example.com, ipa2:8443"`).
///
/// Entries may carry an `http://` or `https://` scheme and a `:port`. Every
/// host gets the same priority and weight. Blank entries are skipped, so an
/// empty list yields no endpoints.
#[must_use]
pub fn parse_static_hosts(list: &str) -> Vec<DirectoryEndpoint> {
    let mut endpoints: Vec<DirectoryEndpoint> = Vec::new();
    for raw in list.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let (transport, rest) = if let Some(rest) = entry.strip_prefix("https://") {
            (Transport::Https, rest)
        } else if let Some(rest) = entry.strip_prefix("http://") {
            (Transport::Http, rest)
        } else {
            (Transport::Https, entry)
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => (rest, transport.default_port()),
            },
            None => (rest, transport.default_port()),
        };
        if host.is_empty() || endpoints.iter().any(|e| e.host == host && e.port == port) {
            continue;
        }
        endpoints.push(DirectoryEndpoint {
            host: host.to_string(),
            port,
            priority: STATIC_PRIORITY,
            weight: STATIC_WEIGHT,
            transport,
        });
    }
    endpoints
}
