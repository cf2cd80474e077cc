//! DC locator.
//!
//! Selection order, used at startup and on watchdog failover:
//! 1. the preferred server (config), then the last-used DC persisted in
//!    a sidecar file,
//! 2. a DC in the local site, from the machine's IPv4 matched against
//!    the subnet→site map (loaded from the configuration partition on
//!    the first successful connect and cached for later failovers),
//! 3. any DC resolved via DNS lookup of the domain name.
//!
//! A DC is available when the lightweight bootstrap query (domain flat
//! name) answers within the configured timeout. Tiers are probed
//! lazily: DNS is only consulted once every earlier candidate failed.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::directory::{DirectoryClient, DirectoryConnector, FeedError, SiteTopology};

const DIRECTORY_PORT: u16 = 389;

#[derive(Clone, Debug)]
pub struct LocatorConfig {
    pub domain: String,
    pub preferred_server: Option<String>,
    /// Sidecar file remembering the last DC that worked.
    pub sidecar_path: Option<PathBuf>,
    pub bootstrap_timeout: Duration,
    /// Test hook: skip local-interface discovery.
    pub local_ipv4_override: Option<Ipv4Addr>,
}

/// A DC that answered the bootstrap probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedDc {
    pub host: String,
    pub flat_name: String,
}

pub struct DcLocator {
    config: LocatorConfig,
    topology: Mutex<Option<SiteTopology>>,
}

impl DcLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self {
            config,
            topology: Mutex::new(None),
        }
    }

    /// Probe candidates tier by tier; the first DC whose bootstrap
    /// answers wins and is persisted as the new last-used sidecar entry.
    pub fn select(
        &self,
        connector: &dyn DirectoryConnector,
    ) -> Result<(SelectedDc, Arc<dyn DirectoryClient>), FeedError> {
        let mut tried: BTreeSet<String> = BTreeSet::new();
        let mut fatal: Option<FeedError> = None;

        for host in self.preferred_candidates() {
            if tried.insert(host.clone()) {
                match self.probe(connector, &host) {
                    Ok(found) => return Ok(found),
                    Err(err) => note_failure(&host, err, &mut fatal),
                }
            }
        }
        for host in self.site_candidates() {
            if tried.insert(host.clone()) {
                match self.probe(connector, &host) {
                    Ok(found) => return Ok(found),
                    Err(err) => note_failure(&host, err, &mut fatal),
                }
            }
        }
        for host in self.dns_candidates() {
            if tried.insert(host.clone()) {
                match self.probe(connector, &host) {
                    Ok(found) => return Ok(found),
                    Err(err) => note_failure(&host, err, &mut fatal),
                }
            }
        }

        // Credentials rejected everywhere is not going to heal with a
        // retry loop; everything else is.
        match fatal {
            Some(err) => Err(err),
            None => Err(FeedError::transient(format!(
                "no domain controller available for {} ({} candidates tried)",
                self.config.domain,
                tried.len()
            ))),
        }
    }

    fn probe(
        &self,
        connector: &dyn DirectoryConnector,
        host: &str,
    ) -> Result<(SelectedDc, Arc<dyn DirectoryClient>), FeedError> {
        let client = connector.connect(host)?;
        let info = client.bootstrap(self.config.bootstrap_timeout)?;
        tracing::info!(host, flat_name = %info.flat_name, "domain controller selected");
        self.persist_last_used(host);
        self.cache_topology(client.as_ref());
        Ok((
            SelectedDc {
                host: host.to_string(),
                flat_name: info.flat_name,
            },
            client,
        ))
    }

    fn cache_topology(&self, client: &dyn DirectoryClient) {
        let mut cached = self.topology.lock().expect("topology lock poisoned");
        if cached.is_some() {
            return;
        }
        match client.load_topology() {
            Ok(topology) => {
                tracing::debug!(
                    subnets = topology.subnets.len(),
                    sites = topology.site_servers.len(),
                    "site topology loaded"
                );
                *cached = Some(topology);
            }
            Err(err) => tracing::warn!(%err, "site topology unavailable"),
        }
    }

    fn preferred_candidates(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(host) = &self.config.preferred_server {
            out.push(host.clone());
        }
        if let Some(host) = self.read_last_used() {
            out.push(host);
        }
        out
    }

    fn site_candidates(&self) -> Vec<String> {
        let topology = self.topology.lock().expect("topology lock poisoned");
        let Some(topology) = topology.as_ref() else {
            return Vec::new();
        };
        let Some(addr) = self.local_ipv4() else {
            return Vec::new();
        };
        match topology.site_of(addr) {
            Some(site) => topology.servers_in(site).to_vec(),
            None => Vec::new(),
        }
    }

    fn dns_candidates(&self) -> Vec<String> {
        match (self.config.domain.as_str(), DIRECTORY_PORT).to_socket_addrs() {
            Ok(addrs) => addrs.map(|addr| addr.ip().to_string()).collect(),
            Err(err) => {
                tracing::warn!(domain = %self.config.domain, %err, "dns lookup failed");
                Vec::new()
            }
        }
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        if let Some(addr) = self.config.local_ipv4_override {
            return Some(addr);
        }
        // Routing probe: a connected UDP socket reveals the source
        // address without sending a packet.
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:53").ok()?;
        match socket.local_addr().ok()? {
            std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
            std::net::SocketAddr::V6(_) => None,
        }
    }

    fn read_last_used(&self) -> Option<String> {
        let path = self.config.sidecar_path.as_ref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let host = contents.trim();
        if host.is_empty() {
            None
        } else {
            Some(host.to_string())
        }
    }

    fn persist_last_used(&self, host: &str) {
        let Some(path) = self.config.sidecar_path.as_ref() else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
                let temp = tempfile::NamedTempFile::new_in(dir)?;
                std::fs::write(temp.path(), format!("{host}\n"))?;
                temp.persist(path)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            tracing::warn!(path = %path.display(), %err, "failed to persist last-used dc");
        }
    }

    #[cfg(test)]
    fn set_topology(&self, topology: SiteTopology) {
        *self.topology.lock().unwrap() = Some(topology);
    }
}

fn note_failure(host: &str, err: FeedError, fatal: &mut Option<FeedError>) {
    tracing::warn!(host, %err, "dc candidate failed");
    if err.is_fatal() && fatal.is_none() {
        *fatal = Some(err);
    }
}
