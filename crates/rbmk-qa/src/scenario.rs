//! Declarative description of a simulated topology.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rbmk_netem::{DnsHandler, PacketFilter, PassThrough};

use crate::error::{ServerRole, SimulationError};

/// Mutates a [`Scenario`] before the simulation is built (e.g. installs a censorship filter).
pub type ScenarioEditor = fn(&mut Scenario);

/// The host running the measurement tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStack {
    pub addrs: Vec<IpAddr>,
    /// Address of the DNS server used by the client's resolver.
    pub resolver: IpAddr,
}

#[derive(Clone, Default)]
pub struct DnsServer {
    pub addrs: Vec<IpAddr>,
    /// Names registered in the shared DNS database and covered by the server certificate.
    pub domains: Vec<String>,
    /// Names registered as CNAMEs of the first domain.
    pub aliases: Vec<String>,
    /// Custom query handler; answers from the shared DNS database when unset.
    pub handler: Option<Arc<dyn DnsHandler>>,
}

#[derive(Clone, Default)]
pub struct HttpServer {
    pub addrs: Vec<IpAddr>,
    pub domains: Vec<String>,
    pub aliases: Vec<String>,
    /// Custom request handler; serves a fixed greeting page when unset.
    pub handler: Option<axum::Router>,
}

#[derive(Clone)]
pub struct Scenario {
    pub client: ClientStack,
    pub dns_servers: Vec<DnsServer>,
    pub http_servers: Vec<HttpServer>,
    /// Installed on the router once the topology is live.
    pub packet_filter: Arc<dyn PacketFilter>,
}

pub const CLIENT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(130, 192, 91, 211));
pub const GOOGLE_DNS_PRIMARY: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
pub const GOOGLE_DNS_SECONDARY: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4));
pub const CLOUDFLARE_DNS_PRIMARY: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
pub const CLOUDFLARE_DNS_SECONDARY: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1));
pub const EXAMPLE_COM_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 215, 14));
/// Address returned by the censorship filters.
pub const BLOCKPAGE_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 10, 34, 35));

impl Scenario {
    /// Default topology: one client resolving through `8.8.8.8`, two public resolvers and a
    /// web server for `example.com`.
    pub fn base() -> Self {
        Self {
            client: ClientStack {
                addrs: vec![CLIENT_ADDR],
                resolver: GOOGLE_DNS_PRIMARY,
            },
            dns_servers: vec![
                DnsServer {
                    addrs: vec![GOOGLE_DNS_PRIMARY, GOOGLE_DNS_SECONDARY],
                    domains: vec!["dns.google".to_string()],
                    aliases: vec!["dns.google.com".to_string()],
                    handler: None,
                },
                DnsServer {
                    addrs: vec![CLOUDFLARE_DNS_PRIMARY, CLOUDFLARE_DNS_SECONDARY],
                    domains: vec!["one.one.one.one".to_string()],
                    aliases: vec!["cloudflare-dns.com".to_string()],
                    handler: None,
                },
            ],
            http_servers: vec![HttpServer {
                addrs: vec![EXAMPLE_COM_ADDR],
                domains: vec!["example.com".to_string()],
                aliases: vec!["www.example.com".to_string()],
                handler: None,
            }],
            packet_filter: Arc::new(PassThrough),
        }
    }

    /// Apply `editors` in order.
    pub fn edited(mut self, editors: &[ScenarioEditor]) -> Self {
        for edit in editors {
            edit(&mut self);
        }
        self
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.client.addrs.is_empty() {
            return Err(SimulationError::EmptyClientAddrs);
        }
        if self.client.resolver.is_unspecified() {
            return Err(SimulationError::UnspecifiedResolver(self.client.resolver));
        }
        for (index, server) in self.dns_servers.iter().enumerate() {
            check_server(ServerRole::Dns, index, &server.addrs, &server.domains, &server.aliases)?;
        }
        for (index, server) in self.http_servers.iter().enumerate() {
            check_server(ServerRole::Http, index, &server.addrs, &server.domains, &server.aliases)?;
        }
        Ok(())
    }
}

fn check_server(
    role: ServerRole,
    index: usize,
    addrs: &[IpAddr],
    domains: &[String],
    aliases: &[String],
) -> Result<(), SimulationError> {
    if addrs.is_empty() {
        return Err(SimulationError::EmptyServerAddrs { role, index });
    }
    if !aliases.is_empty() && domains.is_empty() {
        return Err(SimulationError::AliasWithoutDomain { role, index });
    }
    Ok(())
}

impl Default for Scenario {
    fn default() -> Self {
        Self::base()
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("client", &self.client)
            .field("dns_servers", &self.dns_servers)
            .field("http_servers", &self.http_servers)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsServer")
            .field("addrs", &self.addrs)
            .field("domains", &self.domains)
            .field("aliases", &self.aliases)
            .field("custom_handler", &self.handler.is_some())
            .finish()
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("addrs", &self.addrs)
            .field("domains", &self.domains)
            .field("aliases", &self.aliases)
            .field("custom_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_scenario_is_valid() {
        Scenario::base().validate().unwrap();
    }

    #[test]
    fn preconditions_are_enforced() {
        let mut s = Scenario::base();
        s.client.addrs.clear();
        assert!(matches!(s.validate(), Err(SimulationError::EmptyClientAddrs)));

        let mut s = Scenario::base();
        s.client.resolver = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert!(matches!(s.validate(), Err(SimulationError::UnspecifiedResolver(_))));

        let mut s = Scenario::base();
        s.http_servers[0].domains.clear();
        assert!(matches!(
            s.validate(),
            Err(SimulationError::AliasWithoutDomain {
                role: ServerRole::Http,
                index: 0
            })
        ));

        let mut s = Scenario::base();
        s.dns_servers[1].addrs.clear();
        assert!(matches!(
            s.validate(),
            Err(SimulationError::EmptyServerAddrs {
                role: ServerRole::Dns,
                index: 1
            })
        ));
    }

    #[test]
    fn editors_run_in_order() {
        fn drop_http(s: &mut Scenario) {
            s.http_servers.clear();
        }
        fn add_http(s: &mut Scenario) {
            s.http_servers.push(HttpServer {
                addrs: vec![BLOCKPAGE_ADDR],
                ..HttpServer::default()
            });
        }
        let s = Scenario::base().edited(&[drop_http as ScenarioEditor, add_http]);
        assert_eq!(s.http_servers.len(), 1);
        assert_eq!(s.http_servers[0].addrs, vec![BLOCKPAGE_ADDR]);
    }
}
