//! Builds a running topology from a [`Scenario`].

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rbmk_netem::ca::{DOT_ALPN, HTTP1_ALPN, HTTP_ALPN};
use rbmk_netem::dns::wire::{Message, RecordData, ResponseCode, TYPE_A, TYPE_AAAA};
use rbmk_netem::server::{
    default_http_router, doh_router, serve_dns_tcp, serve_dns_tls, serve_dns_udp, serve_http,
    DNS_PORT, DOT_PORT, HTTPS_PORT, HTTP_PORT,
};
use rbmk_netem::{
    CaError, CertificateAuthority, DatabaseHandler, DnsDatabase, DnsHandler, Internet,
    IssuedCert, NetemError, Route, ServerHandle, Stack, TcpStream, UdpSocket,
};
use rustls::{ClientConfig, RootCertStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LookupError, SimulationError};
use crate::scenario::{DnsServer, HttpServer, Scenario};
use crate::teardown::{Closer, TeardownError, TeardownReport, TeardownStack};
use crate::timeouts::within;

const MAX_LOOKUP_ALIASES: usize = 8;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Per-query limit applied by [`Simulation::lookup_host`]; `None` waits forever.
    pub lookup_timeout: Option<Duration>,
    /// Offer HTTP/2 on HTTPS endpoints in addition to HTTP/1.1.
    pub http2: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Some(Duration::from_secs(5)),
            http2: true,
        }
    }
}

impl SimulationConfig {
    fn https_alpn(&self) -> &'static [&'static [u8]] {
        if self.http2 {
            HTTP_ALPN
        } else {
            HTTP1_ALPN
        }
    }
}

/// A live simulated topology.
///
/// The router task runs until the cancellation token passed to [`Simulation::new`] fires; it
/// then releases every registered resource in reverse registration order. Cancel the token
/// before calling [`Simulation::wait`].
pub struct Simulation {
    internet: Internet,
    db: DnsDatabase,
    ca: Arc<CertificateAuthority>,
    client: Stack,
    resolver: IpAddr,
    config: SimulationConfig,
    closers: Vec<String>,
    task: JoinHandle<Result<TeardownReport, TeardownError>>,
    next_query_id: AtomicU16,
}

impl Simulation {
    pub async fn new<R: Route>(
        cancel: CancellationToken,
        cert_dir: impl Into<PathBuf>,
        scenario: Scenario,
        router: Arc<R>,
    ) -> Result<Self, SimulationError> {
        Self::with_config(cancel, cert_dir, scenario, router, SimulationConfig::default()).await
    }

    pub async fn with_config<R: Route>(
        cancel: CancellationToken,
        cert_dir: impl Into<PathBuf>,
        scenario: Scenario,
        router: Arc<R>,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        scenario.validate()?;

        let internet = Internet::new();
        let db = DnsDatabase::new();
        let ca = Arc::new(CertificateAuthority::new(cert_dir)?);
        let mut builder = Builder {
            internet: &internet,
            db: &db,
            ca: &ca,
            config: &config,
            teardown: TeardownStack::new(),
        };

        let client = match builder.build_all(&scenario) {
            Ok(client) => client,
            Err(err) => {
                tracing::debug!(%err, "simulation build failed, unwinding");
                // Build errors take precedence over cleanup errors.
                if let Err(cleanup) = builder.teardown.unwind().await {
                    tracing::debug!(%cleanup, "partial simulation did not close cleanly");
                }
                return Err(err);
            }
        };

        let teardown = builder.teardown;
        let closers = teardown.labels();
        router.set_packet_filter(Arc::clone(&scenario.packet_filter));
        let route = Arc::clone(&router).route(cancel, internet.clone());
        let task = tokio::spawn(async move {
            route.await;
            teardown.unwind().await
        });

        tracing::debug!(
            stacks = internet.addresses().len(),
            closers = closers.len(),
            "simulation ready"
        );
        Ok(Self {
            internet,
            db,
            ca,
            client,
            resolver: scenario.client.resolver,
            config,
            closers,
            task,
            next_query_id: AtomicU16::new(1),
        })
    }

    /// Wait for teardown to finish. Never returns unless the build token was cancelled.
    pub async fn wait(self) -> Result<TeardownReport, TeardownError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(TeardownError {
                report: TeardownReport::default(),
                failures: vec![crate::teardown::CloseFailure {
                    label: "router".to_string(),
                    error: err.to_string(),
                }],
            }),
        }
    }

    /// Labels of the registered closers, in registration order.
    pub fn registered_closers(&self) -> &[String] {
        &self.closers
    }

    pub fn internet(&self) -> &Internet {
        &self.internet
    }

    pub fn client_stack(&self) -> &Stack {
        &self.client
    }

    pub fn dns_database(&self) -> &DnsDatabase {
        &self.db
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn resolver(&self) -> SocketAddr {
        SocketAddr::new(self.resolver, DNS_PORT)
    }

    /// Trust anchors for every certificate issued by this simulation.
    pub fn root_store(&self) -> Result<RootCertStore, CaError> {
        self.ca.root_store()
    }

    pub fn client_tls_config(&self, alpn: &[&[u8]]) -> Result<ClientConfig, CaError> {
        self.ca.client_config(alpn)
    }

    /// Open a stream connection from the client stack.
    pub async fn dial_tcp(&self, remote: SocketAddr) -> Result<TcpStream, NetemError> {
        self.client.connect_tcp(remote).await
    }

    /// Open a datagram socket on the client stack connected to `remote`.
    pub fn dial_udp(&self, remote: SocketAddr) -> Result<UdpSocket, NetemError> {
        self.client.connect_udp(remote)
    }

    /// Resolve `domain` to its A and AAAA addresses through the client's resolver over UDP.
    pub async fn lookup_host(&self, domain: &str) -> Result<Vec<IpAddr>, LookupError> {
        let mut addrs = Vec::new();
        for qtype in [TYPE_A, TYPE_AAAA] {
            addrs.extend(self.lookup_chain(domain, qtype).await?);
        }
        if addrs.is_empty() {
            return Err(LookupError::NoAddresses {
                domain: domain.to_string(),
            });
        }
        Ok(addrs)
    }

    async fn lookup_chain(&self, domain: &str, qtype: u16) -> Result<Vec<IpAddr>, LookupError> {
        let mut name = domain.to_string();
        for _ in 0..=MAX_LOOKUP_ALIASES {
            let response = self.exchange(&name, qtype).await?;
            match response.rcode() {
                rcode if rcode == ResponseCode::NoError as u8 => {}
                rcode if rcode == ResponseCode::NameError as u8 => {
                    return Err(LookupError::NoSuchHost(domain.to_string()))
                }
                rcode => {
                    return Err(LookupError::ServerFailure {
                        domain: domain.to_string(),
                        rcode,
                    })
                }
            }
            let addrs = response.addresses();
            if !addrs.is_empty() {
                return Ok(addrs);
            }
            // Follow a CNAME the resolver did not chase itself.
            let target = response.answers.iter().rev().find_map(|rr| match &rr.data {
                RecordData::Cname(target) => Some(target.clone()),
                _ => None,
            });
            match target {
                Some(target) => name = target,
                None => return Ok(Vec::new()),
            }
        }
        Err(LookupError::TooManyAliases(domain.to_string()))
    }

    async fn exchange(&self, name: &str, qtype: u16) -> Result<Message, LookupError> {
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let socket = self.client.connect_udp(self.resolver())?;
        socket.send(&Message::query(id, name, qtype).encode()?).await?;

        let receive = async {
            let mut buf = vec![0u8; 65_535];
            loop {
                let n = socket.recv(&mut buf).await?;
                match Message::parse(&buf[..n]) {
                    Ok(msg) if msg.is_response() && msg.id == id => return Ok::<_, LookupError>(msg),
                    Ok(_) => continue,
                    Err(err) => tracing::debug!(%err, "ignoring malformed DNS response"),
                }
            }
        };
        within(self.config.lookup_timeout, receive)
            .await
            .ok_or_else(|| LookupError::Timeout(name.to_string()))?
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("client", &self.client)
            .field("resolver", &self.resolver)
            .field("closers", &self.closers.len())
            .finish_non_exhaustive()
    }
}

struct Builder<'a> {
    internet: &'a Internet,
    db: &'a DnsDatabase,
    ca: &'a CertificateAuthority,
    config: &'a SimulationConfig,
    teardown: TeardownStack,
}

impl Builder<'_> {
    fn build_all(&mut self, scenario: &Scenario) -> Result<Stack, SimulationError> {
        let client = self.internet.new_stack(&scenario.client.addrs)?;
        self.teardown.push(Closer::new(
            format!("client stack {}", join_addrs(&scenario.client.addrs)),
            client.clone(),
        ));

        for server in &scenario.dns_servers {
            self.build_dns_server(server)?;
        }
        for server in &scenario.http_servers {
            self.build_http_server(server)?;
        }
        Ok(client)
    }

    /// Stack, database registration and (when the server has a domain) certificate.
    fn provision(
        &mut self,
        role: &str,
        addrs: &[IpAddr],
        domains: &[String],
        aliases: &[String],
    ) -> Result<(Stack, Option<IssuedCert>), SimulationError> {
        let stack = self.internet.new_stack(addrs)?;
        self.teardown.push(Closer::new(
            format!("{role} stack {}", join_addrs(addrs)),
            stack.clone(),
        ));

        for domain in domains {
            self.db.add_addresses(domain, addrs);
        }
        let Some(primary) = domains.first() else {
            return Ok((stack, None));
        };
        for alias in aliases {
            self.db.add_alias(alias, primary);
        }

        let mut seen = HashSet::new();
        let names: Vec<String> = domains
            .iter()
            .chain(aliases)
            .filter(|name| seen.insert(name.to_ascii_lowercase()))
            .cloned()
            .collect();
        let cert = self.ca.issue(&names, addrs)?;
        tracing::debug!(role, names = ?names, "provisioned server");
        Ok((stack, Some(cert)))
    }

    fn build_dns_server(&mut self, server: &DnsServer) -> Result<(), SimulationError> {
        let (stack, cert) = self.provision("dns", &server.addrs, &server.domains, &server.aliases)?;
        let handler: Arc<dyn DnsHandler> = match &server.handler {
            Some(handler) => Arc::clone(handler),
            None => Arc::new(DatabaseHandler::new(self.db.clone())),
        };
        let dot = cert
            .as_ref()
            .map(|cert| cert.server_config(DOT_ALPN))
            .transpose()?;
        let doh = cert
            .as_ref()
            .map(|cert| cert.server_config(self.config.https_alpn()))
            .transpose()?;

        for ip in &server.addrs {
            let udp = serve_dns_udp(&stack, SocketAddr::new(*ip, DNS_PORT), Arc::clone(&handler))?;
            self.register(udp);
            let tcp = serve_dns_tcp(&stack, SocketAddr::new(*ip, DNS_PORT), Arc::clone(&handler))?;
            self.register(tcp);
            if let (Some(dot), Some(doh)) = (&dot, &doh) {
                let tls = serve_dns_tls(
                    &stack,
                    SocketAddr::new(*ip, DOT_PORT),
                    Arc::clone(&handler),
                    Arc::clone(dot),
                )?;
                self.register(tls);
                let https = serve_http(
                    &stack,
                    SocketAddr::new(*ip, HTTPS_PORT),
                    doh_router(Arc::clone(&handler)),
                    Some(Arc::clone(doh)),
                )?;
                self.register(https);
            }
        }
        Ok(())
    }

    fn build_http_server(&mut self, server: &HttpServer) -> Result<(), SimulationError> {
        let (stack, cert) =
            self.provision("http", &server.addrs, &server.domains, &server.aliases)?;
        let router = server.handler.clone().unwrap_or_else(default_http_router);
        let tls = cert
            .as_ref()
            .map(|cert| cert.server_config(self.config.https_alpn()))
            .transpose()?;

        for ip in &server.addrs {
            let http = serve_http(&stack, SocketAddr::new(*ip, HTTP_PORT), router.clone(), None)?;
            self.register(http);
            if let Some(tls) = &tls {
                let https = serve_http(
                    &stack,
                    SocketAddr::new(*ip, HTTPS_PORT),
                    router.clone(),
                    Some(Arc::clone(tls)),
                )?;
                self.register(https);
            }
        }
        Ok(())
    }

    fn register(&mut self, server: ServerHandle) {
        let label = format!("{} server {}", server.protocol(), server.local_addr());
        self.teardown.push(Closer::new(label, server));
    }
}

fn join_addrs(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
