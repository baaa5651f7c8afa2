//! A small `dig` stand-in that runs against a [`Simulation`] and writes the same structured
//! events the real command emits, so registry entries can be checked end to end.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use rbmk_events::Event;
use rbmk_netem::ca::{DOT_ALPN, HTTP1_ALPN};
use rbmk_netem::dns::wire::{Message, TYPE_A, TYPE_AAAA};
use rbmk_netem::server::{DNS_MESSAGE_CONTENT_TYPE, DNS_PORT, DOH_PATH, DOT_PORT, HTTPS_PORT};
use rbmk_netem::{TcpStream, UdpSocket};
use rbmk_qa::Simulation;
use rustls::pki_types::ServerName;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

pub const READ_BUFFER_SIZE: usize = 65_535;
pub const QUERY_ID: u16 = 0x2a2a;
pub const TIMEOUT_ERR: &str = "i/o timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp { wait_duplicates: bool },
    Tcp,
    Tls,
    Https,
}

#[derive(Debug)]
struct DigArgs {
    transport: Transport,
    server: String,
    qtype: u16,
    name: String,
}

fn parse_argv(argv: &[&str]) -> Result<DigArgs, String> {
    let mut transport = Transport::Udp {
        wait_duplicates: false,
    };
    let mut server = None;
    let mut qtype = TYPE_A;
    let mut name = None;
    for arg in argv.iter().skip(1) {
        match *arg {
            "+udp" => transport = Transport::Udp { wait_duplicates: false },
            "+udp=wait-duplicates" => transport = Transport::Udp { wait_duplicates: true },
            "+tcp" => transport = Transport::Tcp,
            "+tls" => transport = Transport::Tls,
            "+https" => transport = Transport::Https,
            "A" => qtype = TYPE_A,
            "AAAA" => qtype = TYPE_AAAA,
            other => {
                if let Some(addr) = other.strip_prefix('@') {
                    server = Some(addr.to_string());
                } else if other.starts_with('+') {
                    return Err(format!("unsupported flag {other}"));
                } else {
                    name = Some(other.to_string());
                }
            }
        }
    }
    Ok(DigArgs {
        transport,
        server: server.ok_or("missing @server")?,
        qtype,
        name: name.ok_or("missing query name")?,
    })
}

/// What the probe observed: its JSONL log, its terminal error and every DNS response it read.
#[derive(Debug)]
pub struct DigOutcome {
    pub jsonl: String,
    pub err: Option<String>,
    pub responses: Vec<Message>,
}

impl DigOutcome {
    /// Addresses carried by each response, in arrival order.
    pub fn answers(&self) -> Vec<Vec<IpAddr>> {
        self.responses.iter().map(Message::addresses).collect()
    }
}

#[derive(Default)]
struct Log {
    events: Vec<Event>,
}

impl Log {
    fn emit(&mut self, ev: Event) {
        self.events.push(ev);
    }

    fn jsonl(&self) -> String {
        self.events
            .iter()
            .map(|ev| ev.to_json_line().unwrap() + "\n")
            .collect()
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Endpoints of one connection.
struct Conn {
    protocol: &'static str,
    local: String,
    remote: String,
}

impl Conn {
    fn new(protocol: &'static str, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            protocol,
            local: local.to_string(),
            remote: remote.to_string(),
        }
    }

    fn event(&self, msg: &str, t: OffsetDateTime) -> Event {
        Event::new(msg, t).with_endpoints(self.protocol, &self.local, &self.remote)
    }

    fn io_done(&self, msg: &str, t0: OffsetDateTime, buffer: usize, result: &io::Result<usize>) -> Event {
        let ev = self.event(msg, now()).with_span(t0);
        match result {
            Ok(n) => ev.with_io(buffer as i64, Some(*n as i64)),
            Err(err) => ev
                .with_io(buffer as i64, None)
                .with_failure(&err.to_string(), err_class(err)),
        }
    }
}

/// The DNS server an exchange talks to.
struct Server {
    addr: String,
    protocol: &'static str,
}

impl Server {
    fn event(&self, msg: &str, t: OffsetDateTime) -> Event {
        Event::new(msg, t).with_server(&self.addr, self.protocol)
    }

    fn query(&self, raw: &[u8]) -> Event {
        let mut ev = self.event("dnsQuery", now());
        ev.dns_raw_query = Some(raw.to_vec());
        ev
    }

    fn response(&self, raw: &[u8]) -> Event {
        let mut ev = self.event("dnsResponse", now());
        ev.dns_raw_response = Some(raw.to_vec());
        ev
    }
}

fn err_class(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::UnexpectedEof => "EEOF",
        _ => "EGENERIC",
    }
}

async fn with_deadline<T>(deadline: Instant, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, TIMEOUT_ERR)),
    }
}

/// Run `argv` (`dig [+udp|+udp=wait-duplicates|+tcp|+tls|+https] @SERVER [A|AAAA] NAME`) from the
/// simulation's client stack.
pub async fn run_dig(sim: &Simulation, argv: &[&str], timeout: Duration) -> DigOutcome {
    let mut log = Log::default();
    let result = match parse_argv(argv) {
        Ok(args) => dig(sim, &args, timeout, &mut log).await,
        Err(err) => Err(err),
    };
    let jsonl = log.jsonl();
    match result {
        Ok(responses) => DigOutcome {
            jsonl,
            err: None,
            responses,
        },
        Err(err) => DigOutcome {
            jsonl,
            err: Some(err),
            responses: Vec::new(),
        },
    }
}

async fn dig(sim: &Simulation, args: &DigArgs, timeout: Duration, log: &mut Log) -> Result<Vec<Message>, String> {
    let ip = match args.server.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => sim.lookup_host(&args.server).await.map_err(|e| e.to_string())?[0],
    };
    let query = Message::query(QUERY_ID, &args.name, args.qtype)
        .encode()
        .map_err(|err| err.to_string())?;

    match args.transport {
        Transport::Udp { wait_duplicates } => {
            let remote = SocketAddr::new(ip, DNS_PORT);
            let socket = connect_udp(sim, remote, log)?;
            let conn = Conn::new("udp", socket.local_addr(), remote);
            let server = Server {
                addr: remote.to_string(),
                protocol: "udp",
            };
            let deadline = Instant::now() + timeout;
            let started = now();
            log.emit(server.event("dnsExchangeStart", started));
            log.emit(conn.event("setDeadline", now()));
            let result = udp_roundtrips(&socket, &conn, &server, &query, wait_duplicates, deadline, log).await;
            exchange_done(log, &server, started, &result);

            let t0 = now();
            log.emit(conn.event("closeStart", t0));
            drop(socket);
            log.emit(conn.event("closeDone", now()).with_span(t0));
            result
        }
        Transport::Tcp => {
            let remote = SocketAddr::new(ip, DNS_PORT);
            let stream = connect_tcp(sim, remote, log).await?;
            let conn = Conn::new("tcp", stream.local_addr(), remote);
            let server = Server {
                addr: remote.to_string(),
                protocol: "tcp",
            };
            stream_exchange(stream, &conn, &server, &query, Instant::now() + timeout, log).await
        }
        Transport::Tls => {
            let remote = SocketAddr::new(ip, DOT_PORT);
            let stream = connect_tcp(sim, remote, log).await?;
            let conn = Conn::new("tcp", stream.local_addr(), remote);
            let deadline = Instant::now() + timeout;
            let tls = tls_handshake(sim, stream, &conn, &args.server, DOT_ALPN, deadline, log).await?;
            let server = Server {
                addr: remote.to_string(),
                protocol: "dot",
            };
            stream_exchange(tls, &conn, &server, &query, deadline, log).await
        }
        Transport::Https => {
            let remote = SocketAddr::new(ip, HTTPS_PORT);
            let stream = connect_tcp(sim, remote, log).await?;
            let conn = Conn::new("tcp", stream.local_addr(), remote);
            let deadline = Instant::now() + timeout;
            let tls = tls_handshake(sim, stream, &conn, &args.server, HTTP1_ALPN, deadline, log).await?;
            let url = format!("https://{}{DOH_PATH}", args.server);
            let server = Server {
                addr: url.clone(),
                protocol: "doh",
            };
            let started = now();
            log.emit(server.event("dnsExchangeStart", started));
            let result = doh_roundtrip(tls, &conn, &server, &args.server, &url, &query, deadline, log).await;
            exchange_done(log, &server, started, &result);

            let t0 = now();
            log.emit(conn.event("closeStart", t0));
            log.emit(conn.event("closeDone", now()).with_span(t0));
            result
        }
    }
}

fn connect_udp(sim: &Simulation, remote: SocketAddr, log: &mut Log) -> Result<UdpSocket, String> {
    let t0 = now();
    log.emit(connect_event("connectStart", t0, "udp", remote));
    match sim.dial_udp(remote) {
        Ok(socket) => {
            let conn = Conn::new("udp", socket.local_addr(), remote);
            log.emit(conn.event("connectDone", now()).with_span(t0));
            Ok(socket)
        }
        Err(err) => {
            let err = io::Error::from(err);
            log.emit(
                connect_event("connectDone", now(), "udp", remote)
                    .with_span(t0)
                    .with_failure(&err.to_string(), err_class(&err)),
            );
            Err(err.to_string())
        }
    }
}

async fn connect_tcp(sim: &Simulation, remote: SocketAddr, log: &mut Log) -> Result<TcpStream, String> {
    let t0 = now();
    log.emit(connect_event("connectStart", t0, "tcp", remote));
    match sim.dial_tcp(remote).await {
        Ok(stream) => {
            let conn = Conn::new("tcp", stream.local_addr(), remote);
            log.emit(conn.event("connectDone", now()).with_span(t0));
            Ok(stream)
        }
        Err(err) => {
            let err = io::Error::from(err);
            log.emit(
                connect_event("connectDone", now(), "tcp", remote)
                    .with_span(t0)
                    .with_failure(&err.to_string(), err_class(&err)),
            );
            Err(err.to_string())
        }
    }
}

fn connect_event(msg: &str, t: OffsetDateTime, protocol: &str, remote: SocketAddr) -> Event {
    let mut ev = Event::new(msg, t);
    ev.protocol = Some(protocol.to_string());
    ev.remote_addr = Some(remote.to_string());
    ev
}

fn exchange_done(log: &mut Log, server: &Server, t0: OffsetDateTime, result: &Result<Vec<Message>, String>) {
    let ev = server.event("dnsExchangeDone", now()).with_span(t0);
    log.emit(match result {
        Ok(_) => ev,
        Err(err) if err.contains("timeout") => ev.with_failure(err, "ETIMEDOUT"),
        Err(err) => ev.with_failure(err, "EGENERIC"),
    });
}

async fn udp_roundtrips(
    socket: &UdpSocket,
    conn: &Conn,
    server: &Server,
    query: &[u8],
    wait_duplicates: bool,
    deadline: Instant,
    log: &mut Log,
) -> Result<Vec<Message>, String> {
    let t0 = now();
    log.emit(conn.event("writeStart", t0).with_io(query.len() as i64, None));
    let result = with_deadline(deadline, socket.send(query)).await;
    log.emit(conn.io_done("writeDone", t0, query.len(), &result));
    result.map_err(|e| e.to_string())?;
    log.emit(server.query(query));

    let mut responses = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let t0 = now();
        log.emit(conn.event("readStart", t0).with_io(READ_BUFFER_SIZE as i64, None));
        let result = with_deadline(deadline, socket.recv(&mut buf)).await;
        log.emit(conn.io_done("readDone", t0, READ_BUFFER_SIZE, &result));
        match result {
            Ok(n) => {
                let Ok(msg) = Message::parse(&buf[..n]) else {
                    continue;
                };
                if !msg.is_response() || msg.id != QUERY_ID {
                    continue;
                }
                log.emit(server.response(&buf[..n]));
                responses.push(msg);
                if !wait_duplicates {
                    return Ok(responses);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut && !responses.is_empty() => {
                return Ok(responses)
            }
            Err(err) => return Err(err.to_string()),
        }
    }
}

async fn stream_exchange<S>(
    mut stream: S,
    conn: &Conn,
    server: &Server,
    query: &[u8],
    deadline: Instant,
    log: &mut Log,
) -> Result<Vec<Message>, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = now();
    log.emit(server.event("dnsExchangeStart", started));
    log.emit(conn.event("setDeadline", now()));
    let result = stream_roundtrip(&mut stream, conn, server, query, deadline, log).await;
    exchange_done(log, server, started, &result);

    let t0 = now();
    log.emit(conn.event("closeStart", t0));
    let _ = with_deadline(deadline, stream.shutdown()).await;
    log.emit(conn.event("closeDone", now()).with_span(t0));
    result
}

async fn stream_roundtrip<S>(
    stream: &mut S,
    conn: &Conn,
    server: &Server,
    query: &[u8],
    deadline: Instant,
    log: &mut Log,
) -> Result<Vec<Message>, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = (query.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(query);
    let t0 = now();
    log.emit(conn.event("writeStart", t0).with_io(framed.len() as i64, None));
    let result = with_deadline(deadline, async {
        stream.write_all(&framed).await?;
        stream.flush().await?;
        Ok::<_, io::Error>(framed.len())
    })
    .await;
    log.emit(conn.io_done("writeDone", t0, framed.len(), &result));
    result.map_err(|e| e.to_string())?;
    log.emit(server.query(query));

    let mut len = [0u8; 2];
    let t0 = now();
    log.emit(conn.event("readStart", t0).with_io(2, None));
    let result = with_deadline(deadline, stream.read_exact(&mut len)).await;
    log.emit(conn.io_done("readDone", t0, 2, &result));
    result.map_err(|e| e.to_string())?;

    let mut raw = vec![0u8; u16::from_be_bytes(len) as usize];
    if raw.is_empty() {
        return Err("empty DNS response".to_string());
    }
    let t0 = now();
    log.emit(conn.event("readStart", t0).with_io(raw.len() as i64, None));
    let result = with_deadline(deadline, stream.read_exact(&mut raw)).await;
    log.emit(conn.io_done("readDone", t0, raw.len(), &result));
    result.map_err(|e| e.to_string())?;

    let msg = Message::parse(&raw).map_err(|e| e.to_string())?;
    log.emit(server.response(&raw));
    Ok(vec![msg])
}

async fn tls_handshake(
    sim: &Simulation,
    stream: TcpStream,
    conn: &Conn,
    server_name: &str,
    alpn: &[&[u8]],
    deadline: Instant,
    log: &mut Log,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, String> {
    let config = sim.client_tls_config(alpn).map_err(|e| e.to_string())?;
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| e.to_string())?;

    let t0 = now();
    let mut start = conn.event("tlsHandshakeStart", t0);
    start.tls_server_name = Some(server_name.to_string());
    start.tls_skip_verify = Some(false);
    log.emit(start);
    log.emit(conn.event("setDeadline", now()));

    let result = with_deadline(deadline, TlsConnector::from(Arc::new(config)).connect(name, stream)).await;
    let mut done = conn.event("tlsHandshakeDone", now()).with_span(t0);
    done.tls_server_name = Some(server_name.to_string());
    done.tls_skip_verify = Some(false);
    match result {
        Ok(tls) => {
            let (_, session) = tls.get_ref();
            done.tls_version = session.protocol_version().map(|v| format!("{v:?}"));
            done.tls_cipher_suite = session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite()));
            done.tls_negotiated_protocol = session
                .alpn_protocol()
                .map(|proto| String::from_utf8_lossy(proto).into_owned());
            done.tls_peer_certs = session
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.to_vec()).collect());
            log.emit(done);
            Ok(tls)
        }
        Err(err) => {
            log.emit(done.with_failure(&err.to_string(), err_class(&err)));
            Err(err.to_string())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn doh_roundtrip(
    tls: tokio_rustls::client::TlsStream<TcpStream>,
    conn: &Conn,
    server: &Server,
    host: &str,
    url: &str,
    query: &[u8],
    deadline: Instant,
    log: &mut Log,
) -> Result<Vec<Message>, String> {
    log.emit(server.query(query));
    let t0 = now();
    log.emit(http_event("httpRoundTripStart", t0, url));
    log.emit(conn.event("setDeadline", now()));

    let result = with_deadline(deadline, async {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(io::Error::other)?;
        tokio::spawn(connection);
        let req = hyper::Request::post(DOH_PATH)
            .header("host", host)
            .header("content-type", DNS_MESSAGE_CONTENT_TYPE)
            .header("accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(Full::new(Bytes::copy_from_slice(query)))
            .map_err(io::Error::other)?;
        let resp = sender.send_request(req).await.map_err(io::Error::other)?;
        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(io::Error::other)?
            .to_bytes();
        Ok::<_, io::Error>((status, body))
    })
    .await;

    let mut done = http_event("httpRoundTripDone", now(), url).with_span(t0);
    match result {
        Ok((status, body)) => {
            done.http_response_status_code = Some(status);
            log.emit(done);
            if status != 200 {
                return Err(format!("unexpected HTTP status {status}"));
            }
            let msg = Message::parse(&body).map_err(|e| e.to_string())?;
            log.emit(server.response(&body));
            Ok(vec![msg])
        }
        Err(err) => {
            log.emit(done.with_failure(&err.to_string(), err_class(&err)));
            Err(err.to_string())
        }
    }
}

fn http_event(msg: &str, t: OffsetDateTime, url: &str) -> Event {
    let mut ev = Event::new(msg, t);
    ev.http_method = Some("POST".to_string());
    ev.http_url = Some(url.to_string());
    ev
}
