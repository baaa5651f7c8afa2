use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::frame::{Frame, Payload, Segment};
use crate::{Internet, NetemError};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Largest payload carried by a single stream segment.
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024;

/// `(local, remote)`
type ConnKey = (SocketAddr, SocketAddr);

/// A simulated host bound to one or more addresses.
///
/// Every socket opened through a stack must use one of its addresses; anything else fails with
/// [`NetemError::AddressNotBound`]. Cloning yields another handle to the same host.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

pub(crate) struct StackInner {
    addrs: Vec<IpAddr>,
    internet: Internet,
    state: Mutex<StackState>,
}

struct StackState {
    closed: bool,
    next_port: u16,
    udp: HashMap<SocketAddr, mpsc::UnboundedSender<(Bytes, SocketAddr)>>,
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<TcpStream>>,
    conns: HashMap<ConnKey, Conn>,
}

struct Conn {
    tx: mpsc::UnboundedSender<Segment>,
    /// Set while an outbound connect waits for SYN-ACK.
    handshake: Option<oneshot::Sender<bool>>,
}

impl StackState {
    /// Hand out the next free ephemeral port, wrapping around the range once.
    fn alloc_port(&mut self, ip: IpAddr) -> Result<u16, NetemError> {
        let span = u16::MAX - FIRST_EPHEMERAL_PORT;
        for _ in 0..=span {
            let port = self.next_port;
            self.next_port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            let addr = SocketAddr::new(ip, port);
            let in_use = self.udp.contains_key(&addr)
                || self.listeners.contains_key(&addr)
                || self.conns.keys().any(|(local, _)| *local == addr);
            if !in_use {
                return Ok(port);
            }
        }
        Err(NetemError::PortsExhausted)
    }
}

impl Stack {
    pub(crate) fn new(addrs: Vec<IpAddr>, internet: Internet) -> Self {
        Self {
            inner: Arc::new(StackInner {
                addrs,
                internet,
                state: Mutex::new(StackState {
                    closed: false,
                    next_port: FIRST_EPHEMERAL_PORT,
                    udp: HashMap::new(),
                    listeners: HashMap::new(),
                    conns: HashMap::new(),
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<StackInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn addrs(&self) -> &[IpAddr] {
        &self.inner.addrs
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Bind a datagram socket. Port `0` picks an ephemeral port.
    pub fn bind_udp(&self, addr: SocketAddr) -> Result<UdpSocket, NetemError> {
        self.inner.check_bound(addr.ip())?;
        let mut state = self.inner.lock();
        if state.closed {
            return Err(NetemError::StackClosed);
        }
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), state.alloc_port(addr.ip())?)
        } else {
            addr
        };
        if state.udp.contains_key(&addr) {
            return Err(NetemError::PortInUse(addr));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.udp.insert(addr, tx);
        Ok(UdpSocket {
            stack: Arc::clone(&self.inner),
            local: addr,
            peer: None,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Bind an ephemeral datagram socket whose default peer is `remote`.
    pub fn connect_udp(&self, remote: SocketAddr) -> Result<UdpSocket, NetemError> {
        let local_ip = self.inner.local_ip_for(remote.ip())?;
        let mut socket = self.bind_udp(SocketAddr::new(local_ip, 0))?;
        socket.peer = Some(remote);
        Ok(socket)
    }

    /// Accept stream connections on `addr`. Port `0` picks an ephemeral port.
    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<TcpListener, NetemError> {
        self.inner.check_bound(addr.ip())?;
        let mut state = self.inner.lock();
        if state.closed {
            return Err(NetemError::StackClosed);
        }
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), state.alloc_port(addr.ip())?)
        } else {
            addr
        };
        if state.listeners.contains_key(&addr) {
            return Err(NetemError::PortInUse(addr));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(addr, tx);
        Ok(TcpListener {
            stack: Arc::clone(&self.inner),
            local: addr,
            rx,
        })
    }

    /// Open a stream connection to `remote`.
    ///
    /// Resolves once the peer accepted (or refused) the connection. A connection request dropped
    /// by a packet filter never completes; callers are expected to apply their own timeout.
    pub async fn connect_tcp(&self, remote: SocketAddr) -> Result<TcpStream, NetemError> {
        let local_ip = self.inner.local_ip_for(remote.ip())?;
        let (local, rx, handshake) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(NetemError::StackClosed);
            }
            let local = SocketAddr::new(local_ip, state.alloc_port(local_ip)?);
            let (tx, rx) = mpsc::unbounded_channel();
            let (handshake_tx, handshake_rx) = oneshot::channel();
            state.conns.insert(
                (local, remote),
                Conn {
                    tx,
                    handshake: Some(handshake_tx),
                },
            );
            (local, rx, handshake_rx)
        };

        // Created before awaiting so the connection slot is released if this future is dropped.
        let stream = TcpStream::new(Arc::clone(&self.inner), local, remote, rx);
        self.inner
            .internet
            .submit(Frame::tcp(local, remote, Segment::Syn));

        match handshake.await {
            Ok(true) => Ok(stream),
            Ok(false) => {
                stream.discard();
                Err(NetemError::ConnectionRefused(remote))
            }
            Err(_) => {
                stream.discard();
                Err(NetemError::StackClosed)
            }
        }
    }

    /// Detach the stack from the internet and abort everything it hosts.
    ///
    /// Listeners and datagram sockets observe end-of-stream, established connections observe a
    /// reset and pending connects are refused. Closing twice fails with
    /// [`NetemError::StackClosed`].
    pub fn close(&self) -> Result<(), NetemError> {
        let (udp, listeners, conns) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(NetemError::StackClosed);
            }
            state.closed = true;
            (
                std::mem::take(&mut state.udp),
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.conns),
            )
        };
        self.inner.internet.release(&self.inner.addrs);

        for conn in conns.into_values() {
            match conn.handshake {
                Some(handshake) => {
                    let _ = handshake.send(false);
                }
                None => {
                    let _ = conn.tx.send(Segment::Rst);
                }
            }
        }
        drop(udp);
        drop(listeners);
        tracing::debug!(addrs = ?self.inner.addrs, "stack closed");
        Ok(())
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("addrs", &self.inner.addrs)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StackInner {
    fn lock(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn check_bound(&self, ip: IpAddr) -> Result<(), NetemError> {
        if self.addrs.contains(&ip) {
            Ok(())
        } else {
            Err(NetemError::AddressNotBound(ip))
        }
    }

    fn local_ip_for(&self, remote: IpAddr) -> Result<IpAddr, NetemError> {
        self.addrs
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() == remote.is_ipv4())
            .ok_or(NetemError::NoRouteToHost(remote))
    }

    fn submit(&self, frame: Frame) {
        self.internet.submit(frame);
    }

    pub(crate) fn receive(self: &Arc<Self>, frame: Frame) {
        let Frame { src, dst, payload } = frame;
        match payload {
            Payload::Udp(data) => {
                let state = self.lock();
                match state.udp.get(&dst) {
                    Some(tx) => {
                        let _ = tx.send((data, src));
                    }
                    None => tracing::trace!(%src, %dst, "udp port unreachable"),
                }
            }
            Payload::Tcp(Segment::Syn) => self.on_syn(dst, src),
            Payload::Tcp(segment) => self.on_segment(dst, src, segment),
        }
    }

    fn on_syn(self: &Arc<Self>, local: SocketAddr, remote: SocketAddr) {
        let mut state = self.lock();
        if state.conns.contains_key(&(local, remote)) {
            // Duplicate connection request for a live connection.
            return;
        }
        let listener = if state.closed {
            None
        } else {
            state.listeners.get(&local).cloned()
        };
        let Some(listener) = listener else {
            drop(state);
            tracing::trace!(%local, %remote, "connection refused");
            self.submit(Frame::tcp(local, remote, Segment::Rst));
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        state.conns.insert((local, remote), Conn { tx, handshake: None });
        // SYN-ACK must be queued before anything the accepted side writes.
        self.submit(Frame::tcp(local, remote, Segment::SynAck));
        drop(state);

        let stream = TcpStream::new(Arc::clone(self), local, remote, rx);
        if let Err(mpsc::error::SendError(stream)) = listener.send(stream) {
            stream.abort();
        }
    }

    fn on_segment(&self, local: SocketAddr, remote: SocketAddr, segment: Segment) {
        let answer_with_reset = matches!(segment, Segment::Data(_) | Segment::SynAck);
        let mut state = self.lock();
        let known = match state.conns.get_mut(&(local, remote)) {
            Some(conn) => {
                match (segment, conn.handshake.take()) {
                    (Segment::SynAck, Some(handshake)) => {
                        let _ = handshake.send(true);
                    }
                    (Segment::Rst, Some(handshake)) => {
                        let _ = handshake.send(false);
                    }
                    (segment, handshake) => {
                        conn.handshake = handshake;
                        let _ = conn.tx.send(segment);
                    }
                }
                true
            }
            None => false,
        };
        drop(state);
        if !known && answer_with_reset {
            self.submit(Frame::tcp(local, remote, Segment::Rst));
        }
    }

    fn release_conn(&self, key: ConnKey) {
        self.lock().conns.remove(&key);
    }

    fn release_udp(&self, addr: SocketAddr) {
        self.lock().udp.remove(&addr);
    }

    fn release_listener(&self, addr: SocketAddr) {
        self.lock().listeners.remove(&addr);
    }
}

/// Datagram socket bound to a [`Stack`] address.
pub struct UdpSocket {
    stack: Arc<StackInner>,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
}

impl UdpSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.stack.is_closed() {
            return Err(NetemError::StackClosed.into());
        }
        self.stack
            .submit(Frame::udp(self.local, target, Bytes::copy_from_slice(buf)));
        Ok(buf.len())
    }

    /// Receive one datagram; bytes beyond `buf.len()` are discarded.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(NetemError::StackClosed.into()),
        }
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let peer = self.peer.ok_or_else(not_connected)?;
        self.send_to(buf, peer).await
    }

    /// Receive one datagram from the connected peer, skipping datagrams from anyone else.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let peer = self.peer.ok_or_else(not_connected)?;
        loop {
            let (n, from) = self.recv_from(buf).await?;
            if from == peer {
                return Ok(n);
            }
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.stack.release_udp(self.local);
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket has no default peer")
}

/// Stream listener bound to a [`Stack`] address.
pub struct TcpListener {
    stack: Arc<StackInner>,
    local: SocketAddr,
    rx: mpsc::UnboundedReceiver<TcpStream>,
}

impl TcpListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self.rx.recv().await {
            Some(stream) => {
                let peer = stream.peer_addr();
                Ok((stream, peer))
            }
            None => Err(NetemError::StackClosed.into()),
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.stack.release_listener(self.local);
    }
}

/// One side of a simulated stream connection.
///
/// Writes are split into segments of at most [`MAX_SEGMENT_SIZE`] bytes. Shutting down (or
/// dropping) the stream sends FIN; a peer reset surfaces as
/// [`io::ErrorKind::ConnectionReset`].
pub struct TcpStream {
    stack: Arc<StackInner>,
    local: SocketAddr,
    remote: SocketAddr,
    rx: mpsc::UnboundedReceiver<Segment>,
    pending: Bytes,
    read_eof: bool,
    reset: bool,
    write_closed: bool,
}

impl TcpStream {
    fn new(
        stack: Arc<StackInner>,
        local: SocketAddr,
        remote: SocketAddr,
        rx: mpsc::UnboundedReceiver<Segment>,
    ) -> Self {
        Self {
            stack,
            local,
            remote,
            rx,
            pending: Bytes::new(),
            read_eof: false,
            reset: false,
            write_closed: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Abort the connection with a reset instead of an orderly FIN.
    pub fn abort(mut self) {
        if !self.write_closed {
            self.send(Segment::Rst);
        }
        self.write_closed = true;
    }

    /// Release the connection slot without telling the peer.
    fn discard(mut self) {
        self.write_closed = true;
    }

    fn send(&self, segment: Segment) {
        self.stack
            .submit(Frame::tcp(self.local, self.remote, segment));
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.reset {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Segment::Data(data)) => this.pending = data,
                Some(Segment::Rst) => this.reset = true,
                Some(Segment::Fin) | None => this.read_eof = true,
                Some(Segment::Syn) | Some(Segment::SynAck) => {}
            }
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if this.stack.is_closed() {
            return Poll::Ready(Err(NetemError::StackClosed.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_SEGMENT_SIZE);
        this.send(Segment::Data(Bytes::copy_from_slice(&buf[..n])));
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            if !this.reset {
                this.send(Segment::Fin);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if !self.write_closed && !self.reset {
            self.send(Segment::Fin);
        }
        self.stack.release_conn((self.local, self.remote));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const EPHEMERAL_PORTS: usize = (u16::MAX - FIRST_EPHEMERAL_PORT) as usize + 1;

    fn stack() -> Stack {
        Internet::new()
            .new_stack(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
            .unwrap()
    }

    #[test]
    fn released_ports_are_reused_after_wrapping() {
        let stack = stack();
        let remote: SocketAddr = "10.0.0.2:53".parse().unwrap();
        for i in 0..EPHEMERAL_PORTS + 4096 {
            let sock = stack
                .connect_udp(remote)
                .unwrap_or_else(|err| panic!("socket {i}: {err}"));
            drop(sock);
        }
    }

    #[test]
    fn allocation_skips_ports_still_in_use() {
        let stack = stack();
        let remote: SocketAddr = "10.0.0.2:53".parse().unwrap();
        let held = stack.connect_udp(remote).unwrap();
        for _ in 1..EPHEMERAL_PORTS {
            let sock = stack.connect_udp(remote).unwrap();
            assert_ne!(sock.local_addr(), held.local_addr());
        }
    }

    #[test]
    fn a_full_range_is_exhausted() {
        let stack = stack();
        let remote: SocketAddr = "10.0.0.2:53".parse().unwrap();
        let held: Vec<_> = (0..EPHEMERAL_PORTS)
            .map(|_| stack.connect_udp(remote).unwrap())
            .collect();
        assert!(matches!(
            stack.connect_udp(remote),
            Err(NetemError::PortsExhausted)
        ));
        drop(held);
        stack.connect_udp(remote).unwrap();
    }
}
