use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::frame::{Frame, Payload, Segment};
use crate::stack::{Stack, StackInner};
use crate::NetemError;

/// Shared substrate connecting every [`Stack`] of a simulated topology.
///
/// Stacks submit frames with [`Internet::submit`]; a router drains them with
/// [`Internet::next_frame`] and hands each one back through [`Internet::deliver`]. The in-flight
/// queue is unbounded so that submitting never blocks a simulated host.
#[derive(Clone)]
pub struct Internet {
    inner: Arc<InternetInner>,
}

struct InternetInner {
    hosts: Mutex<HashMap<IpAddr, Weak<StackInner>>>,
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl Internet {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(InternetInner {
                hosts: Mutex::new(HashMap::new()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Create a stack owning `addrs`.
    ///
    /// Fails when `addrs` is empty or when any address is already owned by a live stack.
    pub fn new_stack(&self, addrs: &[IpAddr]) -> Result<Stack, NetemError> {
        if addrs.is_empty() {
            return Err(NetemError::EmptyAddressSet);
        }
        let mut unique: Vec<IpAddr> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !unique.contains(addr) {
                unique.push(*addr);
            }
        }

        let mut hosts = self.hosts();
        // Stacks dropped without an explicit close leave stale entries behind.
        hosts.retain(|_, stack| stack.strong_count() > 0);
        if let Some(taken) = unique.iter().find(|addr| hosts.contains_key(addr)) {
            return Err(NetemError::AddressInUse(*taken));
        }

        let stack = Stack::new(unique, self.clone());
        for addr in stack.addrs() {
            hosts.insert(*addr, stack.downgrade());
        }
        tracing::debug!(addrs = ?stack.addrs(), "stack created");
        Ok(stack)
    }

    /// Queue a frame for routing.
    pub fn submit(&self, frame: Frame) {
        // The receiver lives as long as `self.inner`, so this cannot fail.
        let _ = self.inner.tx.send(frame);
    }

    /// Wait for the next in-flight frame.
    ///
    /// Intended for a single router task; concurrent callers are serialized.
    pub async fn next_frame(&self) -> Option<Frame> {
        self.inner.rx.lock().await.recv().await
    }

    /// Hand `frame` to the stack owning its destination address.
    ///
    /// Returns `false` when no live stack owns the destination. Undeliverable connection requests
    /// are answered with a reset so that connects fail fast instead of hanging.
    pub fn deliver(&self, frame: Frame) -> bool {
        let host = self
            .hosts()
            .get(&frame.dst.ip())
            .and_then(Weak::upgrade);
        match host {
            Some(stack) => {
                stack.receive(frame);
                true
            }
            None => {
                tracing::trace!(src = %frame.src, dst = %frame.dst, "no route to host");
                if frame.payload == Payload::Tcp(Segment::Syn) {
                    self.submit(frame.reply(Payload::Tcp(Segment::Rst)));
                }
                false
            }
        }
    }

    /// Addresses currently owned by live stacks.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let hosts = self.hosts();
        let mut out: Vec<IpAddr> = hosts
            .iter()
            .filter(|(_, stack)| stack.strong_count() > 0)
            .map(|(addr, _)| *addr)
            .collect();
        out.sort();
        out
    }

    pub(crate) fn release(&self, addrs: &[IpAddr]) {
        let mut hosts = self.hosts();
        for addr in addrs {
            hosts.remove(addr);
        }
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<IpAddr, Weak<StackInner>>> {
        self.inner
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Internet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Internet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Internet")
            .field("addresses", &self.addresses())
            .finish()
    }
}
