use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Frame counters maintained by the [`crate::Router`].
#[derive(Clone, Default)]
pub struct RouterStats {
    inner: Arc<RouterStatsInner>,
}

#[derive(Default)]
struct RouterStatsInner {
    frames_routed: AtomicU64,
    frames_dropped: AtomicU64,
    frames_injected: AtomicU64,
    frames_undeliverable: AtomicU64,
    bytes_routed: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub frames_routed: u64,
    pub frames_dropped: u64,
    pub frames_injected: u64,
    pub frames_undeliverable: u64,
    pub bytes_routed: u64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_routed(&self, bytes: usize) {
        self.inner.frames_routed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_routed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_injected(&self) {
        self.inner.frames_injected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_undeliverable(&self) {
        self.inner
            .frames_undeliverable
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            frames_routed: self.inner.frames_routed.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
            frames_injected: self.inner.frames_injected.load(Ordering::Relaxed),
            frames_undeliverable: self.inner.frames_undeliverable.load(Ordering::Relaxed),
            bytes_routed: self.inner.bytes_routed.load(Ordering::Relaxed),
        }
    }
}
