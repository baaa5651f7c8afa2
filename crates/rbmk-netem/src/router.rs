use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::filter::{PacketFilter, PassThrough};
use crate::frame::Frame;
use crate::stats::{RouterStats, RouterStatsSnapshot};
use crate::Internet;

/// Moves in-flight frames from the [`Internet`] queue to their destination stacks.
pub trait Route: Send + Sync + 'static {
    /// Route frames until `cancel` fires.
    fn route(self: Arc<Self>, cancel: CancellationToken, internet: Internet) -> BoxFuture<'static, ()>;

    /// Replace the active packet filter. Safe to call while routing.
    fn set_packet_filter(&self, filter: Arc<dyn PacketFilter>);
}

/// Default [`Route`] implementation holding exactly one packet filter.
///
/// The filter is swapped as a whole under a reader/writer lock, so a frame is always evaluated
/// against one complete filter.
pub struct Router {
    filter: RwLock<Arc<dyn PacketFilter>>,
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::with_packet_filter(Arc::new(PassThrough))
    }

    pub fn with_packet_filter(filter: Arc<dyn PacketFilter>) -> Self {
        Self {
            filter: RwLock::new(filter),
            stats: RouterStats::new(),
        }
    }

    pub fn packet_filter(&self) -> Arc<dyn PacketFilter> {
        Arc::clone(&self.filter.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Go back to delivering every frame untouched.
    pub fn clear_packet_filter(&self) {
        self.set_packet_filter(Arc::new(PassThrough));
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one frame through the active filter and deliver whatever survives.
    pub fn route_frame(&self, internet: &Internet, mut frame: Frame) {
        let filter = self.packet_filter();
        let mut injected = Vec::new();
        let drop_frame = filter.should_drop(&mut frame, &mut injected);

        for extra in injected {
            self.stats.frame_injected();
            tracing::debug!(src = %extra.src, dst = %extra.dst, "injecting frame");
            self.deliver(internet, extra);
        }

        if drop_frame {
            self.stats.frame_dropped();
            tracing::debug!(src = %frame.src, dst = %frame.dst, "dropping frame");
            return;
        }
        self.deliver(internet, frame);
    }

    fn deliver(&self, internet: &Internet, frame: Frame) {
        let len = frame.len();
        if internet.deliver(frame) {
            self.stats.frame_routed(len);
        } else {
            self.stats.frame_undeliverable();
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Route for Router {
    fn route(self: Arc<Self>, cancel: CancellationToken, internet: Internet) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::debug!("router started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = internet.next_frame() => match frame {
                        Some(frame) => self.route_frame(&internet, frame),
                        None => break,
                    },
                }
            }
            tracing::debug!(stats = ?self.stats(), "router stopped");
        })
    }

    fn set_packet_filter(&self, filter: Arc<dyn PacketFilter>) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterFn;
    use crate::frame::Payload;

    #[tokio::test]
    async fn filter_can_drop_and_inject() {
        let internet = Internet::new();
        let a = internet.new_stack(&["10.0.0.1".parse().unwrap()]).unwrap();
        let b = internet.new_stack(&["10.0.0.2".parse().unwrap()]).unwrap();
        let sock_a = a.bind_udp("10.0.0.1:1000".parse().unwrap()).unwrap();
        let sock_b = b.bind_udp("10.0.0.2:2000".parse().unwrap()).unwrap();

        let router = Router::new();
        router.set_packet_filter(Arc::new(FilterFn(|frame: &mut Frame, inject: &mut Vec<Frame>| {
            inject.push(frame.reply(Payload::Udp("injected".into())));
            true
        })));

        sock_a.send_to(b"hello", sock_b.local_addr()).await.unwrap();
        let frame = internet.next_frame().await.unwrap();
        router.route_frame(&internet, frame);

        let mut buf = [0u8; 64];
        let (n, from) = sock_a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"injected");
        assert_eq!(from, sock_b.local_addr());

        let stats = router.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_injected, 1);
        assert_eq!(stats.frames_routed, 1);

        router.clear_packet_filter();
        sock_a.send_to(b"again", sock_b.local_addr()).await.unwrap();
        let frame = internet.next_frame().await.unwrap();
        router.route_frame(&internet, frame);
        let (n, _) = sock_b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again");
    }
}
