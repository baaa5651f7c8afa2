use std::fmt;

use crate::frame::Frame;

/// Decides, per routed frame, whether it is dropped.
///
/// Implementations may rewrite `frame` in place before returning and may push additional frames
/// into `inject`; the router delivers injected frames ahead of the original one. Filters run on
/// the router task, so they must not block.
pub trait PacketFilter: Send + Sync {
    fn should_drop(&self, frame: &mut Frame, inject: &mut Vec<Frame>) -> bool;
}

/// Delivers every frame untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassThrough;

impl PacketFilter for PassThrough {
    fn should_drop(&self, _frame: &mut Frame, _inject: &mut Vec<Frame>) -> bool {
        false
    }
}

/// Adapts a closure into a [`PacketFilter`].
pub struct FilterFn<F>(pub F);

impl<F> PacketFilter for FilterFn<F>
where
    F: Fn(&mut Frame, &mut Vec<Frame>) -> bool + Send + Sync,
{
    fn should_drop(&self, frame: &mut Frame, inject: &mut Vec<Frame>) -> bool {
        (self.0)(frame, inject)
    }
}

impl<F> fmt::Debug for FilterFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterFn")
    }
}
