//! Structured event schema emitted by the measurement commands, one JSON object per line, and
//! the field contracts each event kind must satisfy.

#![forbid(unsafe_code)]

mod b64;
pub mod contract;
mod event;
mod kind;

pub use contract::{verify_event, ContractViolation};
pub use event::{is_zero_time, parse_jsonl, Event, ParseError, ZERO_TIME};
pub use kind::{EventKind, Timing};
