//! Checks a captured event log against an expected sequence.
//!
//! Expectations are either exact messages or wildcard [`Pattern`]s. A wildcard greedily absorbs
//! zero or more consecutive low-level I/O events of the selected classes, which lets a single
//! expected sequence accept the variable number of reads, writes and deadline updates a real
//! run produces while still pinning the order of the protocol milestones.

use std::fmt;

use bitflags::bitflags;
use rbmk_events::{parse_jsonl, verify_event, ContractViolation, Event, EventKind, ParseError};
use thiserror::Error;

bitflags! {
    /// Classes of I/O events a wildcard absorbs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Pattern: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CLOSE = 1 << 2;
        const SET_DEADLINE = 1 << 3;
    }
}

impl Pattern {
    pub const READ_WRITE_DEADLINE: Pattern =
        Pattern::READ.union(Pattern::WRITE).union(Pattern::SET_DEADLINE);
    pub const ANY_IO: Pattern = Pattern::all();

    pub fn matches(self, kind: &EventKind) -> bool {
        (self.contains(Pattern::READ) && kind.is_read())
            || (self.contains(Pattern::WRITE) && kind.is_write())
            || (self.contains(Pattern::CLOSE) && kind.is_close())
            || (self.contains(Pattern::SET_DEADLINE) && kind.is_set_deadline())
    }

    pub fn matches_msg(self, msg: &str) -> bool {
        self.matches(&EventKind::from_msg(msg))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedEvent {
    Message(&'static str),
    Pattern(Pattern),
}

impl fmt::Display for ExpectedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedEvent::Message(msg) => f.write_str(msg),
            ExpectedEvent::Pattern(pattern) => {
                let names: Vec<&str> = pattern.iter_names().map(|(name, _)| name).collect();
                write!(f, "<{}>", names.join("|"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("event #{index}: expected {expected:?}, got {actual:?}")]
    Mismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("event #{index} ({msg:?}) and later are not expected")]
    LeftoverActual { index: usize, msg: String },
    #[error("log ended while still expecting {expected:?} (expectation #{index})")]
    LeftoverExpected { index: usize, expected: String },
}

/// Match `actual` messages against `expected`.
///
/// Runs in time linear in the combined lengths and succeeds only when both sequences are
/// exhausted together.
pub fn verify_sequence<S: AsRef<str>>(
    actual: &[S],
    expected: &[ExpectedEvent],
) -> Result<(), SequenceError> {
    let mut cursor = 0usize;
    for (index, expectation) in expected.iter().enumerate() {
        match expectation {
            ExpectedEvent::Message(want) => {
                let Some(got) = actual.get(cursor) else {
                    return Err(SequenceError::LeftoverExpected {
                        index,
                        expected: want.to_string(),
                    });
                };
                if got.as_ref() != *want {
                    return Err(SequenceError::Mismatch {
                        index: cursor,
                        expected: want.to_string(),
                        actual: got.as_ref().to_string(),
                    });
                }
                cursor += 1;
            }
            ExpectedEvent::Pattern(pattern) => {
                while cursor < actual.len() && pattern.matches_msg(actual[cursor].as_ref()) {
                    cursor += 1;
                }
            }
        }
    }
    match actual.get(cursor) {
        Some(extra) => Err(SequenceError::LeftoverActual {
            index: cursor,
            msg: extra.as_ref().to_string(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid log: {0}")]
    Parse(#[from] ParseError),
    #[error("event #{index} ({msg}): {violation}")]
    Contract {
        index: usize,
        msg: String,
        violation: ContractViolation,
    },
    #[error("unexpected sequence: {0}")]
    Sequence(#[from] SequenceError),
    #[error("expected error {expected}, got {actual:?}")]
    Outcome {
        expected: String,
        actual: Option<String>,
    },
}

/// Check every event's field contract, then the sequence.
pub fn verify_events(events: &[Event], expected: &[ExpectedEvent]) -> Result<(), VerifyError> {
    for (index, ev) in events.iter().enumerate() {
        verify_event(ev).map_err(|violation| VerifyError::Contract {
            index,
            msg: ev.msg.clone(),
            violation,
        })?;
    }
    let msgs: Vec<&str> = events.iter().map(|ev| ev.msg.as_str()).collect();
    verify_sequence(&msgs, expected)?;
    Ok(())
}

/// Parse a JSONL log and run [`verify_events`] on it.
pub fn verify_log(jsonl: &str, expected: &[ExpectedEvent]) -> Result<Vec<Event>, VerifyError> {
    let events = parse_jsonl(jsonl)?;
    verify_events(&events, expected)?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExpectedEvent::{Message as M, Pattern as P};

    const RWD: Pattern = Pattern::READ_WRITE_DEADLINE;

    #[test]
    fn exact_messages_must_line_up() {
        let expected = [M("connectStart"), M("connectDone")];
        assert_eq!(verify_sequence(&["connectStart", "connectDone"], &expected), Ok(()));
        assert_eq!(
            verify_sequence(&["connectStart", "closeStart"], &expected),
            Err(SequenceError::Mismatch {
                index: 1,
                expected: "connectDone".to_string(),
                actual: "closeStart".to_string(),
            })
        );
    }

    #[test]
    fn wildcard_absorbs_only_its_classes() {
        let expected = [M("dnsQuery"), P(RWD), M("dnsResponse")];
        let actual = ["dnsQuery", "setDeadline", "readStart", "readDone", "dnsResponse"];
        assert_eq!(verify_sequence(&actual, &expected), Ok(()));

        let actual = ["dnsQuery", "closeStart", "dnsResponse"];
        assert!(matches!(
            verify_sequence(&actual, &expected),
            Err(SequenceError::Mismatch { index: 1, .. })
        ));
    }

    #[test]
    fn wildcard_may_match_nothing() {
        let expected = [M("dnsQuery"), P(RWD), M("dnsResponse"), P(Pattern::CLOSE)];
        assert_eq!(verify_sequence(&["dnsQuery", "dnsResponse"], &expected), Ok(()));
    }

    #[test]
    fn leftovers_on_either_side_fail() {
        let expected = [M("connectStart"), M("connectDone")];
        assert_eq!(
            verify_sequence(&["connectStart", "connectDone", "closeStart"], &expected),
            Err(SequenceError::LeftoverActual {
                index: 2,
                msg: "closeStart".to_string()
            })
        );
        assert_eq!(
            verify_sequence(&["connectStart"], &expected),
            Err(SequenceError::LeftoverExpected {
                index: 1,
                expected: "connectDone".to_string()
            })
        );
    }

    #[test]
    fn patterns_display_their_classes() {
        assert_eq!(P(RWD).to_string(), "<READ|WRITE|SET_DEADLINE>");
        assert_eq!(M("dnsQuery").to_string(), "dnsQuery");
    }
}
