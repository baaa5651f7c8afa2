use std::fmt;

use super::database::{DnsDatabase, Lookup};
use super::wire::{Message, ResponseCode, CLASS_IN};

/// Turns a raw DNS query into a raw DNS response.
///
/// Returning `None` means the query is silently ignored, which clients observe as a timeout.
/// The same handler serves every transport (UDP, TCP, TLS and HTTPS).
pub trait DnsHandler: Send + Sync {
    fn handle(&self, query: &[u8]) -> Option<Vec<u8>>;
}

/// Answers queries from a [`DnsDatabase`].
#[derive(Clone)]
pub struct DatabaseHandler {
    db: DnsDatabase,
}

impl DatabaseHandler {
    pub fn new(db: DnsDatabase) -> Self {
        Self { db }
    }

    fn answer(&self, query: &Message) -> Message {
        let Some(question) = query.question() else {
            return Message::response_to(query, ResponseCode::FormatError, Vec::new());
        };
        if query.questions.len() != 1 || question.qclass != CLASS_IN {
            return Message::response_to(query, ResponseCode::Refused, Vec::new());
        }
        match self.db.lookup(&question.name, question.qtype) {
            Lookup::Found { records } => Message::response_to(query, ResponseCode::NoError, records),
            Lookup::NotFound => Message::response_to(query, ResponseCode::NameError, Vec::new()),
        }
    }
}

impl DnsHandler for DatabaseHandler {
    fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::parse(query) {
            Ok(msg) if !msg.is_response() => msg,
            Ok(_) => return None,
            Err(err) => {
                tracing::debug!(%err, "ignoring malformed DNS query");
                return None;
            }
        };
        match self.answer(&query).encode() {
            Ok(raw) => Some(raw),
            Err(err) => {
                tracing::warn!(%err, "cannot encode DNS answer");
                Message::response_to(&query, ResponseCode::ServerFailure, Vec::new())
                    .encode()
                    .ok()
            }
        }
    }
}

impl fmt::Debug for DatabaseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandler")
            .field("domains", &self.db.domains())
            .finish()
    }
}
