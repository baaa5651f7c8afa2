use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::datetime;
use time::OffsetDateTime;

use crate::b64;
use crate::kind::EventKind;

/// Zero value of a timestamp: `0001-01-01T00:00:00Z`.
pub const ZERO_TIME: OffsetDateTime = datetime!(0001-01-01 0:00 UTC);

pub fn is_zero_time(t: &OffsetDateTime) -> bool {
    *t == ZERO_TIME
}

/// One structured log record, serialized as a single JSON line.
///
/// Only `msg` and `t` are always present. The other fields are grouped by concern (network,
/// failure, I/O, DNS, server, TLS, HTTP) and are omitted from the output when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub msg: String,
    #[serde(with = "time::serde::rfc3339")]
    pub t: OffsetDateTime,
    /// Span start; absent or zero on start events.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub t0: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_buffer_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_bytes_count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::bytes")]
    pub dns_raw_query: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::bytes")]
    pub dns_raw_response: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_lookup_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_resolved_addrs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_skip_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cipher_suite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_negotiated_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::bytes_list")]
    pub tls_peer_certs: Option<Vec<Vec<u8>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response_status_code: Option<u16>,
}

impl Event {
    /// An event with only `msg` and `t` set.
    pub fn new(msg: impl Into<String>, t: OffsetDateTime) -> Self {
        Self {
            msg: msg.into(),
            t,
            t0: None,
            protocol: None,
            local_addr: None,
            remote_addr: None,
            err: None,
            err_class: None,
            io_buffer_size: None,
            io_bytes_count: None,
            dns_raw_query: None,
            dns_raw_response: None,
            dns_lookup_domain: None,
            dns_resolved_addrs: None,
            server_addr: None,
            server_protocol: None,
            tls_server_name: None,
            tls_skip_verify: None,
            tls_cipher_suite: None,
            tls_negotiated_protocol: None,
            tls_version: None,
            tls_peer_certs: None,
            http_method: None,
            http_url: None,
            http_response_status_code: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_msg(&self.msg)
    }

    /// Span start, treating an absent `t0` as zero.
    pub fn span_start(&self) -> OffsetDateTime {
        self.t0.unwrap_or(ZERO_TIME)
    }

    pub fn with_span(mut self, t0: OffsetDateTime) -> Self {
        self.t0 = Some(t0);
        self
    }

    pub fn with_endpoints(mut self, protocol: &str, local: &str, remote: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self.local_addr = Some(local.to_string());
        self.remote_addr = Some(remote.to_string());
        self
    }

    pub fn with_failure(mut self, err: &str, class: &str) -> Self {
        self.err = Some(err.to_string());
        self.err_class = Some(class.to_string());
        self
    }

    pub fn with_io(mut self, buffer_size: i64, bytes_count: Option<i64>) -> Self {
        self.io_buffer_size = Some(buffer_size);
        self.io_bytes_count = bytes_count;
        self
    }

    pub fn with_server(mut self, addr: &str, protocol: &str) -> Self {
        self.server_addr = Some(addr.to_string());
        self.server_protocol = Some(protocol.to_string());
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct ParseError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Parse a JSONL log, one event per non-blank line. Line numbers in errors are 1-based.
pub fn parse_jsonl(input: &str) -> Result<Vec<Event>, ParseError> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| ParseError {
                line: idx + 1,
                source,
            })
        })
        .collect()
}
