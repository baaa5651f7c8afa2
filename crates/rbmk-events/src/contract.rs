//! Per-kind field contracts.
//!
//! Each check inspects one concern of an [`Event`] and reports the first violation it finds.
//! [`verify_event`] selects the checks that apply to the event's kind.
//!
//! Kinds this crate does not recognise are emitted by layers it knows nothing about, so only their
//! timestamps and failure fields are checked. Any other field may be set on them.

use std::net::SocketAddr;

use thiserror::Error;
use time::OffsetDateTime;

use crate::event::{is_zero_time, Event};
use crate::kind::{EventKind, Timing};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("`t` is zero")]
    ZeroTime,
    #[error("start event has non-zero `t0` ({0})")]
    NonZeroSpanStart(OffsetDateTime),
    #[error("done event has zero or missing `t0`")]
    MissingSpanStart,
    #[error("`t0` ({t0}) is after `t` ({t})")]
    SpanEndsBeforeStart { t0: OffsetDateTime, t: OffsetDateTime },
    #[error("`ioBufferSize` must be positive, got {0:?}")]
    BufferSizeNotPositive(Option<i64>),
    #[error("I/O completion needs `ioBytesCount` or `err`/`errClass`")]
    MissingIoResult,
    #[error("`ioBytesCount` must not be negative, got {0}")]
    NegativeBytesCount(i64),
    #[error("`ioBufferSize` must be zero, got {0}")]
    NonZeroBufferSize(i64),
    #[error("`ioBytesCount` must be zero, got {0}")]
    NonZeroBytesCount(i64),
    #[error("missing `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` is not an address:port endpoint: {value:?}")]
    InvalidEndpoint { field: &'static str, value: String },
    #[error("`{field}` must be empty for {kind} events")]
    UnexpectedField { field: &'static str, kind: String },
    #[error("`err` and `errClass` must be set together")]
    InconsistentFailure,
}

pub type ContractResult = Result<(), ContractViolation>;

/// Start events carry a non-zero `t` and no span start.
pub fn verify_start_event_time(ev: &Event) -> ContractResult {
    verify_point_event_time(ev)?;
    match ev.t0 {
        Some(t0) if !is_zero_time(&t0) => Err(ContractViolation::NonZeroSpanStart(t0)),
        _ => Ok(()),
    }
}

/// Done events carry a non-zero span `t0 <= t`.
pub fn verify_done_event_time(ev: &Event) -> ContractResult {
    verify_point_event_time(ev)?;
    let t0 = ev.span_start();
    if is_zero_time(&t0) {
        return Err(ContractViolation::MissingSpanStart);
    }
    if t0 > ev.t {
        return Err(ContractViolation::SpanEndsBeforeStart { t0, t: ev.t });
    }
    Ok(())
}

pub fn verify_point_event_time(ev: &Event) -> ContractResult {
    if is_zero_time(&ev.t) {
        return Err(ContractViolation::ZeroTime);
    }
    Ok(())
}

pub fn verify_io_buffer_size_positive(ev: &Event) -> ContractResult {
    match ev.io_buffer_size {
        Some(size) if size > 0 => Ok(()),
        other => Err(ContractViolation::BufferSizeNotPositive(other)),
    }
}

/// A completed read or write reports how many bytes moved, or why it failed.
pub fn verify_io_result(ev: &Event) -> ContractResult {
    verify_failure_consistent(ev)?;
    match (ev.io_bytes_count, &ev.err) {
        (Some(n), _) if n < 0 => Err(ContractViolation::NegativeBytesCount(n)),
        (Some(_), _) | (None, Some(_)) => Ok(()),
        (None, None) => Err(ContractViolation::MissingIoResult),
    }
}

pub fn verify_io_buffer_size_zero(ev: &Event) -> ContractResult {
    match ev.io_buffer_size {
        Some(size) if size != 0 => Err(ContractViolation::NonZeroBufferSize(size)),
        _ => Ok(()),
    }
}

pub fn verify_io_bytes_count_zero(ev: &Event) -> ContractResult {
    match ev.io_bytes_count {
        Some(count) if count != 0 => Err(ContractViolation::NonZeroBytesCount(count)),
        _ => Ok(()),
    }
}

/// Present endpoints must parse as `address:port`; the required ones must be present.
pub fn verify_endpoints(ev: &Event, require_local: bool, require_remote: bool) -> ContractResult {
    verify_endpoint("localAddr", ev.local_addr.as_deref(), require_local)?;
    verify_endpoint("remoteAddr", ev.remote_addr.as_deref(), require_remote)?;
    if (ev.local_addr.is_some() || ev.remote_addr.is_some()) && ev.protocol.is_none() {
        return Err(ContractViolation::MissingField("protocol"));
    }
    Ok(())
}

fn verify_endpoint(field: &'static str, value: Option<&str>, required: bool) -> ContractResult {
    match value {
        None if required => Err(ContractViolation::MissingField(field)),
        None => Ok(()),
        Some(value) => value
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| ContractViolation::InvalidEndpoint {
                field,
                value: value.to_string(),
            }),
    }
}

pub fn verify_no_dns_fields(ev: &Event) -> ContractResult {
    forbid(ev, "dnsRawQuery", ev.dns_raw_query.is_some())?;
    forbid(ev, "dnsRawResponse", ev.dns_raw_response.is_some())?;
    forbid(ev, "dnsLookupDomain", ev.dns_lookup_domain.is_some())?;
    forbid(ev, "dnsResolvedAddrs", ev.dns_resolved_addrs.is_some())
}

pub fn verify_no_tls_fields(ev: &Event) -> ContractResult {
    forbid(ev, "tlsServerName", ev.tls_server_name.is_some())?;
    forbid(ev, "tlsSkipVerify", ev.tls_skip_verify.is_some())?;
    forbid(ev, "tlsCipherSuite", ev.tls_cipher_suite.is_some())?;
    forbid(ev, "tlsNegotiatedProtocol", ev.tls_negotiated_protocol.is_some())?;
    forbid(ev, "tlsVersion", ev.tls_version.is_some())?;
    forbid(ev, "tlsPeerCerts", ev.tls_peer_certs.is_some())
}

pub fn verify_no_server_fields(ev: &Event) -> ContractResult {
    forbid(ev, "serverAddr", ev.server_addr.is_some())?;
    forbid(ev, "serverProtocol", ev.server_protocol.is_some())
}

pub fn verify_no_http_fields(ev: &Event) -> ContractResult {
    forbid(ev, "httpMethod", ev.http_method.is_some())?;
    forbid(ev, "httpUrl", ev.http_url.is_some())?;
    forbid(ev, "httpResponseStatusCode", ev.http_response_status_code.is_some())
}

fn verify_no_io_fields(ev: &Event) -> ContractResult {
    forbid(ev, "ioBufferSize", ev.io_buffer_size.is_some())?;
    forbid(ev, "ioBytesCount", ev.io_bytes_count.is_some())
}

/// `err` and `errClass` are either both set or both absent.
pub fn verify_failure_consistent(ev: &Event) -> ContractResult {
    if ev.err.is_some() != ev.err_class.is_some() {
        return Err(ContractViolation::InconsistentFailure);
    }
    Ok(())
}

fn forbid(ev: &Event, field: &'static str, present: bool) -> ContractResult {
    if present {
        return Err(ContractViolation::UnexpectedField {
            field,
            kind: ev.msg.clone(),
        });
    }
    Ok(())
}

fn require(field: &'static str, present: bool) -> ContractResult {
    if !present {
        return Err(ContractViolation::MissingField(field));
    }
    Ok(())
}

/// Run every contract that applies to the event's kind.
///
/// Unknown kinds are only checked for a non-zero `t` and a consistent failure pair.
pub fn verify_event(ev: &Event) -> ContractResult {
    let kind = ev.kind();
    match kind.timing() {
        Timing::Start => verify_start_event_time(ev)?,
        Timing::Done => verify_done_event_time(ev)?,
        Timing::Point => verify_point_event_time(ev)?,
    }
    verify_failure_consistent(ev)?;

    match kind {
        EventKind::Unknown(_) => return Ok(()),
        EventKind::ConnectStart | EventKind::ConnectDone => {
            verify_endpoints(ev, false, true)?;
            verify_no_io_fields(ev)?;
        }
        EventKind::ReadStart | EventKind::WriteStart => {
            verify_endpoints(ev, true, true)?;
            verify_io_buffer_size_positive(ev)?;
            verify_io_bytes_count_zero(ev)?;
        }
        EventKind::ReadDone | EventKind::WriteDone => {
            verify_endpoints(ev, true, true)?;
            verify_io_buffer_size_positive(ev)?;
            verify_io_result(ev)?;
        }
        EventKind::CloseStart | EventKind::CloseDone => {
            verify_endpoints(ev, true, true)?;
            verify_io_buffer_size_zero(ev)?;
            verify_io_bytes_count_zero(ev)?;
        }
        EventKind::SetDeadline => verify_endpoints(ev, true, true)?,
        EventKind::DnsExchangeStart | EventKind::DnsExchangeDone => {
            verify_endpoints(ev, false, false)?;
            require("serverAddr", ev.server_addr.is_some())?;
            require("serverProtocol", ev.server_protocol.is_some())?;
        }
        EventKind::DnsQuery => {
            verify_endpoints(ev, false, false)?;
            require("dnsRawQuery", ev.dns_raw_query.is_some())?;
            require("serverAddr", ev.server_addr.is_some())?;
        }
        EventKind::DnsResponse => {
            verify_endpoints(ev, false, false)?;
            require("dnsRawResponse", ev.dns_raw_response.is_some())?;
            require("serverAddr", ev.server_addr.is_some())?;
        }
        EventKind::DnsLookupStart => {
            require("dnsLookupDomain", ev.dns_lookup_domain.is_some())?;
            forbid(ev, "dnsResolvedAddrs", ev.dns_resolved_addrs.is_some())?;
        }
        EventKind::DnsLookupDone => {
            require("dnsLookupDomain", ev.dns_lookup_domain.is_some())?;
            if ev.err.is_none() {
                require("dnsResolvedAddrs", ev.dns_resolved_addrs.is_some())?;
            }
        }
        EventKind::TlsHandshakeStart => {
            verify_endpoints(ev, true, true)?;
            require("tlsServerName", ev.tls_server_name.is_some())?;
        }
        EventKind::TlsHandshakeDone => {
            verify_endpoints(ev, true, true)?;
            require("tlsServerName", ev.tls_server_name.is_some())?;
            if ev.err.is_none() {
                require("tlsVersion", ev.tls_version.is_some())?;
            }
        }
        EventKind::HttpRoundTripStart | EventKind::HttpRoundTripDone => {
            verify_endpoints(ev, false, false)?;
            require("httpMethod", ev.http_method.is_some())?;
            require("httpUrl", ev.http_url.is_some())?;
        }
    }

    if !kind.is_dns() {
        verify_no_dns_fields(ev)?;
    }
    if !kind.is_tls() {
        verify_no_tls_fields(ev)?;
    }
    if !kind.is_dns() && !kind.is_http() {
        verify_no_server_fields(ev)?;
    }
    if !kind.is_http() {
        verify_no_http_fields(ev)?;
    }
    if !kind.is_io() && !matches!(kind, EventKind::ConnectStart | EventKind::ConnectDone) {
        verify_no_io_fields(ev)?;
    }
    Ok(())
}
