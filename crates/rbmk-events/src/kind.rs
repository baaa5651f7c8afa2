use std::fmt;

/// Whether an event marks the beginning of an operation, its completion, or a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Only `t` is set; `t0` is absent or zero.
    Start,
    /// Both `t0` and `t` are set and `t0 <= t`.
    Done,
    Point,
}

/// Event kinds, keyed by the `msg` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectStart,
    ConnectDone,
    ReadStart,
    ReadDone,
    WriteStart,
    WriteDone,
    CloseStart,
    CloseDone,
    SetDeadline,
    DnsExchangeStart,
    DnsExchangeDone,
    DnsQuery,
    DnsResponse,
    DnsLookupStart,
    DnsLookupDone,
    TlsHandshakeStart,
    TlsHandshakeDone,
    HttpRoundTripStart,
    HttpRoundTripDone,
    Unknown(String),
}

const NAMES: &[(EventKind, &str)] = &[
    (EventKind::ConnectStart, "connectStart"),
    (EventKind::ConnectDone, "connectDone"),
    (EventKind::ReadStart, "readStart"),
    (EventKind::ReadDone, "readDone"),
    (EventKind::WriteStart, "writeStart"),
    (EventKind::WriteDone, "writeDone"),
    (EventKind::CloseStart, "closeStart"),
    (EventKind::CloseDone, "closeDone"),
    (EventKind::SetDeadline, "setDeadline"),
    (EventKind::DnsExchangeStart, "dnsExchangeStart"),
    (EventKind::DnsExchangeDone, "dnsExchangeDone"),
    (EventKind::DnsQuery, "dnsQuery"),
    (EventKind::DnsResponse, "dnsResponse"),
    (EventKind::DnsLookupStart, "dnsLookupStart"),
    (EventKind::DnsLookupDone, "dnsLookupDone"),
    (EventKind::TlsHandshakeStart, "tlsHandshakeStart"),
    (EventKind::TlsHandshakeDone, "tlsHandshakeDone"),
    (EventKind::HttpRoundTripStart, "httpRoundTripStart"),
    (EventKind::HttpRoundTripDone, "httpRoundTripDone"),
];

impl EventKind {
    pub fn from_msg(msg: &str) -> Self {
        NAMES
            .iter()
            .find(|(_, name)| *name == msg)
            .map(|(kind, _)| kind.clone())
            .unwrap_or_else(|| EventKind::Unknown(msg.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Unknown(msg) => msg,
            known => NAMES
                .iter()
                .find(|(kind, _)| kind == known)
                .map(|(_, name)| *name)
                .unwrap_or_default(),
        }
    }

    pub fn timing(&self) -> Timing {
        use EventKind::*;
        match self {
            ConnectStart | ReadStart | WriteStart | CloseStart | DnsExchangeStart
            | DnsLookupStart | TlsHandshakeStart | HttpRoundTripStart => Timing::Start,
            ConnectDone | ReadDone | WriteDone | CloseDone | DnsExchangeDone | DnsLookupDone
            | TlsHandshakeDone | HttpRoundTripDone => Timing::Done,
            SetDeadline | DnsQuery | DnsResponse | Unknown(_) => Timing::Point,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, EventKind::ReadStart | EventKind::ReadDone)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, EventKind::WriteStart | EventKind::WriteDone)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, EventKind::CloseStart | EventKind::CloseDone)
    }

    pub fn is_set_deadline(&self) -> bool {
        matches!(self, EventKind::SetDeadline)
    }

    /// Low-level I/O events emitted by a connection wrapper.
    pub fn is_io(&self) -> bool {
        self.is_read() || self.is_write() || self.is_close() || self.is_set_deadline()
    }

    pub fn is_dns(&self) -> bool {
        use EventKind::*;
        matches!(
            self,
            DnsExchangeStart
                | DnsExchangeDone
                | DnsQuery
                | DnsResponse
                | DnsLookupStart
                | DnsLookupDone
        )
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, EventKind::TlsHandshakeStart | EventKind::TlsHandshakeDone)
    }

    pub fn is_http(&self) -> bool {
        matches!(
            self,
            EventKind::HttpRoundTripStart | EventKind::HttpRoundTripDone
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for (kind, name) in NAMES {
            assert_eq!(EventKind::from_msg(name), *kind);
            assert_eq!(kind.as_str(), *name);
        }
        assert_eq!(
            EventKind::from_msg("stunRequest"),
            EventKind::Unknown("stunRequest".to_string())
        );
        assert_eq!(EventKind::from_msg("stunRequest").as_str(), "stunRequest");
    }

    #[test]
    fn timing_and_classes() {
        assert_eq!(EventKind::ReadStart.timing(), Timing::Start);
        assert_eq!(EventKind::CloseDone.timing(), Timing::Done);
        assert_eq!(EventKind::DnsQuery.timing(), Timing::Point);
        assert!(EventKind::SetDeadline.is_io());
        assert!(!EventKind::ConnectDone.is_io());
        assert!(EventKind::DnsResponse.is_dns());
    }
}
