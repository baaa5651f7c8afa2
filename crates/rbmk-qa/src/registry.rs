//! Catalogue of named scenarios: what to run inside the simulation and what it must log.

use std::fmt;
use std::sync::Arc;

use rbmk_netem::{DnsPoisoner, FilterFn, Frame, PoisonMode};

use crate::scenario::{Scenario, ScenarioEditor, BLOCKPAGE_ADDR};
use crate::verify::{verify_log, ExpectedEvent, Pattern, VerifyError};

/// Terminal error a scenario run must end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedErr {
    None,
    /// The command failed with an error whose text contains this fragment.
    Containing(&'static str),
}

impl ExpectedErr {
    pub fn check(&self, actual: Option<&str>) -> Result<(), VerifyError> {
        let ok = match (self, actual) {
            (ExpectedErr::None, None) => true,
            (ExpectedErr::Containing(fragment), Some(err)) => err.contains(fragment),
            _ => false,
        };
        if ok {
            return Ok(());
        }
        Err(VerifyError::Outcome {
            expected: match self {
                ExpectedErr::None => "none".to_string(),
                ExpectedErr::Containing(fragment) => format!("containing {fragment:?}"),
            },
            actual: actual.map(str::to_string),
        })
    }
}

#[derive(Clone, Copy)]
pub struct ScenarioDescriptor {
    pub name: &'static str,
    pub editors: &'static [ScenarioEditor],
    pub argv: &'static [&'static str],
    pub expected_err: ExpectedErr,
    pub expected_seq: &'static [ExpectedEvent],
}

impl ScenarioDescriptor {
    /// The base scenario with this entry's editors applied.
    pub fn scenario(&self) -> Scenario {
        Scenario::base().edited(self.editors)
    }

    /// Check a finished run: its terminal error and its JSONL log.
    pub fn check(&self, err: Option<&str>, jsonl: &str) -> Result<(), VerifyError> {
        self.expected_err.check(err)?;
        verify_log(jsonl, self.expected_seq)?;
        Ok(())
    }
}

impl fmt::Debug for ScenarioDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioDescriptor")
            .field("name", &self.name)
            .field("editors", &self.editors.len())
            .field("argv", &self.argv)
            .field("expected_err", &self.expected_err)
            .field("expected_seq", &self.expected_seq)
            .finish()
    }
}

pub fn lookup(name: &str) -> Option<&'static ScenarioDescriptor> {
    REGISTRY.iter().find(|desc| desc.name == name)
}

pub fn all() -> &'static [ScenarioDescriptor] {
    REGISTRY
}

/// Domain targeted by the censorship editors.
pub const CENSORED_DOMAIN: &str = "www.example.com";

pub fn inject_dns_poisoning(scenario: &mut Scenario) {
    scenario.packet_filter =
        Arc::new(DnsPoisoner::new(PoisonMode::Inject).poison(CENSORED_DOMAIN, [BLOCKPAGE_ADDR]));
}

pub fn replace_dns_responses(scenario: &mut Scenario) {
    scenario.packet_filter = Arc::new(
        DnsPoisoner::new(PoisonMode::InjectAndDrop).poison(CENSORED_DOMAIN, [BLOCKPAGE_ADDR]),
    );
}

pub fn drop_dns_over_udp(scenario: &mut Scenario) {
    scenario.packet_filter = Arc::new(FilterFn(|frame: &mut Frame, _: &mut Vec<Frame>| {
        frame.udp_payload().is_some() && (frame.dst.port() == 53 || frame.src.port() == 53)
    }));
}

use ExpectedEvent::{Message as M, Pattern as P};

const RWD: ExpectedEvent = P(Pattern::READ_WRITE_DEADLINE);
const CLOSE: ExpectedEvent = P(Pattern::CLOSE);
const ANY: ExpectedEvent = P(Pattern::ANY_IO);

const DIG_UDP: &[&str] = &["dig", "@8.8.8.8", "A", "www.example.com"];

const UDP_EXCHANGE: &[ExpectedEvent] = &[
    M("connectStart"),
    M("connectDone"),
    M("dnsExchangeStart"),
    RWD,
    M("dnsQuery"),
    RWD,
    M("dnsResponse"),
    RWD,
    M("dnsExchangeDone"),
    CLOSE,
];

const UDP_EXCHANGE_WITH_DUPLICATES: &[ExpectedEvent] = &[
    M("connectStart"),
    M("connectDone"),
    M("dnsExchangeStart"),
    RWD,
    M("dnsQuery"),
    RWD,
    M("dnsResponse"),
    RWD,
    M("dnsResponse"),
    RWD,
    M("dnsExchangeDone"),
    CLOSE,
];

const UDP_TIMEOUT: &[ExpectedEvent] = &[
    M("connectStart"),
    M("connectDone"),
    M("dnsExchangeStart"),
    RWD,
    M("dnsQuery"),
    RWD,
    M("dnsExchangeDone"),
    CLOSE,
];

const TCP_EXCHANGE: &[ExpectedEvent] = UDP_EXCHANGE;

const TLS_EXCHANGE: &[ExpectedEvent] = &[
    M("connectStart"),
    M("connectDone"),
    M("tlsHandshakeStart"),
    RWD,
    M("tlsHandshakeDone"),
    M("dnsExchangeStart"),
    RWD,
    M("dnsQuery"),
    RWD,
    M("dnsResponse"),
    RWD,
    M("dnsExchangeDone"),
    ANY,
];

const HTTPS_EXCHANGE: &[ExpectedEvent] = &[
    M("connectStart"),
    M("connectDone"),
    M("tlsHandshakeStart"),
    RWD,
    M("tlsHandshakeDone"),
    M("dnsExchangeStart"),
    M("dnsQuery"),
    M("httpRoundTripStart"),
    RWD,
    M("httpRoundTripDone"),
    M("dnsResponse"),
    M("dnsExchangeDone"),
    ANY,
];

static REGISTRY: &[ScenarioDescriptor] = &[
    // DNS over UDP
    ScenarioDescriptor {
        name: "dnsOverUdpSuccess",
        editors: &[],
        argv: DIG_UDP,
        expected_err: ExpectedErr::None,
        expected_seq: UDP_EXCHANGE,
    },
    ScenarioDescriptor {
        name: "dnsOverUdpCensorship",
        editors: &[inject_dns_poisoning],
        argv: DIG_UDP,
        expected_err: ExpectedErr::None,
        expected_seq: UDP_EXCHANGE,
    },
    ScenarioDescriptor {
        name: "dnsOverUdpCensorshipWithDuplicates",
        editors: &[inject_dns_poisoning],
        argv: &["dig", "+udp=wait-duplicates", "@8.8.8.8", "A", "www.example.com"],
        expected_err: ExpectedErr::None,
        expected_seq: UDP_EXCHANGE_WITH_DUPLICATES,
    },
    ScenarioDescriptor {
        name: "dnsOverUdpTimeout",
        editors: &[drop_dns_over_udp],
        argv: DIG_UDP,
        expected_err: ExpectedErr::Containing("timeout"),
        expected_seq: UDP_TIMEOUT,
    },
    // DNS over TCP
    ScenarioDescriptor {
        name: "dnsOverTcpSuccess",
        editors: &[],
        argv: &["dig", "+tcp", "@8.8.8.8", "A", "www.example.com"],
        expected_err: ExpectedErr::None,
        expected_seq: TCP_EXCHANGE,
    },
    ScenarioDescriptor {
        name: "dnsOverTcpWithUdpPoisoning",
        editors: &[replace_dns_responses],
        argv: &["dig", "+tcp", "@8.8.8.8", "A", "www.example.com"],
        expected_err: ExpectedErr::None,
        expected_seq: TCP_EXCHANGE,
    },
    // DNS over TLS
    ScenarioDescriptor {
        name: "dnsOverTlsSuccess",
        editors: &[],
        argv: &["dig", "+tls", "@dns.google", "A", "www.example.com"],
        expected_err: ExpectedErr::None,
        expected_seq: TLS_EXCHANGE,
    },
    // DNS over HTTPS
    ScenarioDescriptor {
        name: "dnsOverHttpsSuccess",
        editors: &[],
        argv: &["dig", "+https", "@dns.google", "A", "www.example.com"],
        expected_err: ExpectedErr::None,
        expected_seq: HTTPS_EXCHANGE,
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_and_resolvable() {
        let mut seen = HashSet::new();
        for desc in all() {
            assert!(seen.insert(desc.name), "duplicate scenario {}", desc.name);
            assert_eq!(lookup(desc.name).map(|d| d.name), Some(desc.name));
            assert!(!desc.argv.is_empty());
            desc.scenario().validate().unwrap();
        }
        assert!(lookup("noSuchScenario").is_none());
    }

    #[test]
    fn udp_success_entry() {
        let desc = lookup("dnsOverUdpSuccess").unwrap();
        assert!(desc.editors.is_empty());
        assert_eq!(desc.argv, ["dig", "@8.8.8.8", "A", "www.example.com"]);
        assert_eq!(desc.expected_err, ExpectedErr::None);
        let msgs: Vec<&str> = desc
            .expected_seq
            .iter()
            .filter_map(|e| match e {
                ExpectedEvent::Message(m) => Some(*m),
                ExpectedEvent::Pattern(_) => None,
            })
            .collect();
        assert_eq!(
            msgs,
            ["connectStart", "connectDone", "dnsExchangeStart", "dnsQuery", "dnsResponse", "dnsExchangeDone"]
        );
        assert_eq!(desc.expected_seq.last(), Some(&CLOSE));
    }

    #[test]
    fn duplicates_entry_expects_two_responses() {
        let desc = lookup("dnsOverUdpCensorshipWithDuplicates").unwrap();
        assert!(desc.argv.contains(&"+udp=wait-duplicates"));
        assert_eq!(desc.editors.len(), 1);
        let responses = desc
            .expected_seq
            .iter()
            .filter(|e| **e == M("dnsResponse"))
            .count();
        assert_eq!(responses, 2);
        assert_eq!(
            &desc.expected_seq[desc.expected_seq.len() - 2..],
            &[M("dnsExchangeDone"), CLOSE]
        );
    }

    #[test]
    fn expected_error_is_compared() {
        assert!(ExpectedErr::None.check(None).is_ok());
        assert!(ExpectedErr::None.check(Some("boom")).is_err());
        assert!(ExpectedErr::Containing("timeout").check(Some("i/o timeout")).is_ok());
        assert!(ExpectedErr::Containing("timeout").check(None).is_err());
    }
}
