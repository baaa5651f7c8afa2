//! DNS-poisoning censorship filter.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;

use crate::dns::wire::{normalize_name, Message, Record, ResponseCode, TYPE_A, TYPE_AAAA};
use crate::filter::PacketFilter;
use crate::frame::{Frame, Payload};

const DNS_PORT: u16 = 53;
const FORGED_TTL: u32 = 60;

/// How a [`DnsPoisoner`] interferes with matching lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonMode {
    /// Inject a forged response and let the query reach the resolver, so the client receives the
    /// forged answer followed by the genuine one.
    Inject,
    /// Inject a forged response and drop the query.
    InjectAndDrop,
    /// Let the query through and rewrite the answers of the genuine response in place.
    Rewrite,
}

/// Packet filter forging answers for DNS-over-UDP lookups of censored domains.
///
/// A domain entry also covers its subdomains, and the most specific matching entry wins. Answers
/// only carry addresses of the queried family; a censored domain without addresses of that family
/// gets an empty NOERROR response.
pub struct DnsPoisoner {
    mode: PoisonMode,
    domains: BTreeMap<String, Vec<IpAddr>>,
}

impl DnsPoisoner {
    pub fn new(mode: PoisonMode) -> Self {
        Self {
            mode,
            domains: BTreeMap::new(),
        }
    }

    /// Censor `domain`, answering with `addrs`.
    pub fn poison(mut self, domain: &str, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.domains
            .entry(normalize_name(domain))
            .or_default()
            .extend(addrs);
        self
    }

    pub fn mode(&self) -> PoisonMode {
        self.mode
    }

    fn forged_addrs(&self, name: &str) -> Option<&[IpAddr]> {
        let name = normalize_name(name);
        self.domains
            .iter()
            .filter(|(domain, _)| domain_matches(&name, domain))
            .max_by_key(|(domain, _)| domain.len())
            .map(|(_, addrs)| addrs.as_slice())
    }

    /// Build the forged response for `query`, if it asks about a censored domain.
    fn forge(&self, query: &Message) -> Option<Message> {
        let question = query.question()?;
        let addrs = self.forged_addrs(&question.name)?;
        let answers = addrs
            .iter()
            .filter(|addr| match question.qtype {
                TYPE_A => addr.is_ipv4(),
                TYPE_AAAA => addr.is_ipv6(),
                _ => false,
            })
            .map(|addr| Record::address(&question.name, FORGED_TTL, *addr))
            .collect();
        Some(Message::response_to(query, ResponseCode::NoError, answers))
    }

    fn on_query(&self, frame: &Frame, inject: &mut Vec<Frame>) -> bool {
        let Some(query) = parse_udp(frame).filter(|msg| !msg.is_response()) else {
            return false;
        };
        let Some(forged) = self.forge(&query) else {
            return false;
        };
        tracing::debug!(
            client = %frame.src,
            resolver = %frame.dst,
            name = ?query.question().map(|q| q.name.as_str()),
            mode = ?self.mode,
            "forging DNS response"
        );
        let raw = match forged.encode() {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, "cannot encode forged DNS response");
                return false;
            }
        };
        inject.push(frame.reply(Payload::Udp(Bytes::from(raw))));
        self.mode == PoisonMode::InjectAndDrop
    }

    fn on_response(&self, frame: &mut Frame) {
        let Some(genuine) = parse_udp(frame).filter(Message::is_response) else {
            return;
        };
        let Some(mut forged) = self.forge(&genuine) else {
            return;
        };
        forged.flags = genuine.flags & !0x000f;
        tracing::debug!(
            resolver = %frame.src,
            client = %frame.dst,
            "rewriting DNS response"
        );
        match forged.encode() {
            Ok(raw) => frame.payload = Payload::Udp(Bytes::from(raw)),
            Err(err) => tracing::warn!(%err, "cannot encode rewritten DNS response"),
        }
    }
}

impl PacketFilter for DnsPoisoner {
    fn should_drop(&self, frame: &mut Frame, inject: &mut Vec<Frame>) -> bool {
        match self.mode {
            PoisonMode::Inject | PoisonMode::InjectAndDrop if frame.dst.port() == DNS_PORT => {
                self.on_query(frame, inject)
            }
            PoisonMode::Rewrite if frame.src.port() == DNS_PORT => {
                self.on_response(frame);
                false
            }
            _ => false,
        }
    }
}

impl fmt::Debug for DnsPoisoner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut domains: Vec<_> = self.domains.keys().collect();
        domains.sort();
        f.debug_struct("DnsPoisoner")
            .field("mode", &self.mode)
            .field("domains", &domains)
            .finish()
    }
}

fn parse_udp(frame: &Frame) -> Option<Message> {
    Message::parse(frame.udp_payload()?).ok()
}

fn domain_matches(name: &str, suffix: &str) -> bool {
    if name == suffix {
        return true;
    }
    let Some(rest) = name.strip_suffix(suffix) else {
        return false;
    };
    rest.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::wire::Message;
    use crate::frame::Segment;
    use std::net::SocketAddr;

    const CLIENT: &str = "130.192.91.211:50000";
    const RESOLVER: &str = "8.8.8.8:53";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn query_frame(name: &str, qtype: u16) -> Frame {
        let query = Message::query(0xabcd, name, qtype);
        Frame::udp(addr(CLIENT), addr(RESOLVER), query.encode().unwrap())
    }

    fn blockpage() -> IpAddr {
        "10.10.34.35".parse().unwrap()
    }

    #[test]
    fn domain_matches_requires_suffix_boundary() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("sub.example.com", "example.com"));
        assert!(!domain_matches("notexample.com", "example.com"));
        assert!(!domain_matches("example.com.evil", "example.com"));
        assert!(!domain_matches("evilcom", "com"));
        assert!(domain_matches("example.com", "com"));
    }

    #[test]
    fn inject_keeps_query_and_forges_answer() {
        let poisoner = DnsPoisoner::new(PoisonMode::Inject).poison("dns.google", [blockpage()]);
        let mut frame = query_frame("DNS.Google.", TYPE_A);
        let mut inject = Vec::new();

        assert!(!poisoner.should_drop(&mut frame, &mut inject));
        assert_eq!(inject.len(), 1);
        let forged = &inject[0];
        assert_eq!(forged.src, addr(RESOLVER));
        assert_eq!(forged.dst, addr(CLIENT));

        let msg = Message::parse(forged.udp_payload().unwrap()).unwrap();
        assert!(msg.is_response());
        assert_eq!(msg.id, 0xabcd);
        assert_eq!(msg.addresses(), vec![blockpage()]);
    }

    #[test]
    fn most_specific_entry_wins() {
        let www: IpAddr = "10.10.34.36".parse().unwrap();
        for _ in 0..32 {
            let poisoner = DnsPoisoner::new(PoisonMode::Inject)
                .poison("example.com", [blockpage()])
                .poison("www.example.com", [www]);
            assert_eq!(poisoner.forged_addrs("www.example.com"), Some(&[www][..]));
            assert_eq!(poisoner.forged_addrs("a.www.example.com"), Some(&[www][..]));
            assert_eq!(
                poisoner.forged_addrs("mail.example.com"),
                Some(&[blockpage()][..])
            );
        }
    }

    #[test]
    fn inject_and_drop_drops_query() {
        let poisoner =
            DnsPoisoner::new(PoisonMode::InjectAndDrop).poison("example.com", [blockpage()]);
        let mut frame = query_frame("www.example.com", TYPE_A);
        let mut inject = Vec::new();
        assert!(poisoner.should_drop(&mut frame, &mut inject));
        assert_eq!(inject.len(), 1);
    }

    #[test]
    fn forged_answers_follow_query_family() {
        let poisoner = DnsPoisoner::new(PoisonMode::Inject).poison("dns.google", [blockpage()]);
        let mut frame = query_frame("dns.google", TYPE_AAAA);
        let mut inject = Vec::new();
        poisoner.should_drop(&mut frame, &mut inject);
        let msg = Message::parse(inject[0].udp_payload().unwrap()).unwrap();
        assert!(msg.answers.is_empty());
        assert_eq!(msg.rcode(), ResponseCode::NoError as u8);
    }

    #[test]
    fn unrelated_traffic_is_untouched() {
        let poisoner = DnsPoisoner::new(PoisonMode::InjectAndDrop).poison("dns.google", [blockpage()]);
        let mut inject = Vec::new();

        let mut other_domain = query_frame("example.org", TYPE_A);
        assert!(!poisoner.should_drop(&mut other_domain, &mut inject));

        let mut not_dns = Frame::udp(addr(CLIENT), addr(RESOLVER), &b"garbage"[..]);
        assert!(!poisoner.should_drop(&mut not_dns, &mut inject));

        let mut tcp = Frame::tcp(addr(CLIENT), addr(RESOLVER), Segment::Syn);
        assert!(!poisoner.should_drop(&mut tcp, &mut inject));

        assert!(inject.is_empty());
    }

    #[test]
    fn rewrite_replaces_genuine_answers() {
        let poisoner = DnsPoisoner::new(PoisonMode::Rewrite).poison("dns.google", [blockpage()]);
        let query = Message::query(3, "dns.google", TYPE_A);
        let genuine = Message::response_to(
            &query,
            ResponseCode::NoError,
            vec![Record::address("dns.google", 300, "8.8.8.8".parse().unwrap())],
        );
        let mut frame = Frame::udp(addr(RESOLVER), addr(CLIENT), genuine.encode().unwrap());
        let mut inject = Vec::new();

        assert!(!poisoner.should_drop(&mut frame, &mut inject));
        assert!(inject.is_empty());
        let msg = Message::parse(frame.udp_payload().unwrap()).unwrap();
        assert_eq!(msg.id, 3);
        assert_eq!(msg.addresses(), vec![blockpage()]);
    }
}
