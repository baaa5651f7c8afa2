use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use super::wire::{normalize_name, Record, RecordData, TYPE_A, TYPE_AAAA, TYPE_CNAME};

const MAX_CNAME_HOPS: usize = 8;
const DEFAULT_TTL: u32 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Addrs(Vec<IpAddr>),
    Alias(String),
}

/// Result of a [`DnsDatabase::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The name exists; `records` holds the CNAME chain followed by matching addresses and may be
    /// empty when the name has no address of the requested type.
    Found { records: Vec<Record> },
    /// NXDOMAIN.
    NotFound,
}

/// Shared name table backing every simulated DNS server.
#[derive(Debug, Clone, Default)]
pub struct DnsDatabase {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl DnsDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `domain` to `addrs`, appending to any addresses already registered.
    pub fn add_addresses(&self, domain: &str, addrs: &[IpAddr]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&normalize_name(domain)) {
            Some(Entry::Addrs(existing)) => {
                for addr in addrs {
                    if !existing.contains(addr) {
                        existing.push(*addr);
                    }
                }
            }
            _ => {
                entries.insert(normalize_name(domain), Entry::Addrs(addrs.to_vec()));
            }
        }
    }

    /// Make `alias` a CNAME pointing at `target`.
    pub fn add_alias(&self, alias: &str, target: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_name(alias), Entry::Alias(normalize_name(target)));
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&normalize_name(domain))
    }

    /// Every registered name, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve `domain` for record type `qtype`, following CNAMEs.
    pub fn lookup(&self, domain: &str, qtype: u16) -> Lookup {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut name = normalize_name(domain);
        let mut records = Vec::new();

        for _ in 0..=MAX_CNAME_HOPS {
            match entries.get(&name) {
                None if records.is_empty() => return Lookup::NotFound,
                None => break,
                Some(Entry::Alias(target)) => {
                    records.push(Record {
                        name: name.clone(),
                        ttl: DEFAULT_TTL,
                        data: RecordData::Cname(target.clone()),
                    });
                    if qtype == TYPE_CNAME {
                        break;
                    }
                    name = target.clone();
                }
                Some(Entry::Addrs(addrs)) => {
                    records.extend(
                        addrs
                            .iter()
                            .filter(|addr| match qtype {
                                TYPE_A => addr.is_ipv4(),
                                TYPE_AAAA => addr.is_ipv6(),
                                _ => false,
                            })
                            .map(|addr| Record::address(&name, DEFAULT_TTL, *addr)),
                    );
                    break;
                }
            }
        }
        Lookup::Found { records }
    }
}
