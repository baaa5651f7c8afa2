//! Minimal DNS message codec (RFC 1035) covering what the simulated servers, the censorship
//! filter and the client-side lookup need: the question section plus A, AAAA and CNAME answers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 1 << 15;
const FLAG_AA: u16 = 1 << 10;
const FLAG_RD: u16 = 1 << 8;
const FLAG_RA: u16 = 1 << 7;

const MAX_LABEL_LEN: u8 = 63;
const MAX_NAME_LEN: usize = 255;
/// A name has at most 127 labels, each of which may be reached through one pointer.
const MAX_POINTER_HOPS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated DNS message")]
    Truncated,
    #[error("invalid DNS message: {0}")]
    Invalid(&'static str),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Other { rtype: u16, data: Vec<u8> },
}

impl RecordData {
    pub fn rtype(&self) -> u16 {
        match self {
            RecordData::A(_) => TYPE_A,
            RecordData::Aaaa(_) => TYPE_AAAA,
            RecordData::Cname(_) => TYPE_CNAME,
            RecordData::Other { rtype, .. } => *rtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    /// An A or AAAA record, depending on the address family.
    pub fn address(name: &str, ttl: u32, addr: IpAddr) -> Self {
        let data = match addr {
            IpAddr::V4(v4) => RecordData::A(v4),
            IpAddr::V6(v6) => RecordData::Aaaa(v6),
        };
        Self {
            name: name.to_string(),
            ttl,
            data,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(v4) => Some(IpAddr::V4(v4)),
            RecordData::Aaaa(v6) => Some(IpAddr::V6(v6)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Message {
    /// A recursive query with a single question.
    pub fn query(id: u16, name: &str, qtype: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![Question {
                name: name.trim_end_matches('.').to_string(),
                qtype,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
        }
    }

    /// An authoritative response echoing the id, RD bit and questions of `query`.
    pub fn response_to(query: &Message, rcode: ResponseCode, answers: Vec<Record>) -> Self {
        let mut flags = FLAG_QR | FLAG_AA | FLAG_RA;
        flags |= query.flags & FLAG_RD;
        flags |= rcode as u16;
        Self {
            id: query.id,
            flags,
            questions: query.questions.clone(),
            answers,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// Addresses carried by A/AAAA answers, in answer order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.answers.iter().filter_map(Record::ip).collect()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 12 {
            return Err(WireError::Truncated);
        }
        let id = read_u16(buf, 0)?;
        let flags = read_u16(buf, 2)?;
        let qdcount = read_u16(buf, 4)? as usize;
        let ancount = read_u16(buf, 6)? as usize;

        let mut offset = 12usize;
        let mut questions = Vec::with_capacity(qdcount.min(16));
        for _ in 0..qdcount {
            let (name, next) = decode_name(buf, offset)?;
            offset = next;
            let qtype = read_u16(buf, offset)?;
            let qclass = read_u16(buf, offset + 2)?;
            offset += 4;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let mut answers = Vec::with_capacity(ancount.min(32));
        for _ in 0..ancount {
            let (name, next) = decode_name(buf, offset)?;
            offset = next;
            let rtype = read_u16(buf, offset)?;
            let ttl = read_u32(buf, offset + 4)?;
            let rdlen = read_u16(buf, offset + 8)? as usize;
            offset += 10;
            let end = offset + rdlen;
            if end > buf.len() {
                return Err(WireError::Truncated);
            }
            let rdata = &buf[offset..end];
            let data = match rtype {
                TYPE_A => {
                    let octets: [u8; 4] = rdata
                        .try_into()
                        .map_err(|_| WireError::Invalid("A record length"))?;
                    RecordData::A(Ipv4Addr::from(octets))
                }
                TYPE_AAAA => {
                    let octets: [u8; 16] = rdata
                        .try_into()
                        .map_err(|_| WireError::Invalid("AAAA record length"))?;
                    RecordData::Aaaa(Ipv6Addr::from(octets))
                }
                TYPE_CNAME => RecordData::Cname(decode_name(buf, offset)?.0),
                rtype => RecordData::Other {
                    rtype,
                    data: rdata.to_vec(),
                },
            };
            offset = end;
            answers.push(Record { name, ttl, data });
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
        })
    }

    /// Serialize the message, rejecting names that do not fit the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

        for question in &self.questions {
            encode_name(&question.name, &mut out)?;
            out.extend_from_slice(&question.qtype.to_be_bytes());
            out.extend_from_slice(&question.qclass.to_be_bytes());
        }

        for answer in &self.answers {
            encode_name(&answer.name, &mut out)?;
            out.extend_from_slice(&answer.data.rtype().to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&answer.ttl.to_be_bytes());
            let rdata = match &answer.data {
                RecordData::A(v4) => v4.octets().to_vec(),
                RecordData::Aaaa(v6) => v6.octets().to_vec(),
                RecordData::Cname(target) => {
                    let mut name = Vec::new();
                    encode_name(target, &mut name)?;
                    name
                }
                RecordData::Other { data, .. } => data.clone(),
            };
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(&rdata);
        }
        Ok(out)
    }
}

/// Lower-case `name` and strip the trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, WireError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(WireError::Truncated)
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, WireError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(WireError::Truncated)
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    let start = out.len();
    let trimmed = name.trim_end_matches('.');
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            let len = u8::try_from(label.len())
                .ok()
                .filter(|len| (1..=MAX_LABEL_LEN).contains(len))
                .ok_or(WireError::Invalid("label must be 1 to 63 bytes"))?;
            out.push(len);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    if out.len() - start > MAX_NAME_LEN {
        return Err(WireError::Invalid("name longer than 255 bytes"));
    }
    Ok(())
}

fn decode_name(buf: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Labels::new(buf, offset);
    let mut name = String::new();
    // Wire length including the root label.
    let mut encoded = 1;
    for label in labels.by_ref() {
        let label = label?;
        encoded += label.len() + 1;
        if encoded > MAX_NAME_LEN {
            return Err(WireError::Invalid("name longer than 255 bytes"));
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
    }
    Ok((name, labels.end()))
}

/// Labels of an encoded name, following compression pointers.
struct Labels<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Where parsing resumes once the name ends; fixed by the first pointer taken.
    resume: Option<usize>,
    hops: usize,
    done: bool,
}

impl<'a> Labels<'a> {
    fn new(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            pos: offset,
            resume: None,
            hops: 0,
            done: false,
        }
    }

    /// Offset of the first byte after the name in the enclosing message.
    fn end(&self) -> usize {
        self.resume.unwrap_or(self.pos)
    }

    fn step(&mut self) -> Result<Option<&'a str>, WireError> {
        loop {
            let len = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
            match len >> 6 {
                0b00 if len == 0 => {
                    self.pos += 1;
                    return Ok(None);
                }
                0b00 => {
                    let start = self.pos + 1;
                    let end = start + usize::from(len);
                    let label = self.buf.get(start..end).ok_or(WireError::Truncated)?;
                    self.pos = end;
                    return std::str::from_utf8(label)
                        .map(Some)
                        .map_err(|_| WireError::Invalid("label is not UTF-8"));
                }
                0b11 => {
                    let low = *self.buf.get(self.pos + 1).ok_or(WireError::Truncated)?;
                    self.hops += 1;
                    if self.hops > MAX_POINTER_HOPS {
                        return Err(WireError::Invalid("name pointer loop"));
                    }
                    self.resume.get_or_insert(self.pos + 2);
                    self.pos = usize::from(u16::from_be_bytes([len & 0b0011_1111, low]));
                }
                _ => return Err(WireError::Invalid("label length has reserved bits set")),
            }
        }
    }
}

impl<'a> Iterator for Labels<'a> {
    type Item = Result<&'a str, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.step();
        if !matches!(step, Ok(Some(_))) {
            self.done = true;
        }
        step.transpose()
    }
}
