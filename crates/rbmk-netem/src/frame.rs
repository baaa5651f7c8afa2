use std::net::SocketAddr;

use bytes::Bytes;

/// Stream-transport segment carried by a [`Frame`].
///
/// The simulated stream transport is deliberately simple: delivery is in-order and lossless
/// unless a packet filter drops a frame, so there are no sequence numbers or retransmissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Connection request.
    Syn,
    /// Connection accepted.
    SynAck,
    Data(Bytes),
    /// No more data from the sender.
    Fin,
    /// Connection refused or aborted.
    Rst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Udp(Bytes),
    Tcp(Segment),
}

/// A unit of traffic exchanged between stacks through the [`crate::Internet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Payload,
}

impl Frame {
    pub fn udp(src: SocketAddr, dst: SocketAddr, data: impl Into<Bytes>) -> Self {
        Self {
            src,
            dst,
            payload: Payload::Udp(data.into()),
        }
    }

    pub fn tcp(src: SocketAddr, dst: SocketAddr, segment: Segment) -> Self {
        Self {
            src,
            dst,
            payload: Payload::Tcp(segment),
        }
    }

    /// Datagram bytes, when this is a UDP frame.
    pub fn udp_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Udp(data) => Some(data),
            Payload::Tcp(_) => None,
        }
    }

    /// Build a frame travelling in the opposite direction.
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Udp(data) => data.len(),
            Payload::Tcp(Segment::Data(data)) => data.len(),
            Payload::Tcp(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
