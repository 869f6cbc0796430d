//! Gnutella v0.4 descriptors and their binary layout.
//!
//! Every descriptor starts with a 23 byte header:
//!
//! ```text
//! | id (16) | kind (1) | ttl (1) | hops (1) | payload length (4) |
//! ```
//!
//! followed by a payload whose layout depends on the kind. None of the payloads are
//! self-describing, the decoder relies on the kind and on the payload length from the header.

use crate::{
    id::{MessageId, ServentId, ID_LEN},
    wire::{put_uint, DecodeError, Reader, IP_LEN, PORT_LEN, TERMINATOR, U32_LEN},
};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Length of the descriptor header.
pub const HEADER_LEN: usize = ID_LEN + 3 + PAYLOAD_LEN_LEN;

/// Largest payload a connection is willing to buffer.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

/// Hop count carried by descriptors this node created and has not sent yet.
pub const LOCAL_HOP: u8 = u8::MAX;

/// Default time to live of locally originated descriptors.
pub const DEFAULT_TTL: u8 = 7;

/// Maximum number of results a single query hit can carry.
pub const MAX_HITS: usize = u8::MAX as usize;

const PAYLOAD_LEN_LEN: usize = 4;
const PONG_PAYLOAD_LEN: usize = PORT_LEN + IP_LEN + 2 * U32_LEN;
const MIN_SPEED_LEN: usize = 2;
const QUERY_HIT_FIXED_LEN: usize = 1 + PORT_LEN + IP_LEN + U32_LEN;
const HIT_FIXED_LEN: usize = 2 * U32_LEN;

/// Payload descriptor byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Kind {
    Ping = 0x00,
    Pong = 0x01,
    Push = 0x40,
    Query = 0x80,
    QueryHit = 0x81,
}

impl Kind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ping),
            0x01 => Some(Self::Pong),
            0x40 => Some(Self::Push),
            0x80 => Some(Self::Query),
            0x81 => Some(Self::QueryHit),
            _ => None,
        }
    }
}

/// Raw descriptor header, as read from the wire before the payload is interpreted.
///
/// No validation happens here: the reader still needs the payload length of a bad frame to skip
/// over it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub id: MessageId,
    pub kind: u8,
    pub ttl: u8,
    pub hops: u8,
    pub payload_len: u32,
}

impl Header {
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(input);

        let id = MessageId::from(reader.array::<ID_LEN>("id")?);
        let kind = reader.u8("kind")?;
        let ttl = reader.u8("ttl")?;
        let hops = reader.u8("hops")?;
        let payload_len = reader.uint(PAYLOAD_LEN_LEN, "payload length")?;

        Ok(Self {
            id,
            kind,
            ttl,
            hops,
            payload_len,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub ttl: u8,
    pub hops: u8,
    pub body: Body,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Body {
    Ping,
    Pong(Pong),
    Query(Query),
    QueryHit(QueryHit),
}

/// Answer to a ping, describing one reachable servent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pong {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub file_count: u32,
    pub kb_count: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Query {
    /// Minimum speed (kB/s) of servents that should respond.
    pub min_speed: u16,
    criteria: String,
}

/// Answer to a query. The servent id is shared by all the hits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryHit {
    pub port: u16,
    pub ip: Ipv4Addr,
    /// Speed (kB/s) of the responding servent.
    pub speed: u32,
    pub hits: Vec<Hit>,
    pub servent_id: ServentId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hit {
    pub index: u32,
    pub size: u32,
    name: String,
}

/// A string field would be cut short by its NUL terminator.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("{field} contains a NUL byte")]
pub struct NulError {
    pub field: &'static str,
}

fn check_terminated(value: String, field: &'static str) -> Result<String, NulError> {
    if value.as_bytes().contains(&TERMINATOR) {
        Err(NulError { field })
    } else {
        Ok(value)
    }
}

impl Query {
    pub fn new(min_speed: u16, criteria: impl Into<String>) -> Result<Self, NulError> {
        Ok(Self {
            min_speed,
            criteria: check_terminated(criteria.into(), "search criteria")?,
        })
    }

    pub fn criteria(&self) -> &str {
        &self.criteria
    }
}

impl Hit {
    pub fn new(index: u32, size: u32, name: impl Into<String>) -> Result<Self, NulError> {
        Ok(Self {
            index,
            size,
            name: check_terminated(name.into(), "file name")?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of moving a descriptor one hop further.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Advance {
    Forward(Message),
    Expired,
}

impl Message {
    /// Create a descriptor originated by this node.
    pub fn local(id: MessageId, ttl: u8, body: Body) -> Self {
        Self {
            id,
            ttl,
            hops: LOCAL_HOP,
            body,
        }
    }

    pub fn is_local(&self) -> bool {
        self.hops == LOCAL_HOP
    }

    pub fn kind(&self) -> Kind {
        match self.body {
            Body::Ping => Kind::Ping,
            Body::Pong(_) => Kind::Pong,
            Body::Query(_) => Kind::Query,
            Body::QueryHit(_) => Kind::QueryHit,
        }
    }

    /// Length of the payload following the header.
    pub fn payload_len(&self) -> usize {
        match &self.body {
            Body::Ping => 0,
            Body::Pong(_) => PONG_PAYLOAD_LEN,
            Body::Query(query) => MIN_SPEED_LEN + query.criteria.len() + 1,
            Body::QueryHit(hit) => {
                QUERY_HIT_FIXED_LEN
                    + hit
                        .hits()
                        .iter()
                        .map(|h| HIT_FIXED_LEN + h.name.len() + 1)
                        .sum::<usize>()
                    + ID_LEN
            }
        }
    }

    /// Produce the copy of this descriptor that is sent to the next hop.
    ///
    /// A local descriptor leaves with zero hops and its ttl untouched. Any other descriptor
    /// spends one unit of ttl, or expires when there is none left.
    pub fn advance(&self) -> Advance {
        if self.is_local() {
            return Advance::Forward(Self {
                hops: 0,
                ..self.clone()
            });
        }

        if self.ttl == 0 {
            return Advance::Expired;
        }

        match self.hops.checked_add(1).filter(|hops| *hops != LOCAL_HOP) {
            Some(hops) => Advance::Forward(Self {
                ttl: self.ttl - 1,
                hops,
                ..self.clone()
            }),
            None => Advance::Expired,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload_len();
        let mut buffer = Vec::with_capacity(HEADER_LEN + payload_len);

        buffer.extend(self.id.as_ref());
        buffer.push(self.kind() as u8);
        buffer.push(self.ttl);
        buffer.push(self.hops);
        // Payloads are bounded by `MAX_HITS` and short strings, so this can't truncate in
        // practice.
        put_uint(&mut buffer, payload_len as u32, PAYLOAD_LEN_LEN);

        match &self.body {
            Body::Ping => (),
            Body::Pong(pong) => {
                put_uint(&mut buffer, pong.port.into(), PORT_LEN);
                buffer.extend(pong.ip.octets());
                put_uint(&mut buffer, pong.file_count, U32_LEN);
                put_uint(&mut buffer, pong.kb_count, U32_LEN);
            }
            Body::Query(query) => {
                put_uint(&mut buffer, query.min_speed.into(), MIN_SPEED_LEN);
                buffer.extend(query.criteria.as_bytes());
                buffer.push(TERMINATOR);
            }
            Body::QueryHit(hit) => {
                let hits = hit.hits();

                buffer.push(hits.len() as u8);
                put_uint(&mut buffer, hit.port.into(), PORT_LEN);
                buffer.extend(hit.ip.octets());
                put_uint(&mut buffer, hit.speed, U32_LEN);

                for h in hits {
                    put_uint(&mut buffer, h.index, U32_LEN);
                    put_uint(&mut buffer, h.size, U32_LEN);
                    buffer.extend(h.name.as_bytes());
                    buffer.push(TERMINATOR);
                }

                buffer.extend(hit.servent_id.as_ref());
            }
        }

        buffer
    }

    /// Decode one whole frame (header followed by its payload).
    ///
    /// Returns `Ok(None)` for push descriptors and unknown kinds, which are not supported.
    pub fn decode(input: &[u8]) -> Result<Option<Self>, DecodeError> {
        let header = Header::decode(input)?;

        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(DecodeError::Oversized(header.payload_len));
        }

        let payload = &input[HEADER_LEN..];
        let payload_len = header.payload_len as usize;

        if payload.len() < payload_len {
            return Err(DecodeError::Truncated {
                field: "payload",
                needed: payload_len,
                available: payload.len(),
            });
        }

        Self::decode_payload(header, &payload[..payload_len])
    }

    /// Decode the payload belonging to an already decoded header.
    pub fn decode_payload(header: Header, payload: &[u8]) -> Result<Option<Self>, DecodeError> {
        if header.hops == LOCAL_HOP {
            return Err(DecodeError::ReservedHop(header.hops));
        }

        let mut reader = Reader::new(payload);

        let body = match Kind::from_byte(header.kind) {
            Some(Kind::Ping) => Body::Ping,
            Some(Kind::Pong) => Body::Pong(Pong {
                port: reader.uint(PORT_LEN, "port")? as u16,
                ip: reader.ip("ip")?,
                file_count: reader.uint(U32_LEN, "file count")?,
                kb_count: reader.uint(U32_LEN, "kb count")?,
            }),
            Some(Kind::Query) => {
                let min_speed = reader.uint(MIN_SPEED_LEN, "min speed")? as u16;
                let criteria = reader.rest_until_terminator();

                Body::Query(Query {
                    min_speed,
                    criteria: String::from_utf8_lossy(criteria).into_owned(),
                })
            }
            Some(Kind::QueryHit) => Body::QueryHit(decode_query_hit(&mut reader)?),
            Some(Kind::Push) | None => return Ok(None),
        };

        Ok(Some(Self {
            id: header.id,
            ttl: header.ttl,
            hops: header.hops,
            body,
        }))
    }
}

fn decode_query_hit(reader: &mut Reader) -> Result<QueryHit, DecodeError> {
    let count = reader.u8("hit count")?;
    let port = reader.uint(PORT_LEN, "port")? as u16;
    let ip = reader.ip("ip")?;
    let speed = reader.uint(U32_LEN, "speed")?;

    let mut hits = Vec::with_capacity(count.into());

    for _ in 0..count {
        let index = reader.uint(U32_LEN, "file index")?;
        let size = reader.uint(U32_LEN, "file size")?;
        // The name can't run into the servent id that closes the payload.
        let max = reader.remaining().saturating_sub(ID_LEN);
        let name = reader.terminated(max, "file name")?;

        hits.push(Hit {
            index,
            size,
            name: String::from_utf8_lossy(name).into_owned(),
        });
    }

    let servent_id = ServentId::from(reader.array::<ID_LEN>("servent id")?);

    Ok(QueryHit {
        port,
        ip,
        speed,
        hits,
        servent_id,
    })
}

impl QueryHit {
    /// The hits that fit on the wire.
    pub fn hits(&self) -> &[Hit] {
        &self.hits[..self.hits.len().min(MAX_HITS)]
    }
}

// ----------------------------------------------------------------------------//
