//! Event blocks.
//!
//! An [`EventBlock`] is one node of the merkle-DAG that carries meta updates
//! between peers: a dag-cbor map `{ "parents": [...], "data": { "dbMeta" } }`
//! addressed by the hash of its canonical encoding. The parent links encode
//! causality, an event whose cid appears in another event's parents is
//! superseded by it.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use ipld::codec::Codec;
use ipld::Ipld;
use ipld_cbor::DagCborCodec;

/// Errors from encoding or decoding event blocks.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event could not be encoded as dag-cbor.
    #[error("failed to encode event: {0}")]
    Encode(String),
    /// The bytes are not valid dag-cbor.
    #[error("failed to decode event: {0}")]
    Decode(String),
    /// A required field is absent.
    #[error("event field `{0}` is missing")]
    MissingField(&'static str),
    /// A field decoded to the wrong kind of value.
    #[error("unexpected event shape: {0}")]
    UnexpectedShape(&'static str),
    /// The wire message is not valid base64.
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] data_encoding::DecodeError),
}

/// A hash-linked node announcing one meta update.
///
/// The cid is derived from the canonical bytes, so decoding and re-encoding
/// an event is the identity and the address verifies the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBlock {
    cid: Cid,
    bytes: Bytes,
    parents: Vec<Cid>,
    db_meta: Bytes,
}

impl EventBlock {
    /// Creates an event carrying `db_meta`, linked to its causal `parents`.
    /// Root events have no parents.
    pub fn new(db_meta: Bytes, parents: Vec<Cid>) -> Result<Self, EventError> {
        let ipld = to_ipld(&parents, &db_meta);
        let bytes = DagCborCodec
            .encode(&ipld)
            .map_err(|e| EventError::Encode(e.to_string()))?;
        let cid = cid_for(&bytes);
        Ok(Self {
            cid,
            bytes: bytes.into(),
            parents,
            db_meta,
        })
    }

    /// Decodes an event from its canonical bytes.
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self, EventError> {
        let bytes = bytes.into();
        let ipld: Ipld = DagCborCodec
            .decode(&bytes)
            .map_err(|e| EventError::Decode(e.to_string()))?;
        let map = match ipld {
            Ipld::Map(map) => map,
            _ => return Err(EventError::UnexpectedShape("event must be a map")),
        };

        let parents = match map.get("parents") {
            Some(Ipld::List(entries)) => {
                let mut parents = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        Ipld::Link(cid) => parents.push(*cid),
                        _ => {
                            return Err(EventError::UnexpectedShape(
                                "parents must be a list of links",
                            ))
                        }
                    }
                }
                parents
            }
            Some(_) => return Err(EventError::UnexpectedShape("parents must be a list")),
            None => return Err(EventError::MissingField("parents")),
        };

        let db_meta = match map.get("data") {
            Some(Ipld::Map(data)) => match data.get("dbMeta") {
                Some(Ipld::Bytes(meta)) => Bytes::from(meta.clone()),
                Some(_) => return Err(EventError::UnexpectedShape("dbMeta must be bytes")),
                None => return Err(EventError::MissingField("dbMeta")),
            },
            Some(_) => return Err(EventError::UnexpectedShape("data must be a map")),
            None => return Err(EventError::MissingField("data")),
        };

        let cid = cid_for(&bytes);
        Ok(Self {
            cid,
            bytes,
            parents,
            db_meta,
        })
    }

    /// The content address of this event.
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// The canonical dag-cbor bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The cids of the events this one supersedes.
    pub fn parents(&self) -> &[Cid] {
        &self.parents
    }

    /// The meta payload.
    pub fn db_meta(&self) -> &Bytes {
        &self.db_meta
    }
}

fn to_ipld(parents: &[Cid], db_meta: &Bytes) -> Ipld {
    let mut data = BTreeMap::new();
    data.insert("dbMeta".to_string(), Ipld::Bytes(db_meta.to_vec()));
    let mut event = BTreeMap::new();
    event.insert(
        "parents".to_string(),
        Ipld::List(parents.iter().map(|cid| Ipld::Link(*cid)).collect()),
    );
    event.insert("data".to_string(), Ipld::Map(data));
    Ipld::Map(event)
}

fn cid_for(bytes: &[u8]) -> Cid {
    let digest = Code::Sha2_256.digest(bytes);
    Cid::new_v1(DagCborCodec.into(), digest)
}
