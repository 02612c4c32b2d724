//! # Wire Protocol Messages
//!
//! This module defines the data model shared by every node and all serializable
//! message types of the Whanau RPC surface. Messages are serialized using bincode
//! with size limits to prevent memory exhaustion.
//!
//! ## Operations
//!
//! | Operation | Request | Reply |
//! |-----------|---------|-------|
//! | RandomWalk | `steps` | [`RandomWalkReply`] |
//! | GetId | `layer` | [`GetIdReply`] |
//! | SampleSuccessors | `key`, `t` | [`SampleSuccessorsReply`] |
//! | Lookup | `key`, `routed_from` | [`LookupReply`] |
//! | Put | `key`, `value` | [`PutReply`] |
//!
//! Every reply carries a [`Status`]. Transport failures never appear on the
//! wire; callers map them to [`Status::ErrRpcCall`] locally.

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Network address of a node ("host:port"). Doubles as the node's name.
pub type Address = String;

/// Authoritative value held by the consistency layer.
pub type TrueValue = String;

/// Maximum size of a single framed message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// A point in the ordered key space. Layer identifiers and record keys share it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The servers holding the authoritative copy of a record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub servers: Vec<Address>,
}

impl ServerGroup {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Address>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// A key paired with the server group that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub value: ServerGroup,
}

impl Record {
    pub fn new(key: impl Into<Key>, value: ServerGroup) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Hint that the node at `address` claimed `id` in some layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finger {
    pub id: Key,
    pub address: Address,
}

/// Outcome attached to every reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// Key, record or walk target not found.
    ErrNoKey,
    /// A walk could not be started or completed.
    ErrRandWalk,
    /// The peer could not be reached.
    ErrRpcCall,
    // Reserved for the consistency layer boundary.
    ErrWrongGroup,
    ErrFailVerify,
    ErrPending,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::ErrNoKey => "ErrNoKey",
            Status::ErrRandWalk => "ErrRandWalk",
            Status::ErrRpcCall => "ErrRPCCall",
            Status::ErrWrongGroup => "ErrWrongGroup",
            Status::ErrFailVerify => "ErrFailVerify",
            Status::ErrPending => "ErrPending",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomWalkReply {
    pub server: Option<Address>,
    pub status: Status,
}

impl RandomWalkReply {
    pub fn ok(server: Address) -> Self {
        Self {
            server: Some(server),
            status: Status::Ok,
        }
    }

    pub fn err(status: Status) -> Self {
        Self { server: None, status }
    }

    /// The landed address, if the walk succeeded.
    pub fn landed(self) -> Option<Address> {
        if self.status.is_ok() { self.server } else { None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIdReply {
    pub key: Option<Key>,
    pub status: Status,
}

impl GetIdReply {
    pub fn ok(key: Key) -> Self {
        Self {
            key: Some(key),
            status: Status::Ok,
        }
    }

    pub fn err(status: Status) -> Self {
        Self { key: None, status }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSuccessorsReply {
    pub successors: Vec<Record>,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupReply {
    /// Authoritative value, when the consistency layer could resolve it.
    pub value: Option<TrueValue>,
    /// Server group the key routed to.
    pub servers: ServerGroup,
    pub status: Status,
}

impl LookupReply {
    pub fn found(servers: ServerGroup, value: Option<TrueValue>) -> Self {
        Self {
            value,
            servers,
            status: Status::Ok,
        }
    }

    pub fn not_found() -> Self {
        Self {
            value: None,
            servers: ServerGroup::default(),
            status: Status::ErrNoKey,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReply {
    pub status: Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WhanauRequest {
    RandomWalk {
        steps: usize,
    },
    GetId {
        layer: usize,
    },
    SampleSuccessors {
        key: Key,
        t: usize,
    },
    Lookup {
        key: Key,
        routed_from: Vec<Address>,
    },
    Put {
        key: Key,
        value: TrueValue,
    },
}

impl WhanauRequest {
    /// Short operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WhanauRequest::RandomWalk { .. } => "RandomWalk",
            WhanauRequest::GetId { .. } => "GetId",
            WhanauRequest::SampleSuccessors { .. } => "SampleSuccessors",
            WhanauRequest::Lookup { .. } => "Lookup",
            WhanauRequest::Put { .. } => "Put",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WhanauResponse {
    RandomWalk(RandomWalkReply),
    GetId(GetIdReply),
    SampleSuccessors(SampleSuccessorsReply),
    Lookup(LookupReply),
    Put(PutReply),
    Error { message: String },
}
