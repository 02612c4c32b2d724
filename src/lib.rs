//! # Whanau - Sybil-Resistant Layered Lookup Overlay
//!
//! Whanau routes key lookups over a social graph whose honest region is fast
//! mixing. Nodes build their routing state purely from random walks, so an
//! attacker who controls many identities but few edges into the honest region
//! gains little influence over honest routing tables.
//!
//! - **Random walks**: the only discovery primitive; honest walks mix, Sybil
//!   nodes answer in a single hop
//! - **Layered index**: per-layer identifiers, finger tables and successor
//!   tables, rebuilt from scratch on every setup pass
//! - **Routing**: local store, then successor tables, then fingers, then
//!   neighbors, with path tracking to prevent loops
//! - **Consistency**: authoritative values live behind a pluggable layer
//!
//! ## Architecture
//!
//! Each node is a cheap-to-clone handle in front of an actor that owns all
//! mutable state. Setup passes and lookups run on the handle and talk to the
//! actor over channels, never holding locks across network calls.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | TCP-bound node combining overlay and transport |
//! | `overlay` | Node handle, state actor and RPC handlers |
//! | `walker` | Honest and Sybil random walks, walk-ahead cache |
//! | `store` | Routing store and key-sorted db sample |
//! | `index` | Layered index, identifier selection, finger ordering |
//! | `setup` | Finger and successor table construction, atomic publish |
//! | `router` | Lookup state machine |
//! | `consistency` | In-memory consistency layer |
//! | `config` | Tunable parameters and validation |
//! | `protocols` | Transport and consistency trait definitions |
//! | `rpc` | Length-prefixed bincode over TCP |
//! | `messages` | Data model and wire types |

mod config;
mod consistency;
mod index;
mod messages;
mod node;
mod overlay;
mod protocols;
mod router;
mod rpc;
mod setup;
mod store;
mod walker;

pub use config::{ConfigError, WhanauConfig, MAX_WALK_STEPS};
pub use consistency::MemoryConsistency;
pub use index::{Layer, LayeredIndex};
pub use messages::{
    Address, Finger, GetIdReply, Key, LookupReply, PutReply, RandomWalkReply, Record,
    SampleSuccessorsReply, ServerGroup, Status, TrueValue,
};
pub use node::Node;
pub use overlay::{NodeTelemetry, WhanauNode};
pub use protocols::{ConsistencyLayer, WhanauRpc};
pub use rpc::TcpRpc;
pub use setup::{SetupError, TableKind};
pub use walker::WalkStrategy;

#[cfg(test)]
mod testnet;
