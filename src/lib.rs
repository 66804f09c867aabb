//! # BDP - Butterfly Delta Protocol
//!
//! BDP is a peer-to-peer folder-sync engine: content-addressed storage,
//! an incremental Merkle index, a vector-clock CRDT planner, and a framed
//! wire protocol, wired together by a per-peer session state machine.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bdp::config::Config;
//! use bdp::store::Store;
//! use bdp::cas::Cas;
//!
//! let config = Config::default();
//! let store = Store::open(&config.bdp_dir.join("bdp.redb"))?;
//! let cas = Cas::new(config.bdp_dir.join("cas"), config.compression_threshold, config.compression_ratio_cutoff);
//! ```

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod cas;
pub mod chunking;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod merkle;
pub mod planner;
pub mod session;
pub mod store;
pub mod types;
pub mod wire;

pub use cas::Cas;
pub use config::Config;
pub use error::BdpError;
pub use session::{Session, SessionCallbacks, SessionState, SyncType};
pub use store::Store;
pub use types::{ConflictStrategy, DeviceId, Direction, PairId, SyncPair};

// vim: ts=4
