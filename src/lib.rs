//! datanode: a data-publishing network node
//!
//! Peers advertise and resolve metadata documents (DDOs) over a libp2p
//! overlay, answer protocol commands, and run compute-to-data jobs in docker
//! containers next to the data.

pub mod compute;
pub mod config;
pub mod context;
pub mod ddo;
pub mod dispatcher;
pub mod error;
pub mod nonce;
pub mod p2p;
pub mod storage;
pub mod stream;

pub use config::Config;
pub use context::NodeContext;
pub use error::{NodeError, NodeResult};
