//! Node records and the repository that holds them.
//!
//! - [`NodeRecord`]: identity, hardware, status and counters of one worker
//! - [`SlotLedger`]: concurrency reservations of a node
//! - [`Tier`]: hardware classification used as a ranking bonus
//! - [`NodeStore`]: narrow repository trait, [`InMemoryNodeStore`] by default

pub mod node;
pub mod slots;
pub mod store;
pub mod tier;

pub use node::{AgentMetrics, HardwareProfile, NodeRecord, NodeStatus, NodeSummary, SystemStats};
pub use slots::{Reservation, SlotLedger};
pub use store::{InMemoryNodeStore, NodeStore};
pub use tier::Tier;
