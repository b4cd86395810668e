//! The octree of grid nodes: topology, ghost-zone exchange, the integrator
//! pipeline, child/parent state transfer, and the refinement lifecycle.

pub mod client;
mod flux;
mod ghost;
mod inject;
pub mod refine;
pub mod server;
pub mod step;

pub use client::NodeClient;
pub use server::{Nephew, NodeServer};

use serde::{Deserialize, Serialize};

/// Globally unique node address: the owning rank plus an index unique within
/// the allocating rank. Carries no reference count, so a parent address held
/// by a child can never form an ownership cycle.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub rank: u32,
    pub index: u64,
}

/// Everything needed to construct a node, computed by the parent (or the
/// driver, for the root) before the node exists.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInit {
    pub parent: Option<NodeClient>,
    pub level: u64,
    pub location: [i64; 3],
    pub dx: f64,
    pub time: f64,
    pub offset: [i64; 3],
    pub origin: [f64; 3],
    pub step: u64,
}
