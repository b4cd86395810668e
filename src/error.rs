use thiserror::Error;

use crate::face::Face;
use crate::octant::Octant;
use crate::tree::NodeId;

/// Error to represent a protocol or construction fault in the mesh engine.
/// Invariant violations are not represented here; those indicate a
/// construction bug and abort with a diagnostic instead.
///
#[derive(Debug, Error)]
pub enum Error {
    #[error("face slot {face:?} of node {node:?} accessed while invalid")]
    InvalidBoundary { node: NodeId, face: Face },

    #[error("dependency slot drained before its producer fulfilled it: {0}")]
    BrokenChannel(&'static str),

    #[error("face index {0} out of range")]
    OutOfRangeFace(usize),

    #[error("child {octant:?} of node {node:?} already exists")]
    ChildAlreadyExists { node: NodeId, octant: Octant },

    #[error("child of node {0:?} constructed with an owning parent handle")]
    ParentReferenceCycle(NodeId),

    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("checkpoint i/o: {0}")]
    Checkpoint(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
