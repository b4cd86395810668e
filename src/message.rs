use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::face::Face;
use crate::octant::Octant;
use crate::tree::NodeId;

/// Boundary-face fluxes of one node, averaged over 2×2 fine-face windows so
/// the parent can overwrite the matching coarse faces. One block per face;
/// each block is a single-cell-thick slab over the child's interior octant
/// footprint in parent cells.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FluxPacket {
    pub faces: [Block; 6],
}

/// A message between node stages. Every variant names the receiver's frame:
/// `face` is the face of the *receiving* node that the payload fills, and
/// `octant` is the sender's octant within the receiving parent. Refinement
/// signals travel on the call protocol, not here; the step pipeline only
/// ever carries bulk state.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeMessage {
    /// A ghost-zone slab for the receiver's `(step, phase, face)` slot.
    Ghost {
        step: u64,
        phase: usize,
        face: Face,
        slab: Block,
    },

    /// A child's boundary-flux packet for the parent's `(phase, octant)`
    /// flux-adjustment slot.
    ChildFlux {
        step: u64,
        phase: usize,
        octant: Octant,
        packet: FluxPacket,
    },

    /// A child's averaged interior state for the parent's `(phase, octant)`
    /// injection slot.
    ChildState {
        step: u64,
        phase: usize,
        octant: Octant,
        block: Block,
    },
}

/// Identifies the pipeline stage a message is addressed to. Stage keys are
/// the routing keys of the executor: `(node, tag)` uniquely identifies a
/// task within one step.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageTag {
    Ghost(usize),
    Flux(usize),
    Update(usize),
    Inject(usize),
    Finish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageKey {
    pub node: NodeId,
    pub tag: StageTag,
}
