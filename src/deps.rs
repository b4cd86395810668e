use std::sync::Mutex;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::message::FluxPacket;
use crate::octant::Octant;

/// Per-node dependency slots. Each slot is a single-value channel written at
/// most once per `(step, phase)` cycle by exactly one producer and drained at
/// most once by the owning node; re-use across cycles is by reset after
/// drain. Posting into an occupied slot indicates two producers raced for it
/// and aborts. Draining an empty slot means the producer disappeared before
/// fulfilling it, which surfaces as [`Error::BrokenChannel`].
///
/// Slot groups are sized from the Runge-Kutta order: `order + 1` ghost
/// phases, `order + 1` child-state phases, `order` flux-adjustment phases,
/// and exactly 5 refinement passes.
///
pub struct Dependencies {
    ghost: Mutex<Vec<[Option<Block>; 6]>>,
    child_state: Mutex<Vec<[Option<Block>; 8]>>,
    child_flux: Mutex<Vec<[Option<FluxPacket>; 8]>>,
    refine: Mutex<[[bool; 6]; 5]>,
}

const NO_BLOCK: Option<Block> = None;
const NO_FLUX: Option<FluxPacket> = None;

impl Dependencies {
    pub fn new(order: usize) -> Self {
        Self {
            ghost: Mutex::new(vec![[NO_BLOCK; 6]; order + 1]),
            child_state: Mutex::new(vec![[NO_BLOCK; 8]; order + 1]),
            child_flux: Mutex::new(vec![[NO_FLUX; 8]; order]),
            refine: Mutex::new([[false; 6]; 5]),
        }
    }

    /// Post an inbound ghost slab and return how many of the six face slots
    /// for this phase are now filled.
    ///
    pub fn post_ghost(&self, phase: usize, face: Face, slab: Block) -> usize {
        let mut ghost = self.ghost.lock().unwrap();
        let slots = &mut ghost[phase];
        assert!(
            slots[face.index()].is_none(),
            "ghost slot (phase {}, {:?}) written twice",
            phase,
            face
        );
        slots[face.index()] = Some(slab);
        slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn take_ghost(&self, phase: usize, face: Face) -> Result<Block> {
        self.ghost.lock().unwrap()[phase][face.index()]
            .take()
            .ok_or(Error::BrokenChannel("ghost zone"))
    }

    pub fn post_child_state(&self, phase: usize, octant: Octant, block: Block) -> usize {
        let mut state = self.child_state.lock().unwrap();
        let slots = &mut state[phase];
        assert!(
            slots[octant.index()].is_none(),
            "child-state slot (phase {}, {:?}) written twice",
            phase,
            octant
        );
        slots[octant.index()] = Some(block);
        slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn take_child_state(&self, phase: usize, octant: Octant) -> Result<Block> {
        self.child_state.lock().unwrap()[phase][octant.index()]
            .take()
            .ok_or(Error::BrokenChannel("child state"))
    }

    pub fn post_child_flux(&self, phase: usize, octant: Octant, packet: FluxPacket) -> usize {
        let mut flux = self.child_flux.lock().unwrap();
        let slots = &mut flux[phase];
        assert!(
            slots[octant.index()].is_none(),
            "child-flux slot (phase {}, {:?}) written twice",
            phase,
            octant
        );
        slots[octant.index()] = Some(packet);
        slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn take_child_flux(&self, phase: usize, octant: Octant) -> Result<FluxPacket> {
        self.child_flux.lock().unwrap()[phase][octant.index()]
            .take()
            .ok_or(Error::BrokenChannel("child flux"))
    }

    /// Record a refinement signal from the sibling across `face`.
    ///
    pub fn post_refine_signal(&self, pass: usize, face: Face) {
        let mut refine = self.refine.lock().unwrap();
        assert!(
            !refine[pass][face.index()],
            "refinement slot (pass {}, {:?}) written twice",
            pass,
            face
        );
        refine[pass][face.index()] = true;
    }

    /// Drain and return the refinement signals for a pass.
    ///
    pub fn drain_refine_signals(&self, pass: usize) -> [bool; 6] {
        std::mem::replace(&mut self.refine.lock().unwrap()[pass], [false; 6])
    }
}

#[cfg(test)]
mod test {
    use super::Dependencies;
    use crate::block::Block;
    use crate::face::Face;
    use crate::octant::Octant;

    #[test]
    fn ghost_slots_fill_and_drain() {
        let deps = Dependencies::new(3);
        assert_eq!(deps.post_ghost(0, Face::XL, Block::zeros([1, 1, 1], 1)), 1);
        assert_eq!(deps.post_ghost(0, Face::ZU, Block::zeros([1, 1, 1], 1)), 2);
        assert!(deps.take_ghost(0, Face::XL).is_ok());
        assert!(deps.take_ghost(0, Face::XL).is_err());

        // The slot is free again after the drain.
        deps.post_ghost(0, Face::XL, Block::zeros([1, 1, 1], 1));
    }

    #[test]
    #[should_panic(expected = "written twice")]
    fn double_post_aborts() {
        let deps = Dependencies::new(1);
        deps.post_ghost(1, Face::YL, Block::zeros([1, 1, 1], 1));
        deps.post_ghost(1, Face::YL, Block::zeros([1, 1, 1], 1));
    }

    #[test]
    fn broken_channel_is_reported() {
        let deps = Dependencies::new(2);
        assert!(deps.take_child_state(1, Octant::new(3)).is_err());
    }

    #[test]
    fn refinement_signals_reset_on_drain() {
        let deps = Dependencies::new(1);
        deps.post_refine_signal(2, Face::XU);
        let got = deps.drain_refine_signals(2);
        assert!(got[Face::XU.index()]);
        assert!(!got[Face::XL.index()]);
        assert_eq!(deps.drain_refine_signals(2), [false; 6]);
    }
}
