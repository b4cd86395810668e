use std::sync::Arc;

use crate::exec::{Stage, Status};
use crate::message::{NodeMessage, StageKey, StageTag};
use crate::octant::Octant;
use crate::tree::server::NodeServer;
use crate::tree::NodeClient;

/// One node's position in the sub-step pipeline of a single time step. A
/// step is a chain of stages per node:
///
/// ```text
/// Ghost(0) → Flux(0) → Update(0) → Inject(0) → Ghost(1) → ...
///          → Inject(order - 1) → Ghost(order) → Finish
/// ```
///
/// Entry messages carry data computed by the previous stage body, so a
/// neighbor's sub-step `s` cannot begin until this node's sub-step `s - 1`
/// has completed its update, which is the engine's ordering guarantee.
///
pub struct StepStage {
    node: Arc<NodeServer>,
    tag: StageTag,
    dt: f64,
    step: u64,
    expected: usize,
    received: usize,
}

impl StepStage {
    /// The stage a node starts a step on.
    ///
    pub fn initial(node: Arc<NodeServer>, dt: f64) -> Self {
        let step = node.step();
        Self::at(node, StageTag::Ghost(0), dt, step)
    }

    fn at(node: Arc<NodeServer>, tag: StageTag, dt: f64, step: u64) -> Self {
        let expected = match tag {
            StageTag::Ghost(_) => 6,
            StageTag::Flux(_) | StageTag::Finish => 0,
            StageTag::Update(_) | StageTag::Inject(_) => node.num_children(),
        };
        Self {
            node,
            tag,
            dt,
            step,
            expected,
            received: 0,
        }
    }

    /// Interpolated sub-slabs for every subscribed nephew, keyed to their
    /// ghost stage of the given phase.
    ///
    fn nephew_messages(&self, phase: usize) -> Vec<(StageKey, NodeMessage)> {
        self.node
            .nephews()
            .into_iter()
            .map(|nephew| {
                let slab = self.node.interpolated_ghost_slab(nephew.face, nephew.offset);
                let key = StageKey {
                    node: nephew.client.expect_real(),
                    tag: StageTag::Ghost(phase),
                };
                let message = NodeMessage::Ghost {
                    step: self.step,
                    phase,
                    face: nephew.face,
                    slab,
                };
                (key, message)
            })
            .collect()
    }

    /// Messages to the parent's stage of the given tag, if this node has a
    /// parent.
    ///
    fn parent_message(
        &self,
        tag: StageTag,
        message: NodeMessage,
    ) -> Vec<(StageKey, NodeMessage)> {
        match self.node.parent() {
            Some(parent) => {
                let key = StageKey {
                    node: parent.expect_real(),
                    tag,
                };
                vec![(key, message)]
            }
            None => vec![],
        }
    }
}

impl Stage for StepStage {
    type Key = StageKey;
    type Message = NodeMessage;

    fn key(&self) -> StageKey {
        StageKey {
            node: self.node.id(),
            tag: self.tag,
        }
    }

    fn rank_of(key: &StageKey) -> usize {
        key.node.rank as usize
    }

    fn messages(&self) -> Vec<(StageKey, NodeMessage)> {
        match self.tag {
            // Entering a ghost exchange: push outgoing slabs to real
            // siblings, and the locally mapped slabs for physical faces to
            // ourselves. Amr faces are inbound-only; the coarse neighbor
            // pushes when it fans out to its nephews.
            StageTag::Ghost(phase) => {
                let mut out = Vec::new();
                for (face, client) in crate::face::Face::ALL.iter().zip(self.node.siblings())
                {
                    match client {
                        NodeClient::Real { id } => {
                            let slab = self.node.extract_ghost_slab(face.invert());
                            let key = StageKey {
                                node: id,
                                tag: StageTag::Ghost(phase),
                            };
                            out.push((
                                key,
                                NodeMessage::Ghost {
                                    step: self.step,
                                    phase,
                                    face: face.invert(),
                                    slab,
                                },
                            ));
                        }
                        NodeClient::Physical { .. } => {
                            let slab = self.node.mapped_ghost_slab(*face);
                            out.push((
                                self.key(),
                                NodeMessage::Ghost {
                                    step: self.step,
                                    phase,
                                    face: *face,
                                    slab,
                                },
                            ));
                        }
                        NodeClient::Amr { .. } => {}
                        NodeClient::Invalid => {
                            panic!(
                                "node {:?} exchanging ghosts across an invalid face {:?}",
                                self.node.id(),
                                face
                            )
                        }
                    }
                }
                out
            }

            // Entering the flux stage: ghosts are fresh, so serve the
            // nephews their interpolated slabs for this phase.
            StageTag::Flux(phase) => self.nephew_messages(phase),

            // Entering the update: fluxes are computed, so ship the
            // boundary-flux packet up for coarse/fine reconciliation.
            StageTag::Update(phase) => self.parent_message(
                StageTag::Update(phase),
                NodeMessage::ChildFlux {
                    step: self.step,
                    phase,
                    octant: self.node.octant_in_parent(),
                    packet: self.node.flux_packet(),
                },
            ),

            // Entering injection: the update is done, so ship the averaged
            // interior up, keyed one phase ahead.
            StageTag::Inject(phase) => self.parent_message(
                StageTag::Inject(phase),
                NodeMessage::ChildState {
                    step: self.step,
                    phase: phase + 1,
                    octant: self.node.octant_in_parent(),
                    block: self.node.averaged_interior(),
                },
            ),

            // The trailing exchange is done; nephews still need their final
            // slabs before their own Finish.
            StageTag::Finish => self.nephew_messages(self.node.context().order()),
        }
    }

    fn receive(&mut self, message: NodeMessage) -> Status {
        let deps = self.node.deps();
        match message {
            NodeMessage::Ghost {
                phase, face, slab, ..
            } => deps.post_ghost(phase, face, slab),
            NodeMessage::ChildFlux {
                phase,
                octant,
                packet,
                ..
            } => deps.post_child_flux(phase, octant, packet),
            NodeMessage::ChildState {
                phase,
                octant,
                block,
                ..
            } => deps.post_child_state(phase, octant, block),
        };
        self.received += 1;
        Status::eligible_if(self.received == self.expected)
    }

    fn ready(&self) -> Status {
        Status::eligible_if(self.expected == 0)
    }

    fn worker_hint(&self) -> Option<usize> {
        Some(self.node.id().index as usize)
    }

    fn advance(self) -> Option<Self> {
        let order = self.node.context().order();
        let node = self.node.clone();

        let next = match self.tag {
            StageTag::Ghost(phase) => {
                if phase == 0 {
                    node.snapshot_state();
                }
                for face in crate::face::Face::ALL {
                    let slab = node
                        .deps()
                        .take_ghost(phase, face)
                        .expect("eligibility guarantees a fulfilled ghost slot");
                    node.integrate_ghost_slab(face, &slab);
                }
                if phase < order {
                    StageTag::Flux(phase)
                } else {
                    StageTag::Finish
                }
            }

            StageTag::Flux(phase) => {
                node.prepare_differentials();
                node.compute_fluxes();
                StageTag::Update(phase)
            }

            StageTag::Update(phase) => {
                let packets: Vec<(Octant, _)> = Octant::ALL
                    .into_iter()
                    .filter(|octant| node.child(*octant).is_some())
                    .map(|octant| {
                        let packet = node
                            .deps()
                            .take_child_flux(phase, octant)
                            .expect("eligibility guarantees a fulfilled flux slot");
                        (octant, packet)
                    })
                    .collect();
                node.adjust_flux(&packets);
                node.sum_differentials();
                let beta = node.context().config.beta_schedule()[phase];
                node.add_differentials(self.dt, beta);
                StageTag::Inject(phase)
            }

            StageTag::Inject(phase) => {
                for octant in Octant::ALL {
                    if node.child(octant).is_some() {
                        let block = node
                            .deps()
                            .take_child_state(phase + 1, octant)
                            .expect("eligibility guarantees a fulfilled state slot");
                        node.inject_child_state(octant, &block);
                    }
                }
                StageTag::Ghost(phase + 1)
            }

            StageTag::Finish => {
                node.advance_clock(self.dt);
                return None;
            }
        };

        Some(Self::at(node, next, self.dt, self.step))
    }
}
