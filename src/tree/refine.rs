use log::debug;
use rayon::prelude::*;

use crate::engine::{CallOp, CallReply, Engine};
use crate::error::Result;
use crate::face::{Axis, Face};
use crate::octant::{invert, Octant};
use crate::tree::client::amr_offset;
use crate::tree::server::{Nephew, NodeServer};
use crate::tree::NodeClient;

/// Pass indexes into the refinement-signal slots. One signal goes to every
/// real sibling at the end of each pass and is drained at the start of the
/// next, so same-level neighbors stay in lockstep without a global
/// collective; the finalize signal is drained by the next cycle's clear.
///
const CLEAR: usize = 0;
const MARK: usize = 1;
const POPULATE: usize = 2;
const LINK: usize = 3;
const FINALIZE: usize = 4;

impl Engine {
    /// One global refinement pass: clear marks, mark (with mandatory
    /// propagation), populate, link real ties, then finalize boundaries
    /// and nephew subscriptions.
    ///
    pub fn refine(&self) -> Result<()> {
        self.refine_sweep(CLEAR, |engine, node| engine.clear_pass(node))?;
        self.refine_sweep(MARK, |engine, node| engine.mark_pass(node))?;
        self.refine_sweep(POPULATE, |engine, node| engine.populate_pass(node))?;
        self.refine_sweep(LINK, |engine, node| engine.link_pass(node))?;
        self.refine_sweep(FINALIZE, |engine, node| engine.finalize_pass(node))?;
        Ok(())
    }

    /// Run one pass over a snapshot of the local nodes in parallel. Each
    /// visit drains the previous pass's sibling signals first and posts its
    /// own at the end.
    ///
    fn refine_sweep<F>(&self, pass: usize, visit: F) -> Result<()>
    where
        F: Fn(&Engine, &NodeServer) -> Result<()> + Sync,
    {
        let nodes = self.local_nodes();
        nodes.par_iter().try_for_each(|node| {
            node.deps().drain_refine_signals((pass + 4) % 5);
            visit(self, node.as_ref())?;
            self.signal_siblings(node.as_ref(), pass)
        })
    }

    fn signal_siblings(&self, node: &NodeServer, pass: usize) -> Result<()> {
        for (face, client) in Face::ALL.iter().zip(node.siblings()) {
            if let NodeClient::Real { id } = client {
                self.dispatch(CallOp::RefineSignal {
                    node: id,
                    pass,
                    face: face.invert(),
                })?;
            }
        }
        Ok(())
    }

    fn clear_pass(&self, node: &NodeServer) -> Result<()> {
        node.clear_marks();
        Ok(())
    }

    /// Ask the refinement predicate about every absent child within the
    /// depth limit. Marking routes through `require_child`, which also
    /// propagates mandatory refinement across coarser neighbors.
    ///
    fn mark_pass(&self, node: &NodeServer) -> Result<()> {
        if node.level() + 1 >= self.config().levels_of_refinement {
            return Ok(());
        }
        for octant in Octant::ALL {
            if node.child(octant).is_none() && self.context().science.refine(node, octant) {
                self.require_child(node.id(), octant)?;
            }
        }
        Ok(())
    }

    /// Create every marked child, seeded from this node's state.
    ///
    fn populate_pass(&self, node: &NodeServer) -> Result<()> {
        for octant in Octant::ALL {
            if node.is_marked(octant) && node.child(octant).is_none() {
                self.create_child(node.id(), octant)?;
            }
        }
        Ok(())
    }

    /// Install every real tie that this pass of refinement makes possible:
    ///
    /// - repair this node's own amr faces whose missing neighbor now
    ///   exists (created here or forced by `require_child`);
    /// - tie new children to their face-adjacent siblings within this
    ///   parent;
    /// - tie new children across parents, initiated from the upper-face
    ///   side; the receiving parent declines for pre-existing children,
    ///   which repair their own faces instead.
    ///
    fn link_pass(&self, node: &NodeServer) -> Result<()> {
        // Repairs. Amr clients pointing at this node's own parent belong
        // to the in-parent tie rule below, on the parent's visit.
        for face in Face::ALL {
            if let NodeClient::Amr { id: coarse, .. } = node.sibling(face) {
                if node.parent().and_then(|p| p.id()) == Some(coarse) {
                    continue;
                }
                let mut neighbor = node.location();
                neighbor[face.axis().index()] += face.unit()[face.axis().index()];
                let reply = self.dispatch(CallOp::GetChild {
                    node: coarse,
                    octant: Octant::from_location(neighbor),
                })?;
                if let CallReply::Child(Some(sibling)) = reply {
                    debug!("repairing {:?} face {:?} to {:?}", node.id(), face, sibling);
                    self.tie_sibling(node.id(), face, sibling.expect_real())?;
                }
            }
        }

        for octant in Octant::ALL {
            if !node.is_marked(octant) {
                continue;
            }
            let child = node.child(octant).expect("marked children are populated");

            for axis in Axis::ALL {
                // In-parent ties. When both children are new, the lower
                // octant initiates; a pre-existing sibling never initiates,
                // so the new child's side always does.
                let interior = octant.interior_face(axis);
                let sibling = octant.flip(axis);
                if let Some(sibling_client) = node.child(sibling) {
                    if !node.is_marked(sibling) || octant.bit(axis) == 0 {
                        self.set_sibling(child.expect_real(), interior, sibling_client)?;
                        self.set_sibling(
                            sibling_client.expect_real(),
                            interior.invert(),
                            child,
                        )?;
                    }
                }

                // Cross-parent ties through the uncle, upper side first.
                let exterior = octant.exterior_face(axis);
                if let NodeClient::Real { id: uncle } = node.sibling(exterior) {
                    if exterior.is_upper() {
                        let reply = self.dispatch(CallOp::TieChildSibling {
                            node: uncle,
                            octant: invert(exterior, octant),
                            face: exterior.invert(),
                            client: child,
                        })?;
                        if let CallReply::Child(Some(cousin)) = reply {
                            self.set_sibling(child.expect_real(), exterior, cousin)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill every face of a new child that linking left open: absent
    /// in-parent siblings become amr boundaries served by this node,
    /// absent cousins become amr boundaries served by the uncle, and
    /// physical uncles project physical faces onto the child. Every amr
    /// install registers the inverse nephew subscription.
    ///
    fn finalize_pass(&self, node: &NodeServer) -> Result<()> {
        let bw = self.context().bw();
        for octant in Octant::ALL {
            if !node.is_marked(octant) {
                continue;
            }
            let child = node.child(octant).expect("marked children are populated");
            let child_id = child.expect_real();
            let child_offset = match self.dispatch(CallOp::GetOffset { node: child_id })? {
                CallReply::Offset(offset) => offset,
                _ => unreachable!(),
            };
            let open = match self.dispatch(CallOp::GetSiblings { node: child_id })? {
                CallReply::Siblings(siblings) => siblings,
                _ => unreachable!(),
            };

            for face in Face::ALL {
                if !open[face.index()].is_invalid() {
                    continue;
                }

                if face == octant.interior_face(face.axis()) {
                    // The in-parent sibling is absent and unmarked; this
                    // node serves the interpolated slabs itself.
                    let offset = amr_offset(child_offset, node.offset(), bw);
                    self.set_sibling(
                        child_id,
                        face,
                        NodeClient::Amr {
                            face,
                            octant,
                            id: node.id(),
                            offset,
                        },
                    )?;
                    node.add_nephew(Nephew {
                        client: child,
                        face,
                        offset,
                    });
                    continue;
                }

                match node.sibling(face) {
                    NodeClient::Physical { .. } => {
                        self.set_sibling(
                            child_id,
                            face,
                            NodeClient::Physical {
                                face,
                                id: child_id,
                            },
                        )?;
                    }
                    NodeClient::Real { id: uncle } => {
                        let uncle_offset =
                            match self.dispatch(CallOp::GetOffset { node: uncle })? {
                                CallReply::Offset(offset) => offset,
                                _ => unreachable!(),
                            };
                        let offset = amr_offset(child_offset, uncle_offset, bw);
                        self.set_sibling(
                            child_id,
                            face,
                            NodeClient::Amr {
                                face,
                                octant,
                                id: uncle,
                                offset,
                            },
                        )?;
                        self.dispatch(CallOp::AddNephew {
                            node: uncle,
                            nephew: Nephew {
                                client: child,
                                face,
                                offset,
                            },
                        })?;
                    }
                    other => panic!(
                        "node {:?} cannot close face {:?} of child {:?} across {:?}",
                        node.id(),
                        face,
                        octant,
                        other
                    ),
                }
            }

            // Invariant: no face slot stays invalid once linking completes.
            let closed = self.resolve(child_id)?.siblings();
            assert!(
                closed.iter().all(|client| !client.is_invalid()),
                "child {:?} of {:?} left an invalid face after refinement",
                octant,
                node.id()
            );
        }
        Ok(())
    }
}

/// Verify the topology invariants over the local tree: real ties are
/// symmetric, amr clients point exactly one level up, and every amr client
/// has the inverse nephew subscription with the matching offset.
///
pub fn check_invariants(engine: &Engine) -> Result<()> {
    let bw = engine.context().bw();
    for node in engine.local_nodes() {
        for (face, client) in Face::ALL.iter().zip(node.siblings()) {
            match client {
                NodeClient::Invalid => {
                    panic!("node {:?} has an invalid face {:?}", node.id(), face)
                }
                NodeClient::Real { id } => {
                    let neighbor = engine.resolve(id)?;
                    assert_eq!(neighbor.level(), node.level());
                    assert_eq!(
                        neighbor.sibling(face.invert()),
                        NodeClient::real(node.id()),
                        "asymmetric real tie across {:?}",
                        face
                    );
                }
                NodeClient::Amr { id, offset, .. } => {
                    let coarse = engine.resolve(id)?;
                    assert_eq!(
                        coarse.level() + 1,
                        node.level(),
                        "amr level jump exceeds one across {:?}",
                        face
                    );
                    assert_eq!(offset, amr_offset(node.offset(), coarse.offset(), bw));
                    assert!(
                        coarse.nephews().iter().any(|nephew| {
                            nephew.client == NodeClient::real(node.id())
                                && nephew.face == *face
                                && nephew.offset == offset
                        }),
                        "missing nephew subscription for {:?} on {:?}",
                        node.id(),
                        id
                    );
                }
                NodeClient::Physical { .. } => {}
            }
        }

        // Every nephew subscription has the inverse amr client.
        for nephew in node.nephews() {
            let fine = engine.resolve(nephew.client.expect_real())?;
            match fine.sibling(nephew.face) {
                NodeClient::Amr { id, offset, .. } => {
                    assert_eq!(id, node.id());
                    assert_eq!(offset, nephew.offset);
                }
                other => panic!(
                    "nephew {:?} of {:?} lost its amr client: {:?}",
                    nephew.client,
                    node.id(),
                    other
                ),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::check_invariants;
    use crate::config::Config;
    use crate::comm::LoopbackCommunicator;
    use crate::engine::Engine;
    use crate::face::Face;
    use crate::octant::Octant;
    use crate::science::{Coords, Science};
    use crate::tree::NodeServer;
    use std::sync::Arc;

    /// Marks an explicit set of `(level, location, octant)` children.
    struct MarkList {
        marks: Vec<(u64, [i64; 3], Octant)>,
    }

    impl MarkList {
        fn new(marks: Vec<(u64, [i64; 3], Octant)>) -> Self {
            Self { marks }
        }
    }

    impl Science for MarkList {
        fn state_size(&self) -> usize {
            1
        }
        fn ghost_zone_width(&self) -> usize {
            2
        }
        fn reconstruct(&self, q0: &[Vec<f64>], ql: &mut [Vec<f64>], qr: &mut [Vec<f64>]) {
            for i in 1..q0.len() {
                ql[i].copy_from_slice(&q0[i - 1]);
                qr[i].copy_from_slice(&q0[i]);
            }
        }
        fn conserved_to_primitive(&self, _: &mut [f64], _: Coords) {}
        fn primitive_to_conserved(&self, _: &mut [f64], _: Coords) {}
        fn flux(&self, _: crate::face::Axis, _: &[f64], _: Coords, out: &mut [f64]) {
            out[0] = 0.0
        }
        fn max_eigenvalue(&self, _: crate::face::Axis, _: &[f64], _: Coords) -> f64 {
            0.0
        }
        fn source(&self, _: &[f64], _: Coords, out: &mut [f64]) {
            out[0] = 0.0
        }
        fn refine(&self, node: &NodeServer, octant: Octant) -> bool {
            self.marks.iter().any(|(level, location, target)| {
                *level == node.level() && *location == node.location() && *target == octant
            })
        }
        fn initialize(&self, node: &NodeServer) {
            node.fill_interior(|_, u| u[0] = 1.0)
        }
        fn initial_dt(&self, _: &NodeServer) -> f64 {
            0.1
        }
        fn predict_dt(&self, _: &NodeServer, dt: f64, _: f64) -> (f64, f64) {
            (dt, dt)
        }
    }

    fn engine_with(science: Arc<dyn Science>, levels: u64) -> Arc<Engine> {
        let config = Config {
            levels_of_refinement: levels,
            ..Config::default()
        };
        Engine::new(config, science, Arc::new(LoopbackCommunicator::new()), 2).unwrap()
    }

    /// A single marked child gets amr boundaries on its in-parent faces,
    /// physical faces toward the domain edge, and the parent records the
    /// inverse nephew subscriptions.
    #[test]
    fn lone_child_is_fenced_by_amr_and_physical_faces() {
        let science = Arc::new(MarkList::new(vec![(0, [0, 0, 0], Octant::new(1))]));
        let engine = engine_with(science, 2);
        let root = engine.create_root().unwrap().expect_real();
        engine.refine().unwrap();

        let root_node = engine.resolve(root).unwrap();
        let child = root_node.child(Octant::new(1)).unwrap().expect_real();
        let child_node = engine.resolve(child).unwrap();

        // Octant (1, 0, 0): interior faces XL, YU, ZU; exterior XU, YL, ZL.
        for (face, amr) in [
            (Face::XL, true),
            (Face::XU, false),
            (Face::YL, false),
            (Face::YU, true),
            (Face::ZL, false),
            (Face::ZU, true),
        ] {
            let client = child_node.sibling(face);
            if amr {
                assert!(client.is_amr(), "{:?} should be amr, got {:?}", face, client);
                assert_eq!(client.id(), Some(root));
            } else {
                assert!(
                    client.is_physical(),
                    "{:?} should be physical, got {:?}",
                    face,
                    client
                );
            }
        }
        assert_eq!(root_node.nephews().len(), 3);
        check_invariants(&engine).unwrap();

        // The fenced tree still steps: interpolation, injection and flux
        // reconciliation all engage.
        engine.step(1e-3).unwrap();
        assert_eq!(engine.resolve(root).unwrap().step(), 1);
        assert_eq!(engine.resolve(child).unwrap().step(), 1);
    }

    /// Marking a child whose exterior face borders a missing same-level
    /// neighbor forces that neighbor into existence, and the amr face is
    /// repaired to a real tie.
    #[test]
    fn mandatory_refinement_propagates_across_amr_faces() {
        // First pass creates only root child (0,0,0); the second pass marks
        // that child's (1,1,1) grandchild, whose exterior faces cross into
        // absent uncles.
        let science = Arc::new(MarkList::new(vec![
            (0, [0, 0, 0], Octant::new(0)),
            (1, [0, 0, 0], Octant::new(7)),
        ]));
        let engine = engine_with(science.clone(), 3);
        let root = engine.create_root().unwrap().expect_real();

        engine.refine().unwrap();
        let root_node = engine.resolve(root).unwrap();
        let a = root_node.child(Octant::new(0)).unwrap().expect_real();

        engine.refine().unwrap();

        // The grandchild exists...
        let a_node = engine.resolve(a).unwrap();
        assert!(a_node.child(Octant::new(7)).is_some());

        // ...and so do the three forced uncles adjacent to its exterior
        // faces, with repaired real ties back to (0,0,0).
        for octant in [Octant::new(1), Octant::new(2), Octant::new(4)] {
            let forced = root_node.child(octant);
            assert!(forced.is_some(), "uncle {:?} was not forced", octant);
        }
        assert!(a_node.sibling(Face::XU).is_real());
        assert!(a_node.sibling(Face::YU).is_real());
        assert!(a_node.sibling(Face::ZU).is_real());

        check_invariants(&engine).unwrap();
    }

    /// A fully refined level wires all interior sibling ties symmetrically.
    #[test]
    fn full_octet_ties_are_symmetric() {
        let marks = Octant::ALL
            .map(|octant| (0, [0, 0, 0], octant))
            .to_vec();
        let engine = engine_with(Arc::new(MarkList::new(marks)), 2);
        let root = engine.create_root().unwrap().expect_real();
        engine.refine().unwrap();

        let root_node = engine.resolve(root).unwrap();
        assert_eq!(root_node.num_children(), 8);
        for octant in Octant::ALL {
            let child = root_node.child(octant).unwrap().expect_real();
            let child_node = engine.resolve(child).unwrap();
            let real = child_node
                .siblings()
                .iter()
                .filter(|c| c.is_real())
                .count();
            assert_eq!(real, 3, "child {:?} has {} real ties", octant, real);
        }
        assert!(root_node.nephews().is_empty());
        check_invariants(&engine).unwrap();

        // A refined octet also steps cleanly end to end.
        engine.step(1e-3).unwrap();
        assert_eq!(root_node.step(), 1);
    }
}
