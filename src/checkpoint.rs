//! Checkpointing: one opaque record per node plus a global header. Records
//! carry enough identity to rebuild the whole topology from scratch on
//! reload, so sibling, parent and nephew wiring is never serialized.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::octant::Octant;
use crate::tree::client::amr_offset;
use crate::tree::server::{Nephew, NodeServer};
use crate::tree::{NodeClient, NodeId, NodeInit};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub level: u64,
    pub location: [i64; 3],
    pub dx: f64,
    pub offset: [i64; 3],
    pub origin: [f64; 3],
    pub time: f64,
    pub step: u64,
    pub u: Block,
    pub fo: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub time: f64,
    pub dt: f64,
    pub nodes: Vec<NodeRecord>,
}

impl Checkpoint {
    /// Capture the full local tree. Records are ordered by `(level,
    /// location)` so captures of the same tree are identical.
    ///
    pub fn capture(engine: &Engine, dt: f64) -> Result<Self> {
        let root = engine.root()?;
        let mut nodes: Vec<NodeRecord> = engine
            .local_nodes()
            .iter()
            .map(|node| {
                let grid = node.grid();
                NodeRecord {
                    level: node.level(),
                    location: node.location(),
                    dx: node.dx(),
                    offset: node.offset(),
                    origin: node.origin(),
                    time: grid.time,
                    step: grid.step,
                    u: grid.u.clone(),
                    fo: grid.fo.clone(),
                }
            })
            .collect();
        nodes.sort_by_key(|record| (record.level, record.location));

        Ok(Self {
            step: root.step(),
            time: root.time(),
            dt,
            nodes,
        })
    }

    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        ciborium::ser::into_writer(self, writer).map_err(|e| Error::Checkpoint(e.to_string()))
    }

    pub fn read<R: Read>(reader: R) -> Result<Self> {
        ciborium::de::from_reader(reader).map_err(|e| Error::Checkpoint(e.to_string()))
    }

    /// Rebuild the tree into a fresh engine: construct every node from its
    /// record, then relink parents, children, siblings and nephew
    /// subscriptions from the `(level, location)` lattice alone.
    ///
    pub fn restore(&self, engine: &Engine) -> Result<()> {
        let bw = engine.context().bw();

        let mut ids: HashMap<(u64, [i64; 3]), NodeId> = HashMap::new();
        for record in &self.nodes {
            ids.insert((record.level, record.location), engine.alloc_id());
        }

        for record in &self.nodes {
            let id = ids[&(record.level, record.location)];
            let parent = (record.level > 0).then(|| {
                let parent_location = record.location.map(|l| l.div_euclid(2));
                NodeClient::real(ids[&(record.level - 1, parent_location)])
            });
            let init = NodeInit {
                parent,
                level: record.level,
                location: record.location,
                dx: record.dx,
                time: record.time,
                offset: record.offset,
                origin: record.origin,
                step: record.step,
            };
            let node = Arc::new(NodeServer::restore(
                id,
                init,
                record.u.clone(),
                record.fo.clone(),
                engine.context().clone(),
            ));
            engine.register_node(node);
            if record.level == 0 {
                engine.set_root(id);
            }
        }

        // Relink. A neighbor location outside the level's lattice is the
        // outer domain; a present neighbor is a real tie; an absent one is
        // served by the coarse node covering it, which must exist or the
        // checkpoint violated the level-jump invariant.
        for record in &self.nodes {
            let id = ids[&(record.level, record.location)];
            let node = engine.resolve(id)?;
            let extent = 1i64 << record.level;

            for face in Face::ALL {
                let mut neighbor = record.location;
                let axis = face.axis().index();
                neighbor[axis] += face.unit()[axis];

                let inside = neighbor.iter().all(|l| (0..extent).contains(l));
                if !inside {
                    node.install_sibling(face, NodeClient::Physical { face, id });
                } else if let Some(other) = ids.get(&(record.level, neighbor)) {
                    node.install_sibling(face, NodeClient::real(*other));
                } else {
                    let coarse_location = neighbor.map(|l| l.div_euclid(2));
                    let coarse_id = ids[&(record.level - 1, coarse_location)];
                    let coarse = engine.resolve(coarse_id)?;
                    let offset = amr_offset(record.offset, coarse.offset(), bw);
                    node.install_sibling(
                        face,
                        NodeClient::Amr {
                            face,
                            octant: Octant::from_location(record.location),
                            id: coarse_id,
                            offset,
                        },
                    );
                    coarse.add_nephew(Nephew {
                        client: NodeClient::real(id),
                        face,
                        offset,
                    });
                }
            }

            for octant in Octant::ALL {
                let mut child = record.location.map(|l| 2 * l);
                for axis in 0..3 {
                    child[axis] += octant.vector()[axis];
                }
                if let Some(child_id) = ids.get(&(record.level + 1, child)) {
                    node.register_child(octant, NodeClient::real(*child_id))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Checkpoint;
    use crate::comm::LoopbackCommunicator;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::science::LinearAdvection;
    use crate::tree::refine::check_invariants;
    use std::sync::Arc;

    fn advection_engine() -> Arc<Engine> {
        let config = Config {
            levels_of_refinement: 2,
            ..Config::default()
        };
        let science = Arc::new(LinearAdvection::new([1.0, 0.5, 0.0]).with_refine_threshold(0.2));
        let engine = Engine::new(config, science, Arc::new(LoopbackCommunicator::new()), 2).unwrap();
        let root = engine.create_root().unwrap().expect_real();
        let root_node = engine.resolve(root).unwrap();
        engine.context().science.initialize(&root_node);
        engine.refine().unwrap();
        engine
    }

    #[test]
    fn capture_restore_round_trips_the_tree() {
        let engine = advection_engine();
        let dt = engine.initial_dt().unwrap();
        engine.step(dt).unwrap();

        let checkpoint = Checkpoint::capture(&engine, dt).unwrap();

        let mut bytes = Vec::new();
        checkpoint.write(&mut bytes).unwrap();
        let reloaded = Checkpoint::read(bytes.as_slice()).unwrap();
        assert_eq!(reloaded.step, 1);
        assert_eq!(reloaded.nodes.len(), checkpoint.nodes.len());

        let fresh = Engine::new(
            engine.config().clone(),
            Arc::new(LinearAdvection::new([1.0, 0.5, 0.0]).with_refine_threshold(0.2)),
            Arc::new(LoopbackCommunicator::new()),
            2,
        )
        .unwrap();
        reloaded.restore(&fresh).unwrap();
        check_invariants(&fresh).unwrap();

        // An interrupted run and a straight-through run produce the same
        // state after the next step.
        engine.step(dt).unwrap();
        fresh.step(dt).unwrap();

        let a = Checkpoint::capture(&engine, dt).unwrap();
        let b = Checkpoint::capture(&fresh, dt).unwrap();
        assert_eq!(a.nodes.len(), b.nodes.len());
        for (ra, rb) in a.nodes.iter().zip(&b.nodes) {
            assert_eq!(ra.level, rb.level);
            assert_eq!(ra.location, rb.location);
            assert_eq!(ra.step, rb.step);
            assert_eq!(ra.u, rb.u, "state diverged after reload");
        }
    }
}
