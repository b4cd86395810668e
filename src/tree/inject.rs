use crate::block::Block;
use crate::face::Axis;
use crate::octant::Octant;
use crate::tree::server::NodeServer;

impl NodeServer {
    /// Average this node's interior into 2×2×2 blocks for injection into
    /// the parent: one entry per coarse cell covered, each the mean of the
    /// eight underlying fine cells.
    ///
    pub(crate) fn averaged_interior(&self) -> Block {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let half = ctx.interior() / 2;

        let grid = self.grid();
        Block::from_fn([half; 3], ns, |coarse, out| {
            for di in 0..2 {
                for dj in 0..2 {
                    for dk in 0..2 {
                        let i = bw + 2 * coarse[0] + di;
                        let j = bw + 2 * coarse[1] + dj;
                        let k = bw + 2 * coarse[2] + dk;
                        debug_assert!(i < gnx - bw && j < gnx - bw && k < gnx - bw);
                        for (out, u) in out.iter_mut().zip(grid.u.get(i, j, k)) {
                            *out += 0.125 * u
                        }
                    }
                }
            }
        })
    }

    /// Write a child's averaged state into the interior octant it covers.
    ///
    pub(crate) fn inject_child_state(&self, octant: Octant, block: &Block) {
        let ctx = self.context();
        let bw = ctx.bw();
        let half = ctx.interior() / 2;
        assert_eq!(block.dim(), [half; 3], "child state shape mismatch");

        let start = |axis: Axis| bw + octant.bit(axis) as usize * half;
        let (i0, j0, k0) = (start(Axis::X), start(Axis::Y), start(Axis::Z));

        let mut grid = self.grid();
        for i in 0..half {
            for j in 0..half {
                for k in 0..half {
                    grid.u
                        .get_mut(i0 + i, j0 + j, k0 + k)
                        .copy_from_slice(block.get(i, j, k));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::octant::Octant;
    use crate::tree::server::test::{root_init, test_context};
    use crate::tree::server::{seeded_block, NodeServer};
    use crate::tree::{NodeClient, NodeId, NodeInit};

    /// Seeding a child from the parent and immediately injecting its
    /// averaged interior back must leave the parent's cells unchanged.
    #[test]
    fn seed_then_inject_round_trips_the_parent_state() {
        let ctx = test_context(12);
        let parent_id = NodeId { rank: 0, index: 0 };
        let parent = NodeServer::root(parent_id, root_init(&ctx), ctx.clone());
        parent.fill_interior(|x, u| {
            u[0] = x[0] * 2.0 + x[1] - 0.5 * x[2] + 1.0;
        });

        let octant = Octant::new(3);
        let seed = seeded_block(&parent.grid().u, octant, &ctx);
        let init = NodeInit {
            parent: Some(NodeClient::real(parent_id)),
            level: 1,
            location: octant.vector(),
            dx: parent.dx() / 2.0,
            time: 0.0,
            offset: octant.vector().map(|b| b * ctx.interior() as i64),
            origin: [0.0; 3],
            step: 0,
        };
        let child =
            NodeServer::new_child(NodeId { rank: 0, index: 1 }, init, seed, ctx.clone()).unwrap();

        let before = parent.grid().u.clone();
        parent.inject_child_state(octant, &child.averaged_interior());
        let after = parent.grid().u.clone();

        for i in 0..12 {
            for j in 0..12 {
                for k in 0..12 {
                    let (b, a) = (before.get(i, j, k)[0], after.get(i, j, k)[0]);
                    assert!(
                        (b - a).abs() < 1e-13,
                        "parent cell ({} {} {}) drifted from {} to {}",
                        i,
                        j,
                        k,
                        b,
                        a
                    );
                }
            }
        }
    }

    #[test]
    fn injection_targets_the_matching_octant() {
        let ctx = test_context(12);
        let parent = NodeServer::root(NodeId { rank: 0, index: 0 }, root_init(&ctx), ctx.clone());

        let block = crate::block::Block::from_fn([4; 3], 1, |[i, j, k], u| {
            u[0] = (i + 10 * j + 100 * k) as f64;
        });
        parent.inject_child_state(Octant::new(7), &block);

        // Octant 7 covers the upper half on every axis: cells 6..10.
        assert_eq!(parent.cell(6, 6, 6), vec![0.0]);
        assert_eq!(parent.cell(9, 6, 7), vec![3.0 + 100.0]);
        assert_eq!(parent.cell(5, 5, 5), vec![0.0]);
    }
}
