use crate::block::Block;
use crate::face::Face;
use crate::science::minmod;
use crate::tree::server::NodeServer;

/// Destination cell ranges of the ghost region on one face: width `bw` on
/// the normal axis, the interior extent on the other two.
///
fn ghost_ranges(face: Face, gnx: usize, bw: usize) -> [(usize, usize); 3] {
    let mut ranges = [(bw, gnx - bw); 3];
    ranges[face.axis().index()] = if face.is_upper() {
        (gnx - bw, gnx)
    } else {
        (0, bw)
    };
    ranges
}

fn slab_dim(ranges: &[(usize, usize); 3]) -> [usize; 3] {
    [
        ranges[0].1 - ranges[0].0,
        ranges[1].1 - ranges[1].0,
        ranges[2].1 - ranges[2].0,
    ]
}

impl NodeServer {
    /// Extract the slab that fills the ghost region on face `face` of a
    /// same-level neighbor: this node's interior cells adjacent to the
    /// shared face, laid out in the receiver's slab frame.
    ///
    pub(crate) fn extract_ghost_slab(&self, face: Face) -> Block {
        let gnx = self.context().gnx();
        let bw = self.context().bw();
        let ranges = ghost_ranges(face, gnx, bw);
        let axis = face.axis().index();

        // The receiver's lower ghost cells mirror this node's upper interior
        // and vice versa.
        let shift = (gnx - 2 * bw) as i64 * if face.is_upper() { -1 } else { 1 };

        let grid = self.grid();
        let mut slab = Block::zeros(slab_dim(&ranges), self.context().ns());
        for i in ranges[0].0..ranges[0].1 {
            for j in ranges[1].0..ranges[1].1 {
                for k in ranges[2].0..ranges[2].1 {
                    let mut src = [i, j, k];
                    src[axis] = (src[axis] as i64 + shift) as usize;
                    slab.get_mut(i - ranges[0].0, j - ranges[1].0, k - ranges[2].0)
                        .copy_from_slice(grid.u.get(src[0], src[1], src[2]));
                }
            }
        }
        slab
    }

    /// Compute the slab for a physical boundary on face `face` of this node
    /// from its own interior: outflow faces clamp to the nearest interior
    /// cell and pass through `enforce_outflow`; z faces under `reflect_on_z`
    /// mirror across the symmetry plane and pass through `reflect_z`.
    ///
    pub(crate) fn mapped_ghost_slab(&self, face: Face) -> Block {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ranges = ghost_ranges(face, gnx, bw);
        let axis = face.axis();
        let a = axis.index();
        let mirrored = ctx.config.reflect_on_z && face == Face::ZL;

        let boundary = if face.is_upper() { gnx - bw } else { bw };

        let grid = self.grid();
        let mut slab = Block::zeros(slab_dim(&ranges), ctx.ns());
        for i in ranges[0].0..ranges[0].1 {
            for j in ranges[1].0..ranges[1].1 {
                for k in ranges[2].0..ranges[2].1 {
                    let dst = [i, j, k];
                    let mut src = dst;
                    src[a] = if mirrored {
                        2 * bw - 1 - dst[a]
                    } else if face.is_upper() {
                        gnx - bw - 1
                    } else {
                        bw
                    };

                    let cell =
                        slab.get_mut(i - ranges[0].0, j - ranges[1].0, k - ranges[2].0);
                    cell.copy_from_slice(grid.u.get(src[0], src[1], src[2]));

                    if mirrored {
                        ctx.science.reflect_z(cell);
                    } else {
                        let mut at = dst;
                        at[a] = boundary;
                        let coords = self.face_center(axis, at[0], at[1], at[2]);
                        ctx.science.enforce_outflow(face, cell, coords);
                    }
                }
            }
        }
        slab
    }

    /// Serve a ghost slab to a finer nephew across face `face` of the fine
    /// node. Each fine destination index resolves to the source cell
    /// `(offset + index) / 2`; a minmod-limited slope on the face-normal
    /// axis splits the coarse value between the two fine cells it covers,
    /// the sign chosen by the parity of `offset + index`.
    ///
    pub(crate) fn interpolated_ghost_slab(&self, face: Face, offset: [i64; 3]) -> Block {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let ranges = ghost_ranges(face, gnx, bw);
        let a = face.axis().index();

        let grid = self.grid();
        let mut slab = Block::zeros(slab_dim(&ranges), ns);
        for i in ranges[0].0..ranges[0].1 {
            for j in ranges[1].0..ranges[1].1 {
                for k in ranges[2].0..ranges[2].1 {
                    let dst = [i, j, k];
                    let mut src = [0; 3];
                    for axis in 0..3 {
                        src[axis] =
                            (offset[axis] + dst[axis] as i64).div_euclid(2) as usize;
                    }
                    let sign = if (offset[a] + dst[a] as i64).rem_euclid(2) == 0 {
                        -0.25
                    } else {
                        0.25
                    };

                    let mut fwd = src;
                    fwd[a] += 1;
                    let mut bck = src;
                    bck[a] -= 1;

                    let u0 = grid.u.get(src[0], src[1], src[2]);
                    let up = grid.u.get(fwd[0], fwd[1], fwd[2]);
                    let um = grid.u.get(bck[0], bck[1], bck[2]);

                    let cell =
                        slab.get_mut(i - ranges[0].0, j - ranges[1].0, k - ranges[2].0);
                    for n in 0..ns {
                        let slope = minmod(up[n] - u0[n], u0[n] - um[n]);
                        cell[n] = u0[n] + sign * slope;
                    }
                }
            }
        }
        slab
    }

    /// Write an inbound slab into the ghost region on `face`.
    ///
    pub(crate) fn integrate_ghost_slab(&self, face: Face, slab: &Block) {
        let gnx = self.context().gnx();
        let bw = self.context().bw();
        let ranges = ghost_ranges(face, gnx, bw);
        assert_eq!(slab.dim(), slab_dim(&ranges), "ghost slab shape mismatch");

        let mut grid = self.grid();
        for i in ranges[0].0..ranges[0].1 {
            for j in ranges[1].0..ranges[1].1 {
                for k in ranges[2].0..ranges[2].1 {
                    grid.u.get_mut(i, j, k).copy_from_slice(slab.get(
                        i - ranges[0].0,
                        j - ranges[1].0,
                        k - ranges[2].0,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::ghost_ranges;
    use crate::face::Face;
    use crate::tree::server::test::{root_init, test_context};
    use crate::tree::server::NodeServer;
    use crate::tree::NodeId;

    fn test_node() -> NodeServer {
        let ctx = test_context(12);
        let node = NodeServer::root(NodeId { rank: 0, index: 0 }, root_init(&ctx), ctx);
        node.fill_interior(|x, u| u[0] = x[0] + 10.0 * x[1] + 100.0 * x[2]);
        node
    }

    #[test]
    fn ghost_ranges_have_the_documented_shape() {
        assert_eq!(ghost_ranges(Face::XL, 12, 2), [(0, 2), (2, 10), (2, 10)]);
        assert_eq!(ghost_ranges(Face::YU, 12, 2), [(2, 10), (10, 12), (2, 10)]);
        assert_eq!(ghost_ranges(Face::ZL, 12, 2), [(2, 10), (2, 10), (0, 2)]);
    }

    #[test]
    fn extracted_slabs_come_from_the_shared_face() {
        let node = test_node();

        // A neighbor below this node on x receives this node's lower
        // interior cells for its upper (XU) ghost region.
        let slab = node.extract_ghost_slab(Face::XU);
        assert_eq!(slab.dim(), [2, 8, 8]);
        assert_eq!(slab.get(0, 0, 0), node.cell(2, 2, 2).as_slice());
        assert_eq!(slab.get(1, 3, 4), node.cell(3, 5, 6).as_slice());

        // And the inverse for a neighbor above.
        let slab = node.extract_ghost_slab(Face::XL);
        assert_eq!(slab.get(0, 0, 0), node.cell(8, 2, 2).as_slice());
        assert_eq!(slab.get(1, 7, 7), node.cell(9, 9, 9).as_slice());
    }

    #[test]
    fn integrate_writes_the_ghost_region() {
        let node = test_node();
        let slab = node.extract_ghost_slab(Face::XL);
        node.integrate_ghost_slab(Face::XL, &slab);
        assert_eq!(node.cell(0, 2, 2), node.cell(8, 2, 2));
        assert_eq!(node.cell(1, 9, 9), node.cell(9, 9, 9));
    }

    #[test]
    fn outflow_faces_clamp_to_the_nearest_interior_cell() {
        let node = test_node();
        let slab = node.mapped_ghost_slab(Face::XU);
        // dst i in {10, 11} both copy interior cell 9.
        assert_eq!(slab.get(0, 0, 0), node.cell(9, 2, 2).as_slice());
        assert_eq!(slab.get(1, 0, 0), node.cell(9, 2, 2).as_slice());
    }

    #[test]
    fn reflected_z_faces_mirror_across_the_symmetry_plane() {
        let node = test_node();
        // reflect_on_z is set in the test config, so ZL mirrors: ghost
        // k = 0 maps to interior k = 3, ghost k = 1 to interior k = 2.
        let slab = node.mapped_ghost_slab(Face::ZL);
        assert_eq!(slab.get(0, 0, 0), node.cell(2, 2, 3).as_slice());
        assert_eq!(slab.get(0, 0, 1), node.cell(2, 2, 2).as_slice());
    }

    #[test]
    fn interpolation_matches_the_slope_formula() {
        let node = test_node();
        let ctx = node.context().clone();
        let (gnx, bw) = (ctx.gnx(), ctx.bw());

        // Serve the XL ghost region of a fine child at octant x = 1; its
        // offset is (gnx - 2 bw) on x, zero elsewhere.
        let interior = (gnx - 2 * bw) as i64;
        let offset = [
            interior + bw as i64,
            bw as i64,
            bw as i64,
        ];
        let slab = node.interpolated_ghost_slab(Face::XL, offset);
        assert_eq!(slab.dim(), [bw, gnx - 2 * bw, gnx - 2 * bw]);

        // Fine ghost (0, 0, 0): source cell (5, 1, 1)... but transverse
        // sources land at (offset + dst) / 2 with dst starting at bw.
        let src = |o: i64, d: usize| ((o + d as i64) / 2) as usize;
        let (si, sj, sk) = (src(offset[0], 0), src(offset[1], bw), src(offset[2], bw));
        let u0 = node.cell(si, sj, sk)[0];
        let up = node.cell(si + 1, sj, sk)[0];
        let um = node.cell(si - 1, sj, sk)[0];
        let slope = crate::science::minmod(up - u0, u0 - um);
        let expected = u0 - 0.25 * slope; // offset[0] + 0 is even
        assert!((slab.get(0, 0, 0)[0] - expected).abs() < 1e-12);

        // The two fine cells covering one coarse cell sum to twice its
        // value, so interpolation is conservative along the normal axis.
        let pair = slab.get(0, 0, 0)[0] + slab.get(1, 0, 0)[0];
        assert!((pair - 2.0 * u0).abs() < 1e-12);
    }
}
