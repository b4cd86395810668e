use crate::block::Block;
use crate::face::{Axis, Face};
use crate::message::FluxPacket;
use crate::octant::Octant;
use crate::tree::server::NodeServer;

/// Map a line index `m` on `axis` plus two transverse indexes to a cell
/// index. The transverse order matches the loop nests below.
///
fn place(axis: Axis, m: usize, b: usize, c: usize) -> [usize; 3] {
    match axis {
        Axis::X => [m, b, c],
        Axis::Y => [b, m, c],
        Axis::Z => [b, c, m],
    }
}

impl NodeServer {
    /// Snapshot the state for the Runge-Kutta blend: `U0 ← U`, `FO0 ← FO`.
    ///
    pub(crate) fn snapshot_state(&self) {
        let mut guard = self.grid();
        let grid = &mut *guard;
        let u = grid.u.clone();
        grid.u0 = u;
        let fo = grid.fo.clone();
        grid.fo0 = fo;
    }

    /// Zero the differential accumulator and the outflow differential.
    ///
    pub(crate) fn prepare_differentials(&self) {
        let mut guard = self.grid();
        let grid = &mut *guard;
        grid.d.clear();
        grid.dfo.iter_mut().for_each(|x| *x = 0.0);
    }

    /// Compute the three axial flux arrays. The kernels are independent and
    /// write disjoint arrays; two run in spawned tasks and one inline.
    ///
    pub(crate) fn compute_fluxes(&self) {
        let mut guard = self.grid();
        let grid = &mut *guard;
        let u = &grid.u;
        let (fx, fy, fz) = (&mut grid.fx, &mut grid.fy, &mut grid.fz);

        rayon::join(
            || self.axis_flux(u, fx, Axis::X),
            || self.axis_flux(u, fy, Axis::Y),
        );
        self.axis_flux(u, fz, Axis::Z);
    }

    /// The flux kernel for one axis: copy each interior line into a scratch
    /// buffer of primitives, reconstruct left and right face states, and
    /// combine their fluxes with the local Rusanov dissipation term.
    ///
    fn axis_flux(&self, u: &Block, flux: &mut Block, axis: Axis) {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let science = &ctx.science;

        let mut q0 = vec![vec![0.0; ns]; gnx];
        let mut ql = vec![vec![0.0; ns]; gnx];
        let mut qr = vec![vec![0.0; ns]; gnx];
        let mut fl = vec![0.0; ns];
        let mut fr = vec![0.0; ns];

        for b in bw..gnx - bw {
            for c in bw..gnx - bw {
                for m in 0..gnx {
                    let [i, j, k] = place(axis, m, b, c);
                    q0[m].copy_from_slice(u.get(i, j, k));
                    science.conserved_to_primitive(&mut q0[m], self.cell_center(i, j, k));
                }

                science.reconstruct(&q0, &mut ql, &mut qr);

                for m in bw..=gnx - bw {
                    let [i, j, k] = place(axis, m, b, c);
                    let coords = self.face_center(axis, i, j, k);

                    science.primitive_to_conserved(&mut ql[m], coords);
                    science.primitive_to_conserved(&mut qr[m], coords);

                    let a = science
                        .max_eigenvalue(axis, &ql[m], coords)
                        .max(science.max_eigenvalue(axis, &qr[m], coords));

                    science.flux(axis, &ql[m], coords, &mut fl);
                    science.flux(axis, &qr[m], coords, &mut fr);

                    let face = flux.get_mut(i, j, k);
                    for n in 0..ns {
                        face[n] = 0.5 * (fl[n] + fr[n] - a * (qr[m][n] - ql[m][n]));
                    }
                }
            }
        }
    }

    /// Average this node's boundary-face fluxes over 2×2 fine-face windows
    /// for the parent's flux reconciliation.
    ///
    pub(crate) fn flux_packet(&self) -> FluxPacket {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let half = ctx.interior() / 2;

        let grid = self.grid();
        let pick = |face: Face| -> &Block {
            match face.axis() {
                Axis::X => &grid.fx,
                Axis::Y => &grid.fy,
                Axis::Z => &grid.fz,
            }
        };

        let faces = Face::ALL.map(|face| {
            let a = face.axis();
            let boundary = if face.is_upper() { gnx - bw } else { bw };
            let mut dim = [half; 3];
            dim[a.index()] = 1;
            let source = pick(face);

            Block::from_fn(dim, ns, |window, out| {
                // The two transverse window indexes, in axis order with the
                // normal axis collapsed.
                for (dj, dk) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                    let mut fine = [0; 3];
                    let mut t = [dj, dk].into_iter();
                    for axis in 0..3 {
                        fine[axis] = if axis == a.index() {
                            boundary
                        } else {
                            bw + 2 * window[axis] + t.next().unwrap()
                        };
                    }
                    for (out, f) in out.iter_mut().zip(source.get(fine[0], fine[1], fine[2]))
                    {
                        *out += 0.25 * f
                    }
                }
            })
        });
        FluxPacket { faces }
    }

    /// Coarse/fine flux reconciliation: overwrite this node's face fluxes
    /// under each child's octant boundary with the averaged fine-side
    /// fluxes, so adjacent un-refined cells see the finer answer.
    ///
    pub(crate) fn adjust_flux(&self, packets: &[(Octant, FluxPacket)]) {
        let ctx = self.context();
        let bw = ctx.bw();
        let half = ctx.interior() / 2;

        let mut guard = self.grid();
        let grid = &mut *guard;
        for (octant, packet) in packets {
            let start = |axis: Axis| bw + octant.bit(axis) as usize * half;
            let r0 = [start(Axis::X), start(Axis::Y), start(Axis::Z)];

            for face in Face::ALL {
                let a = face.axis().index();
                let slab = &packet.faces[face.index()];
                let target = match face.axis() {
                    Axis::X => &mut grid.fx,
                    Axis::Y => &mut grid.fy,
                    Axis::Z => &mut grid.fz,
                };
                let dim = slab.dim();
                for wi in 0..dim[0] {
                    for wj in 0..dim[1] {
                        for wk in 0..dim[2] {
                            let window = [wi, wj, wk];
                            let mut cell = [0; 3];
                            for axis in 0..3 {
                                cell[axis] = if axis == a {
                                    r0[axis] + if face.is_upper() { half } else { 0 }
                                } else {
                                    r0[axis] + window[axis]
                                };
                            }
                            target
                                .get_mut(cell[0], cell[1], cell[2])
                                .copy_from_slice(slab.get(wi, wj, wk));
                        }
                    }
                }
            }
        }
    }

    /// Accumulate flux divergences into the differential, and the boundary
    /// outflow differential on the root.
    ///
    pub(crate) fn sum_differentials(&self) {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let dxinv = 1.0 / self.dx();

        let mut guard = self.grid();
        let grid = &mut *guard;
        let (u_d, fx, fy, fz) = (&mut grid.d, &grid.fx, &grid.fy, &grid.fz);

        for i in bw..gnx - bw {
            for j in bw..gnx - bw {
                for k in bw..gnx - bw {
                    let d = u_d.get_mut(i, j, k);
                    for n in 0..ns {
                        d[n] -= (fx.get(i + 1, j, k)[n] - fx.get(i, j, k)[n]) * dxinv;
                        d[n] -= (fy.get(i, j + 1, k)[n] - fy.get(i, j, k)[n]) * dxinv;
                        d[n] -= (fz.get(i, j, k + 1)[n] - fz.get(i, j, k)[n]) * dxinv;
                    }
                }
            }
        }

        // Boundary outflow is tracked on the root only.
        if self.level() == 0 {
            let da = self.dx() * self.dx();
            let dfo = &mut grid.dfo;
            for a in bw..gnx - bw {
                for b in bw..gnx - bw {
                    for n in 0..ns {
                        dfo[n] += (fx.get(gnx - bw, a, b)[n] - fx.get(bw, a, b)[n]) * da;
                        dfo[n] += (fy.get(a, gnx - bw, b)[n] - fy.get(a, bw, b)[n]) * da;
                        dfo[n] += if ctx.config.reflect_on_z {
                            fz.get(a, b, gnx - bw)[n] * da
                        } else {
                            (fz.get(a, b, gnx - bw)[n] - fz.get(a, b, bw)[n]) * da
                        };
                    }
                }
            }
        }
    }

    /// Add the source term, apply one Runge-Kutta stage blend, and clamp the
    /// result into its admissible region.
    ///
    pub(crate) fn add_differentials(&self, dt: f64, beta: f64) {
        let ctx = self.context();
        let gnx = ctx.gnx();
        let bw = ctx.bw();
        let ns = ctx.ns();
        let science = &ctx.science;

        let mut guard = self.grid();
        let grid = &mut *guard;
        let mut src = vec![0.0; ns];

        for i in bw..gnx - bw {
            for j in bw..gnx - bw {
                for k in bw..gnx - bw {
                    let coords = self.cell_center(i, j, k);

                    science.source(grid.u.get(i, j, k), coords, &mut src);
                    let d = grid.d.get_mut(i, j, k);
                    for n in 0..ns {
                        d[n] += src[n]
                    }

                    let d = grid.d.get(i, j, k).to_vec();
                    let u0 = grid.u0.get(i, j, k).to_vec();
                    let u = grid.u.get_mut(i, j, k);
                    for n in 0..ns {
                        u[n] = (u[n] + d[n] * dt) * beta + u0[n] * (1.0 - beta);
                    }
                    science.enforce_limits(u, coords);
                }
            }
        }

        for n in 0..ns {
            grid.fo[n] = (grid.fo[n] + grid.dfo[n] * dt) * beta + grid.fo0[n] * (1.0 - beta);
        }
    }

    /// Advance the clock once per step, after all stages complete and the
    /// final ghost exchange has occurred.
    ///
    pub(crate) fn advance_clock(&self, dt: f64) {
        let mut guard = self.grid();
        let grid = &mut *guard;
        grid.step += 1;
        grid.time += dt;
    }
}

#[cfg(test)]
mod test {
    use crate::face::Axis;
    use crate::science::{Coords, Science};
    use crate::tree::server::test::{root_init, test_context, test_context_with};
    use crate::tree::server::NodeServer;
    use crate::tree::NodeId;
    use std::sync::Arc;

    /// Fluxless physics with the source `λ·u`, for exercising the stage
    /// blend on the model problem `du/dt = λu`.
    struct LinearSource {
        lambda: f64,
    }

    impl Science for LinearSource {
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
        fn flux(&self, _: Axis, _: &[f64], _: Coords, out: &mut [f64]) {
            out[0] = 0.0
        }
        fn max_eigenvalue(&self, _: Axis, _: &[f64], _: Coords) -> f64 {
            0.0
        }
        fn source(&self, u: &[f64], _: Coords, out: &mut [f64]) {
            out[0] = self.lambda * u[0]
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

    fn source_node(lambda: f64) -> NodeServer {
        let ctx = test_context_with(12, Arc::new(LinearSource { lambda }));
        let node = NodeServer::root(NodeId { rank: 0, index: 0 }, root_init(&ctx), ctx.clone());
        ctx.science.initialize(&node);
        node
    }

    #[test]
    fn uniform_advection_has_uniform_fluxes() {
        let ctx = test_context(12);
        let node = NodeServer::root(NodeId { rank: 0, index: 0 }, root_init(&ctx), ctx);
        node.fill_interior(|_, u| u[0] = 3.0);

        // Fill ghosts so the stencil sees a uniform field everywhere.
        {
            let mut guard = node.grid();
            let grid = &mut *guard;
            for i in 0..12 {
                for j in 0..12 {
                    for k in 0..12 {
                        grid.u.get_mut(i, j, k)[0] = 3.0;
                    }
                }
            }
        }
        node.compute_fluxes();

        // Advection velocity is (1, 0, 0): x faces carry v·u, y and z zero.
        let grid = node.grid();
        for m in 2..=10 {
            assert!((grid.fx.get(m, 5, 5)[0] - 3.0).abs() < 1e-12);
            assert!(grid.fy.get(5, m, 5)[0].abs() < 1e-12);
            assert!(grid.fz.get(5, 5, m)[0].abs() < 1e-12);
        }
    }

    #[test]
    fn flux_divergence_of_uniform_fluxes_is_zero() {
        let ctx = test_context(12);
        let node = NodeServer::root(NodeId { rank: 0, index: 0 }, root_init(&ctx), ctx);
        {
            let mut guard = node.grid();
            let grid = &mut *guard;
            for i in 0..12 {
                for j in 0..12 {
                    for k in 0..12 {
                        grid.fx.get_mut(i, j, k)[0] = 2.0;
                        grid.fy.get_mut(i, j, k)[0] = -1.0;
                        grid.fz.get_mut(i, j, k)[0] = 0.5;
                    }
                }
            }
        }
        node.prepare_differentials();
        node.sum_differentials();
        let grid = node.grid();
        for m in 2..10 {
            assert!(grid.d.get(m, m, m)[0].abs() < 1e-12);
        }
    }

    /// For `du/dt = λu`, the three-stage schedule β = 1, 1/4, 2/3 must
    /// reproduce the classic third-order stencil
    /// `u' = (1 + z + z²/2 + z³/6)·u` with `z = λ·dt`.
    #[test]
    fn rk3_weights_match_the_tvd_stencil() {
        let lambda = 0.7;
        let dt = 0.3;
        let node = source_node(lambda);

        node.snapshot_state();
        for beta in [1.0, 0.25, 2.0 / 3.0] {
            node.prepare_differentials();
            node.add_differentials(dt, beta);
        }

        let z: f64 = lambda * dt;
        let expected = 1.0 + z + z * z / 2.0 + z * z * z / 6.0;
        let got = node.cell(5, 5, 5)[0];
        assert!(
            (got - expected).abs() < 1e-12,
            "got {} expected {}",
            got,
            expected
        );
    }

    #[test]
    fn rk2_weights_match_heun() {
        let lambda = -0.5;
        let dt = 0.25;
        let node = source_node(lambda);

        node.snapshot_state();
        for beta in [1.0, 0.5] {
            node.prepare_differentials();
            node.add_differentials(dt, beta);
        }

        let z: f64 = lambda * dt;
        let expected = 1.0 + z + z * z / 2.0;
        let got = node.cell(4, 6, 8)[0];
        assert!((got - expected).abs() < 1e-12);
    }
}
