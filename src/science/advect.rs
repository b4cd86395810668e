use crate::face::Axis;
use crate::octant::Octant;
use crate::science::{Coords, Minmod, Science};
use crate::tree::NodeServer;

/// Scalar linear advection with a fixed velocity field: the simplest physics
/// that exercises every part of the pipeline. Primitive and conserved
/// variables coincide, the flux is `v·u`, and the wave speed is `|v|`.
///
pub struct LinearAdvection {
    velocity: [f64; 3],
    reconstruction: Minmod,
    refine_threshold: f64,
    cfl: f64,
}

impl LinearAdvection {
    pub fn new(velocity: [f64; 3]) -> Self {
        Self {
            velocity,
            reconstruction: Minmod::default(),
            refine_threshold: 0.5,
            cfl: 0.4,
        }
    }

    pub fn with_refine_threshold(mut self, threshold: f64) -> Self {
        self.refine_threshold = threshold;
        self
    }

    fn max_speed(&self) -> f64 {
        self.velocity.iter().fold(0.0, |a: f64, v| a.max(v.abs()))
    }
}

impl Science for LinearAdvection {
    fn state_size(&self) -> usize {
        1
    }

    fn ghost_zone_width(&self) -> usize {
        2
    }

    fn reconstruct(&self, q0: &[Vec<f64>], ql: &mut [Vec<f64>], qr: &mut [Vec<f64>]) {
        self.reconstruction.reconstruct(q0, ql, qr)
    }

    fn conserved_to_primitive(&self, _u: &mut [f64], _coords: Coords) {}

    fn primitive_to_conserved(&self, _u: &mut [f64], _coords: Coords) {}

    fn flux(&self, axis: Axis, u: &[f64], _coords: Coords, out: &mut [f64]) {
        out[0] = self.velocity[axis.index()] * u[0]
    }

    fn max_eigenvalue(&self, axis: Axis, _u: &[f64], _coords: Coords) -> f64 {
        self.velocity[axis.index()].abs()
    }

    fn source(&self, _u: &[f64], _coords: Coords, out: &mut [f64]) {
        out[0] = 0.0
    }

    fn refine(&self, node: &NodeServer, octant: Octant) -> bool {
        let mut peak: f64 = 0.0;
        node.for_each_octant_cell(octant, |_, u| peak = peak.max(u[0].abs()));
        peak > self.refine_threshold
    }

    fn initialize(&self, node: &NodeServer) {
        let width = node.domain() * 0.25;
        node.fill_interior(|x, u| {
            let r2 = x.iter().map(|x| x * x).sum::<f64>();
            u[0] = (-r2 / (width * width)).exp();
        });
    }

    fn initial_dt(&self, node: &NodeServer) -> f64 {
        self.cfl * node.dx() / self.max_speed()
    }

    fn predict_dt(&self, node: &NodeServer, _dt: f64, _until: f64) -> (f64, f64) {
        let dt = self.cfl * node.dx() / self.max_speed();
        (dt, dt)
    }
}
