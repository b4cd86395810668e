//! The application-physics seam. The engine never interprets state vectors
//! itself; everything problem-specific is reached through the [`Science`]
//! trait: variable mappings, fluxes, wave speeds, sources, limits, boundary
//! data, the refinement predicate, and timestep control.

mod advect;
mod minmod;

pub use advect::LinearAdvection;
pub use minmod::{minmod, minmod_slice, Minmod};

use crate::config::Config;
use crate::face::{Axis, Face};
use crate::octant::Octant;
use crate::tree::NodeServer;

/// Cell-center or face coordinates of a state vector.
pub type Coords = [f64; 3];

pub trait Science: Send + Sync {
    /// Number of conserved quantities per cell.
    fn state_size(&self) -> usize;

    /// Ghost-zone width in cells per face. Must leave at least one cell of
    /// margin for the reconstruction stencil.
    fn ghost_zone_width(&self) -> usize;

    /// Cell size of the root node.
    ///
    fn initial_spacestep(&self, config: &Config) -> f64 {
        let interior = config.grid_node_length - 2 * self.ghost_zone_width();
        2.0 * config.spatial_domain / interior as f64
    }

    /// Produce left and right face states from a line of cell-center
    /// primitives. `ql[i]` and `qr[i]` describe the face between cells
    /// `i - 1` and `i`.
    fn reconstruct(&self, q0: &[Vec<f64>], ql: &mut [Vec<f64>], qr: &mut [Vec<f64>]);

    fn conserved_to_primitive(&self, u: &mut [f64], coords: Coords);

    fn primitive_to_conserved(&self, u: &mut [f64], coords: Coords);

    /// The flux of every conserved quantity through a face normal to `axis`.
    fn flux(&self, axis: Axis, u: &[f64], coords: Coords, out: &mut [f64]);

    /// The largest characteristic speed along `axis`.
    fn max_eigenvalue(&self, axis: Axis, u: &[f64], coords: Coords) -> f64;

    fn source(&self, u: &[f64], coords: Coords, out: &mut [f64]);

    /// Clamp a freshly updated state into its admissible region.
    fn enforce_limits(&self, _u: &mut [f64], _coords: Coords) {}

    /// Map a state through the z symmetry plane.
    fn reflect_z(&self, _u: &mut [f64]) {}

    /// Adjust an outflow-boundary ghost state.
    fn enforce_outflow(&self, _face: Face, _u: &mut [f64], _coords: Coords) {}

    /// Decide whether the given absent child of a node should be created in
    /// the next refinement pass.
    fn refine(&self, _node: &NodeServer, _octant: Octant) -> bool {
        false
    }

    /// Write the initial condition into a node's cells.
    fn initialize(&self, node: &NodeServer);

    /// Emit one node's worth of output for the current epoch.
    fn output(&self, _node: &NodeServer) {}

    /// The first timestep size admissible on a leaf.
    fn initial_dt(&self, node: &NodeServer) -> f64;

    /// Predict the next and the following timestep size on a leaf.
    fn predict_dt(&self, node: &NodeServer, dt: f64, until: f64) -> (f64, f64);
}
