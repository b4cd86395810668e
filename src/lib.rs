//! A distributed adaptive-mesh-refinement octree engine for finite-volume
//! simulations on a 3D Cartesian grid. The tree holds cubic sub-grids that
//! advance a user-defined conserved state with a TVD Runge-Kutta pipeline,
//! exchanging ghost zones, interpolating across coarse/fine interfaces, and
//! injecting fine state back into parents through message-passing stages.

pub mod block;
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod exec;
pub mod face;
pub mod message;
pub mod octant;
pub mod pool;
pub mod science;
pub mod tree;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
