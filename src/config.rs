use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Runtime configuration of the mesh engine. Fields default to the values of
/// the stock torus problem, so a configuration file only needs to name the
/// options it overrides.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum tree depth, inclusive of the root.
    pub levels_of_refinement: u64,

    /// Runge-Kutta order of the sub-step pipeline; 1, 2 or 3.
    pub runge_kutta_order: usize,

    /// Treat the lower z face of the domain as a symmetry plane.
    pub reflect_on_z: bool,

    /// Half-extent of the root cube; the domain spans `[-d, d]` on each axis
    /// (`[0, 2d]` on z when `reflect_on_z` is set).
    pub spatial_domain: f64,

    /// Per-node cube side length in cells, including ghost zones.
    pub grid_node_length: usize,

    /// Stop time in orbital units.
    pub temporal_domain: f64,

    /// Number of steps between timestep-size predictions.
    pub temporal_prediction_gap: u64,

    /// Simulation-time interval between output epochs.
    pub output_frequency: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            levels_of_refinement: 1,
            runge_kutta_order: 1,
            reflect_on_z: true,
            spatial_domain: 1.5e-4,
            grid_node_length: 12,
            temporal_domain: 1.0e-6,
            temporal_prediction_gap: 10,
            output_frequency: 1.0e-7,
        }
    }
}

impl Config {
    /// Load a configuration from a RON file.
    ///
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::BadConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let config: Config =
            ron::de::from_str(text).map_err(|e| Error::BadConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option values that have no sensible interpretation. The ghost
    /// width is supplied by the science and cross-checked by the engine.
    ///
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.runge_kutta_order) {
            return Err(Error::BadConfig(format!(
                "runge_kutta_order ({}) is unsupported",
                self.runge_kutta_order
            )));
        }
        if self.levels_of_refinement == 0 {
            return Err(Error::BadConfig(
                "levels_of_refinement must include the root".into(),
            ));
        }
        if self.grid_node_length % 2 != 0 {
            return Err(Error::BadConfig(format!(
                "grid_node_length ({}) must be even",
                self.grid_node_length
            )));
        }
        if self.spatial_domain <= 0.0 || self.temporal_domain <= 0.0 {
            return Err(Error::BadConfig(
                "spatial_domain and temporal_domain must be positive".into(),
            ));
        }
        if self.temporal_prediction_gap == 0 {
            return Err(Error::BadConfig(
                "temporal_prediction_gap must be at least one step".into(),
            ));
        }
        Ok(())
    }

    /// The β schedule of the configured Runge-Kutta order.
    ///
    pub fn beta_schedule(&self) -> &'static [f64] {
        match self.runge_kutta_order {
            1 => &[1.0],
            2 => &[1.0, 0.5],
            3 => &[1.0, 0.25, 2.0 / 3.0],
            n => panic!("runge-kutta order ({}) is unsupported or invalid", n),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[octomesh]")?;
        writeln!(f, "levels_of_refinement     = {}", self.levels_of_refinement)?;
        writeln!(f, "runge_kutta_order        = {}", self.runge_kutta_order)?;
        writeln!(f, "reflect_on_z             = {}", self.reflect_on_z)?;
        writeln!(f, "spatial_domain           = {:e}", self.spatial_domain)?;
        writeln!(f, "grid_node_length         = {}", self.grid_node_length)?;
        writeln!(f, "temporal_domain          = {:e}", self.temporal_domain)?;
        writeln!(f, "temporal_prediction_gap  = {}", self.temporal_prediction_gap)?;
        write!(f, "output_frequency         = {:e}", self.output_frequency)
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn ron_overrides_named_options() {
        let config = Config::from_str(
            "(grid_node_length: 16, runge_kutta_order: 3, reflect_on_z: false)",
        )
        .unwrap();
        assert_eq!(config.grid_node_length, 16);
        assert_eq!(config.runge_kutta_order, 3);
        assert_eq!(config.levels_of_refinement, 1);
        assert_eq!(config.beta_schedule(), &[1.0, 0.25, 2.0 / 3.0]);
    }

    #[test]
    fn bad_options_are_rejected() {
        assert!(Config::from_str("(runge_kutta_order: 4)").is_err());
        assert!(Config::from_str("(grid_node_length: 13)").is_err());
        assert!(Config::from_str("(no_such_option: 1)").is_err());
    }
}
