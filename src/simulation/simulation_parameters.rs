use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    error::{read_file, ConfigError},
    floating_type_mod::FT,
    vec3f, V3,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    // kernel radius, also the cell size of the neighbor grid
    pub kernel_h: FT,
    pub solver_iterations: usize,

    // only used by drivers that step with a fixed time step
    pub dt: FT,

    pub rest_density: FT,

    // constraint force mixing, relaxes the multiplier for particles with few neighbors.
    // Comparable to the gradient sum of a handful of neighbors at the default kernel size.
    pub cfm_epsilon: FT,

    // artificial pressure against particle clustering
    pub tensile_k: FT,
    pub tensile_n: i32,
    pub tensile_delta_q: FT,

    pub viscosity_c: FT,
    pub vorticity_epsilon: FT,

    pub gravity: V3,
    pub gravity_enabled: bool,

    // opt-in: use max(C, 0) so the constraint only pushes particles apart
    pub clamp_density_constraint: bool,

    pub check_neighborhood: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        let kernel_h = 0.25;
        SimulationParams {
            kernel_h,
            solver_iterations: 5,
            dt: 0.016,
            rest_density: 200.,
            cfm_epsilon: 100.,
            tensile_k: 0.001,
            tensile_n: 4,
            tensile_delta_q: 0.2 * kernel_h,
            viscosity_c: 0.01,
            vorticity_epsilon: 0.0006,
            gravity: vec3f(0., -9.8, 0.),
            gravity_enabled: true,
            clamp_density_constraint: false,
            check_neighborhood: false,
        }
    }
}

impl SimulationParams {
    pub fn gravity_vector(&self) -> V3 {
        if self.gravity_enabled {
            self.gravity
        } else {
            V3::zeros()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &'static str, value: FT) -> Result<(), ConfigError> {
            if value > 0. && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be positive and finite, got {}", value),
                })
            }
        }

        fn non_negative(name: &'static str, value: FT) -> Result<(), ConfigError> {
            if value >= 0. && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be non-negative and finite, got {}", value),
                })
            }
        }

        positive("kernel_h", self.kernel_h)?;
        positive("dt", self.dt)?;
        positive("rest_density", self.rest_density)?;
        positive("cfm_epsilon", self.cfm_epsilon)?;
        non_negative("tensile_k", self.tensile_k)?;
        non_negative("viscosity_c", self.viscosity_c)?;
        non_negative("vorticity_epsilon", self.vorticity_epsilon)?;

        if self.solver_iterations == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "solver_iterations",
                reason: "at least one iteration is required".to_string(),
            });
        }

        if !(self.tensile_delta_q > 0. && self.tensile_delta_q < self.kernel_h) {
            return Err(ConfigError::InvalidParameter {
                name: "tensile_delta_q",
                reason: format!(
                    "must lie strictly between 0 and kernel_h={}, got {}",
                    self.kernel_h, self.tensile_delta_q
                ),
            });
        }

        if self.tensile_n < 1 {
            return Err(ConfigError::InvalidParameter {
                name: "tensile_n",
                reason: format!("must be at least 1, got {}", self.tensile_n),
            });
        }

        if !self.gravity.iter().all(|x| x.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "gravity",
                reason: format!("must be finite, got {:?}", self.gravity),
            });
        }

        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let params: SimulationParams = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            origin: "simulation parameters".to_string(),
            source,
        })?;
        params.validate()?;
        Ok(params)
    }

    /**
     * Reads the parameter file and, if given, replaces single keys with the values from `overwrite_path`.
     * Keys missing from both files keep their default value.
     */
    pub fn load_yaml(path: &Path, overwrite_path: Option<&Path>) -> Result<Self, ConfigError> {
        let params_yaml = read_file(path)?;
        let mut simulation_params_serde: serde_yaml::Value =
            serde_yaml::from_str(&params_yaml).map_err(|source| ConfigError::Parse {
                origin: path.display().to_string(),
                source,
            })?;

        if let Some(overwrite_path) = overwrite_path {
            let overwrite_config_str = read_file(overwrite_path)?;
            let overwrite_config: serde_yaml::Value =
                serde_yaml::from_str(&overwrite_config_str).map_err(|source| ConfigError::Parse {
                    origin: overwrite_path.display().to_string(),
                    source,
                })?;
            merge_overwrite(&mut simulation_params_serde, overwrite_config)?;
        }

        let simulation_params: SimulationParams =
            serde_yaml::from_value(simulation_params_serde).map_err(|source| ConfigError::Parse {
                origin: path.display().to_string(),
                source,
            })?;
        simulation_params.validate()?;
        Ok(simulation_params)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            origin: "simulation parameters".to_string(),
            source,
        })
    }
}

/// Copies every key of the `overwrite` mapping into `base`. Keys that are not parameter names are rejected.
pub fn merge_overwrite(base: &mut serde_yaml::Value, overwrite: serde_yaml::Value) -> Result<(), ConfigError> {
    let known = serde_yaml::to_value(SimulationParams::default()).map_err(|source| ConfigError::Parse {
        origin: "default simulation parameters".to_string(),
        source,
    })?;

    let overwrite = match overwrite {
        serde_yaml::Value::Mapping(mapping) => mapping,
        serde_yaml::Value::Null => return Ok(()),
        _ => return Err(ConfigError::UnknownKey("<overwrite file is not a mapping>".to_string())),
    };

    if base.is_null() {
        *base = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    let mapping = base
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::UnknownKey("<parameter file is not a mapping>".to_string()))?;

    for (k, v) in overwrite.into_iter() {
        let is_known = known.as_mapping().map_or(false, |m| m.contains_key(&k));
        if !is_known {
            let name = k.as_str().map(String::from).unwrap_or_else(|| format!("{:?}", k));
            return Err(ConfigError::UnknownKey(name));
        }
        mapping.insert(k, v);
    }

    Ok(())
}
