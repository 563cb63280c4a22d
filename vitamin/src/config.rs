use crate::error::config_error;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(self, device_no: usize) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Cpu => candle_core::Device::Cpu,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
            ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
        })
    }
}

/// Layer sizes of the three sub-networks
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// output channels of each convolutional layer
    #[serde(default = "default_conv_filters")]
    pub conv_filters: Vec<usize>,
    #[serde(default = "default_conv_kernels")]
    pub conv_kernels: Vec<usize>,
    #[serde(default = "default_conv_strides")]
    pub conv_strides: Vec<usize>,
    /// widths of the dense layers after the convolutions
    #[serde(default = "default_dense")]
    pub dense: Vec<usize>,
    #[serde(default)]
    pub dropout: f32,
}

fn default_conv_filters() -> Vec<usize> {
    vec![32, 32, 16]
}

fn default_conv_kernels() -> Vec<usize> {
    vec![16, 8, 8]
}

fn default_conv_strides() -> Vec<usize> {
    vec![2, 2, 1]
}

fn default_dense() -> Vec<usize> {
    vec![256, 128]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            conv_filters: default_conv_filters(),
            conv_kernels: default_conv_kernels(),
            conv_strides: default_conv_strides(),
            dense: default_dense(),
            dropout: 0.,
        }
    }
}

/// Which on-the-fly randomizations the training loader applies
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AugmentConfig {
    #[serde(default = "default_true")]
    pub distance: bool,
    #[serde(default = "default_true")]
    pub phase: bool,
    #[serde(default = "default_true")]
    pub time: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            distance: true,
            phase: true,
            time: true,
        }
    }
}

/// Run parameters, read once from JSON and never mutated
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub run_label: String,

    /// inferred parameters, in model order
    pub inf_pars: Vec<String>,
    #[serde(default)]
    pub gauss_pars: Vec<String>,
    #[serde(default)]
    pub vonmise_pars: Vec<String>,
    #[serde(default)]
    pub sky_pars: Vec<String>,
    #[serde(default = "default_periodic_pars")]
    pub periodic_pars: Vec<String>,

    /// time samples per detector (T)
    pub ndata: usize,
    /// detector channels (D)
    pub n_detectors: usize,
    /// seconds of data per waveform
    #[serde(default = "default_duration")]
    pub duration: f64,

    pub z_dimension: usize,
    pub n_modes: usize,

    pub batch_size: usize,
    pub num_iterations: usize,
    pub learning_rate: f32,

    pub ramp_start: usize,
    /// ramp length in epochs
    pub ramp_end: usize,
    #[serde(default = "default_one")]
    pub ramp_cycles: usize,

    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,

    pub y_normscale: f32,
    #[serde(default = "default_noise_amp")]
    pub noise_amp: f32,
    #[serde(default = "default_chunk_reload_interval")]
    pub chunk_reload_interval: usize,

    #[serde(default)]
    pub resume_training: bool,
    #[serde(default = "default_one")]
    pub n_kl_samples: usize,

    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub augment: AugmentConfig,

    #[serde(default)]
    pub device: ComputeDevice,
    #[serde(default)]
    pub device_no: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_periodic_pars() -> Vec<String> {
    ["ra", "phase", "psi", "phi_12", "phi_jl"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_duration() -> f64 {
    1.0
}

fn default_one() -> usize {
    1
}

fn default_save_interval() -> usize {
    1000
}

fn default_n_samples() -> usize {
    1000
}

fn default_noise_amp() -> f32 {
    1.0
}

fn default_chunk_reload_interval() -> usize {
    10
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("run parameters: {}", e)))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn num_params(&self) -> usize {
        self.inf_pars.len()
    }

    /// Reject inconsistent settings before any network is built
    pub fn validate(&self, bounds: &Bounds) -> anyhow::Result<()> {
        if self.inf_pars.is_empty() {
            return Err(config_error("no inferred parameters"));
        }

        let net = &self.network;
        if net.conv_filters.len() != net.conv_kernels.len()
            || net.conv_filters.len() != net.conv_strides.len()
        {
            return Err(config_error(format!(
                "conv layers: {} filters, {} kernels, {} strides",
                net.conv_filters.len(),
                net.conv_kernels.len(),
                net.conv_strides.len()
            )));
        }

        if net.conv_kernels.iter().chain(net.conv_strides.iter()).any(|&k| k == 0) {
            return Err(config_error("conv kernels and strides must be positive"));
        }

        if !(0. ..1.).contains(&net.dropout) {
            return Err(config_error(format!("dropout {} not in [0, 1)", net.dropout)));
        }

        let positive = [
            ("batch_size", self.batch_size),
            ("ndata", self.ndata),
            ("n_detectors", self.n_detectors),
            ("z_dimension", self.z_dimension),
            ("n_modes", self.n_modes),
            ("ramp_end", self.ramp_end),
            ("ramp_cycles", self.ramp_cycles),
            ("save_interval", self.save_interval),
            ("chunk_reload_interval", self.chunk_reload_interval),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(config_error(format!("{} must be positive", name)));
            }
        }

        if !(self.y_normscale > 0.) {
            return Err(config_error("y_normscale must be positive"));
        }

        if !(self.duration > 0.) {
            return Err(config_error("duration must be positive"));
        }

        for name in self.inf_pars.iter() {
            bounds.get(name)?;
        }

        Ok(())
    }
}

/// Physical range of one parameter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
}

impl ParamRange {
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// `<name>_min` / `<name>_max` table
#[derive(Clone, Debug, Default)]
pub struct Bounds {
    table: HashMap<String, f64>,
}

impl Bounds {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let table: HashMap<String, f64> = serde_json::from_str(json)
            .map_err(|e| config_error(format!("bounds table: {}", e)))?;
        Ok(Self { table })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path.as_ref())?)
    }

    pub fn from_ranges<'a, I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64, f64)>,
    {
        let mut table = HashMap::new();
        for (name, lb, ub) in ranges {
            table.insert(format!("{}_min", name), lb);
            table.insert(format!("{}_max", name), ub);
        }
        Self { table }
    }

    pub fn get(&self, name: &str) -> anyhow::Result<ParamRange> {
        let lookup = |key: String| {
            self.table
                .get(&key)
                .copied()
                .ok_or_else(|| config_error(format!("bounds table is missing {}", key)))
        };
        let range = ParamRange {
            min: lookup(format!("{}_min", name))?,
            max: lookup(format!("{}_max", name))?,
        };
        if !(range.max > range.min) {
            return Err(config_error(format!(
                "empty range for {}: [{}, {}]",
                name, range.min, range.max
            )));
        }
        Ok(range)
    }
}

/// Values of parameters that are held fixed (not inferred)
#[derive(Clone, Debug, Default)]
pub struct FixedValues {
    table: HashMap<String, f64>,
}

impl FixedValues {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let table: HashMap<String, f64> = serde_json::from_str(json)
            .map_err(|e| config_error(format!("fixed-value table: {}", e)))?;
        Ok(Self { table })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path.as_ref())?)
    }

    pub fn get(&self, name: &str) -> anyhow::Result<f64> {
        self.table
            .get(name)
            .copied()
            .ok_or_else(|| config_error(format!("no fixed value for {}", name)))
    }
}

/// Read-only tables shared by everything that converts units
#[derive(Clone, Debug, Default)]
pub struct RunTables {
    pub bounds: Bounds,
    pub fixed: FixedValues,
}

impl RunTables {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(bounds_file: P, fixed_file: Q) -> anyhow::Result<Self> {
        Ok(Self {
            bounds: Bounds::from_json_file(bounds_file)?,
            fixed: FixedValues::from_json_file(fixed_file)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CvaeError;

    const RUN_JSON: &str = r#"{
        "run_label": "unit",
        "inf_pars": ["mass_1", "phase"],
        "gauss_pars": ["mass_1"],
        "vonmise_pars": ["phase"],
        "ndata": 64,
        "n_detectors": 2,
        "z_dimension": 4,
        "n_modes": 2,
        "batch_size": 8,
        "num_iterations": 3,
        "learning_rate": 1e-4,
        "ramp_start": 1,
        "ramp_end": 2,
        "y_normscale": 16.0,
        "network": {"dense": [32]}
    }"#;

    fn bounds() -> Bounds {
        Bounds::from_json_str(r#"{"mass_1_min": 35.0, "mass_1_max": 80.0, "phase_min": 0.0, "phase_max": 6.283185307179586}"#)
            .expect("bounds")
    }

    #[test]
    fn defaults_fill_in() -> anyhow::Result<()> {
        let config = RunConfig::from_json_str(RUN_JSON)?;
        assert_eq!(config.ramp_cycles, 1);
        assert_eq!(config.n_kl_samples, 1);
        assert_eq!(config.chunk_reload_interval, 10);
        assert_eq!(config.device, ComputeDevice::Cpu);
        assert_eq!(config.network.conv_filters.len(), 3);
        assert_eq!(config.network.dense, vec![32]);
        assert!(config.periodic_pars.contains(&"phase".to_string()));
        config.validate(&bounds())
    }

    #[test]
    fn unknown_key_is_rejected() {
        let json = RUN_JSON.replacen("\"ndata\"", "\"n_data\"", 1);
        let err = RunConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(err.downcast_ref::<CvaeError>(), Some(CvaeError::Config(_))));
    }

    #[test]
    fn missing_bounds_are_rejected() -> anyhow::Result<()> {
        let config = RunConfig::from_json_str(RUN_JSON)?;
        let partial = Bounds::from_ranges([("mass_1", 35.0, 80.0)]);
        let err = config.validate(&partial).unwrap_err();
        assert!(err.to_string().contains("phase_min"));
        Ok(())
    }

    #[test]
    fn mismatched_conv_layers_are_rejected() -> anyhow::Result<()> {
        let mut config = RunConfig::from_json_str(RUN_JSON)?;
        config.network.conv_strides.pop();
        assert!(config.validate(&bounds()).is_err());
        Ok(())
    }
}
