use crate::config::{Bounds, FixedValues, ParamRange};
use crate::error::shape_error;
use crate::param_registry::{ParamRegistry, PSI};

use ndarray::{Array2, Axis};
use std::f64::consts::{PI, TAU};

/// Convert between physical units and the unit interval the model
/// works in. Periodic parameters wrap into [0, 1).
#[derive(Clone, Debug)]
pub struct ParamScaler {
    names: Vec<String>,
    ranges: Vec<ParamRange>,
    periodic: Vec<bool>,
}

impl ParamScaler {
    pub fn new(registry: &ParamRegistry, bounds: &Bounds) -> anyhow::Result<Self> {
        let ranges = registry
            .names()
            .iter()
            .map(|p| bounds.get(p))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            names: registry.names().to_vec(),
            ranges,
            periodic: registry.periodic().mask.clone(),
        })
    }

    pub fn ranges(&self) -> &[ParamRange] {
        &self.ranges
    }

    fn check_columns(&self, x: &Array2<f32>) -> anyhow::Result<()> {
        if x.ncols() != self.ranges.len() {
            return Err(shape_error(format!(
                "{} columns vs. {} inferred parameters",
                x.ncols(),
                self.ranges.len()
            )));
        }
        Ok(())
    }

    /// Physical (n x p) to normalized (n x p); `psi` is reduced
    /// modulo π first
    pub fn normalize(&self, x_phys: &Array2<f32>) -> anyhow::Result<Array2<f32>> {
        self.check_columns(x_phys)?;
        let mut out = x_phys.clone();

        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let range = self.ranges[j];
            let is_psi = self.names[j] == PSI;
            let periodic = self.periodic[j];
            col.mapv_inplace(|v| {
                let mut v = v as f64;
                if is_psi {
                    v = v.rem_euclid(PI);
                }
                let mut u = (v - range.min) / range.width();
                if periodic {
                    u = u.rem_euclid(1.0);
                }
                u as f32
            });
        }
        Ok(out)
    }

    /// Normalized (n x p) back to physical units
    pub fn denormalize(&self, x_norm: &Array2<f32>) -> anyhow::Result<Array2<f32>> {
        self.check_columns(x_norm)?;
        let mut out = x_norm.clone();

        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let range = self.ranges[j];
            let periodic = self.periodic[j];
            col.mapv_inplace(|u| {
                let mut u = u as f64;
                if periodic {
                    u = u.rem_euclid(1.0);
                }
                (range.min + u * range.width()) as f32
            });
        }
        Ok(out)
    }

    /// Expand physical samples (n x p) to the columns of `all_names`,
    /// taking parameters that are not inferred from the fixed table
    pub fn fill_fixed(
        &self,
        samples: &Array2<f32>,
        all_names: &[String],
        fixed: &FixedValues,
    ) -> anyhow::Result<Array2<f32>> {
        self.check_columns(samples)?;
        let mut out = Array2::<f32>::zeros((samples.nrows(), all_names.len()));

        for (k, name) in all_names.iter().enumerate() {
            match self.names.iter().position(|p| p == name) {
                Some(j) => out.column_mut(k).assign(&samples.column(j)),
                None => out.column_mut(k).fill(fixed.get(name)? as f32),
            }
        }
        Ok(out)
    }
}

/// Right ascension to hour angle, given the Greenwich mean sidereal
/// time of the event (both in radians)
pub fn ra_to_hour_angle(ra: f64, gmst: f64) -> f64 {
    (gmst - ra).rem_euclid(TAU)
}

/// Inverse of [`ra_to_hour_angle`]
pub fn hour_angle_to_ra(hour_angle: f64, gmst: f64) -> f64 {
    (gmst - hour_angle).rem_euclid(TAU)
}
