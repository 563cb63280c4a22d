use crate::config::RunConfig;
use crate::error::config_error;

use log::debug;
use std::collections::HashSet;

pub const RA: &str = "ra";
pub const DEC: &str = "dec";
pub const DISTANCE: &str = "luminosity_distance";
pub const PHASE: &str = "phase";
pub const GEOCENT_TIME: &str = "geocent_time";
pub const PSI: &str = "psi";
pub const MASS_1: &str = "mass_1";
pub const MASS_2: &str = "mass_2";

/// Membership of a subset of the inferred parameters
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ParamMask {
    /// one flag per inferred parameter
    pub mask: Vec<bool>,
    /// positions of the `true` flags, ascending
    pub indices: Vec<usize>,
}

impl ParamMask {
    fn from_names(all: &[String], subset: &[&str]) -> Self {
        let mask: Vec<bool> = all.iter().map(|p| subset.contains(&p.as_str())).collect();
        let indices = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
            .collect();
        Self { mask, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Indices to pull a subset out of a parameter vector and put it back
///
/// After `[x[complement], x[subset]]` is concatenated into `c`,
/// `x[i] == c[restore[i]]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitIndex {
    pub complement: Vec<usize>,
    pub subset: Vec<usize>,
    pub restore: Vec<usize>,
}

impl SplitIndex {
    fn new(mask: &ParamMask) -> Self {
        let subset = mask.indices.clone();
        let complement: Vec<usize> = mask
            .mask
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| (!b).then_some(i))
            .collect();

        let mut restore = vec![0; mask.mask.len()];
        for (pos, &i) in complement.iter().chain(subset.iter()).enumerate() {
            restore[i] = pos;
        }

        Self {
            complement,
            subset,
            restore,
        }
    }
}

/// The likelihood family each inferred parameter is modelled with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryGroup {
    Gaussian,
    VonMises,
    Sky,
}

/// Positions of the sky-location parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkyLayout {
    pub ra: usize,
    pub dec: usize,
    pub distance: Option<usize>,
}

impl SkyLayout {
    pub fn dim(&self) -> usize {
        if self.distance.is_some() {
            3
        } else {
            2
        }
    }
}

///
/// Partition of the inferred parameter vector, computed once per run
/// and passed by reference to everything that slices parameters.
///
#[derive(Clone, Debug)]
pub struct ParamRegistry {
    names: Vec<String>,
    primary: Vec<PrimaryGroup>,
    gauss: ParamMask,
    vonmise: ParamMask,
    sky: ParamMask,
    periodic: ParamMask,
    sky_layout: Option<SkyLayout>,
}

impl ParamRegistry {
    pub fn from_config(config: &RunConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.inf_pars,
            &config.gauss_pars,
            &config.vonmise_pars,
            &config.sky_pars,
            &config.periodic_pars,
        )
    }

    ///
    /// Build the registry
    ///
    /// * `inf_pars` - inferred parameters, in model order
    /// * `gauss_pars` - parameters with a Gaussian likelihood
    /// * `vonmise_pars` - angles with a von Mises likelihood
    /// * `sky_pars` - parameters of the joint sky-position density
    /// * `periodic_pars` - parameters that wrap around
    ///
    /// A parameter listed in several groups goes to the first of sky,
    /// von Mises and Gaussian. A parameter in none of them is an error.
    pub fn new(
        inf_pars: &[String],
        gauss_pars: &[String],
        vonmise_pars: &[String],
        sky_pars: &[String],
        periodic_pars: &[String],
    ) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for p in inf_pars {
            if !seen.insert(p.as_str()) {
                return Err(config_error(format!("{} is inferred twice", p)));
            }
        }

        let names = inf_pars.to_vec();

        let in_sky = |p: &str| sky_pars.iter().any(|q| q == p);
        let in_vonmise = |p: &str| vonmise_pars.iter().any(|q| q == p);
        let in_gauss = |p: &str| gauss_pars.iter().any(|q| q == p);

        let sky_layout = Self::resolve_sky_layout(&names, &in_sky)?;

        let mut primary = Vec::with_capacity(names.len());
        for p in names.iter() {
            let group = if sky_layout.is_some() && in_sky(p) {
                PrimaryGroup::Sky
            } else if in_vonmise(p) {
                PrimaryGroup::VonMises
            } else if in_gauss(p) {
                PrimaryGroup::Gaussian
            } else {
                return Err(config_error(format!(
                    "{} is not in any of the gaussian, von Mises or sky lists",
                    p
                )));
            };
            primary.push(group);
        }

        let group_mask = |g: PrimaryGroup| {
            let mask: Vec<bool> = primary.iter().map(|&x| x == g).collect();
            let indices = mask
                .iter()
                .enumerate()
                .filter_map(|(i, &b)| b.then_some(i))
                .collect();
            ParamMask { mask, indices }
        };

        let gauss = group_mask(PrimaryGroup::Gaussian);
        let vonmise = group_mask(PrimaryGroup::VonMises);
        let sky = group_mask(PrimaryGroup::Sky);

        let periodic_refs: Vec<&str> = periodic_pars.iter().map(|s| s.as_str()).collect();
        let periodic = ParamMask::from_names(&names, &periodic_refs);

        let registry = Self {
            names,
            primary,
            gauss,
            vonmise,
            sky,
            periodic,
            sky_layout,
        };

        debug!("inferred: {:?}", registry.names);
        debug!("gaussian: {:?}", registry.gauss.indices);
        debug!("von Mises: {:?}", registry.vonmise.indices);
        debug!("sky: {:?}", registry.sky_layout);
        debug!("periodic: {:?}", registry.periodic.indices);

        Ok(registry)
    }

    fn resolve_sky_layout<F>(names: &[String], in_sky: &F) -> anyhow::Result<Option<SkyLayout>>
    where
        F: Fn(&str) -> bool,
    {
        let position = |target: &str| {
            names
                .iter()
                .position(|p| p == target && in_sky(target))
        };

        let unexpected: Vec<&String> = names
            .iter()
            .filter(|p| in_sky(p) && ![RA, DEC, DISTANCE].contains(&p.as_str()))
            .collect();
        if !unexpected.is_empty() {
            return Err(config_error(format!(
                "sky block only takes ra, dec and luminosity_distance, got {:?}",
                unexpected
            )));
        }

        match (position(RA), position(DEC), position(DISTANCE)) {
            (Some(ra), Some(dec), distance) => Ok(Some(SkyLayout { ra, dec, distance })),
            (None, None, None) => Ok(None),
            (None, None, Some(_)) => Err(config_error(
                "luminosity_distance in the sky block needs ra and dec",
            )),
            _ => Err(config_error("the sky block needs both ra and dec")),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_params(&self) -> usize {
        self.names.len()
    }

    pub fn primary_group(&self, idx: usize) -> PrimaryGroup {
        self.primary[idx]
    }

    pub fn gauss(&self) -> &ParamMask {
        &self.gauss
    }

    pub fn vonmise(&self) -> &ParamMask {
        &self.vonmise
    }

    pub fn sky(&self) -> &ParamMask {
        &self.sky
    }

    pub fn sky_layout(&self) -> Option<SkyLayout> {
        self.sky_layout
    }

    pub fn periodic(&self) -> &ParamMask {
        &self.periodic
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|p| p == name)
    }

    /// Mask of a single named parameter, e.g. `phase` or `mass_1`;
    /// empty if the parameter is not inferred
    pub fn named_mask(&self, name: &str) -> ParamMask {
        ParamMask::from_names(&self.names, &[name])
    }

    /// Mask of any subset of parameter names
    pub fn mask_of(&self, subset: &[&str]) -> ParamMask {
        ParamMask::from_names(&self.names, subset)
    }

    /// Complement/subset/restore indices for a named subset
    pub fn split(&self, subset: &[&str]) -> SplitIndex {
        SplitIndex::new(&self.mask_of(subset))
    }

    /// Complement/subset/restore indices for the periodic parameters
    pub fn periodic_split(&self) -> SplitIndex {
        SplitIndex::new(&self.periodic)
    }

    /// Pairs `(i, j)` where `names()[i] == other[j]`, ordered by `i`
    pub fn overlap(&self, other: &[String]) -> Vec<(usize, usize)> {
        self.names
            .iter()
            .enumerate()
            .filter_map(|(i, p)| other.iter().position(|q| q == p).map(|j| (i, j)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_restores_order() {
        let all = strings(&["mass_1", "phase", "ra", "dec", "psi"]);
        let mask = ParamMask::from_names(&all, &["phase", "psi"]);
        let split = SplitIndex::new(&mask);
        assert_eq!(split.subset, vec![1, 4]);
        assert_eq!(split.complement, vec![0, 2, 3]);

        let x = [10, 11, 12, 13, 14];
        let concat: Vec<i32> = split
            .complement
            .iter()
            .chain(split.subset.iter())
            .map(|&i| x[i])
            .collect();
        let restored: Vec<i32> = split.restore.iter().map(|&c| concat[c]).collect();
        assert_eq!(restored, x);
    }

    #[test]
    fn sky_wins_over_von_mises() -> anyhow::Result<()> {
        let reg = ParamRegistry::new(
            &strings(&["mass_1", "ra", "dec", "phase"]),
            &strings(&["mass_1"]),
            &strings(&["ra", "phase"]),
            &strings(&["ra", "dec"]),
            &strings(&["ra", "phase"]),
        )?;
        assert_eq!(reg.primary_group(1), PrimaryGroup::Sky);
        assert_eq!(reg.primary_group(3), PrimaryGroup::VonMises);
        assert_eq!(reg.sky_layout().map(|s| s.dim()), Some(2));
        Ok(())
    }

    #[test]
    fn half_sky_is_rejected() {
        let res = ParamRegistry::new(
            &strings(&["mass_1", "ra"]),
            &strings(&["mass_1"]),
            &strings(&[]),
            &strings(&["ra"]),
            &strings(&["ra"]),
        );
        assert!(res.is_err());
    }
}
