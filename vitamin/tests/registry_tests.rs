use approx::assert_abs_diff_eq;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::{PI, TAU};
use vitamin::config::{Bounds, FixedValues, RunTables};
use vitamin::error::CvaeError;
use vitamin::normalization::ParamScaler;
use vitamin::param_registry::{ParamRegistry, PrimaryGroup};

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

const INF_PARS: [&str; 9] = [
    "mass_1",
    "mass_2",
    "luminosity_distance",
    "geocent_time",
    "phase",
    "theta_jn",
    "psi",
    "ra",
    "dec",
];

fn registry() -> anyhow::Result<ParamRegistry> {
    ParamRegistry::new(
        &strings(&INF_PARS),
        &strings(&["mass_1", "mass_2", "luminosity_distance", "geocent_time", "theta_jn", "dec"]),
        &strings(&["phase", "psi", "ra"]),
        &strings(&["ra", "dec", "luminosity_distance"]),
        &strings(&["ra", "phase", "psi", "phi_12", "phi_jl"]),
    )
}

fn bounds() -> Bounds {
    Bounds::from_ranges([
        ("mass_1", 35., 80.),
        ("mass_2", 35., 80.),
        ("luminosity_distance", 1000., 3000.),
        ("geocent_time", 0.15, 0.35),
        ("phase", 0., TAU),
        ("theta_jn", 0., PI),
        ("psi", 0., PI),
        ("ra", 0., TAU),
        ("dec", -PI / 2., PI / 2.),
    ])
}

#[test]
fn primary_groups_partition_parameters() -> anyhow::Result<()> {
    let reg = registry()?;
    let p = reg.num_params();

    let total = reg.gauss().len() + reg.vonmise().len() + reg.sky().len();
    assert_eq!(total, p);

    for i in 0..p {
        let hits = [reg.gauss(), reg.vonmise(), reg.sky()]
            .iter()
            .filter(|m| m.mask[i])
            .count();
        assert_eq!(hits, 1, "{} covered {} times", reg.names()[i], hits);
    }

    // distance in the sky list makes a 3-d block
    let sky = reg.sky_layout().ok_or(anyhow::anyhow!("no sky block"))?;
    assert_eq!(sky.dim(), 3);
    assert_eq!(reg.primary_group(2), PrimaryGroup::Sky);
    assert_eq!(reg.primary_group(4), PrimaryGroup::VonMises);
    assert_eq!(reg.primary_group(0), PrimaryGroup::Gaussian);
    Ok(())
}

#[test]
fn unresolvable_parameter_is_fatal() {
    let err = ParamRegistry::new(
        &strings(&["mass_1", "chirp_mass"]),
        &strings(&["mass_1"]),
        &strings(&[]),
        &strings(&[]),
        &strings(&[]),
    )
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<CvaeError>(), Some(CvaeError::Config(_))));
}

#[test]
fn periodic_split_and_overlap() -> anyhow::Result<()> {
    let reg = registry()?;
    let split = reg.periodic_split();
    assert_eq!(split.subset, vec![4, 6, 7]);
    assert_eq!(split.complement.len() + split.subset.len(), reg.num_params());

    let bilby = strings(&["ra", "dec", "mass_1", "a_1"]);
    assert_eq!(reg.overlap(&bilby), vec![(0, 2), (7, 0), (8, 1)]);
    assert_eq!(reg.named_mask("geocent_time").indices, vec![3]);
    assert!(reg.named_mask("a_1").is_empty());
    Ok(())
}

#[test]
fn normalize_round_trip() -> anyhow::Result<()> {
    let reg = registry()?;
    let scaler = ParamScaler::new(&reg, &bounds())?;
    let mut rng = StdRng::seed_from_u64(17);

    let n = 200;
    let x_norm = Array2::from_shape_fn((n, reg.num_params()), |_| rng.random::<f32>() * 0.999);
    let x_phys = scaler.denormalize(&x_norm)?;

    for (j, range) in scaler.ranges().iter().enumerate() {
        for &v in x_phys.column(j).iter() {
            assert!((v as f64) >= range.min - 1e-4 && (v as f64) <= range.max + 1e-4);
        }
    }

    let back = scaler.normalize(&x_phys)?;
    for (a, b) in back.iter().zip(x_norm.iter()) {
        let d = (a - b).abs();
        // periodic columns agree modulo one period
        assert!(d < 1e-4 || (1. - d) < 1e-4, "{} vs {}", a, b);
    }
    Ok(())
}

#[test]
fn polarization_and_ra_wrap() -> anyhow::Result<()> {
    let reg = registry()?;
    let scaler = ParamScaler::new(&reg, &bounds())?;
    let psi = reg.index_of("psi").ok_or(anyhow::anyhow!("psi"))?;
    let ra = reg.index_of("ra").ok_or(anyhow::anyhow!("ra"))?;

    let mut x = scaler.denormalize(&Array2::from_elem((1, reg.num_params()), 0.5))?;
    x[[0, psi]] += PI as f32;
    x[[0, ra]] += TAU as f32;

    let u = scaler.normalize(&x)?;
    assert_abs_diff_eq!(u[[0, psi]], 0.5, epsilon = 1e-5);
    assert_abs_diff_eq!(u[[0, ra]], 0.5, epsilon = 1e-5);
    Ok(())
}

#[test]
fn fixed_values_fill_missing_columns() -> anyhow::Result<()> {
    let reg = registry()?;
    let scaler = ParamScaler::new(&reg, &bounds())?;
    let fixed = FixedValues::from_json_str(r#"{"a_1": 0.0, "tilt_1": 0.5}"#)?;

    let x = scaler.denormalize(&Array2::from_elem((3, reg.num_params()), 0.25))?;
    let wide = scaler.fill_fixed(&x, &strings(&["a_1", "mass_1", "tilt_1"]), &fixed)?;
    assert_eq!(wide.dim(), (3, 3));
    assert_abs_diff_eq!(wide[[1, 0]], 0.0);
    assert_abs_diff_eq!(wide[[1, 1]], 35. + 0.25 * 45.);
    assert_abs_diff_eq!(wide[[2, 2]], 0.5);

    let missing = scaler.fill_fixed(&x, &strings(&["a_2"]), &fixed);
    assert!(missing.is_err());
    Ok(())
}

#[test]
fn run_tables_load_from_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bounds_file = dir.path().join("bounds.json");
    let fixed_file = dir.path().join("fixed.json");
    std::fs::write(&bounds_file, r#"{"mass_1_min": 35.0, "mass_1_max": 80.0}"#)?;
    std::fs::write(&fixed_file, r#"{"a_1": 0.0}"#)?;

    let tables = RunTables::load(&bounds_file, &fixed_file)?;
    assert_abs_diff_eq!(tables.bounds.get("mass_1")?.width(), 45.0);
    assert_abs_diff_eq!(tables.fixed.get("a_1")?, 0.0);
    assert!(tables.bounds.get("mass_2").is_err());

    let missing = RunTables::load(dir.path().join("none.json"), &fixed_file);
    assert!(missing.is_err());
    Ok(())
}
