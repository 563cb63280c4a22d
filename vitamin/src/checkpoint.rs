use crate::error::CvaeError;

use candle_nn::VarMap;
use log::info;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.safetensors";

/// Weight files keyed by run label, under
/// `<root>/inverse_model_<label>/model.safetensors`
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn dir_for(&self, run_label: &str) -> PathBuf {
        self.root.join(format!("inverse_model_{}", run_label))
    }

    pub fn path_for(&self, run_label: &str) -> PathBuf {
        self.dir_for(run_label).join(MODEL_FILE)
    }

    pub fn exists(&self, run_label: &str) -> bool {
        self.path_for(run_label).is_file()
    }

    /// Write all weights to a temporary file next to the target, then
    /// rename it into place
    pub fn save(&self, varmap: &VarMap, run_label: &str) -> anyhow::Result<PathBuf> {
        let dir = self.dir_for(run_label);
        std::fs::create_dir_all(&dir)?;

        let tmp = tempfile::Builder::new()
            .prefix(".model")
            .suffix(".safetensors")
            .tempfile_in(&dir)?;
        varmap.save(tmp.path())?;

        let path = self.path_for(run_label);
        tmp.persist(&path)?;
        info!("saved weights: {}", path.display());
        Ok(path)
    }

    /// Overwrite the weights in `varmap` with the saved ones
    pub fn load(&self, varmap: &mut VarMap, run_label: &str) -> anyhow::Result<()> {
        let path = self.path_for(run_label);
        if !path.is_file() {
            return Err(CvaeError::MissingCheckpoint(path.display().to_string()).into());
        }
        varmap.load(&path)?;
        info!("loaded weights: {}", path.display());
        Ok(())
    }
}
