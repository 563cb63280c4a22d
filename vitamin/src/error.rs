/// Errors that callers may want to tell apart from generic failures
/// (`anyhow::Error::downcast_ref::<CvaeError>()`)
#[derive(Debug, Clone, PartialEq)]
pub enum CvaeError {
    /// inconsistent run configuration or bounds table
    Config(String),
    /// tensors or arrays of unexpected shape
    Shape(String),
    /// training loss became NaN or infinite at this epoch
    NonFiniteLoss { epoch: usize, loss: f32 },
    /// no saved weights where they were expected
    MissingCheckpoint(String),
}

impl std::fmt::Display for CvaeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvaeError::Config(msg) => write!(f, "configuration error: {}", msg),
            CvaeError::Shape(msg) => write!(f, "shape mismatch: {}", msg),
            CvaeError::NonFiniteLoss { epoch, loss } => {
                write!(f, "non-finite loss {} at epoch {}", loss, epoch)
            }
            CvaeError::MissingCheckpoint(path) => write!(f, "no checkpoint found at {}", path),
        }
    }
}

impl std::error::Error for CvaeError {}

pub fn config_error<S: Into<String>>(msg: S) -> anyhow::Error {
    CvaeError::Config(msg.into()).into()
}

pub fn shape_error<S: Into<String>>(msg: S) -> anyhow::Error {
    CvaeError::Shape(msg.into()).into()
}
