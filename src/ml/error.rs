use thiserror::Error;

//________________________________________________________________
#[derive(Debug, Error)]
pub enum StyleError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid weights configuration: layer `{0}` is not part of the network")]
    InvalidWeightsConfig(String),

    #[error("non-finite objective at evaluation {evaluation}: {detail}")]
    NonFiniteObjective { evaluation: usize, detail: String },

    #[error("no target representation for layer `{0}`")]
    MissingTarget(String),

    #[error("unknown layer `{0}`")]
    UnknownLayer(String),

    #[error("cannot backpropagate from `{start}` to `{end}`: destination must precede the source")]
    BackwardRange { start: String, end: String },

    #[error("duplicate layer name `{0}`")]
    DuplicateLayer(String),

    #[error("forward pass must be called before {0}")]
    ForwardNotRun(String),

    #[error("no style transfer has been run yet")]
    NoResult,

    #[error("malformed model file: {0}")]
    ModelFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StyleError>;

impl StyleError {
    pub fn shape(expected: impl std::fmt::Debug, got: impl std::fmt::Debug) -> Self {
        StyleError::ShapeMismatch(format!("expected {:?}, got {:?}", expected, got))
    }
}
//________________________________________________________________
