use thiserror::Error;

/// Errors produced by model constructors and wire codecs.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("changelog buffer too short: {0} bytes")]
    ShortChangelog(usize),

    #[error("replica index {index} out of range for {count} children")]
    ChildOutOfRange { index: usize, count: usize },

    #[error("replica count {0} exceeds the wide-map limit")]
    TooManyChildren(usize),

    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, ModelError>;
