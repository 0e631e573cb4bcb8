use thiserror::Error;

/// Error type for the training/inference engine.
///
/// The variants split along the taxonomy the callers care about:
/// configuration and data problems are construction-time failures,
/// `EpisodeOver`/`NotEnoughSamples` indicate caller-logic bugs, and
/// checkpoint/IO variants come from persistence. Numeric trouble
/// (non-finite losses) is *not* an error variant: it is logged and the
/// offending step skipped, leaving abort decisions to the caller.
#[derive(Error, Debug)]
pub enum TradingError {
    // Construction-time problems
    #[error("configuration error: {0}")]
    Config(String),

    #[error("data error: {0}")]
    Data(String),

    // Caller-logic bugs, raised distinctly from the above
    #[error("environment stepped after episode termination")]
    EpisodeOver,

    #[error("requested {requested} samples but store holds {available}")]
    NotEnoughSamples { requested: usize, available: usize },

    // Persistence
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),
}

pub type Result<T> = std::result::Result<T, TradingError>;
