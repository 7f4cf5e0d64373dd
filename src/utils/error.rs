use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MoE configuration error: {0}")]
    Config(String),

    #[error("Routing invariant violated: {0}")]
    Invariant(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Communication error: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, MoeError>;
