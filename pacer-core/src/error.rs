use thiserror::Error;

/// Pre-run validation failures. These are always fatal before any call is
/// issued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid percentile {0:?}: must be 0 < p <= 100")]
    InvalidPercentile(String),

    #[error("histogram resolution must be > 0, got {0}")]
    InvalidResolution(f64),

    #[error("invalid distribution entry {0:?}: expected value or value:weight")]
    InvalidDistribution(String),

    #[error("no run length: both duration and exact call count are zero")]
    MissingRunLength,

    #[error("invalid proxy spec {0:?}")]
    InvalidProxySpec(String),
}
