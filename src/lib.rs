pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::{cli::LocalStorage, toml_config::ExchangeConfig, JobRequest};

#[cfg(feature = "lambda")]
pub use config::lambda::{LambdaConfig, S3SequenceAllocator, S3StagingStore, S3Storage};

pub use core::exchange::{CompensationPolicy, ExchangeCycle, ExchangePorts, ExchangeSettings};
pub use core::job::{build_local_job, ExchangeJob, JobInvocation, JobOutcome};
pub use core::sequence::FileSequenceAllocator;
pub use utils::error::{ExchangeError, Result};
