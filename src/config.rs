//! Cache configuration

use serde::{Deserialize, Serialize};

/// Configuration for the cache facade's background expiry sweeps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Delay before the first sweep after startup, in seconds
  #[serde(default = "default_sweep_grace_secs")]
  pub sweep_grace_secs: u64,

  /// Interval between sweeps, in seconds
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
}

fn default_sweep_grace_secs() -> u64 {
  60
}

fn default_sweep_interval_secs() -> u64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      sweep_grace_secs: default_sweep_grace_secs(),
      sweep_interval_secs: default_sweep_interval_secs(),
    }
  }
}
