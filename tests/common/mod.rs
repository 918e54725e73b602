//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use mediaflow_rs::config::{PoolSettings, RuntimeConfig, SchedulerSettings};
use std::time::Duration;

/// Budget for state changes in tests
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Runtime config with the manual scheduler, so passes run on the test thread
pub fn manual_config() -> RuntimeConfig {
    RuntimeConfig {
        scheduler: SchedulerSettings {
            threads: 1,
            multithreaded: false,
        },
        ..RuntimeConfig::default()
    }
}

/// Manual config with `name` resized to `capacity` (added if missing)
pub fn manual_config_with_pool(name: &str, capacity: usize) -> RuntimeConfig {
    let mut config = manual_config();
    config.resources.retain(|p| p.name != name);
    config.resources.push(PoolSettings::new(name, capacity));
    config
}

/// Runtime config with worker threads
pub fn threaded_config(threads: usize) -> RuntimeConfig {
    RuntimeConfig {
        scheduler: SchedulerSettings {
            threads,
            multithreaded: true,
        },
        ..RuntimeConfig::default()
    }
}
