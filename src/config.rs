// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration (`SPEC_FULL.md` §2). Library code never reads
//! environment variables implicitly; only `src/bin/servicemanager.rs` does,
//! via `RuntimeConfig::from_env`.

/// Tunables for `ProcessState::init_with_driver` (`spec.md` §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub driver_path: String,
    pub max_threads: u32,
    pub mmap_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            driver_path: "/dev/binder".to_string(),
            max_threads: 2,
            mmap_size: 4 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Overrides defaults from `VELA_BINDER_DRIVER_PATH`,
    /// `VELA_BINDER_MAX_THREADS`, `VELA_BINDER_MMAP_SIZE`. Called only by
    /// the `servicemanager` binary.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Ok(path) = std::env::var("VELA_BINDER_DRIVER_PATH") {
            config.driver_path = path;
        }
        if let Ok(n) = std::env::var("VELA_BINDER_MAX_THREADS") {
            if let Ok(n) = n.parse() {
                config.max_threads = n;
            }
        }
        if let Ok(n) = std::env::var("VELA_BINDER_MMAP_SIZE") {
            if let Ok(n) = n.parse() {
                config.mmap_size = n;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.driver_path, "/dev/binder");
        assert_eq!(config.max_threads, 2);
        assert_eq!(config.mmap_size, 4096);
    }
}
