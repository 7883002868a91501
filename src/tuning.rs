//! Auto-tuning module
//!
//! Sizes the request worker pool from the detected hardware when the
//! configuration leaves `workers.count` at 0.

use sysinfo::System;

/// Tuned values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Request workers, each holding one store connection
    pub workers: usize,
    /// Requests that may wait for a free worker
    pub queue_depth: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 256,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Derive pool sizes from core count and memory
///
/// Workers mostly wait on the store, so the pool is twice the core count
/// (min 2, max 32). Each store connection costs memory on the database
/// side as well, so small machines are capped at one worker per 256 MB.
pub fn tune_for(cores: usize, ram_mb: u64) -> TunedConfig {
    let by_cores = (cores * 2).clamp(2, 32);
    let by_ram = ((ram_mb / 256) as usize).max(2);
    let workers = by_cores.min(by_ram);

    TunedConfig {
        workers,
        queue_depth: workers * 64,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    }
}

/// Auto-tune based on detected hardware
pub fn auto_tune() -> TunedConfig {
    let config = tune_for(detect_cpu_cores(), detect_ram_mb());

    tracing::info!(
        cores = config.detected_cores,
        ram_mb = config.detected_ram_mb,
        workers = config.workers,
        queue_depth = config.queue_depth,
        "Auto-tuned worker pool based on hardware"
    );

    config
}

/// Worker count to use: the configured value, or the tuned one when 0
pub fn worker_count(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        auto_tune().workers
    }
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         WolfDir: {} request workers, queue depth {}",
        config.detected_cores, config.detected_ram_mb, config.workers, config.queue_depth,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tune_for_small_machine() {
        let config = tune_for(1, 1024);
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_depth, 128);
    }

    #[test]
    fn test_tune_for_large_machine() {
        let config = tune_for(64, 256 * 1024);
        assert_eq!(config.workers, 32);
    }

    #[test]
    fn test_ram_caps_workers() {
        let config = tune_for(16, 1024);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_configured_count_wins() {
        assert_eq!(worker_count(3), 3);
    }

    #[test]
    fn test_auto_tune_detects_hardware() {
        let config = auto_tune();
        assert!(config.detected_cores >= 1);
        assert!(config.workers >= 2);
    }
}
