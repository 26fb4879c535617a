use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    core::{CaptureOptions, ScanOptions},
    protocol::{FramingOptions, LinkConfig},
};

/// Live capture tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    /// Capacity of the decoded-frame queue; the newest frame is dropped when full
    #[serde(default = "default_decoded_queue_capacity")]
    pub decoded_queue_capacity: usize,
    /// How often the correlation stage drains the queue
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// How often pending responses are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Quiet time after which unmatched responses are placed unanchored
    #[serde(default = "default_pending_flush_after_ms")]
    pub pending_flush_after_ms: u64,
    /// Invalid-CRC frames are dropped for this long after start; `null` disables
    #[serde(default = "default_startup_crc_grace_ms")]
    pub startup_crc_grace_ms: Option<u64>,
}

fn default_decoded_queue_capacity() -> usize {
    1024
}

fn default_drain_interval_ms() -> u64 {
    50
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_pending_flush_after_ms() -> u64 {
    2000
}

fn default_startup_crc_grace_ms() -> Option<u64> {
    Some(1000)
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            decoded_queue_capacity: default_decoded_queue_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            pending_flush_after_ms: default_pending_flush_after_ms(),
            startup_crc_grace_ms: default_startup_crc_grace_ms(),
        }
    }
}

/// Link parameter scanner tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    #[serde(default = "default_observation_window_ms")]
    pub observation_window_ms: u64,
    /// Minimum share of CRC-valid frames for a candidate to be accepted
    #[serde(default = "default_accept_ratio")]
    pub accept_ratio: f64,
}

fn default_observation_window_ms() -> u64 {
    2000
}

fn default_accept_ratio() -> f64 {
    0.80
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            observation_window_ms: default_observation_window_ms(),
            accept_ratio: default_accept_ratio(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnifferConfig {
    /// Port name
    #[serde(default)]
    pub port_name: String,
    /// Line parameters for live capture
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub framing: FramingOptions,
    #[serde(default)]
    pub capture: CaptureParams,
    #[serde(default)]
    pub scan: ScanParams,
}

impl SnifferConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            framing: self.framing.clone(),
            decoded_queue_capacity: self.capture.decoded_queue_capacity,
            drain_interval: Duration::from_millis(self.capture.drain_interval_ms),
            sweep_interval: Duration::from_millis(self.capture.sweep_interval_ms),
            pending_flush_after: Duration::from_millis(self.capture.pending_flush_after_ms),
            startup_crc_grace: self.capture.startup_crc_grace_ms.map(Duration::from_millis),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            observation_window: Duration::from_millis(self.scan.observation_window_ms),
            accept_ratio: self.scan.accept_ratio,
            framing: self.framing.clone(),
            ..ScanOptions::default()
        }
    }
}
