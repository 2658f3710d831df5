//! Host resource sampling.
//!
//! A [`ResourceMonitor`] produces point-in-time CPU, memory and disk
//! utilization. Samples are never persisted; the newest one is kept in a
//! [`LatestSample`] cell for the health probe.

pub mod native;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::MonitorError;

pub use native::SysinfoMonitor;

/// One utilization reading, each dimension in percent (0–100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSample {
    /// Build a sample stamped now, clamping every dimension into 0–100.
    pub fn new(cpu_percent: f64, ram_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent: clamp_percent(cpu_percent),
            ram_percent: clamp_percent(ram_percent),
            disk_percent: clamp_percent(disk_percent),
            timestamp: Utc::now(),
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// `used / total` as a percentage; zero when `total` is zero.
pub fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Source of resource samples.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample, MonitorError>;
}

/// Shared slot holding the most recent sample.
#[derive(Clone, Default)]
pub struct LatestSample {
    inner: Arc<RwLock<Option<ResourceSample>>>,
}

impl LatestSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, sample: ResourceSample) {
        *self.inner.write().await = Some(sample);
    }

    pub async fn get(&self) -> Option<ResourceSample> {
        *self.inner.read().await
    }
}
