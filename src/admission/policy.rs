//! Resource ceilings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::monitor::ResourceSample;

/// Default ceiling for every dimension, in percent.
pub const DEFAULT_CEILING_PERCENT: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Cpu,
    Ram,
    Disk,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Ram => "ram",
            Self::Disk => "disk",
        })
    }
}

/// A dimension at or above its ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pressure {
    pub dimension: ResourceDimension,
    pub value: f64,
    pub ceiling: f64,
}

/// Per-dimension utilization ceilings, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ceilings {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CEILING_PERCENT,
            ram: DEFAULT_CEILING_PERCENT,
            disk: DEFAULT_CEILING_PERCENT,
        }
    }
}

impl Ceilings {
    /// First dimension (cpu, ram, disk) whose value reaches its ceiling.
    pub fn exceeded(&self, sample: &ResourceSample) -> Option<Pressure> {
        [
            (ResourceDimension::Cpu, sample.cpu_percent, self.cpu),
            (ResourceDimension::Ram, sample.ram_percent, self.ram),
            (ResourceDimension::Disk, sample.disk_percent, self.disk),
        ]
        .into_iter()
        .find(|(_, value, ceiling)| value >= ceiling)
        .map(|(dimension, value, ceiling)| Pressure {
            dimension,
            value,
            ceiling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_all_ceilings_passes() {
        let sample = ResourceSample::new(84.9, 10.0, 50.0);
        assert!(Ceilings::default().exceeded(&sample).is_none());
    }

    #[test]
    fn reaching_a_ceiling_is_pressure() {
        let sample = ResourceSample::new(10.0, 85.0, 10.0);
        let pressure = Ceilings::default().exceeded(&sample).unwrap();
        assert_eq!(pressure.dimension, ResourceDimension::Ram);
        assert_eq!(pressure.ceiling, 85.0);
    }

    #[test]
    fn each_dimension_is_checked() {
        let ceilings = Ceilings {
            cpu: 50.0,
            ram: 60.0,
            disk: 70.0,
        };
        let disk_only = ResourceSample::new(10.0, 10.0, 70.5);
        assert_eq!(
            ceilings.exceeded(&disk_only).unwrap().dimension,
            ResourceDimension::Disk
        );
        let cpu_first = ResourceSample::new(99.0, 99.0, 99.0);
        assert_eq!(
            ceilings.exceeded(&cpu_first).unwrap().dimension,
            ResourceDimension::Cpu
        );
    }
}
