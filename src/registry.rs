//! Device registry: logical targets and their physical resources.
//!
//! Built once from the `[targets]` configuration tables. Bindings of one
//! resource kind are returned in a stable order by physical index so that
//! multi-channel writes line up with the order samples are packed.

use crate::config::TargetConfig;
use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of physical resource on the I/O device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Analog output channel
    AnalogOut,
    /// Digital output line
    DigitalOut,
    /// Analog input channel
    AnalogIn,
    /// Counter input
    CounterIn,
}

impl ResourceKind {
    /// Human-readable resource name.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AnalogOut => "analog output channel",
            Self::DigitalOut => "digital output line",
            Self::AnalogIn => "analog input channel",
            Self::CounterIn => "counter input",
        }
    }

    /// Physical channel name on `device` for index `index`.
    pub fn channel_name(&self, device: &str, index: u32) -> String {
        match self {
            Self::AnalogOut => format!("{}/ao{}", device, index),
            Self::DigitalOut => format!("{}/port0/line{}", device, index),
            Self::AnalogIn => format!("{}/ai{}", device, index),
            Self::CounterIn => format!("{}/ctr{}", device, index),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalResource {
    /// Channel or line index
    pub index: u32,
    /// Resource kind
    pub kind: ResourceKind,
}

/// A logical target bound to one physical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Logical target name
    pub target: String,
    /// Bound resource
    pub resource: PhysicalResource,
}

/// Registered information about one logical target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Analog output channel
    pub analog_channel: Option<u32>,
    /// Digital output line
    pub digital_line: Option<u32>,
    /// Analog input channel
    pub analog_input: Option<u32>,
    /// Counter input
    pub counter_input: Option<u32>,
    /// Physical units per volt
    pub conversion_factor: f64,
    /// Positioner takes part in raster scans
    pub for_scanning: bool,
}

impl TargetInfo {
    /// Index of the resource of `kind`, if bound.
    pub fn resource(&self, kind: ResourceKind) -> Option<u32> {
        match kind {
            ResourceKind::AnalogOut => self.analog_channel,
            ResourceKind::DigitalOut => self.digital_line,
            ResourceKind::AnalogIn => self.analog_input,
            ResourceKind::CounterIn => self.counter_input,
        }
    }
}

impl From<&TargetConfig> for TargetInfo {
    fn from(cfg: &TargetConfig) -> Self {
        Self {
            analog_channel: cfg.analog_channel,
            digital_line: cfg.digital_line,
            analog_input: cfg.analog_input,
            counter_input: cfg.counter_input,
            conversion_factor: cfg.conversion_factor,
            for_scanning: cfg.for_scanning,
        }
    }
}

/// Logical target → physical resource lookup.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    targets: BTreeMap<String, TargetInfo>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration tables.
    pub fn from_config(targets: &BTreeMap<String, TargetConfig>) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|(name, cfg)| (name.clone(), TargetInfo::from(cfg)))
                .collect(),
        }
    }

    /// Register or replace a target.
    pub fn insert(&mut self, name: impl Into<String>, info: TargetInfo) {
        self.targets.insert(name.into(), info);
    }

    /// Look up one target.
    pub fn get_device(&self, target: &str) -> Option<&TargetInfo> {
        self.targets.get(target)
    }

    /// Every registered target.
    pub fn all_devices(&self) -> &BTreeMap<String, TargetInfo> {
        &self.targets
    }

    /// Binding of `target` to its resource of `kind`.
    pub fn binding(&self, target: &str, kind: ResourceKind) -> Result<DeviceBinding> {
        self.get_device(target)
            .and_then(|info| info.resource(kind))
            .map(|index| DeviceBinding {
                target: target.to_string(),
                resource: PhysicalResource { index, kind },
            })
            .ok_or_else(|| ScanError::UnboundTarget {
                target: target.to_string(),
                resource: kind.label(),
            })
    }

    /// All bindings of `kind`, sorted by physical index (ties by name).
    pub fn sorted_bindings(&self, kind: ResourceKind) -> Vec<DeviceBinding> {
        let mut bindings: Vec<DeviceBinding> = self
            .targets
            .iter()
            .filter_map(|(name, info)| {
                info.resource(kind).map(|index| DeviceBinding {
                    target: name.clone(),
                    resource: PhysicalResource { index, kind },
                })
            })
            .collect();
        // BTreeMap iteration already orders ties by name; sort_by_key is stable
        bindings.sort_by_key(|b| b.resource.index);
        bindings
    }

    /// Conversion factors of scanning positioners.
    pub fn conversion_factors(&self) -> BTreeMap<String, f64> {
        self.targets
            .iter()
            .filter(|(_, info)| info.for_scanning)
            .map(|(name, info)| (name.clone(), info.conversion_factor))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(analog: Option<u32>, digital: Option<u32>) -> TargetInfo {
        TargetInfo {
            analog_channel: analog,
            digital_line: digital,
            analog_input: None,
            counter_input: None,
            conversion_factor: 1.0,
            for_scanning: analog.is_some(),
        }
    }

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.insert("Stage_Z", target(Some(0), None));
        registry.insert("Stage_X", target(Some(2), None));
        registry.insert("Stage_Y", target(Some(1), None));
        registry.insert("Laser488", target(None, Some(4)));
        registry.insert("Laser405", target(None, Some(1)));
        registry
    }

    #[test]
    fn test_sorted_by_physical_index() {
        let targets: Vec<String> = registry()
            .sorted_bindings(ResourceKind::AnalogOut)
            .into_iter()
            .map(|b| b.target)
            .collect();
        assert_eq!(targets, vec!["Stage_Z", "Stage_Y", "Stage_X"]);

        let lines: Vec<u32> = registry()
            .sorted_bindings(ResourceKind::DigitalOut)
            .iter()
            .map(|b| b.resource.index)
            .collect();
        assert_eq!(lines, vec![1, 4]);
    }

    #[test]
    fn test_unbound_target() {
        let registry = registry();
        assert!(registry.binding("Laser488", ResourceKind::DigitalOut).is_ok());
        match registry.binding("Laser488", ResourceKind::AnalogOut) {
            Err(ScanError::UnboundTarget { target, resource }) => {
                assert_eq!(target, "Laser488");
                assert_eq!(resource, "analog output channel");
            }
            other => panic!("expected UnboundTarget, got {:?}", other),
        }
        assert!(registry.binding("Missing", ResourceKind::DigitalOut).is_err());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(ResourceKind::AnalogOut.channel_name("Dev1", 3), "Dev1/ao3");
        assert_eq!(ResourceKind::DigitalOut.channel_name("Dev1", 2), "Dev1/port0/line2");
        assert_eq!(ResourceKind::CounterIn.channel_name("Dev2", 0), "Dev2/ctr0");
    }

    #[test]
    fn test_from_config() {
        let mut targets = BTreeMap::new();
        targets.insert(
            "Stage_X".to_string(),
            TargetConfig {
                analog_channel: Some(0),
                conversion_factor: 2.5,
                for_scanning: true,
                ..Default::default()
            },
        );
        let registry = DeviceRegistry::from_config(&targets);
        assert_eq!(registry.conversion_factors()["Stage_X"], 2.5);
        assert_eq!(registry.all_devices().len(), 1);
    }
}
