use std::{collections::BTreeMap, sync::Arc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{BackendKind, DeviceType, Driver, Vendor};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId;

/// Hardware description of one device as discovered by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSpec {
    pub name: String,
    /// Raw vendor string.
    pub vendor: String,
    pub device_type: DeviceType,
    /// Maximum clock frequency in MHz.
    pub clock_rate: usize,
    pub compute_capability: (u32, u32),
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub local_mem_size: usize,
    pub global_mem_size: usize,
    /// Warp (CUDA) or wavefront (OpenCL) width.
    pub warp_size: usize,
    pub extensions: Vec<String>,
    /// Whether out-of-order queues are supported.
    pub out_of_order: bool,
    /// Whether a context can currently be created on the device.
    pub available: bool,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            name: "Host Device".into(),
            vendor: "Unknown".into(),
            device_type: DeviceType::Cpu,
            clock_rate: 1000,
            compute_capability: (0, 0),
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            local_mem_size: 48 << 10,
            global_mem_size: 1 << 30,
            warp_size: 32,
            extensions: vec![],
            out_of_order: false,
            available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlatformSpec {
    pub name: String,
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug)]
struct DeviceInner {
    id: uid::Id<DeviceId>,
    platform: (uid::Id<PlatformId>, String),
    spec: DeviceSpec,
    driver: Arc<dyn Driver>,
}

/// A compute unit on a [`Platform`]. Cheap to clone; clones refer to the same device.
#[derive(Debug, Clone)]
pub struct Device(Arc<DeviceInner>);

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Device {}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.backend())
    }
}

impl Device {
    #[inline]
    pub fn id(&self) -> uid::Id<DeviceId> {
        self.0.id
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.0.driver.kind()
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.0.driver
    }

    #[inline]
    pub fn spec(&self) -> &DeviceSpec {
        &self.0.spec
    }

    #[inline]
    pub fn platform_id(&self) -> uid::Id<PlatformId> {
        self.0.platform.0
    }

    #[inline]
    pub fn platform_name(&self) -> &str {
        &self.0.platform.1
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.spec.name
    }

    #[inline]
    pub fn clock_rate(&self) -> usize {
        self.0.spec.clock_rate
    }

    #[inline]
    pub fn device_type(&self) -> DeviceType {
        self.0.spec.device_type
    }

    #[inline]
    pub fn vendor(&self) -> Vendor {
        Vendor::from_vendor_str(&self.0.spec.vendor)
    }

    #[inline]
    pub fn vendor_str(&self) -> &str {
        &self.0.spec.vendor
    }

    #[inline]
    pub fn compute_capability(&self) -> (u32, u32) {
        self.0.spec.compute_capability
    }

    #[inline]
    pub fn max_work_group_size(&self) -> usize {
        self.0.spec.max_work_group_size
    }

    #[inline]
    pub fn max_work_item_sizes(&self) -> [usize; 3] {
        self.0.spec.max_work_item_sizes
    }

    #[inline]
    pub fn local_mem_size(&self) -> usize {
        self.0.spec.local_mem_size
    }

    #[inline]
    pub fn global_mem_size(&self) -> usize {
        self.0.spec.global_mem_size
    }

    #[inline]
    pub fn warp_size(&self) -> usize {
        self.0.spec.warp_size
    }

    #[inline]
    pub fn extensions(&self) -> &[String] {
        &self.0.spec.extensions
    }

    #[inline]
    pub fn fp64_support(&self) -> bool {
        self.0.driver.fp64_support(&self.0.spec)
    }

    #[inline]
    pub fn fp16_support(&self) -> bool {
        self.0.driver.fp16_support(&self.0.spec)
    }

    /// Human-readable summary of the device.
    pub fn info(&self) -> BTreeMap<String, String> {
        let spec = &self.0.spec;
        let [x, y, z] = spec.max_work_item_sizes;
        [
            ("Platform", self.platform_name().to_string()),
            ("Vendor", spec.vendor.clone()),
            ("Name", spec.name.clone()),
            (
                "Maximum total work-group size",
                spec.max_work_group_size.to_string(),
            ),
            ("Maximum individual work-group sizes", format!("{x}, {y}, {z}")),
            ("Local memory size", spec.local_mem_size.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}

/// A discovered backend implementation and the devices it exposes.
#[derive(Debug, Clone)]
pub struct Platform {
    id: uid::Id<PlatformId>,
    name: String,
    backend: BackendKind,
    devices: Vec<Device>,
}

impl Platform {
    pub fn new(driver: Arc<dyn Driver>, spec: PlatformSpec) -> Self {
        let id = uid::Id::new();
        let PlatformSpec { name, devices } = spec;
        let backend = driver.kind();
        let devices = devices
            .into_iter()
            .map(|spec| {
                Device(Arc::new(DeviceInner {
                    id: uid::Id::new(),
                    platform: (id, name.clone()),
                    spec,
                    driver: driver.clone(),
                }))
            })
            .collect();
        Self {
            id,
            name,
            backend,
            devices,
        }
    }

    #[inline]
    pub fn id(&self) -> uid::Id<PlatformId> {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DeviceSpec, Platform, PlatformSpec};
    use crate::driver::{BackendKind, Cuda, DeviceType, OpenCl, Vendor};

    #[test]
    fn test_platform_devices() {
        let spec = PlatformSpec {
            name: "Test Platform".into(),
            devices: vec![
                DeviceSpec {
                    name: "Radeon".into(),
                    vendor: "Advanced Micro Devices, Inc.".into(),
                    device_type: DeviceType::Gpu,
                    max_work_item_sizes: [256, 128, 64],
                    ..Default::default()
                },
                DeviceSpec::default(),
            ],
        };
        let platform = Platform::new(Arc::new(OpenCl::new(vec![])), spec);
        assert_eq!(platform.backend(), BackendKind::OpenCl);
        assert_eq!(platform.devices().len(), 2);

        let device = &platform.devices()[0];
        assert_eq!(device.platform_id(), platform.id());
        assert_eq!(device.vendor(), Vendor::Amd);
        assert_eq!(device.device_type(), DeviceType::Gpu);
        assert_ne!(device, &platform.devices()[1]);
        assert_eq!(device, &device.clone());

        let info = device.info();
        assert_eq!(info["Platform"], "Test Platform");
        assert_eq!(info["Name"], "Radeon");
        assert_eq!(info["Maximum individual work-group sizes"], "256, 128, 64");
    }

    #[test]
    fn test_precision_support() {
        let spec = PlatformSpec {
            name: "Test Platform".into(),
            devices: vec![
                DeviceSpec {
                    extensions: vec!["cl_khr_fp64".into()],
                    ..Default::default()
                },
                DeviceSpec::default(),
            ],
        };
        let platform = Platform::new(Arc::new(OpenCl::new(vec![])), spec.clone());
        assert!(platform.devices()[0].fp64_support());
        assert!(!platform.devices()[0].fp16_support());
        assert!(!platform.devices()[1].fp64_support());

        let platform = Platform::new(Arc::new(Cuda::new(vec![])), spec);
        assert!(platform.devices()[1].fp64_support());
        assert!(platform.devices()[1].fp16_support());
    }
}
