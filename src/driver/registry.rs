use std::sync::{Arc, OnceLock, RwLock};

use itertools::Itertools;

use super::{Device, Driver, DriverError, Platform, QueueProperties};

/// Catalog of the platforms discovered through a set of drivers.
#[derive(Debug)]
pub struct Registry {
    platforms: Vec<Platform>,
}

static GLOBAL: OnceLock<Result<Registry, DriverError>> = OnceLock::new();

impl Registry {
    #[inline]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The process-wide registry over the drivers enabled at build time.
    /// Discovery runs once; later calls see the same platforms.
    pub fn global() -> Result<&'static Registry, DriverError> {
        GLOBAL
            .get_or_init(|| RegistryBuilder::installed().build())
            .as_ref()
            .map_err(Clone::clone)
    }

    #[inline]
    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    #[inline]
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.platforms.iter().flat_map(Platform::devices)
    }
}

#[derive(Debug, Default, Clone)]
pub struct RegistryBuilder {
    pub drivers: Vec<Arc<dyn Driver>>,
}

impl RegistryBuilder {
    /// A builder holding every driver enabled by cargo features.
    pub fn installed() -> Self {
        let builder = Self::default();
        #[cfg(feature = "opencl")]
        let builder = builder.driver(super::OpenCl::default());
        #[cfg(feature = "cuda")]
        let builder = builder.driver(super::Cuda::default());
        builder
    }

    pub fn driver(mut self, driver: impl Driver + 'static) -> Self {
        self.drivers.push(Arc::new(driver));
        self
    }

    /// Runs discovery on every driver. Fails if no driver exposes a platform.
    pub fn build(self) -> Result<Registry, DriverError> {
        let platforms = self
            .drivers
            .iter()
            .flat_map(|driver| {
                driver
                    .discover()
                    .into_iter()
                    .map(|spec| Platform::new(driver.clone(), spec))
            })
            .collect_vec();
        if platforms.is_empty() {
            let backends = self.drivers.iter().map(|driver| driver.kind()).join(", ");
            return Err(DriverError::BackendUnavailable(match backends.is_empty() {
                true => "no backend is enabled".into(),
                false => format!("no platform found on {backends}"),
            }));
        }
        for platform in &platforms {
            log::info!(
                "discovered {} platform {} with {} device(s)",
                platform.backend(),
                platform.name(),
                platform.devices().len()
            );
        }
        Ok(Registry { platforms })
    }
}

/// Lists the platforms of the process-wide registry.
pub fn list_platforms() -> Result<Vec<Platform>, DriverError> {
    Registry::global().map(|registry| registry.platforms().to_vec())
}

/// Process-wide fallbacks read by factories when the caller passes no explicit value.
#[derive(Debug, Default, Clone)]
pub struct Defaults {
    pub device: Option<Device>,
    pub queue_properties: QueueProperties,
}

static DEFAULTS: RwLock<Option<Defaults>> = RwLock::new(None);

fn read_defaults<T>(f: impl FnOnce(&Defaults) -> T) -> T {
    let defaults = DEFAULTS.read().expect("failed to lock defaults");
    match defaults.as_ref() {
        Some(defaults) => f(defaults),
        None => f(&Defaults::default()),
    }
}

fn write_defaults(f: impl FnOnce(&mut Defaults)) {
    let mut defaults = DEFAULTS.write().expect("failed to lock defaults");
    f(defaults.get_or_insert_with(Defaults::default))
}

/// The default device: the one set by [`set_default_device`], else the first discovered device.
pub fn default_device() -> Result<Device, DriverError> {
    if let Some(device) = read_defaults(|defaults| defaults.device.clone()) {
        return Ok(device);
    }
    Registry::global()?
        .devices()
        .next()
        .cloned()
        .ok_or_else(|| DriverError::BackendUnavailable("no device found".into()))
}

pub fn set_default_device(device: Device) {
    write_defaults(|defaults| defaults.device = Some(device))
}

#[inline]
pub fn default_queue_properties() -> QueueProperties {
    read_defaults(|defaults| defaults.queue_properties)
}

pub fn set_default_queue_properties(properties: QueueProperties) {
    write_defaults(|defaults| defaults.queue_properties = properties)
}

#[cfg(test)]
mod tests {
    use super::{Registry, RegistryBuilder, default_device, list_platforms, set_default_device};
    use crate::driver::{
        BackendKind, Cuda, DeviceSpec, DeviceType, DriverError, OpenCl, PlatformSpec, Vendor,
    };

    #[test]
    fn test_empty_registry() {
        let err = Registry::builder().build().unwrap_err();
        assert!(matches!(err, DriverError::BackendUnavailable(_)));

        let err = Registry::builder()
            .driver(OpenCl::new(vec![]))
            .driver(Cuda::new(vec![]))
            .build()
            .unwrap_err();
        let DriverError::BackendUnavailable(reason) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(reason.contains("OpenCL"));
        assert!(reason.contains("CUDA"));
    }

    #[test]
    fn test_discover() {
        let device = DeviceSpec {
            name: "Accelerator".into(),
            vendor: "Some Vendor".into(),
            device_type: DeviceType::Accelerator,
            ..Default::default()
        };
        let registry = Registry::builder()
            .driver(OpenCl::new(vec![PlatformSpec {
                name: "Vendor OpenCL".into(),
                devices: vec![device.clone()],
            }]))
            .driver(Cuda::new(vec![device.clone(), device]))
            .build()
            .unwrap();

        let platforms = registry.platforms();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[0].backend(), BackendKind::OpenCl);
        assert_eq!(platforms[0].devices()[0].device_type(), DeviceType::Accelerator);
        assert_eq!(platforms[0].devices()[0].vendor(), Vendor::Unknown);

        assert_eq!(platforms[1].name(), "CUDA");
        assert_eq!(platforms[1].devices().len(), 2);
        for device in platforms[1].devices() {
            assert_eq!(device.device_type(), DeviceType::Gpu);
            assert_eq!(device.vendor(), Vendor::Nvidia);
            assert_eq!(device.backend(), BackendKind::Cuda);
        }
        assert_eq!(registry.devices().count(), 3);
    }

    #[test]
    fn test_global() {
        let platforms = list_platforms().unwrap();
        let again = list_platforms().unwrap();
        let ids = |platforms: &[crate::driver::Platform]| {
            platforms.iter().map(|platform| platform.id()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&platforms), ids(&again));
        assert_eq!(platforms.len(), RegistryBuilder::installed().drivers.len());

        let device = platforms.last().unwrap().devices()[0].clone();
        set_default_device(device.clone());
        assert_eq!(default_device().unwrap(), device);
    }
}
