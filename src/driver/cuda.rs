//! Host-emulated CUDA-style driver.
//!
//! Every device is an NVIDIA GPU behind a single "CUDA" platform. Streams are in-order and
//! cross-stream dependencies are expressed as stream-wait-event commands ahead of the launch.

use super::{
    BackendKind, Device, DeviceSpec, DeviceType, Driver, Event, Launch, PlatformSpec, Program,
    QueueCommand, QueueProperties, Stream,
};

pub const PLATFORM_NAME: &str = "CUDA";
pub const VENDOR: &str = "NVidia";

#[derive(Debug, Clone)]
pub struct Cuda {
    devices: Vec<DeviceSpec>,
}

impl Default for Cuda {
    fn default() -> Self {
        let device = DeviceSpec {
            name: "Host CUDA Device".into(),
            clock_rate: 1500,
            compute_capability: (7, 5),
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            local_mem_size: 48 << 10,
            warp_size: 32,
            ..Default::default()
        };
        Self::new(vec![device])
    }
}

impl Cuda {
    pub fn new(devices: Vec<DeviceSpec>) -> Self {
        Self { devices }
    }
}

impl Driver for Cuda {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn discover(&self) -> Vec<PlatformSpec> {
        if self.devices.is_empty() {
            return vec![];
        }
        let devices = self
            .devices
            .iter()
            .cloned()
            .map(|device| DeviceSpec {
                vendor: VENDOR.into(),
                device_type: DeviceType::Gpu,
                ..device
            })
            .collect();
        vec![PlatformSpec {
            name: PLATFORM_NAME.into(),
            devices,
        }]
    }

    fn create_context(&self, device: &Device) -> Result<(), String> {
        match device.spec().available {
            true => Ok(()),
            false => Err(format!(
                "CUDA_ERROR_NO_DEVICE: {} cannot host a context",
                device.name()
            )),
        }
    }

    fn check_queue(&self, _device: &Device, properties: QueueProperties) -> Result<(), String> {
        if properties.out_of_order {
            return Err("CUDA_ERROR_INVALID_VALUE: streams execute in order".into());
        }
        Ok(())
    }

    fn build_program(&self, _device: &Device, _program: &Program) -> Result<(), String> {
        Ok(())
    }

    fn submit(&self, stream: &Stream, launch: Launch, dependencies: &[Event]) -> Result<(), String> {
        let map_err = |err| format!("CUDA_ERROR_INVALID_HANDLE: {err}");
        for event in dependencies {
            stream
                .send(QueueCommand::WaitEvent(event.clone()))
                .map_err(map_err)?;
        }
        let wait = vec![];
        stream
            .send(QueueCommand::Launch { launch, wait })
            .map_err(map_err)
    }

    #[inline]
    fn fp64_support(&self, _device: &DeviceSpec) -> bool {
        true
    }

    #[inline]
    fn fp16_support(&self, _device: &DeviceSpec) -> bool {
        true
    }

    fn out_of_memory(&self, requested: usize, available: usize) -> String {
        format!("CUDA_ERROR_OUT_OF_MEMORY: requested {requested} bytes, {available} available")
    }
}
