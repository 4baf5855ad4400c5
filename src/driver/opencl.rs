//! Host-emulated OpenCL-style driver.
//!
//! Dependencies travel with the launch as an event wait list; double and half precision
//! are gated by the `cl_khr_fp64` and `cl_khr_fp16` extensions.

use super::{
    BackendKind, Device, DeviceSpec, DeviceType, Driver, Event, Launch, PlatformSpec, Program,
    QueueCommand, QueueProperties, Stream,
};
use crate::num::DataType;

pub const FP64_EXTENSION: &str = "cl_khr_fp64";
pub const FP16_EXTENSION: &str = "cl_khr_fp16";

#[derive(Debug, Clone)]
pub struct OpenCl {
    platforms: Vec<PlatformSpec>,
}

impl Default for OpenCl {
    fn default() -> Self {
        let device = DeviceSpec {
            name: "Host CPU".into(),
            vendor: "Intel(R) Corporation".into(),
            device_type: DeviceType::Cpu,
            clock_rate: 2400,
            max_work_group_size: 8192,
            max_work_item_sizes: [8192, 8192, 8192],
            local_mem_size: 32 << 10,
            warp_size: 1,
            extensions: vec![FP64_EXTENSION.into(), FP16_EXTENSION.into()],
            out_of_order: true,
            ..Default::default()
        };
        Self::new(vec![PlatformSpec {
            name: "Host OpenCL".into(),
            devices: vec![device],
        }])
    }
}

impl OpenCl {
    pub fn new(platforms: Vec<PlatformSpec>) -> Self {
        Self { platforms }
    }

    #[inline]
    fn has_extension(device: &DeviceSpec, extension: &str) -> bool {
        device.extensions.iter().any(|x| x == extension)
    }
}

impl Driver for OpenCl {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn discover(&self) -> Vec<PlatformSpec> {
        self.platforms.clone()
    }

    fn create_context(&self, device: &Device) -> Result<(), String> {
        match device.spec().available {
            true => Ok(()),
            false => Err(format!("CL_DEVICE_NOT_AVAILABLE: {}", device.name())),
        }
    }

    fn check_queue(&self, device: &Device, properties: QueueProperties) -> Result<(), String> {
        if properties.out_of_order && !device.spec().out_of_order {
            return Err(format!(
                "CL_INVALID_QUEUE_PROPERTIES: {} does not support out-of-order execution",
                device.name()
            ));
        }
        Ok(())
    }

    fn build_program(&self, device: &Device, program: &Program) -> Result<(), String> {
        let spec = device.spec();
        for &r#type in &program.types {
            let supported = match r#type {
                DataType::F64 => self.fp64_support(spec),
                DataType::F16 => self.fp16_support(spec),
                _ => true,
            };
            if !supported {
                return Err(format!(
                    "CL_BUILD_PROGRAM_FAILURE: {} requires {} which {} does not support",
                    program.name,
                    r#type,
                    device.name(),
                ));
            }
        }
        Ok(())
    }

    fn submit(&self, stream: &Stream, launch: Launch, dependencies: &[Event]) -> Result<(), String> {
        let wait = dependencies.to_vec();
        stream
            .send(QueueCommand::Launch { launch, wait })
            .map_err(|err| format!("CL_INVALID_COMMAND_QUEUE: {err}"))
    }

    #[inline]
    fn fp64_support(&self, device: &DeviceSpec) -> bool {
        Self::has_extension(device, FP64_EXTENSION)
    }

    #[inline]
    fn fp16_support(&self, device: &DeviceSpec) -> bool {
        Self::has_extension(device, FP16_EXTENSION)
    }

    fn out_of_memory(&self, requested: usize, available: usize) -> String {
        format!(
            "CL_MEM_OBJECT_ALLOCATION_FAILURE: requested {requested} bytes, {available} available"
        )
    }
}
