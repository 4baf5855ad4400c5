//! Backend-uniform model of platforms, devices, contexts, command queues and events.
//!
//! Each backend kind is served by one [`Driver`] implementation: [`OpenCl`] and [`Cuda`].
//! Everything above the driver (queues, events, the dispatcher) is shared; only the
//! backend calls differ.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use buffer::{Buffer, BufferId};
pub use context::{Context, ContextBuilder};
pub use cuda::Cuda;
pub use device::{Device, DeviceSpec, Platform, PlatformSpec};
pub use event::Event;
pub use opencl::OpenCl;
pub use program::{Kernel, LaunchArgs, Operand, Program};
pub use queue::{CommandQueue, Launch, QueueCommand, QueueProperties, Stream};
pub use registry::{Registry, RegistryBuilder, list_platforms};

pub mod buffer;
pub mod context;
pub mod cuda;
pub mod device;
pub mod event;
pub mod opencl;
pub mod program;
pub mod queue;
pub mod registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BackendKind {
    #[display("OpenCL")]
    OpenCl,
    #[display("CUDA")]
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceType {
    #[display("CPU")]
    Cpu,
    #[display("GPU")]
    Gpu,
    #[display("ACCELERATOR")]
    Accelerator,
}

impl DeviceType {
    /// Native type code of CPU devices.
    pub const CPU: u64 = 1 << 1;
    /// Native type code of GPU devices.
    pub const GPU: u64 = 1 << 2;
    /// Native type code of accelerator devices.
    pub const ACCELERATOR: u64 = 1 << 3;

    /// Converts a native device type code.
    pub fn from_raw(raw: u64) -> Result<Self, DriverError> {
        match raw {
            Self::CPU => Ok(Self::Cpu),
            Self::GPU => Ok(Self::Gpu),
            Self::ACCELERATOR => Ok(Self::Accelerator),
            raw => Err(DriverError::UnknownDeviceType(raw)),
        }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        match self {
            Self::Cpu => Self::CPU,
            Self::Gpu => Self::GPU,
            Self::Accelerator => Self::ACCELERATOR,
        }
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Accelerator => "ACCELERATOR",
        }
    }
}

/// Maps a native device type code to its label.
pub fn device_type_to_string(raw: u64) -> Result<&'static str, DriverError> {
    DeviceType::from_raw(raw).map(DeviceType::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Vendor {
    #[display("AMD")]
    Amd,
    #[display("INTEL")]
    Intel,
    #[display("NVIDIA")]
    Nvidia,
    #[display("UNKNOWN")]
    Unknown,
}

impl Vendor {
    /// Classifies a raw vendor string as reported by the driver.
    pub fn from_vendor_str(vendor: &str) -> Self {
        let vendor = vendor.to_lowercase();
        if vendor.contains("nvidia") {
            Self::Nvidia
        } else if vendor.contains("intel") {
            Self::Intel
        } else if vendor.contains("amd") || vendor.contains("advanced micro devices") {
            Self::Amd
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("no usable backend found: {0}")]
    BackendUnavailable(String),
    #[error("failed to initialize context on {device}: {reason}")]
    DeviceInit { device: String, reason: String },
    #[error("device {device} does not belong to context bound to {context}")]
    QueueMismatch { device: String, context: String },
    #[error("{backend} rejected queue properties: {reason}")]
    BackendUnsupported { backend: BackendKind, reason: String },
    #[error("event {0} is not resolved")]
    EventNotResolved(uid::Id<event::EventId>),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("unknown device type code {0:#x}")]
    UnknownDeviceType(u64),
}

/// The backend-call adapter. Exactly one implementation exists per [`BackendKind`].
pub trait Driver: std::fmt::Debug + Send + Sync {
    /// The backend this driver talks to.
    fn kind(&self) -> BackendKind;

    /// Enumerates the platforms and devices this backend exposes.
    fn discover(&self) -> Vec<PlatformSpec>;

    /// Allocates a native context on `device`.
    fn create_context(&self, device: &Device) -> Result<(), String>;

    /// Validates queue creation properties against `device`.
    fn check_queue(&self, device: &Device, properties: QueueProperties) -> Result<(), String>;

    /// Builds a compiled program for `device`.
    fn build_program(&self, device: &Device, program: &Program) -> Result<(), String>;

    /// Issues `launch` on `stream`, ordered after every event in `dependencies`.
    fn submit(&self, stream: &Stream, launch: Launch, dependencies: &[Event]) -> Result<(), String>;

    /// Whether `device` can run double precision programs.
    fn fp64_support(&self, device: &DeviceSpec) -> bool;

    /// Whether `device` can run half precision programs.
    fn fp16_support(&self, device: &DeviceSpec) -> bool;

    /// Diagnostic reported when an allocation does not fit.
    fn out_of_memory(&self, requested: usize, available: usize) -> String;
}
