//! `heddle` runs elementwise computations on heterogeneous devices through one uniform model
//! over an OpenCL-style and a CUDA-style backend.
//!
//! ## Key Components
//! 1. **Driver Model** ([`driver`]):
//!    - Platforms and devices discovered once per process through the [`driver::Registry`].
//!    - Contexts bound to one device, owning command queues and device memory.
//!    - Events with elapsed times, and dependency lists honored across queues.
//!
//! 2. **Expressions** ([`tree`], [`array`]):
//!    - Arrays are 1-D or 2-D column-major views over device buffers.
//!    - Expression trees describe the computation; an assignment root writes in place.
//!
//! 3. **Dispatch** ([`runtime`]):
//!    - [`enqueue`] compiles, optionally tunes, caches and launches a tree on a queue.
//!    - Each queue caches its plans; concurrent callers share a single build.
//!
//! 4. **Host Compiler** ([`hal`]):
//!    - A reference compiler evaluating expressions on host memory, with chunk-size variants.

pub mod array;
pub mod driver;
pub mod hal;
pub mod num;
pub mod platform;
pub mod runtime;
pub mod tree;

pub use array::{Array, Shape};
pub use driver::{
    BackendKind, CommandQueue, Context, Device, DeviceType, DriverError, Event, Platform,
    QueueProperties, Vendor, device_type_to_string, list_platforms,
};
pub use num::DataType;
pub use runtime::{EnqueueError, EnqueueOptions, enqueue};
pub use tree::{ExpressionTree, Operator};

/// Installs a tracy layer as the global tracing subscriber.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        log::warn!("failed to install tracing subscriber: {err}");
    }
}
