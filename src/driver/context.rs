use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use super::{BackendKind, Buffer, CommandQueue, Device, DriverError, registry};
use crate::{hal::HostCompiler, runtime::compiler::Compiler};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId;

/// An execution scope bound to one [`Device`].
///
/// A context has unique identity: it is handed out as `Arc<Context>` and never cloned.
#[derive(Debug)]
pub struct Context {
    id: uid::Id<ContextId>,
    device: Device,
    compiler: Arc<dyn Compiler>,
    queues: RwLock<Vec<CommandQueue>>,
    usage: Arc<AtomicUsize>,
}

impl Drop for Context {
    fn drop(&mut self) {
        log::debug!("context {} on {} destroyed", self.id, self.device);
    }
}

impl Context {
    /// Creates a context on `device` with the host compiler.
    #[inline]
    pub fn new(device: &Device) -> Result<Arc<Self>, DriverError> {
        Self::builder(device).build()
    }

    /// Creates a context on the process-wide default device.
    pub fn with_default_device() -> Result<Arc<Self>, DriverError> {
        let device = registry::default_device()?;
        Self::new(&device)
    }

    #[inline]
    pub fn builder(device: &Device) -> ContextBuilder {
        ContextBuilder::new(device.clone())
    }

    #[inline]
    pub fn id(&self) -> uid::Id<ContextId> {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.device.backend()
    }

    #[inline]
    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    /// Queues currently live on this context, in creation order.
    #[inline]
    pub fn queues(&self) -> Vec<CommandQueue> {
        self.queues.read().expect("failed to lock").clone()
    }

    pub(crate) fn register(&self, queue: CommandQueue) {
        self.queues.write().expect("failed to lock").push(queue);
    }

    /// Waits until every queue of the context has drained.
    pub async fn synchronize(&self) {
        let queues = self.queues();
        futures::future::join_all(queues.iter().map(CommandQueue::synchronize)).await;
    }

    /// Bytes of device memory currently allocated through this context.
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    /// Allocates `size` zeroed bytes of device memory.
    pub fn alloc(&self, size: usize) -> Result<Buffer, DriverError> {
        let capacity = self.device.global_mem_size();
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                usage.checked_add(size).filter(|&total| total <= capacity)
            })
            .map_err(|usage| {
                let available = capacity.saturating_sub(usage);
                let reason = self.device.driver().out_of_memory(size, available);
                log::warn!("allocation of {size} bytes on {} failed: {reason}", self.device);
                DriverError::Execution(reason)
            })?;
        Ok(Buffer::new(self.id, self.backend(), size, self.usage.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    pub device: Device,
    pub compiler: Arc<dyn Compiler>,
}

impl ContextBuilder {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            compiler: Arc::new(HostCompiler::default()),
        }
    }

    /// Sets the compiler that turns expression trees into programs for this context.
    pub fn compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn build(self) -> Result<Arc<Context>, DriverError> {
        let Self { device, compiler } = self;
        device
            .driver()
            .create_context(&device)
            .map_err(|reason| DriverError::DeviceInit {
                device: device.to_string(),
                reason,
            })?;

        let id = uid::Id::new();
        log::debug!("context {id} created on {device}");

        let queues = RwLock::new(vec![]);
        let usage = Arc::new(AtomicUsize::new(0));
        Ok(Arc::new(Context {
            id,
            device,
            compiler,
            queues,
            usage,
        }))
    }
}
