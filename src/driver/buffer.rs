use std::sync::{
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicUsize, Ordering},
};

use super::{BackendKind, context::ContextId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId;

#[derive(Debug)]
struct BufferInner {
    id: uid::Id<BufferId>,
    context: uid::Id<ContextId>,
    backend: BackendKind,
    data: RwLock<Box<[u8]>>,
    /// Bytes in use on the owning context; released on drop.
    usage: Arc<AtomicUsize>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let size = self.data.get_mut().map(|data| data.len()).unwrap_or_default();
        self.usage.fetch_sub(size, Ordering::AcqRel);
    }
}

/// Device memory owned by a context. Clones alias the same storage.
#[derive(Debug, Clone)]
pub struct Buffer(Arc<BufferInner>);

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Buffer {}

impl Buffer {
    /// Wraps zeroed storage of `size` bytes already accounted for in `usage`.
    pub(crate) fn new(
        context: uid::Id<ContextId>,
        backend: BackendKind,
        size: usize,
        usage: Arc<AtomicUsize>,
    ) -> Self {
        let data = RwLock::new(vec![0; size].into_boxed_slice());
        Self(Arc::new(BufferInner {
            id: uid::Id::new(),
            context,
            backend,
            data,
            usage,
        }))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<BufferId> {
        self.0.id
    }

    /// The context that allocated this buffer.
    #[inline]
    pub fn context(&self) -> uid::Id<ContextId> {
        self.0.context
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.0.backend
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.0.data.read().expect("failed to lock buffer")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.0.data.write().expect("failed to lock buffer")
    }
}
