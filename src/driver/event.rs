use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use super::{BackendKind, DriverError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Complete(Duration),
    Failed(String),
}

#[derive(Debug)]
struct EventInner {
    id: uid::Id<EventId>,
    backend: BackendKind,
    status: watch::Sender<Option<Status>>,
}

/// Completion token of one submitted operation.
///
/// Clones share the same token. The only mutable part is its resolution, which happens once.
#[derive(Debug, Clone)]
pub struct Event(Arc<EventInner>);

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Event {}

impl Event {
    /// Creates an unresolved event of `backend`. Resolve it with [`Event::complete`] or [`Event::fail`].
    pub fn new(backend: BackendKind) -> Self {
        let (status, _) = watch::channel(None);
        Self(Arc::new(EventInner {
            id: uid::Id::new(),
            backend,
            status,
        }))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<EventId> {
        self.0.id
    }

    #[inline]
    pub fn backend(&self) -> BackendKind {
        self.0.backend
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.0.status.borrow().is_some()
    }

    /// Time the operation spent executing on its queue.
    pub fn elapsed_time(&self) -> Result<Duration, DriverError> {
        match self.0.status.borrow().as_ref() {
            Some(Status::Complete(elapsed)) => Ok(*elapsed),
            Some(Status::Failed(reason)) => Err(DriverError::Execution(reason.clone())),
            None => Err(DriverError::EventNotResolved(self.0.id)),
        }
    }

    /// Waits until the event resolves and returns its elapsed time.
    pub async fn wait(&self) -> Result<Duration, DriverError> {
        let mut receiver = self.0.status.subscribe();
        let status = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|err| DriverError::Execution(err.to_string()))?
            .clone();
        match status {
            Some(Status::Complete(elapsed)) => Ok(elapsed),
            Some(Status::Failed(reason)) => Err(DriverError::Execution(reason)),
            None => unreachable!(),
        }
    }

    /// Marks a user event as complete. Has no effect on a resolved event.
    #[inline]
    pub fn complete(&self) {
        self.resolve_with(Status::Complete(Duration::ZERO));
    }

    /// Marks the event as failed. Has no effect on a resolved event.
    #[inline]
    pub fn fail(&self, reason: impl Into<String>) {
        self.resolve_with(Status::Failed(reason.into()));
    }

    #[inline]
    pub(crate) fn resolve(&self, elapsed: Duration) {
        self.resolve_with(Status::Complete(elapsed));
    }

    fn resolve_with(&self, status: Status) {
        self.0.status.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(status);
                true
            }
        });
    }
}
