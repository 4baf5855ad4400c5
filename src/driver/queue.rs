use std::{sync::Arc, time::Duration};

use instant::Instant;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Context, Device, DriverError, Event, LaunchArgs, Program, context::ContextId, registry};
use crate::{platform, runtime::profiles::Profiles};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId;

/// Queue creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueProperties {
    /// Allow the backend to reorder independent submissions.
    pub out_of_order: bool,
    /// Record execution time on events. Without it events resolve with zero elapsed time.
    pub profiling: bool,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self {
            out_of_order: false,
            profiling: true,
        }
    }
}

/// One kernel launch: the program, its bindings and the event it resolves.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: Program,
    pub args: LaunchArgs,
    pub event: Event,
}

/// Commands understood by a queue worker.
#[derive(Debug)]
pub enum QueueCommand {
    /// Stall the queue until the event resolves.
    WaitEvent(Event),
    /// Run a launch once every event in `wait` has resolved.
    Launch { launch: Launch, wait: Vec<Event> },
    /// Reply once every command before this one has finished.
    Marker(flume::Sender<()>),
}

/// The native handle of a queue: the sending end of its worker.
#[derive(Debug, Clone)]
pub struct Stream(flume::Sender<QueueCommand>);

impl Stream {
    #[inline]
    pub fn send(&self, command: QueueCommand) -> Result<(), String> {
        self.0
            .send(command)
            .map_err(|_| "queue worker is not running".to_string())
    }
}

#[derive(Debug)]
struct QueueInner {
    id: uid::Id<QueueId>,
    context: uid::Id<ContextId>,
    device: Device,
    properties: QueueProperties,
    stream: Stream,
    profiles: Profiles,
}

/// An ordered submission channel on one device of a context.
#[derive(Debug, Clone)]
pub struct CommandQueue(Arc<QueueInner>);

impl PartialEq for CommandQueue {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for CommandQueue {}

impl CommandQueue {
    /// Creates a queue with the process-wide default properties.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(context: &Context, device: &Device) -> Result<Self, DriverError> {
        let properties = registry::default_queue_properties();
        Self::with_properties(context, device, properties)
    }

    /// Creates a queue with explicit properties and registers it with `context`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_properties(
        context: &Context,
        device: &Device,
        properties: QueueProperties,
    ) -> Result<Self, DriverError> {
        if context.device() != device {
            return Err(DriverError::QueueMismatch {
                device: device.to_string(),
                context: context.device().to_string(),
            });
        }
        device
            .driver()
            .check_queue(device, properties)
            .map_err(|reason| DriverError::BackendUnsupported {
                backend: device.backend(),
                reason,
            })?;

        let id = uid::Id::new();
        let (sender, receiver) = flume::unbounded();
        platform::spawn(serve(id, properties.profiling, receiver));

        let queue = Self(Arc::new(QueueInner {
            id,
            context: context.id(),
            device: device.clone(),
            properties,
            stream: Stream(sender),
            profiles: Profiles::default(),
        }));
        context.register(queue.clone());
        log::debug!("queue {id} created on {device} with {properties:?}");
        Ok(queue)
    }

    #[inline]
    pub fn id(&self) -> uid::Id<QueueId> {
        self.0.id
    }

    #[inline]
    pub fn context_id(&self) -> uid::Id<ContextId> {
        self.0.context
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.0.device
    }

    #[inline]
    pub fn properties(&self) -> QueueProperties {
        self.0.properties
    }

    /// The compiled program cache of this queue.
    #[inline]
    pub fn profiles(&self) -> &Profiles {
        &self.0.profiles
    }

    /// Fails if any of `dependencies` belongs to another backend.
    pub fn check_dependencies(&self, dependencies: &[Event]) -> Result<(), DriverError> {
        let backend = self.0.device.backend();
        match dependencies.iter().find(|event| event.backend() != backend) {
            Some(event) => Err(DriverError::Execution(format!(
                "dependency {} belongs to {}, queue {} runs on {backend}",
                event.id(),
                event.backend(),
                self.0.id,
            ))),
            None => Ok(()),
        }
    }

    /// Submits `program` through the backend, ordered after `dependencies`.
    /// Returns the event the launch resolves.
    pub fn submit(
        &self,
        program: Program,
        args: LaunchArgs,
        dependencies: &[Event],
    ) -> Result<Event, DriverError> {
        self.check_dependencies(dependencies)?;

        let device = &self.0.device;
        let event = Event::new(device.backend());
        let launch = Launch {
            program,
            args,
            event: event.clone(),
        };
        device
            .driver()
            .submit(&self.0.stream, launch, dependencies)
            .map_err(DriverError::Execution)?;
        Ok(event)
    }

    /// Waits until every operation submitted so far has finished. Idempotent.
    pub async fn synchronize(&self) {
        let (sender, receiver) = flume::bounded(1);
        if self.0.stream.send(QueueCommand::Marker(sender)).is_ok() {
            _ = receiver.recv_async().await;
        }
    }
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(receiver)))]
async fn serve(id: uid::Id<QueueId>, profiling: bool, receiver: flume::Receiver<QueueCommand>) {
    // failure of an awaited event, applied to the next launch
    let mut poison: Option<String> = None;

    while let Ok(command) = receiver.recv_async().await {
        match command {
            QueueCommand::WaitEvent(event) => {
                if let Err(err) = event.wait().await {
                    poison.get_or_insert(err.to_string());
                }
            }
            QueueCommand::Launch { launch, wait } => {
                let mut failure = poison.take();
                for event in &wait {
                    if let Err(err) = event.wait().await {
                        failure.get_or_insert(err.to_string());
                    }
                }

                let Launch {
                    program,
                    args,
                    event,
                } = launch;
                if let Some(reason) = failure {
                    log::warn!("queue {id}: skipped {}: dependency failed", program.name);
                    event.fail(format!("dependency failed: {reason}"));
                    continue;
                }

                let name = program.name.clone();
                let start = Instant::now();
                let result = platform::spawn_blocking(move || program.kernel.launch(&args)).await;
                let result = result.unwrap_or_else(|err| Err(err.to_string()));
                match result {
                    Ok(()) if profiling => event.resolve(start.elapsed()),
                    Ok(()) => event.resolve(Duration::ZERO),
                    Err(reason) => {
                        log::error!("queue {id}: {name} failed: {reason}");
                        event.fail(reason);
                    }
                }
            }
            QueueCommand::Marker(sender) => _ = sender.send_async(()).await,
        }
    }
    log::debug!("queue {id} stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::{CommandQueue, QueueProperties};
    use crate::{
        array::Array,
        driver::{
            BackendKind, Context, Cuda, DeviceSpec, DriverError, Event, Kernel, LaunchArgs,
            OpenCl, PlatformSpec, Program, Registry,
        },
        num::DataType,
    };

    /// Records its tag when launched.
    #[derive(Debug, Clone)]
    struct Probe {
        tag: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Kernel for Probe {
        fn launch(&self, _args: &LaunchArgs) -> Result<(), String> {
            std::thread::sleep(Duration::from_millis(2));
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    fn probe(tag: usize, log: &Arc<Mutex<Vec<usize>>>) -> Program {
        Program {
            name: format!("probe_{tag}"),
            variant: 0,
            types: vec![],
            source: "".into(),
            kernel: Box::new(Probe {
                tag,
                log: log.clone(),
            }),
        }
    }

    fn registry() -> Registry {
        let in_order = DeviceSpec {
            name: "In Order".into(),
            ..Default::default()
        };
        Registry::builder()
            .driver(OpenCl::default())
            .driver(OpenCl::new(vec![PlatformSpec {
                name: "Test OpenCL".into(),
                devices: vec![in_order],
            }]))
            .driver(Cuda::default())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create() {
        let registry = registry();
        let out_of_order = QueueProperties {
            out_of_order: true,
            ..Default::default()
        };

        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device).unwrap();
        let queue = CommandQueue::with_properties(&context, device, out_of_order).unwrap();
        assert_eq!(queue.context_id(), context.id());
        assert_eq!(queue.device(), device);
        assert_eq!(context.queues(), vec![queue.clone()]);
        assert!(queue.profiles().is_empty());

        let other = &registry.platforms()[2].devices()[0];
        let err = CommandQueue::new(&context, other).unwrap_err();
        assert!(matches!(err, DriverError::QueueMismatch { .. }));

        let device = &registry.platforms()[1].devices()[0];
        let context = Context::new(device).unwrap();
        let err = CommandQueue::with_properties(&context, device, out_of_order).unwrap_err();
        assert!(matches!(
            err,
            DriverError::BackendUnsupported { backend: BackendKind::OpenCl, ref reason }
                if reason.contains("CL_INVALID_QUEUE_PROPERTIES")
        ));
        assert!(context.queues().is_empty());

        let context = Context::new(other).unwrap();
        let err = CommandQueue::with_properties(&context, other, out_of_order).unwrap_err();
        assert!(matches!(
            err,
            DriverError::BackendUnsupported { backend: BackendKind::Cuda, .. }
        ));
        assert!(CommandQueue::new(&context, other).is_ok());
    }

    #[tokio::test]
    async fn test_ordering() {
        let registry = registry();
        for platform in [0, 2] {
            let device = &registry.platforms()[platform].devices()[0];
            let context = Context::new(device).unwrap();
            let x = CommandQueue::new(&context, device).unwrap();
            let y = CommandQueue::new(&context, device).unwrap();
            let output = Array::zeros(&context, 1usize, DataType::U8).unwrap();
            let args = LaunchArgs {
                output,
                operands: vec![],
            };

            let log = Arc::new(Mutex::new(vec![]));
            let gate = Event::new(device.backend());
            let first = x.submit(probe(0, &log), args.clone(), &[gate.clone()]).unwrap();
            let second = y.submit(probe(1, &log), args.clone(), &[first.clone()]).unwrap();
            let third = y.submit(probe(2, &log), args.clone(), &[]).unwrap();

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(log.lock().unwrap().is_empty());
            assert!(!third.is_resolved());

            gate.complete();
            context.synchronize().await;
            assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
            for event in [first, second, third] {
                assert!(event.is_resolved());
                assert!(event.elapsed_time().unwrap() > Duration::ZERO);
            }

            // synchronize is idempotent
            y.synchronize().await;
            y.synchronize().await;
        }
    }

    #[tokio::test]
    async fn test_profiling_disabled() {
        let registry = registry();
        let device = &registry.platforms()[2].devices()[0];
        let context = Context::new(device).unwrap();
        let properties = QueueProperties {
            profiling: false,
            ..Default::default()
        };
        let queue = CommandQueue::with_properties(&context, device, properties).unwrap();
        let args = LaunchArgs {
            output: Array::zeros(&context, 1usize, DataType::U8).unwrap(),
            operands: vec![],
        };

        let log = Arc::new(Mutex::new(vec![]));
        let event = queue.submit(probe(0, &log), args, &[]).unwrap();
        assert_eq!(event.wait().await.unwrap(), Duration::ZERO);
    }
}
