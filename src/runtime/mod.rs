//! The dispatcher: runs expression trees on command queues.

use std::{hash::Hasher, sync::Arc, time::Duration};

use instant::Instant;
use rustc_hash::FxHasher;
use thiserror::Error;

use crate::{
    array::{Array, ArrayError},
    driver::{CommandQueue, Context, DriverError, Event, LaunchArgs, Program},
    platform,
    tree::{ExpressionTree, Signature, TreeError},
};
use compiler::{CompileError, CompileRequest};
use profiles::{Plan, ProfileKey};

pub mod compiler;
pub mod profiles;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid queue id {id}: context has {count} queue(s)")]
    InvalidQueue { id: usize, count: usize },
    #[error("nothing to execute: expression is empty")]
    EmptyTree,
    #[error(transparent)]
    Compilation(#[from] CompileError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Array(ArrayError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<ArrayError> for EnqueueError {
    fn from(value: ArrayError) -> Self {
        match value {
            ArrayError::Driver(err) => Self::Driver(err),
            err => Self::Array(err),
        }
    }
}

/// Parameters of one [`enqueue`] call.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Index of the queue within the tree's context.
    pub queue_id: usize,
    /// Events the launch must be ordered after.
    pub dependencies: Vec<Event>,
    /// Benchmark every variant and keep the fastest.
    pub tune: bool,
    /// Pins the program variant. Negative values mean no label.
    pub label: i64,
    /// Cache name of the program; empty derives one from the signature.
    pub program_name: String,
    /// Rebuild even if a plan is cached.
    pub force_recompile: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue_id: 0,
            dependencies: vec![],
            tune: false,
            label: -1,
            program_name: String::new(),
            force_recompile: false,
        }
    }
}

impl EnqueueOptions {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue_id: usize) -> Self {
        self.queue_id = queue_id;
        self
    }

    pub fn dependencies(mut self, dependencies: impl IntoIterator<Item = Event>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn tune(mut self, tune: bool) -> Self {
        self.tune = tune;
        self
    }

    pub fn label(mut self, label: i64) -> Self {
        self.label = label;
        self
    }

    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = name.into();
        self
    }

    pub fn force_recompile(mut self, force: bool) -> Self {
        self.force_recompile = force;
        self
    }
}

/// Cache name derived from a signature.
pub fn default_program_name(signature: &Signature) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(signature.as_bytes());
    format!("program_{:016x}", hasher.finish())
}

/// Runs `tree` on a queue of its context.
///
/// An assignment root writes into its destination and the result aliases the destination's
/// buffer. Any other root is materialized into a newly allocated array. Returns the result and
/// the events produced by this submission; the work itself runs asynchronously.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(queue = options.queue_id)))]
pub async fn enqueue(
    tree: &ExpressionTree,
    options: EnqueueOptions,
) -> Result<(Array, Vec<Event>), EnqueueError> {
    let Some(value) = tree.value() else {
        return Err(EnqueueError::EmptyTree);
    };
    let context = tree.context().ok_or(TreeError::Detached)?;

    let queues = context.queues();
    let queue = queues
        .get(options.queue_id)
        .ok_or(EnqueueError::InvalidQueue {
            id: options.queue_id,
            count: queues.len(),
        })?;
    queue.check_dependencies(&options.dependencies)?;

    let output = match tree.destination() {
        Some(destination) => destination.view(),
        None if tree.is_assignment() => return Err(TreeError::Assignment.into()),
        None => {
            let shape = tree.shape().ok_or(TreeError::Detached)?;
            let r#type = tree.data_type().ok_or(EnqueueError::EmptyTree)?;
            Array::zeros(context, shape, r#type)?
        }
    };

    let signature = tree.signature();
    let key = ProfileKey {
        program: match options.program_name.is_empty() {
            true => default_program_name(&signature),
            false => options.program_name.clone(),
        },
        signature,
        label: usize::try_from(options.label).ok(),
    };

    let builder = PlanBuilder {
        context,
        queue,
        tree,
        value,
        key: &key,
        output: &output,
    };
    let plan = queue
        .profiles()
        .get_or_build(&key, options.force_recompile, || builder.build(options.tune))
        .await?;

    let args = LaunchArgs {
        output: output.view(),
        operands: tree.operands(value),
    };
    let event = queue.submit(plan.program.clone(), args, &options.dependencies)?;
    log::debug!(
        "enqueued {} variant {} on queue {}",
        plan.program.name,
        plan.program.variant,
        queue.id()
    );
    Ok((output.view(), vec![event]))
}

struct PlanBuilder<'a> {
    context: &'a Arc<Context>,
    queue: &'a CommandQueue,
    tree: &'a ExpressionTree,
    value: usize,
    key: &'a ProfileKey,
    output: &'a Array,
}

impl PlanBuilder<'_> {
    fn compile(&self, variant: usize) -> Result<Program, EnqueueError> {
        let device = self.context.device();
        let program = self.context.compiler().compile(CompileRequest {
            name: &self.key.program,
            signature: &self.key.signature,
            tree: self.tree,
            root: self.value,
            variant,
            device,
        })?;
        device
            .driver()
            .build_program(device, &program)
            .map_err(CompileError)?;
        Ok(program)
    }

    /// Runs `program` into a scratch output and returns its execution time.
    ///
    /// The run only reads the operands, so it bypasses the queue and never waits on its work.
    async fn benchmark(&self, program: &Program) -> Result<Duration, EnqueueError> {
        let output = Array::zeros(self.context, self.output.shape().clone(), self.output.data_type())?;
        let args = LaunchArgs {
            output,
            operands: self.tree.operands(self.value),
        };
        let kernel = program.kernel.clone();
        let start = Instant::now();
        platform::spawn_blocking(move || kernel.launch(&args))
            .await
            .unwrap_or_else(|err| Err(err.to_string()))
            .map_err(DriverError::Execution)?;
        match self.queue.properties().profiling {
            true => Ok(start.elapsed()),
            false => Ok(Duration::ZERO),
        }
    }

    async fn build(self, tune: bool) -> Result<Plan, EnqueueError> {
        let variants = self.context.compiler().variants(&self.key.signature).max(1);

        if let Some(label) = self.key.label {
            if label >= variants {
                return Err(CompileError(format!(
                    "label {label} out of range: {variants} variant(s) available"
                ))
                .into());
            }
            return Ok(Plan::new(self.compile(label)?));
        }

        if !tune || variants == 1 {
            return Ok(Plan::new(self.compile(0)?));
        }

        let mut best: Option<(Program, Duration)> = None;
        for variant in 0..variants {
            let program = self.compile(variant)?;
            let elapsed = self.benchmark(&program).await?;
            log::debug!(
                "tuning {}: variant {variant} took {elapsed:?}",
                self.key.program
            );
            if best.as_ref().is_none_or(|(_, time)| elapsed < *time) {
                best = Some((program, elapsed));
            }
        }
        let (program, elapsed) = best.ok_or_else(|| CompileError("no variant to tune".into()))?;
        log::info!(
            "tuned {}: picked variant {} ({elapsed:?})",
            self.key.program,
            program.variant
        );
        Ok(Plan {
            tuned: true,
            elapsed: Some(elapsed),
            ..Plan::new(program)
        })
    }
}
