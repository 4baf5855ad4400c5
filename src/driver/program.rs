use std::sync::Arc;

use dyn_clone::DynClone;

use crate::{array::Array, num::DataType};

/// Compiled entry point of a [`Program`]. Runs on the queue's worker once all waits are met.
pub trait Kernel: DynClone + std::fmt::Debug + Send + Sync {
    fn launch(&self, args: &LaunchArgs) -> Result<(), String>;
}

dyn_clone::clone_trait_object!(Kernel);

/// A kernel argument bound at launch time.
#[derive(Debug, Clone)]
pub enum Operand {
    Array(Array),
    Scalar(f64),
}

/// Bindings of one launch: the output buffer and the operands in leaf order.
#[derive(Debug, Clone)]
pub struct LaunchArgs {
    pub output: Array,
    pub operands: Vec<Operand>,
}

/// A compiled program for one signature and variant.
#[derive(Debug, Clone)]
pub struct Program {
    /// Name of the program; the cache key's program part.
    pub name: String,
    /// The variant index this program was compiled for.
    pub variant: usize,
    /// Element types the program reads or writes.
    pub types: Vec<DataType>,
    /// Generated source, kept for diagnostics.
    pub source: Arc<str>,
    pub kernel: Box<dyn Kernel>,
}
