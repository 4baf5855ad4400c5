use thiserror::Error;

use crate::{
    driver::{Device, Program},
    tree::{ExpressionTree, Signature},
};

#[derive(Debug, Clone, Error)]
#[error("compilation error: {0}")]
pub struct CompileError(pub String);

/// Everything a compiler needs to produce one program variant.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// Program name; the cache key's program part.
    pub name: &'a str,
    pub signature: &'a Signature,
    pub tree: &'a ExpressionTree,
    /// Node whose value the program computes.
    pub root: usize,
    pub variant: usize,
    pub device: &'a Device,
}

/// Turns expression trees into programs for a context's device.
pub trait Compiler: std::fmt::Debug + Send + Sync {
    /// Number of variants the tuner may choose from for `signature`.
    fn variants(&self, _signature: &Signature) -> usize {
        1
    }

    fn compile(&self, request: CompileRequest<'_>) -> Result<Program, CompileError>;
}
