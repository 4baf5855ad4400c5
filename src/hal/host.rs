//! A compiler for elementwise expressions that runs programs on host memory.

use std::sync::Arc;

use itertools::Itertools;

use crate::{
    array::Array,
    driver::{Buffer, Kernel, LaunchArgs, Operand, Program},
    runtime::compiler::{CompileError, CompileRequest, Compiler},
    tree::{ExpressionTree, Node, Operator, Signature},
};

/// Lowers elementwise trees to postfix programs evaluated per element.
///
/// Each variant processes the output in chunks of a different size.
#[derive(Debug, Clone)]
pub struct HostCompiler {
    pub chunks: Vec<usize>,
}

impl Default for HostCompiler {
    fn default() -> Self {
        Self {
            chunks: vec![64, 256, 1024, 4096],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instruction {
    /// Push the element of operand `n`.
    Load(usize),
    Unary(Operator),
    Binary(Operator),
}

fn lower(
    tree: &ExpressionTree,
    index: usize,
    instructions: &mut Vec<Instruction>,
    operands: &mut usize,
) -> Result<(), CompileError> {
    match tree.node(index) {
        Node::Array(_) | Node::Scalar { .. } => {
            instructions.push(Instruction::Load(*operands));
            *operands += 1;
        }
        Node::Binary { op, .. } if op.is_assignment() => {
            return Err(CompileError("assignment is only allowed at the root".into()));
        }
        &Node::Binary { op, lhs, rhs } => {
            lower(tree, lhs, instructions, operands)?;
            lower(tree, rhs, instructions, operands)?;
            instructions.push(Instruction::Binary(op));
        }
        &Node::Unary { op, arg } => {
            lower(tree, arg, instructions, operands)?;
            instructions.push(Instruction::Unary(op));
        }
    }
    Ok(())
}

fn render(instructions: &[Instruction]) -> String {
    let mut stack: Vec<String> = vec![];
    for instruction in instructions {
        let expr = match *instruction {
            Instruction::Load(n) => format!("a{n}[i]"),
            Instruction::Unary(op) => {
                let x = stack.pop().unwrap_or_default();
                format!("{op}({x})")
            }
            Instruction::Binary(op) => {
                let y = stack.pop().unwrap_or_default();
                let x = stack.pop().unwrap_or_default();
                match infix(op) {
                    Some(symbol) => format!("({x} {symbol} {y})"),
                    None => format!("{op}({x}, {y})"),
                }
            }
        };
        stack.push(expr);
    }
    stack.pop().unwrap_or_default()
}

fn infix(op: Operator) -> Option<&'static str> {
    match op {
        Operator::Add => Some("+"),
        Operator::Sub => Some("-"),
        Operator::Mul => Some("*"),
        Operator::Div => Some("/"),
        Operator::Gt => Some(">"),
        Operator::Ge => Some(">="),
        Operator::Lt => Some("<"),
        Operator::Le => Some("<="),
        Operator::Eq => Some("=="),
        Operator::Ne => Some("!="),
        _ => None,
    }
}

#[inline]
fn truth(x: bool) -> f64 {
    match x {
        true => 1.0,
        false => 0.0,
    }
}

fn unary(op: Operator, x: f64) -> f64 {
    match op {
        Operator::Abs => x.abs(),
        Operator::Neg => -x,
        Operator::Exp => x.exp(),
        Operator::Log => x.ln(),
        Operator::Sqrt => x.sqrt(),
        Operator::Sin => x.sin(),
        Operator::Cos => x.cos(),
        Operator::Tanh => x.tanh(),
        Operator::Floor => x.floor(),
        Operator::Ceil => x.ceil(),
        _ => x,
    }
}

fn binary(op: Operator, x: f64, y: f64) -> f64 {
    match op {
        Operator::Add => x + y,
        Operator::Sub => x - y,
        Operator::Mul => x * y,
        Operator::Div => x / y,
        Operator::Pow => x.powf(y),
        Operator::Max => x.max(y),
        Operator::Min => x.min(y),
        Operator::Gt => truth(x > y),
        Operator::Ge => truth(x >= y),
        Operator::Lt => truth(x < y),
        Operator::Le => truth(x <= y),
        Operator::Eq => truth(x == y),
        Operator::Ne => truth(x != y),
        _ => y,
    }
}

impl Compiler for HostCompiler {
    fn variants(&self, _signature: &Signature) -> usize {
        self.chunks.len()
    }

    fn compile(&self, request: CompileRequest<'_>) -> Result<Program, CompileError> {
        let CompileRequest {
            name,
            signature,
            tree,
            root,
            variant,
            device,
        } = request;

        let chunk = match self.chunks.get(variant) {
            Some(&chunk) if chunk > 0 => chunk,
            Some(_) => return Err(CompileError(format!("variant {variant} has an empty chunk"))),
            None => {
                return Err(CompileError(format!(
                    "variant {variant} out of range: {} variant(s) available",
                    self.chunks.len()
                )));
            }
        };

        let mut instructions = vec![];
        let mut operands = 0;
        lower(tree, root, &mut instructions, &mut operands)?;

        let output = tree
            .data_type()
            .ok_or_else(|| CompileError("expression is empty".into()))?;
        let types = tree
            .leaves(root)
            .into_iter()
            .filter_map(|leaf| match tree.node(leaf) {
                Node::Array(array) => Some(array.data_type()),
                Node::Scalar { r#type, .. } => Some(*r#type),
                _ => None,
            })
            .chain([output])
            .sorted()
            .dedup()
            .collect_vec();

        let source = format!(
            "// {signature} on {device}, chunk {chunk}\nout[i] = {};\n",
            render(&instructions)
        );
        log::trace!("compiled {name} variant {variant}:\n{source}");

        Ok(Program {
            name: name.into(),
            variant,
            types,
            source: source.into(),
            kernel: Box::new(HostKernel {
                instructions: instructions.into(),
                operands,
                chunk,
            }),
        })
    }
}

#[derive(Debug, Clone)]
struct HostKernel {
    instructions: Arc<[Instruction]>,
    operands: usize,
    chunk: usize,
}

enum Source<'a> {
    Array { slot: usize, array: &'a Array },
    Scalar(f64),
}

impl Kernel for HostKernel {
    fn launch(&self, args: &LaunchArgs) -> Result<(), String> {
        let LaunchArgs { output, operands } = args;
        if operands.len() != self.operands {
            return Err(format!(
                "expected {} operand(s), got {}",
                self.operands,
                operands.len()
            ));
        }

        // one read lock per distinct buffer
        let mut buffers: Vec<&Buffer> = vec![];
        let mut sources = vec![];
        for operand in operands {
            let source = match operand {
                Operand::Array(array) if array.len() != output.len() => {
                    return Err(format!(
                        "operand of shape {} does not match output of shape {}",
                        array.shape(),
                        output.shape()
                    ));
                }
                Operand::Array(array) => {
                    let slot = match buffers.iter().position(|&x| x == array.buffer()) {
                        Some(slot) => slot,
                        None => {
                            buffers.push(array.buffer());
                            buffers.len() - 1
                        }
                    };
                    Source::Array { slot, array }
                }
                &Operand::Scalar(value) => Source::Scalar(value),
            };
            sources.push(source);
        }
        let guards = buffers.iter().map(|buffer| buffer.read()).collect_vec();

        let eval = |base: usize, values: &mut [f64]| {
            let mut stack = Vec::with_capacity(8);
            for (offset, value) in values.iter_mut().enumerate() {
                let index = base + offset;
                stack.clear();
                for instruction in self.instructions.iter() {
                    let x = match *instruction {
                        Instruction::Load(n) => match &sources[n] {
                            Source::Array { slot, array } => array
                                .data_type()
                                .load(&guards[*slot], array.offset(index)),
                            Source::Scalar(value) => *value,
                        },
                        Instruction::Unary(op) => {
                            let x = stack.pop().unwrap_or_default();
                            unary(op, x)
                        }
                        Instruction::Binary(op) => {
                            let y = stack.pop().unwrap_or_default();
                            let x = stack.pop().unwrap_or_default();
                            binary(op, x, y)
                        }
                    };
                    stack.push(x);
                }
                *value = stack.pop().unwrap_or_default();
            }
        };

        let mut values = vec![0.0; output.len()];
        #[cfg(not(feature = "rayon"))]
        values
            .chunks_mut(self.chunk)
            .enumerate()
            .for_each(|(index, values)| eval(index * self.chunk, values));
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            values
                .par_chunks_mut(self.chunk)
                .enumerate()
                .for_each(|(index, values)| eval(index * self.chunk, values));
        }
        drop(guards);

        let r#type = output.data_type();
        let mut data = output.buffer().write();
        for (index, value) in values.into_iter().enumerate() {
            r#type.store(&mut data, output.offset(index), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HostCompiler;
    use crate::{
        array::Array,
        driver::{Context, LaunchArgs, OpenCl, Registry},
        num::DataType,
        runtime::compiler::{CompileRequest, Compiler},
        tree::{ExpressionTree, Operator},
    };

    #[test]
    fn test_compile_and_launch() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::builder().driver(OpenCl::default()).build()?;
        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device)?;

        let data = (0..300).map(|_| fastrand::f32() * 4.0 - 2.0).collect::<Vec<_>>();
        let x = Array::from_slice(&context, [100usize, 3], &data)?;
        let y = Array::zeros(&context, [100usize, 3], DataType::F32)?;

        // max(exp(x), 1) > 1.5
        let tree = ExpressionTree::unary(Operator::Exp, &x)?;
        let tree = ExpressionTree::binary(
            Operator::Max,
            tree,
            ExpressionTree::scalar(1.0, DataType::F32),
        )?;
        let tree = ExpressionTree::binary(
            Operator::Gt,
            tree,
            ExpressionTree::scalar(1.5, DataType::F32),
        )?;
        let root = tree.value().unwrap();
        let signature = tree.signature();

        let compiler = HostCompiler::default();
        assert_eq!(compiler.variants(&signature), 4);
        for variant in 0..4 {
            let program = compiler.compile(CompileRequest {
                name: "test",
                signature: &signature,
                tree: &tree,
                root,
                variant,
                device,
            })?;
            assert_eq!(program.variant, variant);
            assert_eq!(program.types, vec![DataType::F32]);
            assert!(program.source.contains("(max(exp(a0[i]), a1[i]) > a2[i])"));

            let args = LaunchArgs {
                output: y.view(),
                operands: tree.operands(root),
            };
            program.kernel.launch(&args)?;

            let output = y.read::<f32>()?;
            for (x, y) in data.iter().zip(output) {
                let expected = if (*x as f64).exp().max(1.0) > 1.5 { 1.0 } else { 0.0 };
                assert_eq!(y, expected);
            }
        }

        let err = compiler.compile(CompileRequest {
            name: "test",
            signature: &signature,
            tree: &tree,
            root,
            variant: 4,
            device,
        });
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn test_in_place() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::builder().driver(OpenCl::default()).build()?;
        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device)?;

        let x = Array::from_slice(&context, 4usize, &[1i32, -2, 3, -4])?;
        let tree = ExpressionTree::binary(Operator::Mul, &x, &x)?;
        let tree = ExpressionTree::binary(Operator::Sub, tree, ExpressionTree::unary(Operator::Abs, &x)?)?;
        let tree = ExpressionTree::assign(&x, tree)?;
        let root = tree.value().unwrap();
        let signature = tree.signature();

        let program = HostCompiler::default().compile(CompileRequest {
            name: "square",
            signature: &signature,
            tree: &tree,
            root,
            variant: 0,
            device,
        })?;
        let args = LaunchArgs {
            output: tree.destination().unwrap().view(),
            operands: tree.operands(root),
        };
        program.kernel.launch(&args)?;
        assert_eq!(x.read::<i32>()?, vec![0, 2, 6, 12]);
        Ok(())
    }
}
