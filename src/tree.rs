//! Expression trees: the computations handed to [`enqueue`](crate::runtime::enqueue).
//!
//! A tree is a flat list of nodes addressed by index. Leaves are arrays or scalars; inner
//! nodes apply an [`Operator`]. An assignment root writes its right-hand side into the array
//! on its left.

use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    array::{Array, Shape},
    driver::{Context, Operand},
    num::DataType,
};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("expression is empty")]
    Empty,
    #[error("shape mismatch: {0} vs {1}")]
    Shape(Shape, Shape),
    #[error("operands live on different contexts")]
    Context,
    #[error("operator {0} cannot be applied to {1} operand(s)")]
    Arity(Operator, usize),
    #[error("cannot assign a value of shape {1} to a destination of shape {0}")]
    Destination(Shape, Shape),
    #[error("expression has no array operand and therefore no context")]
    Detached,
    #[error("an assignment needs an array destination")]
    Assignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Operator {
    #[display("assign")]
    Assign,
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("pow")]
    Pow,
    #[display("max")]
    Max,
    #[display("min")]
    Min,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("abs")]
    Abs,
    #[display("neg")]
    Neg,
    #[display("exp")]
    Exp,
    #[display("log")]
    Log,
    #[display("sqrt")]
    Sqrt,
    #[display("sin")]
    Sin,
    #[display("cos")]
    Cos,
    #[display("tanh")]
    Tanh,
    #[display("floor")]
    Floor,
    #[display("ceil")]
    Ceil,
}

impl Operator {
    #[inline]
    pub fn is_assignment(self) -> bool {
        matches!(self, Operator::Assign)
    }

    /// Number of operands the operator takes.
    pub fn arity(self) -> usize {
        use Operator::*;
        match self {
            Abs | Neg | Exp | Log | Sqrt | Sin | Cos | Tanh | Floor | Ceil => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Array(Array),
    Scalar { value: f64, r#type: DataType },
    Binary { op: Operator, lhs: usize, rhs: usize },
    Unary { op: Operator, arg: usize },
}

/// Structural description of a tree: operators, leaf types and ranks.
/// Trees with equal signatures can run the same program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Display)]
pub struct Signature(String);

#[derive(Debug, Default, Clone)]
pub struct ExpressionTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    context: Option<Arc<Context>>,
}

impl From<&Array> for ExpressionTree {
    fn from(value: &Array) -> Self {
        Self {
            nodes: vec![Node::Array(value.view())],
            root: Some(0),
            context: Some(value.context().clone()),
        }
    }
}

impl From<Array> for ExpressionTree {
    #[inline]
    fn from(value: Array) -> Self {
        Self::from(&value)
    }
}

impl ExpressionTree {
    /// A tree with nothing to execute.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scalar leaf, rounded to `r#type`.
    pub fn scalar(value: f64, r#type: DataType) -> Self {
        let value = r#type.cast(value);
        Self {
            nodes: vec![Node::Scalar { value, r#type }],
            root: Some(0),
            context: None,
        }
    }

    /// Applies a binary operator. Array operands must agree in shape; scalars broadcast.
    ///
    /// Assignments are built with [`assign`](Self::assign).
    pub fn binary(
        op: Operator,
        lhs: impl Into<Self>,
        rhs: impl Into<Self>,
    ) -> Result<Self, TreeError> {
        if op.arity() != 2 {
            return Err(TreeError::Arity(op, 2));
        }
        if op.is_assignment() {
            return Err(TreeError::Assignment);
        }
        let (lhs, rhs) = (lhs.into(), rhs.into());
        match (lhs.shape(), rhs.shape()) {
            (Some(x), Some(y)) if x != y => return Err(TreeError::Shape(x, y)),
            _ => {}
        }
        Self::merge(lhs, rhs, |lhs, rhs| Node::Binary { op, lhs, rhs })
    }

    /// Applies a unary operator.
    pub fn unary(op: Operator, arg: impl Into<Self>) -> Result<Self, TreeError> {
        if op.arity() != 1 {
            return Err(TreeError::Arity(op, 1));
        }
        let mut tree: Self = arg.into();
        let arg = tree.root.ok_or(TreeError::Empty)?;
        tree.nodes.push(Node::Unary { op, arg });
        tree.root = Some(tree.nodes.len() - 1);
        Ok(tree)
    }

    /// Writes `rhs` into `lhs` in place.
    pub fn assign(lhs: &Array, rhs: impl Into<Self>) -> Result<Self, TreeError> {
        let rhs: Self = rhs.into();
        match rhs.shape() {
            Some(shape) if &shape != lhs.shape() => {
                return Err(TreeError::Destination(lhs.shape().clone(), shape));
            }
            _ => {}
        }
        let op = Operator::Assign;
        Self::merge(lhs.into(), rhs, |lhs, rhs| Node::Binary { op, lhs, rhs })
    }

    fn merge(
        lhs: Self,
        rhs: Self,
        f: impl FnOnce(usize, usize) -> Node,
    ) -> Result<Self, TreeError> {
        let (Some(x), Some(y)) = (lhs.root, rhs.root) else {
            return Err(TreeError::Empty);
        };
        let context = match (lhs.context, rhs.context) {
            (Some(x), Some(y)) if !Arc::ptr_eq(&x, &y) => return Err(TreeError::Context),
            (x, y) => x.or(y),
        };

        let offset = lhs.nodes.len();
        let shift = |node: Node| match node {
            Node::Binary { op, lhs, rhs } => Node::Binary {
                op,
                lhs: lhs + offset,
                rhs: rhs + offset,
            },
            Node::Unary { op, arg } => Node::Unary {
                op,
                arg: arg + offset,
            },
            node => node,
        };
        let mut nodes = lhs.nodes;
        nodes.extend(rhs.nodes.into_iter().map(shift));
        nodes.push(f(x, y + offset));

        let root = Some(nodes.len() - 1);
        Ok(Self {
            nodes,
            root,
            context,
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    pub fn root(&self) -> Option<usize> {
        self.root
    }

    #[inline]
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The context of the array operands, if any.
    #[inline]
    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    /// Returns `true` if the root operator writes into an existing array.
    pub fn is_assignment(&self) -> bool {
        matches!(
            self.root.map(|root| &self.nodes[root]),
            Some(Node::Binary { op, .. }) if op.is_assignment()
        )
    }

    /// The destination of an assignment root.
    pub fn destination(&self) -> Option<&Array> {
        let root = self.root?;
        match &self.nodes[root] {
            Node::Binary { op, lhs, .. } if op.is_assignment() => match &self.nodes[*lhs] {
                Node::Array(array) => Some(array),
                _ => None,
            },
            _ => None,
        }
    }

    /// The node whose value the tree computes: the right-hand side of an assignment, else the root.
    pub fn value(&self) -> Option<usize> {
        let root = self.root?;
        match &self.nodes[root] {
            Node::Binary { op, rhs, .. } if op.is_assignment() => Some(*rhs),
            _ => Some(root),
        }
    }

    /// Shape of the computed value; `None` for scalar-only trees.
    pub fn shape(&self) -> Option<Shape> {
        self.root.and_then(|root| self.node_shape(root))
    }

    fn node_shape(&self, index: usize) -> Option<Shape> {
        match &self.nodes[index] {
            Node::Array(array) => Some(array.shape().clone()),
            Node::Scalar { .. } => None,
            Node::Binary { lhs, rhs, .. } => {
                self.node_shape(*lhs).or_else(|| self.node_shape(*rhs))
            }
            Node::Unary { arg, .. } => self.node_shape(*arg),
        }
    }

    /// Element type of the computed value.
    pub fn data_type(&self) -> Option<DataType> {
        self.root.map(|root| self.node_type(root))
    }

    fn node_type(&self, index: usize) -> DataType {
        match &self.nodes[index] {
            Node::Array(array) => array.data_type(),
            Node::Scalar { r#type, .. } => *r#type,
            Node::Binary { op, lhs, .. } if op.is_assignment() => self.node_type(*lhs),
            Node::Binary { lhs, rhs, .. } => {
                let (x, y) = (self.node_type(*lhs), self.node_type(*rhs));
                // scalars adopt the type of the array side
                match (self.node_shape(*lhs), self.node_shape(*rhs)) {
                    (Some(_), None) => x,
                    (None, Some(_)) => y,
                    _ => x.promote(y),
                }
            }
            Node::Unary { arg, .. } => self.node_type(*arg),
        }
    }

    /// Leaf node indices under `index`, left to right.
    pub fn leaves(&self, index: usize) -> Vec<usize> {
        match &self.nodes[index] {
            Node::Array(_) | Node::Scalar { .. } => vec![index],
            Node::Binary { lhs, rhs, .. } => {
                let mut leaves = self.leaves(*lhs);
                leaves.extend(self.leaves(*rhs));
                leaves
            }
            Node::Unary { arg, .. } => self.leaves(*arg),
        }
    }

    /// Launch operands of the leaves under `index`, in leaf order.
    pub fn operands(&self, index: usize) -> Vec<Operand> {
        self.leaves(index)
            .into_iter()
            .filter_map(|leaf| match &self.nodes[leaf] {
                Node::Array(array) => Some(Operand::Array(array.view())),
                Node::Scalar { value, .. } => Some(Operand::Scalar(*value)),
                _ => None,
            })
            .collect()
    }

    /// The structural signature of the whole tree.
    pub fn signature(&self) -> Signature {
        match self.root {
            Some(root) => Signature(self.node_signature(root)),
            None => Signature(String::new()),
        }
    }

    fn node_signature(&self, index: usize) -> String {
        match &self.nodes[index] {
            Node::Array(array) => format!("{}:{}d", array.data_type(), array.shape().len()),
            Node::Scalar { r#type, .. } => format!("{type}:s"),
            Node::Binary { op, lhs, rhs } => {
                let args = [*lhs, *rhs]
                    .into_iter()
                    .map(|index| self.node_signature(index))
                    .join(",");
                format!("{op}({args})")
            }
            Node::Unary { op, arg } => format!("{op}({})", self.node_signature(*arg)),
        }
    }
}
