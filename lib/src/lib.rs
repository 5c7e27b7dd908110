//! Replays one traced eager execution as a cached static program.
//!
//! A [`PartialProgram`] owns an immutable base [`Program`] plus the nested
//! input/output templates recorded while tracing. On every call it binds fresh
//! runtime tensors, picks the train or infer variant of the program (each
//! derived lazily, at most once) and hands the work to an [`Interpreter`].

pub mod bridge;
pub mod collaborators;
pub mod config;
pub mod lazy;
pub mod nest;
pub mod program;
pub mod prune;
pub mod reference;
pub mod returned;
pub mod scope;
pub mod tensor;
pub mod utils;
pub mod variants;

pub use bridge::*;
pub use collaborators::*;
pub use config::Config;
pub use nest::{FlatTemplate, Leaf, Nested, Slot};
pub use program::{Attr, Block, Operator, Program, Variable};
pub use returned::{OutputLeaf, Returned, SeqKind, NO_VALUE_MAGIC};
pub use scope::Scope;
pub use tensor::{ArrayData, DType, Parameter, Place, RuntimeTensor, VarKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("cannot restore nested structure: template has {expected} leaves, got {actual} values")]
  StructuralMismatch { expected: usize, actual: usize },
  #[error("input #{index} is a tensor but the traced input at that position is not a variable")]
  InputTemplateMismatch { index: usize },
  #[error("parameter #{index} ({name}) is not a persistable tensor")]
  TypeContract { index: usize, name: String },
  #[error(
    "parameter ({name}) is defined inside the traced function. Parameters are re-created on every \
     run there; declare them up front and pass them in the parameter list instead"
  )]
  UndeclaredParameter { name: String },
  #[error("program has no global block")]
  EmptyProgram,
  #[error("operator {op} is not supported")]
  UnsupportedOperator { op: String },
  #[error("{op}: incompatible operand sizes {lhs} and {rhs}")]
  ShapeMismatch { op: String, lhs: usize, rhs: usize },
  #[error("no value computed for {name}")]
  MissingValue { name: String },
  #[error("interpreter failed: {0}")]
  Interpreter(String),
  #[error("backward construction failed: {0}")]
  Autodiff(String),
}

pub type Result<T> = std::result::Result<T, Error>;
