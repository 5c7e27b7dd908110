//! In-crate interpreter and backward builder, enough to run small programs
//! end to end on the CPU.

pub mod autodiff;
pub mod interpreter;
pub mod kernels;

pub use autodiff::ReferenceAutodiff;
pub use interpreter::ReferenceInterpreter;
