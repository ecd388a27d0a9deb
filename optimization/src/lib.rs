//! Numerical optimization machinery for basis-function fitting problems:
//! incremental normal-equation assembly, constrained non-negative least
//! squares, and damped double-buffered iterative refinement.

#[macro_use]
extern crate log;

pub mod error_report;
pub mod function;
pub mod iteration;
pub mod matrix_system;
pub mod nnls;
