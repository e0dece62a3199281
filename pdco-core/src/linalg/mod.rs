//! Linear algebra layer.
//!
//! Sparse storage and kernels, dense vector kernels, the sparse LDL^T
//! backend, sparse LU/QR on faer, and the linear operators the Krylov
//! engine consumes.

pub mod sparse;
pub mod vector;
pub mod ldl;
pub mod sparse_direct;
pub mod operator;
