//! Shared utilities for the tie-points workspace.

pub mod buffer2;
pub mod float_ext;
pub mod log_setup;
pub mod parallel;
pub mod row_ring;

pub use buffer2::Buffer2;
pub use float_ext::FloatExt;
pub use row_ring::RowRing;

pub const EPSILON: f64 = 1e-6;
