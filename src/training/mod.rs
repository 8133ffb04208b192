//! Training infrastructure: the epoch loop, callbacks, optimizer adaptors,
//! metric aggregation, and the gradient-capturing batch strategies.

pub mod callbacks;
pub mod capture;
pub mod gradients;
pub mod metrics;
pub mod optimizer;
pub mod trainer;
