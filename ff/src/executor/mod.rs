//! Parallel execution of independent work items

mod parallel;

pub use parallel::{ParallelConfig, ParallelExecutor, WorkItem, WorkResult};
