//! Port adapters.

pub mod memory;

pub use memory::{
    DependencyScheduler, InMemoryExpressionStore, InMemoryInvocationStore, InMemoryTaskExecutor,
    InMemoryWorkflowCache, LoopbackTaskApi,
};
