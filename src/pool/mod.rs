//! Pooling layer - transmission buffers and completion state objects.
//!
//! Both pools exist for the same reason: at target throughput, allocating
//! a buffer and a completion state per frame would dominate cost. Buffers
//! are bucketed by size class; state objects go through a generic pool
//! parameterised by create/reset/can_reuse/destroy hooks.

mod buffer_pool;
mod object_pool;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use object_pool::{ObjectPool, PoolHooks};
