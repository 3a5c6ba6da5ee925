//! Buffered work queues shared between threads.
//!
//! A [`SharedQueue`] is a chain of fixed-capacity buffers behind a lock,
//! plus a pool of recycled buffers. Each thread works through a
//! [`LocalQueue`], which fills private buffers and only touches the shared
//! chain when a buffer fills up or runs dry.
//!
//! A local queue has two ends. [`LocalQueue::insert`] appends at the tail
//! and full tail buffers join the back of the shared chain, giving FIFO
//! order. [`LocalQueue::push`] adds at the head and full head buffers join
//! the front of the chain, giving LIFO order. [`LocalQueue::pop`] always
//! takes from the head.

mod local;
mod shared;

pub use local::LocalQueue;
pub use shared::SharedQueue;
