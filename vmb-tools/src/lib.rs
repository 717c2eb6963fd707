pub mod buffer_pool;
pub mod crypt_config;
pub mod fingerprint;
pub mod liveness_queue;
pub mod parallel_handler;
pub mod retry;

pub use buffer_pool::{BufferHandle, BufferPool};
pub use fingerprint::{fingerprint, is_zero_block};
pub use liveness_queue::LivenessQueue;
pub use parallel_handler::ParallelHandler;
