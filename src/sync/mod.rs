//! 关中断的自旋锁

mod lock;

pub use lock::{Lock, LockGuard, ReentrantGuard, ReentrantLock};
