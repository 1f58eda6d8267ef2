use crate::arch::{self, interrupt};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

/// 持有期间关闭本核中断的自旋锁
///
/// 缺页处理可能在中断上下文里拿同一把锁，所以上锁前必须先关中断
#[derive(Default)]
pub struct Lock<T>(Mutex<T>);

// 使 LockGuard 的生命周期和 MutexGuard 一样
pub struct LockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    interrupt_state: usize,
}

impl<T> Lock<T> {
    pub const fn new(obj: T) -> Self {
        Self(Mutex::new(obj))
    }

    /// 关中断同时保存之前的中断状态
    pub fn lock(&self) -> LockGuard<'_, T> {
        let interrupt_state = interrupt::disable_and_store();
        LockGuard {
            guard: Some(self.0.lock()),
            interrupt_state,
        }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        let interrupt_state = interrupt::disable_and_store();
        match self.0.try_lock() {
            Some(guard) => Some(LockGuard {
                guard: Some(guard),
                interrupt_state,
            }),
            None => {
                interrupt::restore(interrupt_state);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.0.try_lock().is_none()
    }
}

/// 释放时，先释放内部的 MutexGuard，再恢复中断状态
impl<'a, T> Drop for LockGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        interrupt::restore(self.interrupt_state);
    }
}

impl<'a, T> core::ops::Deref for LockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> core::ops::DerefMut for LockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

const NO_OWNER: usize = usize::MAX;

/// 可重入自旋锁，同一个核可以重复上锁
///
/// 只给出共享引用，内部可变性由 `T` 自己负责（页目录里是 `RefCell`）。
/// 持锁期间中断关闭，不会被抢占，所以用核编号标识持有者。
pub struct ReentrantLock<T> {
    owner: AtomicUsize,
    /// 只有持有者会读写
    depth: UnsafeCell<usize>,
    data: T,
}

unsafe impl<T: Send> Send for ReentrantLock<T> {}
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    interrupt_state: usize,
}

impl<T> ReentrantLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let interrupt_state = interrupt::disable_and_store();
        let me = arch::cpu_id();
        if self.owner.load(Ordering::Acquire) == me {
            unsafe { *self.depth.get() += 1 };
        } else {
            while self
                .owner
                .compare_exchange_weak(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            unsafe { *self.depth.get() = 1 };
        }
        ReentrantGuard {
            lock: self,
            interrupt_state,
        }
    }

    /// 当前核是否持有这把锁
    pub fn is_locked_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == arch::cpu_id()
    }
}

impl<'a, T> Drop for ReentrantGuard<'a, T> {
    fn drop(&mut self) {
        unsafe {
            let depth = self.lock.depth.get();
            *depth -= 1;
            if *depth == 0 {
                self.lock.owner.store(NO_OWNER, Ordering::Release);
            }
        }
        interrupt::restore(self.interrupt_state);
    }
}

impl<'a, T> core::ops::Deref for ReentrantGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.lock.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reentrant_lock_can_be_taken_twice_by_owner() {
        let lock = ReentrantLock::new(RefCell::new(0));
        let outer = lock.lock();
        {
            let inner = lock.lock();
            *inner.borrow_mut() += 1;
        }
        assert!(lock.is_locked_by_current());
        *outer.borrow_mut() += 1;
        drop(outer);
        assert!(!lock.is_locked_by_current());
        assert_eq!(*lock.lock().borrow(), 2);
    }

    #[test]
    fn reentrant_lock_excludes_other_threads() {
        let lock = Arc::new(ReentrantLock::new(RefCell::new(0usize)));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let guard = lock.lock();
                        let again = lock.lock();
                        let value = *again.borrow();
                        *guard.borrow_mut() = value + 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock().borrow(), 4000);
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let lock = Lock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }
}
