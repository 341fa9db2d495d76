use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// 进程内唯一的快照修订号。
///
/// # 设计背景（Why）
/// - 下游缓存（端点缓存、路由分桶）只需要回答“上游快照是否变化”，因此修订号只承诺
///   “同一快照同一值、不同快照不同值”，并不携带时间语义；
/// - 全进程共享同一个单调计数器，即便不同服务的快照也不会撞号，便于日志关联。
///
/// # 契约说明（What）
/// - 通过 [`Revision::next`] 分配的值严格递增，因此较新的快照拥有更大的修订号；
/// - [`Revision::ZERO`] 保留给“尚无快照”的占位场景，`next` 永远不会返回它。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

impl Revision {
    /// 占位修订号，表示尚未观察到任何快照。
    pub const ZERO: Revision = Revision(0);

    /// 使用原始数值创建修订号，主要用于测试与回放。
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// 分配下一个全局修订号。
    pub fn next() -> Self {
        Self(NEXT_REVISION.fetch_add(1, Ordering::Relaxed))
    }

    /// 返回内部整数值，便于日志记录。
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_revisions_are_strictly_increasing() {
        let first = Revision::next();
        let second = Revision::next();
        assert!(second > first);
        assert_ne!(first, Revision::ZERO);
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};
        use std::thread;

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    for _ in 0..256 {
                        let revision = Revision::next();
                        assert!(seen.lock().unwrap().insert(revision), "修订号重复分配");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 8 * 256);
    }
}
