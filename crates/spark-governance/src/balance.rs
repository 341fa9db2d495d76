use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use spark_discovery::Endpoint;
use thiserror::Error;

/// 负载均衡失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// 候选集合为空。
    #[error("no available address found for `{target}`")]
    Exhausted { target: String },
}

impl BalanceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "balance.exhausted",
        }
    }
}

/// 负载均衡器契约：从候选端点中选出一个。
///
/// `target` 标识一组逻辑上相同的候选（服务 + 路由结果），实现可按它维护独立状态。
pub trait LoadBalancer: Send + Sync + 'static {
    fn select(&self, target: &str, candidates: &[Endpoint]) -> Result<Endpoint, BalanceError>;
}

/// 按目标名独立计数的轮询均衡器。
///
/// # 教案式说明
/// - **意图 (Why)**：同一服务在不同路由结果下的候选集合不同，共用一个计数器会让某些子集分布不均，
///   因此按目标名分别计数。
/// - **契约 (What)**：
///   - 第 `k` 次对某目标的选择返回下标 `|k| mod n`（`k` 从 0 开始）；
///   - 计数器溢出后回绕为负数，取绝对值后继续轮询，不会出现越界或 panic；
///   - 并发调用下每次选择领取唯一的计数值，`M` 次选择中每个候选被选中 `floor(M/n)` 或
///     `ceil(M/n)` 次。
/// - **风险 (Trade-offs)**：计数器表只增不减，目标名基数应保持有限。
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: DashMap<String, AtomicI64>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// 泛型版本的选择，返回候选切片中的引用。
    pub fn pick<'a, T>(&self, target: &str, candidates: &'a [T]) -> Result<&'a T, BalanceError> {
        if candidates.is_empty() {
            return Err(BalanceError::Exhausted {
                target: target.to_owned(),
            });
        }
        let ticket = self.next_ticket(target);
        let index = ticket.unsigned_abs() % candidates.len() as u64;
        // index < len，转换不会截断
        Ok(&candidates[index as usize])
    }

    fn next_ticket(&self, target: &str) -> i64 {
        if let Some(counter) = self.counters.get(target) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(target.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    #[cfg(test)]
    fn seed(&self, target: &str, value: i64) {
        self.counters
            .insert(target.to_owned(), AtomicI64::new(value));
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, target: &str, candidates: &[Endpoint]) -> Result<Endpoint, BalanceError> {
        self.pick(target, candidates).cloned()
    }
}
