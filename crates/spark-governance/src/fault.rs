//! # fault 模块说明
//!
//! ## 角色定位（Why）
//! - 故障注入用于演练：按百分比让一部分调用被延迟或直接失败，验证调用方的容错；
//! - 这里只做“是否注入”的决策，真正的等待或失败由调用方执行，决策本身不阻塞。
//!
//! ## 契约（What）
//! - 计数器按 `(传输, 操作)` 维度独立，首个调用的计数为 1；
//! - 第 `n` 次调用在 `floor(n*p/100) != floor((n-1)*p/100)` 时注入，
//!   因此任意连续 100 次调用恰好注入 `p` 次，且分布均匀；
//! - 规则按“操作 → 契约 → 服务 → 全局”由细到粗查找，每一级按传输名区分。

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

/// 第 `count` 次调用在百分比 `percent` 下是否注入。
///
/// `count == 0` 与 `percent == 0` 永不注入，`percent >= 100` 总是注入。
pub fn should_inject(count: u64, percent: u32) -> bool {
    if count == 0 || percent == 0 {
        return false;
    }
    if percent >= 100 {
        return true;
    }
    let percent = u128::from(percent);
    let current = u128::from(count) * percent / 100;
    let previous = u128::from(count - 1) * percent / 100;
    current != previous
}

/// 中止注入：直接以给定状态码失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbortFault {
    pub percent: u32,
    #[serde(default = "default_abort_status")]
    pub http_status: u16,
}

fn default_abort_status() -> u16 {
    421
}

/// 延迟注入：在发出调用前等待固定时长。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayFault {
    pub percent: u32,
    pub fixed_delay_ms: u64,
}

/// 某个作用域、某个传输下的故障规则。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultRule {
    pub abort: Option<AbortFault>,
    pub delay: Option<DelayFault>,
}

impl FaultRule {
    pub fn abort(percent: u32, http_status: u16) -> Self {
        Self {
            abort: Some(AbortFault {
                percent,
                http_status,
            }),
            delay: None,
        }
    }

    pub fn delay(percent: u32, fixed_delay_ms: u64) -> Self {
        Self {
            abort: None,
            delay: Some(DelayFault {
                percent,
                fixed_delay_ms,
            }),
        }
    }

    pub fn with_delay(mut self, percent: u32, fixed_delay_ms: u64) -> Self {
        self.delay = Some(DelayFault {
            percent,
            fixed_delay_ms,
        });
        self
    }

    fn percents(&self) -> impl Iterator<Item = u32> {
        self.abort
            .map(|abort| abort.percent)
            .into_iter()
            .chain(self.delay.map(|delay| delay.percent))
    }
}

/// 一级作用域：按传输名索引的规则。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultScope {
    pub protocols: BTreeMap<String, FaultRule>,
}

impl FaultScope {
    pub fn with_protocol(mut self, transport: impl Into<String>, rule: FaultRule) -> Self {
        self.protocols.insert(transport.into(), rule);
        self
    }

    fn rule(&self, transport: &str) -> Option<&FaultRule> {
        self.protocols.get(transport)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaFaultScope {
    pub protocols: BTreeMap<String, FaultRule>,
    pub operations: BTreeMap<String, FaultScope>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceFaultScope {
    pub protocols: BTreeMap<String, FaultRule>,
    pub schemas: BTreeMap<String, SchemaFaultScope>,
}

/// 分层的故障注入配置。
///
/// ```toml
/// [global.protocols.rest]
/// abort = { percent = 5, http_status = 503 }
///
/// [services.cart.schemas.CartEndpoint.operations.add.protocols.rest]
/// delay = { percent = 50, fixed_delay_ms = 200 }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultConfig {
    pub global: FaultScope,
    pub services: BTreeMap<String, ServiceFaultScope>,
}

impl FaultConfig {
    /// 由细到粗查找适用的规则。
    pub fn lookup(
        &self,
        service: &str,
        schema: Option<&str>,
        operation: Option<&str>,
        transport: &str,
    ) -> Option<&FaultRule> {
        let service_scope = self.services.get(service);
        let schema_scope =
            service_scope.and_then(|scope| schema.and_then(|schema| scope.schemas.get(schema)));
        let operation_scope = schema_scope
            .and_then(|scope| operation.and_then(|operation| scope.operations.get(operation)));

        operation_scope
            .and_then(|scope| scope.rule(transport))
            .or_else(|| schema_scope.and_then(|scope| scope.protocols.get(transport)))
            .or_else(|| service_scope.and_then(|scope| scope.protocols.get(transport)))
            .or_else(|| self.global.rule(transport))
    }

    pub fn is_empty(&self) -> bool {
        self.global.protocols.is_empty() && self.services.is_empty()
    }

    /// 校验百分比范围与传输名。
    pub fn validate(&self) -> Result<(), FaultConfigError> {
        let mut scopes: Vec<(String, &BTreeMap<String, FaultRule>)> =
            vec![("global".to_owned(), &self.global.protocols)];
        for (service, scope) in &self.services {
            scopes.push((service.clone(), &scope.protocols));
            for (schema, schema_scope) in &scope.schemas {
                scopes.push((format!("{service}.{schema}"), &schema_scope.protocols));
                for (operation, operation_scope) in &schema_scope.operations {
                    scopes.push((
                        format!("{service}.{schema}.{operation}"),
                        &operation_scope.protocols,
                    ));
                }
            }
        }
        for (scope, protocols) in scopes {
            for (transport, rule) in protocols {
                if transport.is_empty() {
                    return Err(FaultConfigError::EmptyTransport { scope });
                }
                if let Some(percent) = rule.percents().find(|percent| *percent > 100) {
                    return Err(FaultConfigError::PercentOutOfRange {
                        scope,
                        transport: transport.clone(),
                        percent,
                    });
                }
            }
        }
        Ok(())
    }
}

/// 故障配置非法。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FaultConfigError {
    #[error("fault percent {percent} for `{transport}` in `{scope}` exceeds 100")]
    PercentOutOfRange {
        scope: String,
        transport: String,
        percent: u32,
    },
    #[error("fault rule in `{scope}` has an empty transport name")]
    EmptyTransport { scope: String },
}

/// 故障注入决策。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultDecision {
    /// 调用前需要等待的时长。
    pub delay: Option<Duration>,
    /// 需要以该状态码中止调用。
    pub abort: Option<u16>,
}

impl FaultDecision {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.delay.is_none() && self.abort.is_none()
    }
}

/// 按 `(传输, 操作)` 计数的注入决策器。
///
/// # 教案式说明
/// - **意图 (Why)**：百分比注入若用随机数，小样本下比例波动很大；用计数器可以让每 100 次
///   调用精确注入 `p` 次，演练结果可复现。
/// - **契约 (What)**：
///   - [`decide`](Self::decide) 每次调用推进一次计数，延迟与中止共用同一个计数值；
///   - 计数器首次访问时创建（初值 1），创建过程对同一键只发生一次；
///   - 方法可被任意线程并发调用，并发下同一键上的计数值互不重复。
/// - **风险 (Trade-offs)**：键集合只增不减，操作名基数过大时需要定期 [`reset`](Self::reset)。
#[derive(Default)]
pub struct FaultInjectionGate {
    counters: DashMap<String, AtomicU64>,
}

impl FaultInjectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进并返回本次调用的计数值（从 1 开始）。
    pub fn next_count(&self, transport: &str, operation: &str) -> u64 {
        let key = counter_key(transport, operation);
        if let Some(counter) = self.counters.get(key.as_str()) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(1))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// 按规则做出本次调用的注入决策。
    pub fn decide(&self, transport: &str, operation: &str, rule: &FaultRule) -> FaultDecision {
        if rule.abort.is_none() && rule.delay.is_none() {
            return FaultDecision::none();
        }
        let count = self.next_count(transport, operation);
        FaultDecision {
            delay: rule
                .delay
                .filter(|delay| should_inject(count, delay.percent))
                .map(|delay| Duration::from_millis(delay.fixed_delay_ms)),
            abort: rule
                .abort
                .filter(|abort| should_inject(count, abort.percent))
                .map(|abort| abort.http_status),
        }
    }

    /// 清空全部计数器。
    pub fn reset(&self) {
        self.counters.clear();
    }
}

fn counter_key(transport: &str, operation: &str) -> String {
    let mut key = String::with_capacity(transport.len() + operation.len() + 1);
    key.push_str(transport);
    key.push('/');
    key.push_str(operation);
    key
}
