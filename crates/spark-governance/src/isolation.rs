//! # isolation 模块说明
//!
//! ## 角色定位（Why）
//! - 路由之后、负载均衡之前的最后一道可见性检查：不健康的实例与其他环境的实例不应接到流量；
//! - 另提供属性子集过滤，用于“只调用带某些标签的实例”这类静态约束。
//!
//! ## 契约（What）
//! - 实例状态必须为 `UP`；
//! - 实例声明的环境必须与调用方环境一致，两边都未声明也视为一致；
//! - 属性子集过滤要求实例包含全部给定键值，缺少键即不匹配。

use std::collections::BTreeMap;

use spark_discovery::{Endpoint, Instance};

/// 隔离策略。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsolationPolicy {
    enabled: bool,
    environment: Option<String>,
}

impl IsolationPolicy {
    /// 以调用方自身环境构造；空字符串视为未声明。
    pub fn new(environment: Option<&str>) -> Self {
        Self {
            enabled: true,
            environment: environment.filter(|env| !env.is_empty()).map(str::to_owned),
        }
    }

    /// 不做任何隔离。
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            environment: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// 实例对调用方是否可见；`caller_environment` 覆盖策略中的默认环境。
    pub fn is_visible(&self, instance: &Instance, caller_environment: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let caller = caller_environment
            .filter(|env| !env.is_empty())
            .or(self.environment.as_deref());
        instance.is_up() && instance.environment() == caller
    }

    pub fn retain(&self, candidates: &mut Vec<Endpoint>, caller_environment: Option<&str>) {
        candidates.retain(|endpoint| self.is_visible(endpoint.instance(), caller_environment));
    }
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

/// 实例属性是否包含全部要求的键值。
pub fn matches_properties(instance: &Instance, required: &BTreeMap<String, String>) -> bool {
    required
        .iter()
        .all(|(key, value)| instance.property(key) == Some(value.as_str()))
}

/// 保留属性满足要求的候选。
pub fn retain_matching(candidates: &mut Vec<Endpoint>, required: &BTreeMap<String, String>) {
    if required.is_empty() {
        return;
    }
    candidates.retain(|endpoint| matches_properties(endpoint.instance(), required));
}
