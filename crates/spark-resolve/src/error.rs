//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 解析失败要让调用方分得清“没人在跑”“有人在跑但传输不通”“我们自己的过滤器坏了”
//!   与“上游注册中心暂时不可用”，这些结论决定了重试与熔断策略；
//! - 每个变体带稳定错误码，便于告警与指标按码聚合。
//!
//! ## 设计要求（What）
//! - 下层 crate 的错误以 `#[source]` 保留，不做字符串拼接；
//! - 规则校验失败不是错误：它体现在成功结果的路由决策里，调用照常进行。

use spark_discovery::{ChainError, RegistryError};
use spark_governance::BalanceError;
use thiserror::Error;

use crate::config::ConfigError;

/// 单次解析的失败原因。
///
/// # 教案式说明
/// - **意图 (Why)**：同步返回给调用层，由其决定重试或熔断；解析层自身从不重试。
/// - **契约 (What)**：
///   - [`Registry`](Self::Registry) 是唯一的瞬时错误，既不会被缓存成“无实例”，也不影响已有快照；
///   - 其余变体都是对当前状态的确定结论，立即重试大概率得到相同结果。
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 目标版本规则下没有任何实例。
    #[error("no instances found for `{key}`")]
    NoInstancesFound { key: String },

    /// 有实例，但它们声明的传输都未注册（或被传输过滤排除）。
    #[error("{instances} instance(s) of `{key}` found, but none uses a registered transport")]
    NoTransportAvailable { key: String, instances: usize },

    /// 请求期发现过滤器故障。
    #[error("discovery filter chain failed for `{key}`")]
    FilterChainFault {
        key: String,
        #[source]
        source: ChainError,
    },

    /// 注册中心访问失败。
    #[error("registry lookup failed for `{key}`")]
    Registry {
        key: String,
        #[source]
        source: RegistryError,
    },

    /// 路由与治理之后没有剩下任何候选。
    #[error("load balancer exhausted")]
    LoadBalancerExhausted(#[from] BalanceError),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoInstancesFound { .. } => "resolve.no_instances",
            Self::NoTransportAvailable { .. } => "resolve.no_transport",
            Self::FilterChainFault { .. } => "resolve.filter_chain_fault",
            Self::Registry { .. } => "resolve.registry",
            Self::LoadBalancerExhausted(_) => "resolve.load_balancer_exhausted",
        }
    }

    /// 稍后重试是否可能成功。
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Registry { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// 组装解析流水线失败。
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid resolver configuration")]
    Config(#[from] ConfigError),
    #[error("discovery filter rejected at startup")]
    FilterChain(#[from] ChainError),
}

impl BuildError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(error) => error.code(),
            Self::FilterChain(error) => error.code(),
        }
    }
}
