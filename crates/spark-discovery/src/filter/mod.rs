//! # filter 模块说明
//!
//! ## 角色定位（Why）
//! - 端点快照之后、路由之前，候选端点要经过一组可插拔的发现过滤器（传输可用性、
//!   属性优先级、业务自定义等），每个过滤器只关心一件事；
//! - 过滤器集合在进程启动时显式注册，组装完成后链路不可变，请求路径上无需任何同步。
//!
//! ## 契约（What）
//! - 执行顺序由 `order` 升序决定，同 `order` 保持注册顺序；
//! - 禁用的过滤器在组装时剔除，启动期校验失败属于致命配置错误；
//! - 某一级返回空集合不会中断链路，空集合会继续流向后续过滤器；
//! - 请求期某一级返回 `Err` 时整条链立即失败，错误中带上过滤器名。

mod builtin;

pub use builtin::{PriorityPropertyFilter, TransportAvailabilityFilter};

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, trace};

use crate::context::DiscoveryContext;
use crate::endpoint::Endpoint;

/// 过滤器的静态描述，用于日志与诊断。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterDescriptor {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
}

impl FilterDescriptor {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            description: Cow::Borrowed(description),
        }
    }

    /// 运行期拼装的描述，供业务自定义过滤器使用。
    pub fn owned(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            description: Cow::Owned(description.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// 单个过滤器的失败原因。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct FilterError {
    reason: Cow<'static, str>,
}

impl FilterError {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// 发现过滤器契约。
///
/// # 教案式说明
/// - **意图 (Why)**：把“候选端点怎么收窄”拆成互不依赖的小步骤，业务可以插入自己的规则。
/// - **契约 (What)**：
///   - `order` 越小越先执行；
///   - `enabled` 为 `false` 的过滤器在组装阶段被剔除，请求期不会再询问；
///   - `validate` 在组装阶段调用一次，返回错误即拒绝构建整条链；
///   - `filter` 接收上一级输出的所有权，返回收窄后的集合；返回空集合是合法结果。
/// - **风险 (Trade-offs)**：`filter` 必须是纯计算，不应阻塞或做网络 I/O，它运行在每次调用的热路径上。
pub trait DiscoveryFilter: Send + Sync + 'static {
    fn descriptor(&self) -> &FilterDescriptor;

    fn order(&self) -> i32;

    fn enabled(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<(), FilterError> {
        Ok(())
    }

    fn filter(
        &self,
        ctx: &DiscoveryContext<'_>,
        candidates: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, FilterError>;
}

/// 过滤链错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// 组装阶段：过滤器拒绝了自己的配置。
    #[error("discovery filter `{filter}` rejected its configuration")]
    InvalidFilter {
        filter: String,
        #[source]
        source: FilterError,
    },

    /// 请求阶段：过滤器执行失败。
    #[error("discovery filter `{filter}` failed")]
    FilterFault {
        filter: String,
        #[source]
        source: FilterError,
    },
}

impl ChainError {
    /// 出错的过滤器名。
    pub fn filter(&self) -> &str {
        match self {
            Self::InvalidFilter { filter, .. } | Self::FilterFault { filter, .. } => filter,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFilter { .. } => "discovery.filter.invalid",
            Self::FilterFault { .. } => "discovery.filter.fault",
        }
    }
}

/// 组装完成的不可变过滤链。
#[derive(Clone)]
pub struct DiscoveryFilterChain {
    filters: Arc<[Arc<dyn DiscoveryFilter>]>,
}

impl DiscoveryFilterChain {
    pub fn builder() -> DiscoveryFilterChainBuilder {
        DiscoveryFilterChainBuilder::default()
    }

    /// 不含任何过滤器的链，候选集合原样通过。
    pub fn empty() -> Self {
        Self {
            filters: Arc::from(Vec::new()),
        }
    }

    /// 按执行顺序排列的过滤器名。
    pub fn names(&self) -> Vec<&str> {
        self.filters
            .iter()
            .map(|filter| filter.descriptor().name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// 依次执行全部过滤器。
    pub fn filter(
        &self,
        ctx: &DiscoveryContext<'_>,
        initial: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, ChainError> {
        let mut candidates = initial;
        for filter in self.filters.iter() {
            let before = candidates.len();
            candidates =
                filter
                    .filter(ctx, candidates)
                    .map_err(|source| ChainError::FilterFault {
                        filter: filter.descriptor().name().to_owned(),
                        source,
                    })?;
            trace!(
                service = %ctx.key(),
                filter = filter.descriptor().name(),
                before,
                after = candidates.len(),
                "discovery filter applied"
            );
        }
        Ok(candidates)
    }
}

impl fmt::Debug for DiscoveryFilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryFilterChain")
            .field("filters", &self.names())
            .finish()
    }
}

/// 过滤链构建器：显式注册、启动期校验、按序冻结。
#[derive(Default)]
pub struct DiscoveryFilterChainBuilder {
    filters: Vec<Arc<dyn DiscoveryFilter>>,
}

impl DiscoveryFilterChainBuilder {
    pub fn with_filter(mut self, filter: Arc<dyn DiscoveryFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn DiscoveryFilter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    /// 剔除禁用项、校验、按 `order` 稳定排序后冻结。
    pub fn build(self) -> Result<DiscoveryFilterChain, ChainError> {
        let mut active = Vec::with_capacity(self.filters.len());
        for filter in self.filters {
            let enabled = filter.enabled();
            info!(
                filter = filter.descriptor().name(),
                order = filter.order(),
                enabled,
                "discovery filter registered"
            );
            if !enabled {
                continue;
            }
            filter
                .validate()
                .map_err(|source| ChainError::InvalidFilter {
                    filter: filter.descriptor().name().to_owned(),
                    source,
                })?;
            active.push(filter);
        }
        active.sort_by_key(|filter| filter.order());
        Ok(DiscoveryFilterChain {
            filters: Arc::from(active),
        })
    }
}
