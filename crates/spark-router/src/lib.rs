//! # spark-router
//!
//! ## 角色定位（Why）
//! - 在发现过滤之后、负载均衡之前，按控制面下发的灰度规则把候选实例收窄到某个版本/标签子集；
//! - 规则库与 `DefaultRouter` 的路由表一样采用 `ArcSwap` 整表替换，读路径零锁。
//!
//! ## 模块导览（What）
//! - [`tag`]：标签与匹配分数，[`RouteTarget`] 抽象出“可被分桶的目标”；
//! - [`matcher`]：规则入口条件（来源服务、来源标签、请求头）；
//! - [`rule`]：规则结构与校验补全；
//! - [`store`]：可热更新的规则库与 TOML 配置；
//! - [`selector`]：按权重抽取目标标签；
//! - [`service_info`]：按服务记录最新版本；
//! - [`distributor`]：分桶与回退逻辑，入口为 [`TrafficRouter::distribute`]。

pub mod distributor;
pub mod matcher;
pub mod rule;
pub mod selector;
pub mod service_info;
pub mod store;
pub mod tag;

pub use distributor::{Distribution, LatestReason, RouteDecision, TrafficRouter};
pub use matcher::{HeaderRule, Matcher};
pub use rule::{EffectiveRule, FULL_WEIGHT, PolicyRuleItem, RouteItem, RuleSection, RuleValidationError};
pub use selector::{TagSelector, WeightedRoundRobin};
pub use service_info::{ServiceInfo, ServiceInfoCache};
pub use store::{RouteRuleConfig, RoutingRuleStore, RuleConfigError, StoredRule};
pub use tag::{RouteTarget, TagItem, VERSION_TAG};
