//! # rule 模块说明
//!
//! ## 角色定位（Why）
//! - [`PolicyRuleItem`] 是控制面下发的一条灰度规则：入口匹配条件、按权重分配的路由项、
//!   可选的降级路由项；
//! - 规则在使用前要经过 [`PolicyRuleItem::check`] 校验并补全，得到请求期使用的
//!   [`EffectiveRule`]；校验失败不会中断调用，而是退回“最新版本”集合。
//!
//! ## 校验规则（What）
//! - 路由项为空：非法；
//! - 只有一个路由项：权重固定为 100；
//! - 多个路由项中有缺失权重：非法；
//! - 权重和大于 100：记录告警，按实际权重和分配；
//! - 权重和小于 100：差额分配给“最新版本”标签，并标记为权重不足（weight-less），
//!   此时若不知道最新版本则非法；
//! - 降级路由项遵循同样的单项与缺失权重规则，但不补差额。

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::matcher::Matcher;
use crate::tag::TagItem;

/// 满权重。
pub const FULL_WEIGHT: u32 = 100;

/// 一个按权重分配的路由项。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteItem {
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub tags: TagItem,
}

impl RouteItem {
    pub fn new(weight: u32, tags: TagItem) -> Self {
        Self {
            weight: Some(weight),
            tags,
        }
    }

    /// 未声明权重的路由项。
    pub fn unweighted(tags: TagItem) -> Self {
        Self { weight: None, tags }
    }
}

/// 控制面下发的一条路由规则。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRuleItem {
    /// 越大越先匹配。
    #[serde(default)]
    pub precedence: i32,
    #[serde(default, rename = "match")]
    pub matcher: Option<Matcher>,
    #[serde(default)]
    pub route: Vec<RouteItem>,
    #[serde(default)]
    pub fallback: Vec<RouteItem>,
}

impl PolicyRuleItem {
    pub fn new(precedence: i32) -> Self {
        Self {
            precedence,
            ..Self::default()
        }
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_route(mut self, item: RouteItem) -> Self {
        self.route.push(item);
        self
    }

    pub fn with_fallback(mut self, item: RouteItem) -> Self {
        self.fallback.push(item);
        self
    }

    /// 校验并补全规则。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：控制面配置可能不完整，请求期需要一个权重齐全、可直接抽签的视图。
    /// - **契约 (What)**：
    ///   - 输入 `latest` 为当前已知的最新版本标签，`None` 表示尚未观察到任何实例；
    ///   - 成功时返回的 [`EffectiveRule`] 中每个路由项都带权重，`total` 为抽签区间长度；
    ///   - 失败时返回 [`RuleValidationError`]，调用方应退回最新版本集合。
    /// - **执行 (How)**：见模块文档的校验规则；方法不修改规则本身，可被并发调用。
    pub fn check(&self, latest: Option<&TagItem>) -> Result<EffectiveRule, RuleValidationError> {
        let (mut route, total) = normalize(&self.route, RuleSection::Route)?;
        let mut weight_less = false;
        let total = if total > FULL_WEIGHT {
            warn!(
                precedence = self.precedence,
                total, "route weights sum above 100, distributing by actual sum"
            );
            total
        } else if total < FULL_WEIGHT {
            let latest = latest.ok_or(RuleValidationError::MissingLatestVersion)?;
            route.push(RouteItem::new(FULL_WEIGHT - total, latest.clone()));
            weight_less = true;
            FULL_WEIGHT
        } else {
            total
        };

        let (fallback, fallback_total) = if self.fallback.is_empty() {
            (Vec::new(), 0)
        } else {
            normalize(&self.fallback, RuleSection::Fallback)?
        };

        Ok(EffectiveRule {
            route,
            total,
            weight_less,
            fallback,
            fallback_total,
        })
    }
}

fn normalize(
    items: &[RouteItem],
    section: RuleSection,
) -> Result<(Vec<RouteItem>, u32), RuleValidationError> {
    match items {
        [] => Err(RuleValidationError::EmptyRoute { section }),
        [single] => Ok((vec![RouteItem::new(FULL_WEIGHT, single.tags.clone())], FULL_WEIGHT)),
        _ => {
            let mut total: u32 = 0;
            let mut normalized = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let weight = item
                    .weight
                    .ok_or(RuleValidationError::MissingWeight { section, index })?;
                total = total.saturating_add(weight);
                normalized.push(RouteItem::new(weight, item.tags.clone()));
            }
            Ok((normalized, total))
        }
    }
}

/// 规则中的路由段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleSection {
    Route,
    Fallback,
}

impl core::fmt::Display for RuleSection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Route => "route",
            Self::Fallback => "fallback",
        })
    }
}

/// 规则校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleValidationError {
    #[error("rule has no {section} items")]
    EmptyRoute { section: RuleSection },

    #[error("{section} item #{index} has no weight while several items are declared")]
    MissingWeight { section: RuleSection, index: usize },

    #[error("route weights sum below 100 but no latest version is known")]
    MissingLatestVersion,
}

impl RuleValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyRoute { .. } => "router.rule.empty_route",
            Self::MissingWeight { .. } => "router.rule.missing_weight",
            Self::MissingLatestVersion => "router.rule.missing_latest_version",
        }
    }
}

/// 校验并补全后的规则视图，请求期抽签直接使用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveRule {
    route: Vec<RouteItem>,
    total: u32,
    weight_less: bool,
    fallback: Vec<RouteItem>,
    fallback_total: u32,
}

impl EffectiveRule {
    /// 权重齐全的路由项；权重不足时最后一项是补上的最新版本。
    pub fn route(&self) -> &[RouteItem] {
        &self.route
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// 原始权重和是否小于 100。
    pub fn is_weight_less(&self) -> bool {
        self.weight_less
    }

    pub fn fallback(&self) -> &[RouteItem] {
        &self.fallback
    }

    pub fn fallback_total(&self) -> u32 {
        self.fallback_total
    }
}
