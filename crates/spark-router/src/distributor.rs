//! # distributor 模块说明
//!
//! ## 角色定位（Why）
//! - 规则选定之后，路由器把候选目标按规则的路由项分桶，再按权重抽出一个桶作为本次调用的子集；
//! - 任何一步走不通都退回“最新版本”集合：只要候选中存在最新版本的实例，结果就不会为空。
//!
//! ## 执行流程（How）
//! 1. 计算候选中的最新版本并记录；
//! 2. 校验规则，失败则直接退回最新版本集合并带上校验错误；
//! 3. 每个候选归入匹配分数最高的路由项（同分取先声明者，0 分不入桶）；
//!    权重不足的规则中，最新版本实例额外并入最后一个路由项（即补上的最新版本项）；
//! 4. 抽签得到目标标签，命中非空桶则返回；
//! 5. 否则尝试降级路由项；
//! 6. 仍未命中则退回最新版本集合。

use std::collections::HashMap;
use std::sync::Arc;

use spark_discovery::versions_agree;
use tracing::{debug, warn};

use crate::rule::{EffectiveRule, RouteItem, RuleValidationError};
use crate::selector::{TagSelector, WeightedRoundRobin};
use crate::service_info::ServiceInfoCache;
use crate::store::StoredRule;
use crate::tag::{RouteTarget, TagItem};

/// 为什么退回了最新版本集合。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LatestReason {
    /// 抽到的标签与降级标签都没有对应的非空桶。
    NoTagMatched,
    /// 规则校验失败。
    RuleRejected(RuleValidationError),
}

/// 路由决策。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    /// 命中主路由项。
    Tagged(TagItem),
    /// 命中降级路由项。
    Fallback(TagItem),
    /// 退回最新版本集合。
    LatestVersion(LatestReason),
}

impl RouteDecision {
    /// 规则校验错误（若有）。
    pub fn rule_fault(&self) -> Option<&RuleValidationError> {
        match self {
            Self::LatestVersion(LatestReason::RuleRejected(error)) => Some(error),
            _ => None,
        }
    }

    /// 稳定的低基数标签，用于日志与负载均衡器的目标名。
    pub fn label(&self) -> String {
        match self {
            Self::Tagged(tag) => tag.to_string(),
            Self::Fallback(tag) => format!("fallback:{tag}"),
            Self::LatestVersion(_) => "latest".to_owned(),
        }
    }
}

/// 一次分配的结果：目标子集 + 决策。
#[derive(Clone, Debug)]
pub struct Distribution<T> {
    pub targets: Vec<T>,
    pub decision: RouteDecision,
}

struct Buckets<T> {
    route: HashMap<TagItem, Vec<T>>,
    fallback: HashMap<TagItem, Vec<T>>,
}

/// 按规则把候选目标分配到权重桶中的流量路由器。
///
/// # 教案式说明
/// - **意图 (Why)**：灰度发布需要“按请求特征 + 按比例”把流量导向指定版本，同时保证配置出错时
///   流量仍然有处可去。
/// - **契约 (What)**：
///   - [`distribute`](Self::distribute) 永不返回错误；规则错误体现在
///     [`RouteDecision::LatestVersion`] 的原因中；
///   - 只要候选中存在最新版本的目标，返回集合非空；
///   - 返回集合保持候选的原有顺序。
/// - **风险 (Trade-offs)**：分桶在每次调用时重新计算，复杂度为 `候选数 × 路由项数`。
pub struct TrafficRouter {
    service_info: ServiceInfoCache,
    selector: Arc<dyn TagSelector>,
}

impl Default for TrafficRouter {
    fn default() -> Self {
        Self::new(Arc::new(WeightedRoundRobin))
    }
}

impl TrafficRouter {
    pub fn new(selector: Arc<dyn TagSelector>) -> Self {
        Self {
            service_info: ServiceInfoCache::new(),
            selector,
        }
    }

    pub fn service_info(&self) -> &ServiceInfoCache {
        &self.service_info
    }

    pub fn distribute<T>(&self, service: &str, targets: &[T], rule: &StoredRule) -> Distribution<T>
    where
        T: RouteTarget + Clone,
    {
        let latest = self.service_info.init_latest_version(service, targets);
        let effective = match rule.item().check(latest.as_deref()) {
            Ok(effective) => effective,
            Err(error) => {
                warn!(
                    service,
                    rule = rule.id(),
                    code = error.code(),
                    %error,
                    "routing rule rejected, falling back to latest version"
                );
                return Distribution {
                    targets: latest_version_targets(targets, latest.as_deref()),
                    decision: RouteDecision::LatestVersion(LatestReason::RuleRejected(error)),
                };
            }
        };

        let mut buckets = build_buckets(service, targets, &effective, latest.as_deref());

        if let Some(tag) = self.selector.next_tag(rule, &effective) {
            if let Some(subset) = buckets.route.remove(&tag) {
                debug!(service, rule = rule.id(), %tag, kept = subset.len(), "route tag selected");
                return Distribution {
                    targets: subset,
                    decision: RouteDecision::Tagged(tag),
                };
            }
        }

        if !effective.fallback().is_empty() {
            if let Some(tag) = self.selector.next_fallback_tag(rule, &effective) {
                if let Some(subset) = buckets.fallback.remove(&tag) {
                    debug!(service, rule = rule.id(), %tag, kept = subset.len(), "fallback tag selected");
                    return Distribution {
                        targets: subset,
                        decision: RouteDecision::Fallback(tag),
                    };
                }
            }
        }

        debug!(service, rule = rule.id(), "no tagged bucket matched, using latest version");
        Distribution {
            targets: latest_version_targets(targets, latest.as_deref()),
            decision: RouteDecision::LatestVersion(LatestReason::NoTagMatched),
        }
    }
}

fn latest_version_targets<T: RouteTarget + Clone>(targets: &[T], latest: Option<&TagItem>) -> Vec<T> {
    let Some(version) = latest.and_then(TagItem::version) else {
        return Vec::new();
    };
    targets
        .iter()
        .filter(|target| versions_agree(target.version(), version))
        .cloned()
        .collect()
}

/// 返回分数最高的路由项下标；同分取先声明者，0 分返回 `None`。
fn best_item(items: &[RouteItem], target: &TagItem) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, item) in items.iter().enumerate() {
        let score = item.tags.match_score(target);
        if score > best.map_or(0, |(_, top)| top) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

fn build_buckets<T: RouteTarget + Clone>(
    service: &str,
    targets: &[T],
    effective: &EffectiveRule,
    latest: Option<&TagItem>,
) -> Buckets<T> {
    let mut route: HashMap<TagItem, Vec<T>> = HashMap::new();
    let mut fallback: HashMap<TagItem, Vec<T>> = HashMap::new();
    let latest_version = latest.and_then(TagItem::version);
    let extra_bucket = effective
        .is_weight_less()
        .then(|| effective.route().last())
        .flatten();

    for target in targets.iter().filter(|t| t.service_name() == service) {
        let tag = TagItem::of_target(target);
        let best = best_item(effective.route(), &tag);
        if let Some(index) = best {
            route
                .entry(effective.route()[index].tags.clone())
                .or_default()
                .push(target.clone());
        }
        if let (Some(extra), Some(version)) = (extra_bucket, latest_version) {
            let already = best.is_some_and(|index| effective.route()[index].tags == extra.tags);
            if !already && versions_agree(target.version(), version) {
                route.entry(extra.tags.clone()).or_default().push(target.clone());
            }
        }
        if let Some(index) = best_item(effective.fallback(), &tag) {
            fallback
                .entry(effective.fallback()[index].tags.clone())
                .or_default()
                .push(target.clone());
        }
    }
    Buckets { route, fallback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PolicyRuleItem;
    use crate::store::RoutingRuleStore;
    use spark_discovery::{Instance, InvocationContext};

    fn instance(id: &str, version: &str) -> Arc<Instance> {
        Arc::new(Instance::builder(id, "cart", version).build())
    }

    fn stored(rule: PolicyRuleItem) -> Arc<StoredRule> {
        let store = RoutingRuleStore::new();
        store.replace("cart", vec![rule]);
        store.select("cart", &InvocationContext::new()).unwrap()
    }

    fn ids(targets: &[Arc<Instance>]) -> Vec<&str> {
        targets.iter().map(|i| i.instance_id()).collect()
    }

    fn fleet() -> Vec<Arc<Instance>> {
        vec![
            instance("old-1", "1.0.0"),
            instance("old-2", "1.0.0"),
            instance("new-1", "2.0.0"),
        ]
    }

    #[test]
    fn weighted_split_is_exact_over_one_period() {
        let rule = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(20, TagItem::with_version("2.0.0")))
                .with_route(RouteItem::new(80, TagItem::with_version("1.0.0"))),
        );
        let router = TrafficRouter::default();
        let targets = fleet();
        let mut new_hits = 0;
        for _ in 0..100 {
            let distribution = router.distribute("cart", &targets, &rule);
            match &distribution.decision {
                RouteDecision::Tagged(tag) if tag.version() == Some("2.0.0") => {
                    assert_eq!(ids(&distribution.targets), ["new-1"]);
                    new_hits += 1;
                }
                RouteDecision::Tagged(_) => {
                    assert_eq!(ids(&distribution.targets), ["old-1", "old-2"]);
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(new_hits, 20);
    }

    #[test]
    fn rejected_rule_falls_back_to_latest_version() {
        let rule = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(50, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::unweighted(TagItem::with_version("2.0.0"))),
        );
        let distribution = TrafficRouter::default().distribute("cart", &fleet(), &rule);
        assert_eq!(ids(&distribution.targets), ["new-1"]);
        assert!(matches!(
            distribution.decision.rule_fault(),
            Some(RuleValidationError::MissingWeight { index: 1, .. })
        ));
    }

    #[test]
    fn unmatched_tag_uses_fallback_then_latest() {
        let with_fallback = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(100, TagItem::with_version("9.9.9")))
                .with_fallback(RouteItem::new(100, TagItem::with_version("1.0.0"))),
        );
        let router = TrafficRouter::default();
        let distribution = router.distribute("cart", &fleet(), &with_fallback);
        assert_eq!(
            distribution.decision,
            RouteDecision::Fallback(TagItem::with_version("1.0.0"))
        );
        assert_eq!(ids(&distribution.targets), ["old-1", "old-2"]);

        let without = stored(
            PolicyRuleItem::new(0).with_route(RouteItem::new(100, TagItem::with_version("9.9.9"))),
        );
        let distribution = router.distribute("cart", &fleet(), &without);
        assert_eq!(
            distribution.decision,
            RouteDecision::LatestVersion(LatestReason::NoTagMatched)
        );
        assert_eq!(ids(&distribution.targets), ["new-1"]);
    }

    #[test]
    fn weight_less_rule_sends_remainder_to_latest() {
        let rule = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(10, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::new(10, TagItem::with_version("1.5.0"))),
        );
        let router = TrafficRouter::default();
        let targets = fleet();
        let mut latest_hits = 0;
        for _ in 0..100 {
            let distribution = router.distribute("cart", &targets, &rule);
            if distribution.decision == RouteDecision::LatestVersion(LatestReason::NoTagMatched) {
                // 1.5.0 没有实例，抽中它时退回最新版本
                assert_eq!(ids(&distribution.targets), ["new-1"]);
            } else if ids(&distribution.targets) == ["new-1"] {
                latest_hits += 1;
            }
        }
        assert_eq!(latest_hits, 80);
    }

    #[test]
    fn latest_instance_joins_the_remainder_bucket_as_well() {
        let zone_a = TagItem::any().param("zone", "a");
        let rule = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(20, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::new(30, zone_a.clone())),
        );
        let router = TrafficRouter::default();
        let targets = vec![
            instance("old", "1.0.0"),
            Arc::new(
                Instance::builder("new", "cart", "2.0.0")
                    .property("zone", "a")
                    .build(),
            ),
        ];
        let mut served: HashMap<(String, String), usize> = HashMap::new();
        for _ in 0..100 {
            let distribution = router.distribute("cart", &targets, &rule);
            let RouteDecision::Tagged(tag) = &distribution.decision else {
                panic!("unexpected decision {:?}", distribution.decision);
            };
            for id in ids(&distribution.targets) {
                *served.entry((id.to_owned(), tag.to_string())).or_default() += 1;
            }
        }
        let count = |id: &str, tag: &TagItem| served.get(&(id.to_owned(), tag.to_string())).copied();
        assert_eq!(count("old", &TagItem::with_version("1.0.0")), Some(20));
        assert_eq!(count("new", &zone_a), Some(30));
        assert_eq!(count("new", &TagItem::with_version("2.0.0")), Some(50));
        assert_eq!(served.len(), 3);
    }

    #[test]
    fn ties_go_to_the_first_declared_item() {
        let rule = stored(
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(50, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::new(50, TagItem::with_version("1.0"))),
        );
        let router = TrafficRouter::default();
        let targets = vec![instance("only", "1.0.0")];
        let first = router.distribute("cart", &targets, &rule);
        assert_eq!(first.decision, RouteDecision::Tagged(TagItem::with_version("1.0.0")));
        assert_eq!(ids(&first.targets), ["only"]);
        // 第二项与第一项同分，得不到任何实例
        let mut fell_back = false;
        for _ in 0..100 {
            let distribution = router.distribute("cart", &targets, &rule);
            if let RouteDecision::LatestVersion(LatestReason::NoTagMatched) = distribution.decision {
                fell_back = true;
                assert_eq!(ids(&distribution.targets), ["only"]);
            }
        }
        assert!(fell_back);
    }

    #[test]
    fn empty_candidates_yield_empty_distribution() {
        let rule = stored(
            PolicyRuleItem::new(0).with_route(RouteItem::new(100, TagItem::with_version("1.0.0"))),
        );
        let distribution = TrafficRouter::default().distribute::<Arc<Instance>>("cart", &[], &rule);
        assert!(distribution.targets.is_empty());
    }
}
