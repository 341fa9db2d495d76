use crate::rule::{EffectiveRule, RouteItem};
use crate::store::StoredRule;
use crate::tag::TagItem;

/// 从校验后的规则中抽出本次调用的目标标签。
///
/// - **契约 (What)**：返回 `None` 表示无法抽签（如区间长度为 0），路由器随后尝试降级路由与最新版本回退；
///   实现可以借助 [`StoredRule`] 上的游标保存跨调用状态。
pub trait TagSelector: Send + Sync + 'static {
    fn next_tag(&self, rule: &StoredRule, effective: &EffectiveRule) -> Option<TagItem>;

    fn next_fallback_tag(&self, rule: &StoredRule, effective: &EffectiveRule) -> Option<TagItem>;
}

/// 确定性的加权轮询抽签。
///
/// 第 `n` 次调用落在累计权重区间 `n mod total` 所在的路由项上，
/// 每连续 `total` 次调用中各路由项被选中的次数恰好等于其权重。
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedRoundRobin;

impl WeightedRoundRobin {
    fn pick(items: &[RouteItem], total: u32, ticket: u64) -> Option<TagItem> {
        if total == 0 {
            return None;
        }
        let mut point = ticket % u64::from(total);
        for item in items {
            let weight = u64::from(item.weight.unwrap_or(0));
            if point < weight {
                return Some(item.tags.clone());
            }
            point -= weight;
        }
        None
    }
}

impl TagSelector for WeightedRoundRobin {
    fn next_tag(&self, rule: &StoredRule, effective: &EffectiveRule) -> Option<TagItem> {
        Self::pick(effective.route(), effective.total(), rule.next_route_ticket())
    }

    fn next_fallback_tag(&self, rule: &StoredRule, effective: &EffectiveRule) -> Option<TagItem> {
        Self::pick(
            effective.fallback(),
            effective.fallback_total(),
            rule.next_fallback_ticket(),
        )
    }
}
