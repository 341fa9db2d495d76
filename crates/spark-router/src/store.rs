//! # store 模块说明
//!
//! ## 角色定位（Why）
//! - 规则库保存“服务名 → 有序规则列表”，并维护一份全局规则作为未单独配置服务的兜底；
//! - 控制面推送时整表替换，请求期只做一次原子加载与顺序匹配。
//!
//! ## 契约（What）
//! - 列表按 `precedence` 降序排列，相同优先级保持声明顺序；
//! - 服务存在专属规则时完全遮蔽全局规则；
//! - 每条规则带有独立的抽签游标，规则被替换后游标随之重置。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::Deserialize;
use spark_discovery::InvocationContext;
use thiserror::Error;
use tracing::info;

use crate::rule::PolicyRuleItem;

/// 规则库中的一条规则：规则内容 + 运行期抽签状态。
pub struct StoredRule {
    id: u64,
    service: Option<Arc<str>>,
    item: PolicyRuleItem,
    route_cursor: AtomicU64,
    fallback_cursor: AtomicU64,
}

impl StoredRule {
    fn new(id: u64, service: Option<Arc<str>>, item: PolicyRuleItem) -> Self {
        Self {
            id,
            service,
            item,
            route_cursor: AtomicU64::new(0),
            fallback_cursor: AtomicU64::new(0),
        }
    }

    /// 规则库内唯一的编号，替换后重新分配。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 所属服务；全局规则返回 `None`。
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn item(&self) -> &PolicyRuleItem {
        &self.item
    }

    /// 领取下一张路由抽签号。
    pub fn next_route_ticket(&self) -> u64 {
        self.route_cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// 领取下一张降级抽签号。
    pub fn next_fallback_ticket(&self) -> u64 {
        self.fallback_cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// 规则是否接受本次调用；未配置匹配条件的规则接受一切。
    pub fn matches(&self, ctx: &InvocationContext) -> bool {
        self.item
            .matcher
            .as_ref()
            .is_none_or(|matcher| matcher.matches(ctx))
    }
}

impl fmt::Debug for StoredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredRule")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("precedence", &self.item.precedence)
            .finish()
    }
}

type RuleList = Arc<[Arc<StoredRule>]>;

#[derive(Clone)]
struct RuleTable {
    services: HashMap<Arc<str>, RuleList>,
    global: RuleList,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            global: Arc::from(Vec::new()),
        }
    }
}

/// 可热更新的路由规则库。
///
/// # 教案式说明
/// - **意图 (Why)**：规则读多写少，读路径不能被控制面推送阻塞。
/// - **契约 (What)**：
///   - [`replace`](Self::replace)/[`replace_global`](Self::replace_global)/[`remove`](Self::remove)
///     对后续调用立即可见，正在进行的调用继续使用旧表；
///   - [`load`](Self::load) 用一份完整配置替换全部规则；
///   - [`revision`](Self::revision) 每次修改后递增。
/// - **执行 (How)**：`ArcSwap<RuleTable>` 持有整张表，单服务修改通过 `rcu` 复制表头后替换。
/// - **风险 (Trade-offs)**：单服务修改会复制服务索引（只复制 `Arc`），服务数量极大时写入成本上升。
pub struct RoutingRuleStore {
    table: ArcSwap<RuleTable>,
    next_id: AtomicU64,
    revision: AtomicU64,
}

impl Default for RoutingRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRuleStore {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RuleTable::default()),
            next_id: AtomicU64::new(1),
            revision: AtomicU64::new(0),
        }
    }

    /// 替换某服务的规则列表；传入空列表等价于移除。
    pub fn replace(&self, service: &str, rules: Vec<PolicyRuleItem>) {
        let service: Arc<str> = Arc::from(service);
        let list = self.freeze(Some(&service), rules);
        self.table.rcu(|table| {
            let mut next = RuleTable::clone(table);
            if list.is_empty() {
                next.services.remove(&service);
            } else {
                next.services.insert(Arc::clone(&service), Arc::clone(&list));
            }
            next
        });
        self.bump(&format!("service `{service}`"), list.len());
    }

    /// 替换全局规则列表。
    pub fn replace_global(&self, rules: Vec<PolicyRuleItem>) {
        let list = self.freeze(None, rules);
        self.table.rcu(|table| {
            let mut next = RuleTable::clone(table);
            next.global = Arc::clone(&list);
            next
        });
        self.bump("global", list.len());
    }

    /// 移除某服务的专属规则，之后该服务回落到全局规则。
    pub fn remove(&self, service: &str) -> bool {
        let mut removed = false;
        self.table.rcu(|table| {
            let mut next = RuleTable::clone(table);
            removed = next.services.remove(service).is_some();
            next
        });
        if removed {
            self.bump(&format!("service `{service}`"), 0);
        }
        removed
    }

    /// 用完整配置替换全部规则。
    pub fn load(&self, config: RouteRuleConfig) {
        let mut table = RuleTable {
            services: HashMap::with_capacity(config.services.len()),
            global: self.freeze(None, config.global),
        };
        for (service, rules) in config.services {
            let service: Arc<str> = Arc::from(service);
            let list = self.freeze(Some(&service), rules);
            if !list.is_empty() {
                table.services.insert(service, list);
            }
        }
        let services = table.services.len();
        self.table.store(Arc::new(table));
        self.bump("all", services);
    }

    /// 对某服务生效的规则列表（专属规则优先，否则全局规则）。
    pub fn rules(&self, service: &str) -> RuleList {
        let table = self.table.load();
        table
            .services
            .get(service)
            .map_or_else(|| Arc::clone(&table.global), Arc::clone)
    }

    /// 找出第一条接受本次调用的规则。
    pub fn select(&self, service: &str, ctx: &InvocationContext) -> Option<Arc<StoredRule>> {
        self.rules(service)
            .iter()
            .find(|rule| rule.matches(ctx))
            .cloned()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn freeze(&self, service: Option<&Arc<str>>, mut rules: Vec<PolicyRuleItem>) -> RuleList {
        // 稳定排序：同优先级保留声明顺序。
        rules.sort_by(|left, right| right.precedence.cmp(&left.precedence));
        rules
            .into_iter()
            .map(|item| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(StoredRule::new(id, service.cloned(), item))
            })
            .collect()
    }

    fn bump(&self, scope: &str, rules: usize) {
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        info!(scope, rules, revision, "routing rules updated");
    }
}

impl fmt::Debug for RoutingRuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.load();
        f.debug_struct("RoutingRuleStore")
            .field("services", &table.services.len())
            .field("global", &table.global.len())
            .field("revision", &self.revision())
            .finish()
    }
}

/// 规则配置文件的结构。
///
/// ```toml
/// [[global]]
/// precedence = 1
/// route = [{ tags = { version = "1.0.0" } }]
///
/// [[services.cart]]
/// precedence = 2
/// match = { headers = { x-canary = { exact = "true" } } }
/// route = [{ weight = 100, tags = { version = "2.0.0" } }]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteRuleConfig {
    pub global: Vec<PolicyRuleItem>,
    pub services: BTreeMap<String, Vec<PolicyRuleItem>>,
}

impl RouteRuleConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, RuleConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.services.values().all(Vec::is_empty)
    }
}

/// 规则配置解析失败。
#[derive(Debug, Error)]
#[error("failed to parse routing rules")]
pub struct RuleConfigError(#[from] toml::de::Error);
