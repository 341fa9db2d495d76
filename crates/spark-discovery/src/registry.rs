//! # registry 模块说明
//!
//! ## 角色定位（Why）
//! - 注册中心客户端是解析链路唯一的上游数据源，这里定义它必须满足的契约
//!   [`RegistryClient`]，以及按 `(应用, 服务, 版本规则)` 划分的实例快照
//!   [`VersionedInstanceCache`]；
//! - [`InMemoryRegistry`] 是进程内参考实现，供静态部署、测试与基准使用。
//!
//! ## 契约（What）
//! - 快照一经发布不可修改，内容变化必然伴随新的 [`Revision`]；
//! - 同一键在内容未变化时反复调用 `get_or_create` 必须返回同一修订号，
//!   否则下游端点缓存会被无谓地重建；
//! - 上游不可用属于瞬时错误，必须以 `Err` 返回，不能伪装成空快照。
//!
//! ## 实现要点（How）
//! - 服务原始实例按 `(app, service)` 存放，发布即整体替换；
//! - 派生快照按 [`ServiceKey`] 缓存，并记录派生自哪个源修订号，源变化时才重建；
//! - 两张表都使用 `DashMap`，派生快照通过 `entry` 做“不存在则创建”，同一键的并发请求只会构建一次。

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::instance::Instance;
use crate::revision::Revision;
use crate::version::{VersionError, VersionRule};

/// 实例快照的缓存键：应用、服务名与版本规则。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    app_id: Arc<str>,
    service_name: Arc<str>,
    version_rule: Arc<str>,
}

impl ServiceKey {
    pub fn new(
        app_id: impl Into<Arc<str>>,
        service_name: impl Into<Arc<str>>,
        version_rule: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            version_rule: version_rule.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn version_rule(&self) -> &str {
        &self.version_rule
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.app_id, self.service_name, self.version_rule
        )
    }
}

/// 某个缓存键下的不可变实例快照。
///
/// # 教案式说明
/// - **意图 (Why)**：端点缓存只比较修订号即可判断是否需要重建，避免逐实例比对。
/// - **契约 (What)**：
///   - `instances` 以实例 ID 为键，遍历顺序稳定；
///   - 构造时分配新的全局修订号，因此两个独立构造的快照永远不会“同修订号”；
///   - 空快照是合法状态，表示当前确实没有符合条件的实例。
#[derive(Debug)]
pub struct VersionedInstanceCache {
    key: ServiceKey,
    revision: Revision,
    instances: BTreeMap<String, Arc<Instance>>,
}

impl VersionedInstanceCache {
    /// 以新修订号封装一批实例；同 ID 的实例后者覆盖前者。
    pub fn new(key: ServiceKey, instances: impl IntoIterator<Item = Arc<Instance>>) -> Self {
        let instances = instances
            .into_iter()
            .map(|instance| (instance.instance_id().to_owned(), instance))
            .collect();
        Self {
            key,
            revision: Revision::next(),
            instances,
        }
    }

    pub fn empty(key: ServiceKey) -> Self {
        Self::new(key, core::iter::empty())
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.values()
    }

    pub fn get(&self, instance_id: &str) -> Option<&Arc<Instance>> {
        self.instances.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 两个快照是否出自同一次发布。
    pub fn is_same_revision(&self, other: &Self) -> bool {
        self.revision == other.revision
    }
}

/// 注册中心访问错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// 上游暂时不可达，调用方可以稍后重试。
    #[error("registry unavailable while resolving `{key}`: {detail}")]
    Unavailable { key: String, detail: String },

    /// 缓存键中的版本规则无法解析。
    #[error("invalid version rule `{rule}` in `{key}`")]
    InvalidVersionRule {
        key: String,
        rule: String,
        #[source]
        source: VersionError,
    },
}

impl RegistryError {
    /// 稳定错误码，用于告警与日志聚合。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "registry.unavailable",
            Self::InvalidVersionRule { .. } => "registry.invalid_version_rule",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// 注册中心客户端契约。
///
/// - **契约 (What)**：内容不变时对同一键返回修订号相同的快照（通常是同一个 `Arc`）；
///   实现必须满足 `Send + Sync`，会被多条请求线程并发调用。
pub trait RegistryClient: Send + Sync + 'static {
    fn get_or_create(&self, key: &ServiceKey) -> Result<Arc<VersionedInstanceCache>, RegistryError>;
}

struct Published {
    revision: Revision,
    instances: Vec<Arc<Instance>>,
}

struct Derived {
    source: Revision,
    cache: Arc<VersionedInstanceCache>,
}

/// 进程内注册中心。
///
/// # 教案式说明
/// - **意图 (Why)**：为静态部署与测试提供一个满足 [`RegistryClient`] 契约的实现，
///   同时演示“源快照 + 按规则派生快照”的两级缓存。
/// - **契约 (What)**：
///   - [`publish`](Self::publish) 以新修订号整体替换某服务的实例列表；
///   - [`set_available`](Self::set_available) 为 `false` 时所有查询返回
///     [`RegistryError::Unavailable`]；
///   - 从未发布过的服务返回空快照，而不是错误。
/// - **执行 (How)**：派生快照记录源修订号；查询时比较源修订号，不一致才重建。
/// - **风险 (Trade-offs)**：重建在 `DashMap` 分片锁内完成，规模较大的实例列表会短暂阻塞同分片的其他键。
pub struct InMemoryRegistry {
    services: DashMap<(Arc<str>, Arc<str>), Arc<Published>>,
    derived: DashMap<ServiceKey, Derived>,
    available: AtomicBool,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            derived: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// 替换某服务的全部实例，返回本次发布的源修订号。
    pub fn publish(
        &self,
        app_id: &str,
        service_name: &str,
        instances: impl IntoIterator<Item = Instance>,
    ) -> Revision {
        let published = Published {
            revision: Revision::next(),
            instances: instances.into_iter().map(Arc::new).collect(),
        };
        let revision = published.revision;
        debug!(
            app_id,
            service = service_name,
            instances = published.instances.len(),
            %revision,
            "publish service instances"
        );
        self.services
            .insert((Arc::from(app_id), Arc::from(service_name)), Arc::new(published));
        revision
    }

    /// 下线整个服务；之后的查询返回空快照。
    pub fn remove_service(&self, app_id: &str, service_name: &str) -> bool {
        self.services
            .remove(&(Arc::from(app_id), Arc::from(service_name)))
            .is_some()
    }

    /// 切换可用状态，用于模拟上游故障。
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// 从 TOML 文本加载静态实例清单，按服务分组发布，返回发布的服务数量。
    ///
    /// 文件格式：顶层 `app_id`，以及若干 `[[instances]]` 表（字段同 [`Instance`]）。
    pub fn load_toml(&self, text: &str) -> Result<usize, RegistryFileError> {
        let file: RegistryFile = toml::from_str(text)?;
        let mut grouped: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for instance in file.instances {
            grouped
                .entry(instance.service_name().to_owned())
                .or_default()
                .push(instance);
        }
        let count = grouped.len();
        for (service, instances) in grouped {
            self.publish(&file.app_id, &service, instances);
        }
        Ok(count)
    }

    fn snapshot_of(&self, key: &ServiceKey) -> Option<Arc<Published>> {
        self.services
            .get(&(Arc::from(key.app_id()), Arc::from(key.service_name())))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl RegistryClient for InMemoryRegistry {
    fn get_or_create(&self, key: &ServiceKey) -> Result<Arc<VersionedInstanceCache>, RegistryError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(RegistryError::Unavailable {
                key: key.to_string(),
                detail: "in-memory registry marked unavailable".to_owned(),
            });
        }
        let rule: VersionRule =
            key.version_rule()
                .parse()
                .map_err(|source| RegistryError::InvalidVersionRule {
                    key: key.to_string(),
                    rule: key.version_rule().to_owned(),
                    source,
                })?;
        let published = self.snapshot_of(key);
        let source = published
            .as_ref()
            .map_or(Revision::ZERO, |published| published.revision);
        let build = || {
            let selected = published
                .as_ref()
                .map(|published| rule.select(&published.instances))
                .unwrap_or_default();
            let cache = Arc::new(VersionedInstanceCache::new(key.clone(), selected));
            debug!(
                service = %key,
                source = %source,
                revision = %cache.revision(),
                instances = cache.len(),
                "derive versioned instance cache"
            );
            cache
        };

        match self.derived.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().source == source {
                    return Ok(Arc::clone(&occupied.get().cache));
                }
                let cache = build();
                occupied.insert(Derived {
                    source,
                    cache: Arc::clone(&cache),
                });
                Ok(cache)
            }
            Entry::Vacant(vacant) => {
                let cache = build();
                vacant.insert(Derived {
                    source,
                    cache: Arc::clone(&cache),
                });
                Ok(cache)
            }
        }
    }
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default = "default_app_id")]
    app_id: String,
    #[serde(default)]
    instances: Vec<Instance>,
}

fn default_app_id() -> String {
    "default".to_owned()
}

/// 静态实例清单解析失败。
#[derive(Debug, Error)]
#[error("failed to parse registry file")]
pub struct RegistryFileError(#[from] toml::de::Error);
