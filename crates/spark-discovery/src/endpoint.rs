//! # endpoint 模块说明
//!
//! ## 角色定位（Why）
//! - 实例快照描述“有哪些实例”，端点快照描述“这些实例里本进程能调用哪些地址”；
//! - [`EndpointCache`] 在实例快照之上做一层按修订号失效的派生缓存，
//!   未变化时每次调用都直接返回同一个 `Arc<EndpointSet>`。
//!
//! ## 契约（What）
//! - [`Endpoint`] 只能由缓存重建时绑定，外部无法伪造；
//! - 实例声明了未注册传输的 URI 时跳过该 URI 并记录告警，不会让整体失败；
//! - 并发重建时，缓存只会前进到修订号更大的快照，不会被较旧的结果覆盖。

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use crate::instance::Instance;
use crate::registry::{RegistryClient, RegistryError, ServiceKey, VersionedInstanceCache};
use crate::revision::Revision;
use crate::transport::{AddressError, EndpointAddress, Transport, TransportRegistry};

struct EndpointInner {
    transport: Arc<dyn Transport>,
    uri: Arc<str>,
    address: EndpointAddress,
    instance: Arc<Instance>,
}

/// 绑定了传输实现的可调用地址。
///
/// 克隆只增加一次引用计数。相等性按 `(实例 ID, URI, 传输名)` 判断。
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn bind(
        transport: Arc<dyn Transport>,
        uri: &str,
        instance: Arc<Instance>,
    ) -> Result<Self, AddressError> {
        let address = transport.parse_address(uri)?;
        Ok(Self {
            inner: Arc::new(EndpointInner {
                transport,
                uri: Arc::from(uri),
                address,
                instance,
            }),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.inner.instance
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.instance.instance_id() == other.inner.instance.instance_id()
                && self.inner.uri == other.inner.uri
                && self.transport_name() == other.transport_name())
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("transport", &self.transport_name())
            .field("uri", &self.uri())
            .field("instance", &self.inner.instance.instance_id())
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.inner.instance.instance_id(), self.inner.uri)
    }
}

/// 某一修订号下的端点快照。
///
/// - **契约 (What)**：`revision` 等于派生它的实例快照的修订号；`instance_count` 记录实例快照
///   的实例数，用于区分“没有实例”和“有实例但没有可用传输”。
#[derive(Debug)]
pub struct EndpointSet {
    key: ServiceKey,
    revision: Revision,
    instance_count: usize,
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// 按修订号失效的端点缓存。
///
/// # 教案式说明
/// - **意图 (Why)**：每次调用都重新解析 URI、查找传输代价过高；实例快照不变时端点必然不变。
/// - **契约 (What)**：
///   - [`latest_endpoints`](Self::latest_endpoints) 在修订号未变化时返回同一个 `Arc`；
///   - 修订号变化时按传输名分组重建，未注册的传输被跳过并记录 `warn` 日志；
///   - `transport_filter` 非空时只保留该传输的端点，空字符串表示全部传输；
///   - 注册中心错误原样返回，不污染已缓存的快照。
/// - **执行 (How)**：
///   1. 从注册中心取实例快照；
///   2. 与当前端点快照比较修订号，一致则直接返回；
///   3. 否则重建，并通过 `rcu` 安装：若另一个线程已安装了更新的快照则保留它。
/// - **风险 (Trade-offs)**：并发失效时可能有多个线程同时重建，结果相同，只浪费少量 CPU；
///   换来的是读路径完全无锁。
pub struct EndpointCache {
    key: ServiceKey,
    transport_filter: Option<Arc<str>>,
    registry: Arc<dyn RegistryClient>,
    transports: Arc<TransportRegistry>,
    current: ArcSwapOption<EndpointSet>,
    rebuilds: AtomicU64,
}

impl EndpointCache {
    pub fn new(
        key: ServiceKey,
        transport_filter: &str,
        registry: Arc<dyn RegistryClient>,
        transports: Arc<TransportRegistry>,
    ) -> Self {
        let transport_filter = (!transport_filter.is_empty()).then(|| Arc::from(transport_filter));
        Self {
            key,
            transport_filter,
            registry,
            transports,
            current: ArcSwapOption::empty(),
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// 返回与最新实例快照一致的端点快照。
    pub fn latest_endpoints(&self) -> Result<Arc<EndpointSet>, RegistryError> {
        let instances = self.registry.get_or_create(&self.key)?;
        if let Some(current) = self.current.load().as_ref() {
            if current.revision() == instances.revision() {
                return Ok(Arc::clone(current));
            }
        }

        let rebuilt = Arc::new(self.rebuild(&instances));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        self.current.rcu(|current| match current {
            Some(current) if current.revision() > rebuilt.revision() => Some(Arc::clone(current)),
            _ => Some(Arc::clone(&rebuilt)),
        });
        Ok(rebuilt)
    }

    /// 累计重建次数。
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn rebuild(&self, instances: &VersionedInstanceCache) -> EndpointSet {
        let mut grouped: BTreeMap<&str, Vec<(&Arc<Instance>, &str)>> = BTreeMap::new();
        for instance in instances.instances() {
            for uri in instance.endpoints() {
                let Some((scheme, _)) = uri.split_once("://") else {
                    warn!(
                        service = %self.key,
                        instance = instance.instance_id(),
                        uri = uri.as_str(),
                        "endpoint uri has no scheme, skipped"
                    );
                    continue;
                };
                if let Some(filter) = &self.transport_filter {
                    if &**filter != scheme {
                        continue;
                    }
                }
                grouped
                    .entry(scheme)
                    .or_default()
                    .push((instance, uri.as_str()));
            }
        }

        let mut endpoints = Vec::new();
        for (scheme, members) in grouped {
            let Some(transport) = self.transports.find(scheme) else {
                warn!(
                    service = %self.key,
                    transport = scheme,
                    skipped = members.len(),
                    "transport not registered, endpoints skipped"
                );
                continue;
            };
            for (instance, uri) in members {
                match Endpoint::bind(Arc::clone(&transport), uri, Arc::clone(instance)) {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(error) => warn!(
                        service = %self.key,
                        instance = instance.instance_id(),
                        %error,
                        "endpoint address rejected by transport, skipped"
                    ),
                }
            }
        }

        debug!(
            service = %self.key,
            revision = %instances.revision(),
            instances = instances.len(),
            endpoints = endpoints.len(),
            "endpoint cache rebuilt"
        );
        EndpointSet {
            key: self.key.clone(),
            revision: instances.revision(),
            instance_count: instances.len(),
            endpoints,
        }
    }
}

impl fmt::Debug for EndpointCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCache")
            .field("key", &self.key)
            .field("transport_filter", &self.transport_filter)
            .field("rebuilds", &self.rebuild_count())
            .finish()
    }
}
