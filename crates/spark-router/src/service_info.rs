use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use spark_discovery::compare_versions;

use crate::tag::{RouteTarget, TagItem};

/// 按服务记录最近一次观察到的最新版本。
///
/// - **契约 (What)**：条目按需创建（不存在才插入），之后只更新其中的最新版本标签；
///   同一服务的并发更新互不阻塞，读者总能看到某一次完整的写入。
#[derive(Default)]
pub struct ServiceInfoCache {
    services: DashMap<Arc<str>, Arc<ServiceInfo>>,
}

/// 单个服务的路由信息。
#[derive(Default)]
pub struct ServiceInfo {
    latest: ArcSwapOption<TagItem>,
}

impl ServiceInfo {
    pub fn latest_version(&self) -> Option<Arc<TagItem>> {
        self.latest.load_full()
    }
}

impl ServiceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从候选集合中计算最新版本并记录。
    ///
    /// 只考虑服务名等于 `service` 的目标，且优先只看 `UP` 的目标：下线的高版本实例
    /// 不会把最新版本集合拉到一个无法接流量的版本上。全部目标都不是 `UP` 时才退回
    /// 全集计算；没有任何目标时记录为 `None`。
    pub fn init_latest_version<T: RouteTarget>(
        &self,
        service: &str,
        targets: &[T],
    ) -> Option<Arc<TagItem>> {
        let highest = |up_only: bool| {
            targets
                .iter()
                .filter(|target| target.service_name() == service)
                .filter(|target| !up_only || target.is_up())
                .map(RouteTarget::version)
                .max_by(|left, right| compare_versions(left, right))
        };
        let latest = highest(true)
            .or_else(|| highest(false))
            .map(|version| Arc::new(TagItem::with_version(version)));
        self.entry(service).latest.store(latest.clone());
        latest
    }

    pub fn latest_version(&self, service: &str) -> Option<Arc<TagItem>> {
        self.services
            .get(service)
            .and_then(|info| info.latest_version())
    }

    fn entry(&self, service: &str) -> Arc<ServiceInfo> {
        if let Some(info) = self.services.get(service) {
            return Arc::clone(info.value());
        }
        Arc::clone(
            self.services
                .entry(Arc::from(service))
                .or_insert_with(|| Arc::new(ServiceInfo::default()))
                .value(),
        )
    }
}
