use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{DiscoveryFilter, FilterDescriptor, FilterError};
use crate::context::DiscoveryContext;
use crate::endpoint::Endpoint;
use crate::instance::ENVIRONMENT_PROPERTY;
use crate::transport::TransportRegistry;

/// 属性值的最大长度，超出视为配置错误。
const MAX_PROPERTY_VALUE_LEN: usize = 10_000;

static TRANSPORT_AVAILABILITY: FilterDescriptor = FilterDescriptor::new(
    "spark.discovery.transport-availability",
    "drop endpoints whose transport is no longer registered",
);

/// 剔除传输已被注销或替换的端点。
///
/// 端点快照只在实例修订号变化时重建，期间传输插件可能被卸载；该过滤器在请求期补上这道检查。
pub struct TransportAvailabilityFilter {
    transports: Arc<TransportRegistry>,
}

impl TransportAvailabilityFilter {
    pub const ORDER: i32 = -1_000;

    pub fn new(transports: Arc<TransportRegistry>) -> Self {
        Self { transports }
    }
}

impl DiscoveryFilter for TransportAvailabilityFilter {
    fn descriptor(&self) -> &FilterDescriptor {
        &TRANSPORT_AVAILABILITY
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn filter(
        &self,
        _ctx: &DiscoveryContext<'_>,
        mut candidates: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, FilterError> {
        candidates.retain(|endpoint| self.transports.is_current(endpoint.transport()));
        Ok(candidates)
    }
}

/// 按实例属性分层优先的过滤器。
///
/// # 教案式说明
/// - **意图 (Why)**：同一服务部署在多层级环境（如 `prod.gray.zone-a`）时，优先选择与调用方
///   最贴近的一组实例，没有就逐级放宽。
/// - **契约 (What)**：
///   - 候选按属性 `key` 的取值分组，未声明该属性的实例归入空值组；
///   - 调用方取值依次从调用上下文属性、配置的默认值中获得；
///   - 取值 `a.b.c` 依次尝试 `a.b.c`、`a.b`、`a`、空值组，第一个非空组胜出；
///   - 所有层级都为空时原样返回全部候选；
///   - 调用方取值超过 10000 字符视为请求错误。
/// - **风险 (Trade-offs)**：分组在每次调用时重新计算，候选规模较大时需要关注开销。
pub struct PriorityPropertyFilter {
    descriptor: FilterDescriptor,
    key: String,
    default_value: Option<String>,
    enabled: bool,
}

impl PriorityPropertyFilter {
    pub const ORDER: i32 = 300;

    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            descriptor: FilterDescriptor::owned(
                format!("spark.discovery.priority-property.{key}"),
                "prefer instances whose property is closest to the caller",
            ),
            key,
            default_value: None,
            enabled: true,
        }
    }

    /// 以 `environment` 属性分层。
    pub fn environment() -> Self {
        Self::new(ENVIRONMENT_PROPERTY)
    }

    pub fn with_default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn caller_value<'a>(&'a self, ctx: &DiscoveryContext<'a>) -> &'a str {
        ctx.invocation()
            .property(&self.key)
            .or(self.default_value.as_deref())
            .unwrap_or("")
    }
}

impl DiscoveryFilter for PriorityPropertyFilter {
    fn descriptor(&self) -> &FilterDescriptor {
        &self.descriptor
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self) -> Result<(), FilterError> {
        if self.key.is_empty() {
            return Err(FilterError::new("priority property key must not be empty"));
        }
        match &self.default_value {
            Some(value) if value.len() > MAX_PROPERTY_VALUE_LEN => Err(FilterError::new(
                "priority property default value exceeds 10000 characters",
            )),
            _ => Ok(()),
        }
    }

    fn filter(
        &self,
        ctx: &DiscoveryContext<'_>,
        candidates: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, FilterError> {
        let caller = self.caller_value(ctx);
        if caller.len() > MAX_PROPERTY_VALUE_LEN {
            return Err(FilterError::new(format!(
                "caller property `{}` exceeds {MAX_PROPERTY_VALUE_LEN} characters",
                self.key
            )));
        }

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, endpoint) in candidates.iter().enumerate() {
            let value = endpoint.instance().property(&self.key).unwrap_or("");
            groups.entry(value).or_default().push(index);
        }

        let mut level = caller;
        let chosen = loop {
            if let Some(indexes) = groups.get(level).filter(|indexes| !indexes.is_empty()) {
                break Some(indexes.clone());
            }
            if level.is_empty() {
                break None;
            }
            level = level.rsplit_once('.').map_or("", |(parent, _)| parent);
        };

        let Some(indexes) = chosen else {
            return Ok(candidates);
        };
        debug!(
            service = %ctx.key(),
            property = self.key.as_str(),
            caller,
            matched = level,
            kept = indexes.len(),
            "priority property group selected"
        );
        let mut keep = vec![false; candidates.len()];
        for index in indexes {
            keep[index] = true;
        }
        Ok(candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(endpoint, keep)| keep.then_some(endpoint))
            .collect())
    }
}
