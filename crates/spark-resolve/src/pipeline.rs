//! # pipeline 模块说明
//!
//! ## 角色定位（Why）
//! - 把发现、路由、治理与负载均衡串成一次同步的解析调用：
//!   “调用服务 S、版本规则 V” → “把请求发往端点 E”；
//! - 所有共享状态（端点缓存、规则表、计数器）都归流水线实例所有，同一进程内可以并存多条
//!   互不干扰的流水线。
//!
//! ## 执行流程（How）
//! 1. 以 `(应用, 服务, 版本规则)` 取端点缓存，修订号未变时直接复用上次的端点快照；
//! 2. 区分“没有实例”与“有实例但传输不可用”；
//! 3. 依次执行发现过滤链；
//! 4. 选出适用的路由规则并分桶；
//! 5. 流量闸门做隔离与属性过滤；
//! 6. 负载均衡选出端点，目标名由缓存键与路由结果组成；
//! 7. 对选中的端点给出故障注入决策。

use std::sync::Arc;

use dashmap::DashMap;
use spark_discovery::{
    DiscoveryContext, DiscoveryFilter, DiscoveryFilterChain, Endpoint, EndpointCache,
    InvocationContext, PriorityPropertyFilter, RegistryClient, ServiceKey, Transport,
    TransportAvailabilityFilter, TransportRegistry,
};
use spark_governance::{
    FaultDecision, IsolationPolicy, LoadBalancer, RoundRobin, TrafficControlGate,
};
use spark_router::{RouteDecision, RoutingRuleStore, RuleValidationError, TagSelector, TrafficRouter};
use tracing::{debug, error, info, warn};

use crate::config::ResolverConfig;
use crate::error::{BuildError, ResolveError};

/// 无规则适用时负载均衡目标名的后缀。
const UNROUTED_LABEL: &str = "all";

/// 一次成功解析的结果。
#[derive(Clone, Debug)]
pub struct Resolution {
    /// 选中的端点。
    pub endpoint: Endpoint,
    /// 路由决策；没有适用规则时为 `None`。
    pub route: Option<RouteDecision>,
    /// 调用方在发送前需要执行的故障注入。
    pub fault: FaultDecision,
    /// 负载均衡使用的目标名。
    pub balancer_target: String,
}

impl Resolution {
    /// 适用规则校验失败时的错误；此时端点取自最新版本集合。
    pub fn rule_fault(&self) -> Option<&RuleValidationError> {
        self.route.as_ref().and_then(RouteDecision::rule_fault)
    }
}

/// 解析流水线。
///
/// # 教案式说明
/// - **意图 (Why)**：调用层只关心“这次发给谁”，流水线把七个步骤与它们的缓存封装在一起。
/// - **契约 (What)**：
///   - [`resolve`](Self::resolve) 可被任意线程并发调用，内部不阻塞、不做网络 I/O
///     （注册中心访问的代价由 [`RegistryClient`] 实现决定）；
///   - 失败以 [`ResolveError`] 同步返回，流水线不重试；
///   - 路由规则可在运行期经 [`rules`](Self::rules) 整表热替换，进行中的解析继续使用旧表。
/// - **风险 (Trade-offs)**：端点缓存按键常驻，键的基数等于“服务 × 版本规则”的组合数。
pub struct ResolvePipeline {
    app_id: Arc<str>,
    transport_filter: String,
    registry: Arc<dyn RegistryClient>,
    transports: Arc<TransportRegistry>,
    caches: DashMap<ServiceKey, Arc<EndpointCache>>,
    chain: DiscoveryFilterChain,
    rules: RoutingRuleStore,
    router: TrafficRouter,
    gate: TrafficControlGate,
    balancer: Arc<dyn LoadBalancer>,
}

impl ResolvePipeline {
    pub fn builder(registry: Arc<dyn RegistryClient>) -> ResolvePipelineBuilder {
        ResolvePipelineBuilder::new(registry)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn rules(&self) -> &RoutingRuleStore {
        &self.rules
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    pub fn filter_chain(&self) -> &DiscoveryFilterChain {
        &self.chain
    }

    pub fn gate(&self) -> &TrafficControlGate {
        &self.gate
    }

    /// 已创建的端点缓存（若有）。
    pub fn endpoint_cache(&self, key: &ServiceKey) -> Option<Arc<EndpointCache>> {
        self.caches.get(key).map(|cache| Arc::clone(cache.value()))
    }

    /// 把一次调用解析为单个端点。
    ///
    /// 应用名取自调用上下文，未携带时使用配置中的 `app_id`。
    pub fn resolve(
        &self,
        service: &str,
        version_rule: &str,
        ctx: &InvocationContext,
    ) -> Result<Resolution, ResolveError> {
        let app_id = ctx.app_id().unwrap_or(&self.app_id);
        let key = ServiceKey::new(app_id, service, version_rule);
        let cache = self.cache_for(&key);

        let snapshot = cache
            .latest_endpoints()
            .map_err(|source| ResolveError::Registry {
                key: key.to_string(),
                source,
            })?;
        if snapshot.instance_count() == 0 {
            debug!(service = %key, "no instances registered");
            return Err(ResolveError::NoInstancesFound {
                key: key.to_string(),
            });
        }
        if snapshot.is_empty() {
            warn!(
                service = %key,
                instances = snapshot.instance_count(),
                transport = self.transport_filter.as_str(),
                "instances found but no transport available"
            );
            return Err(ResolveError::NoTransportAvailable {
                key: key.to_string(),
                instances: snapshot.instance_count(),
            });
        }

        let discovery = DiscoveryContext::new(&key, ctx);
        let candidates = self
            .chain
            .filter(&discovery, snapshot.endpoints().to_vec())
            .map_err(|source| {
                error!(
                    service = %key,
                    filter = source.filter(),
                    code = source.code(),
                    %source,
                    "discovery filter failed"
                );
                ResolveError::FilterChainFault {
                    key: key.to_string(),
                    source,
                }
            })?;

        let (candidates, route) = match self.rules.select(service, ctx) {
            Some(rule) => {
                let distribution = self.router.distribute(service, &candidates, &rule);
                (distribution.targets, Some(distribution.decision))
            }
            None => (candidates, None),
        };

        let candidates = self.gate.admit(candidates, ctx);
        let label = route
            .as_ref()
            .map_or_else(|| UNROUTED_LABEL.to_owned(), RouteDecision::label);
        let balancer_target = format!("{key}#{label}");
        let endpoint = self.balancer.select(&balancer_target, &candidates)?;
        let fault = self.gate.fault_decision(service, &endpoint, ctx);

        debug!(
            service = %key,
            target = balancer_target.as_str(),
            endpoint = %endpoint,
            "invocation resolved"
        );
        Ok(Resolution {
            endpoint,
            route,
            fault,
            balancer_target,
        })
    }

    fn cache_for(&self, key: &ServiceKey) -> Arc<EndpointCache> {
        if let Some(cache) = self.caches.get(key) {
            return Arc::clone(cache.value());
        }
        let entry = self.caches.entry(key.clone()).or_insert_with(|| {
            Arc::new(EndpointCache::new(
                key.clone(),
                &self.transport_filter,
                Arc::clone(&self.registry),
                Arc::clone(&self.transports),
            ))
        });
        Arc::clone(entry.value())
    }
}

/// [`ResolvePipeline`] 的构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：过滤器、传输与策略在进程启动时显式登记，构建完成后过滤链即冻结。
/// - **契约 (What)**：
///   - 传输可用性过滤器总是被装入；配置启用时再装入优先属性过滤器；
///   - 配置或任一过滤器的启动期校验失败时返回 [`BuildError`]；
///   - 未指定时使用加权轮询抽签与按目标轮询的负载均衡。
pub struct ResolvePipelineBuilder {
    registry: Arc<dyn RegistryClient>,
    config: ResolverConfig,
    transports: Arc<TransportRegistry>,
    filters: Vec<Arc<dyn DiscoveryFilter>>,
    selector: Option<Arc<dyn TagSelector>>,
    balancer: Option<Arc<dyn LoadBalancer>>,
}

impl ResolvePipelineBuilder {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            config: ResolverConfig::default(),
            transports: Arc::new(TransportRegistry::new()),
            filters: Vec::new(),
            selector: None,
            balancer: None,
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// 共享一个外部维护的传输注册表。
    pub fn with_transports(mut self, transports: Arc<TransportRegistry>) -> Self {
        self.transports = transports;
        self
    }

    /// 向当前传输注册表登记一个传输。
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        self.transports.register(transport);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn DiscoveryFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_tag_selector(mut self, selector: Arc<dyn TagSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_load_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn build(self) -> Result<ResolvePipeline, BuildError> {
        let Self {
            registry,
            config,
            transports,
            filters,
            selector,
            balancer,
        } = self;
        config.validate()?;

        let isolation = if config.isolation.enabled {
            IsolationPolicy::new(config.environment())
        } else {
            IsolationPolicy::disabled()
        };

        let mut chain = DiscoveryFilterChain::builder().with_filter(Arc::new(
            TransportAvailabilityFilter::new(Arc::clone(&transports)),
        ));
        if config.priority_property.enabled {
            let mut priority = PriorityPropertyFilter::new(config.priority_property.key.as_str());
            if let Some(value) = &config.priority_property.value {
                priority = priority.with_default_value(value.as_str());
            }
            chain = chain.with_filter(Arc::new(priority));
        }
        for filter in filters {
            chain = chain.with_filter(filter);
        }
        let chain = chain.build()?;

        let rules = RoutingRuleStore::new();
        if !config.routes.is_empty() {
            rules.load(config.routes);
        }

        let router = selector.map_or_else(TrafficRouter::default, TrafficRouter::new);
        let balancer: Arc<dyn LoadBalancer> = match balancer {
            Some(balancer) => balancer,
            None => Arc::new(RoundRobin::new()),
        };
        let gate = TrafficControlGate::new(isolation, config.required_properties, config.fault);

        info!(
            app_id = config.app_id.as_str(),
            transport = config.transport.as_str(),
            filters = ?chain.names(),
            transports = ?transports.names(),
            "resolve pipeline assembled"
        );
        Ok(ResolvePipeline {
            app_id: Arc::from(config.app_id),
            transport_filter: config.transport,
            registry,
            transports,
            caches: DashMap::new(),
            chain,
            rules,
            router,
            gate,
            balancer,
        })
    }
}
