//! # spark-governance
//!
//! ## 角色定位（Why）
//! - 解析链路的后半段：路由之后做可见性检查（环境隔离、属性子集），再由负载均衡选出单个端点，
//!   最后给出本次调用的故障注入决策；
//! - 各组件都是近乎无状态的决策函数，唯一的可变状态是按键计数的原子计数器。
//!
//! ## 模块导览（What）
//! - [`isolation`]：状态与环境隔离、属性子集过滤；
//! - [`fault`]：百分比故障注入与分层配置；
//! - [`balance`]：负载均衡契约与轮询实现；
//! - [`TrafficControlGate`]：把隔离、属性过滤与故障注入组合成解析链路使用的一道闸门。

pub mod balance;
pub mod fault;
pub mod isolation;

use std::collections::BTreeMap;

use spark_discovery::{Endpoint, InvocationContext};
use tracing::debug;

pub use balance::{BalanceError, LoadBalancer, RoundRobin};
pub use fault::{
    AbortFault, DelayFault, FaultConfig, FaultConfigError, FaultDecision, FaultInjectionGate,
    FaultRule, FaultScope, SchemaFaultScope, ServiceFaultScope, should_inject,
};
pub use isolation::{IsolationPolicy, matches_properties, retain_matching};

/// 流量控制闸门。
///
/// # 教案式说明
/// - **意图 (Why)**：解析链路只需要两个问题的答案：“这些候选里哪些可以接流量”与
///   “这次调用要不要注入故障”，闸门把相关配置与计数器收拢在一处。
/// - **契约 (What)**：
///   - [`admit`](Self::admit) 只做过滤，不会重排候选；
///   - [`fault_decision`](Self::fault_decision) 在选定端点之后调用，按端点的传输名与调用的操作名计数；
///     没有适用规则时不推进任何计数器。
pub struct TrafficControlGate {
    isolation: IsolationPolicy,
    required_properties: BTreeMap<String, String>,
    fault_config: FaultConfig,
    faults: FaultInjectionGate,
}

impl TrafficControlGate {
    pub fn new(
        isolation: IsolationPolicy,
        required_properties: BTreeMap<String, String>,
        fault_config: FaultConfig,
    ) -> Self {
        Self {
            isolation,
            required_properties,
            fault_config,
            faults: FaultInjectionGate::new(),
        }
    }

    /// 不做任何限制的闸门。
    pub fn permissive() -> Self {
        Self::new(IsolationPolicy::disabled(), BTreeMap::new(), FaultConfig::default())
    }

    pub fn isolation(&self) -> &IsolationPolicy {
        &self.isolation
    }

    pub fn fault_config(&self) -> &FaultConfig {
        &self.fault_config
    }

    /// 过滤出可以接流量的候选。
    pub fn admit(&self, mut candidates: Vec<Endpoint>, ctx: &InvocationContext) -> Vec<Endpoint> {
        let before = candidates.len();
        self.isolation.retain(&mut candidates, ctx.environment());
        retain_matching(&mut candidates, &self.required_properties);
        if candidates.len() != before {
            debug!(
                before,
                after = candidates.len(),
                "traffic control gate dropped candidates"
            );
        }
        candidates
    }

    /// 对已选定的端点给出故障注入决策。
    pub fn fault_decision(
        &self,
        service: &str,
        endpoint: &Endpoint,
        ctx: &InvocationContext,
    ) -> FaultDecision {
        let transport = endpoint.transport_name();
        let Some(rule) =
            self.fault_config
                .lookup(service, ctx.schema_id(), ctx.operation(), transport)
        else {
            return FaultDecision::none();
        };
        let operation = match (ctx.schema_id(), ctx.operation()) {
            (Some(schema), Some(operation)) => format!("{service}.{schema}.{operation}"),
            (None, Some(operation)) => format!("{service}.{operation}"),
            _ => service.to_owned(),
        };
        self.faults.decide(transport, &operation, rule)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use spark_discovery::{
        Endpoint, EndpointCache, InMemoryRegistry, Instance, NamedTransport, RegistryClient,
        ServiceKey, TransportRegistry,
    };

    /// 通过进程内注册中心与端点缓存绑定端点；未声明地址的实例补上 `rest://{id}:80`。
    pub fn endpoints(instances: Vec<Instance>) -> Vec<Endpoint> {
        let service = instances
            .first()
            .map(|instance| instance.service_name().to_owned())
            .unwrap_or_default();
        let instances = instances.into_iter().map(|instance| {
            if instance.endpoints().is_empty() {
                let uri = format!("rest://{}:80", instance.instance_id());
                instance.to_builder().endpoint(uri).build()
            } else {
                instance
            }
        });
        let registry = Arc::new(InMemoryRegistry::new());
        registry.publish("test", &service, instances);
        let transports = Arc::new(TransportRegistry::new());
        transports.register(NamedTransport::shared("rest"));
        let cache = EndpointCache::new(
            ServiceKey::new("test", service, "0.0.0+"),
            "",
            registry as Arc<dyn RegistryClient>,
            transports,
        );
        cache.latest_endpoints().unwrap().endpoints().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::endpoints;
    use spark_discovery::{Instance, InstanceStatus};

    #[test]
    fn admit_combines_isolation_and_properties() {
        let gate = TrafficControlGate::new(
            IsolationPolicy::new(Some("production")),
            [("zone".to_owned(), "a".to_owned())].into(),
            FaultConfig::default(),
        );
        let candidates = endpoints(vec![
            Instance::builder("a", "svc", "1")
                .environment("production")
                .property("zone", "a")
                .build(),
            Instance::builder("b", "svc", "1")
                .environment("production")
                .property("zone", "b")
                .build(),
            Instance::builder("c", "svc", "1")
                .environment("production")
                .property("zone", "a")
                .status(InstanceStatus::OutOfService)
                .build(),
        ]);
        let admitted = gate.admit(candidates, &InvocationContext::new());
        let ids: Vec<_> = admitted.iter().map(|e| e.instance().instance_id()).collect();
        assert_eq!(ids, ["a"]);
    }

    #[test]
    fn caller_environment_overrides_default() {
        let gate = TrafficControlGate::new(
            IsolationPolicy::new(Some("production")),
            BTreeMap::new(),
            FaultConfig::default(),
        );
        let candidates = endpoints(vec![
            Instance::builder("p", "svc", "1").environment("production").build(),
            Instance::builder("t", "svc", "1").environment("testing").build(),
        ]);
        let ctx = InvocationContext::new().with_environment("testing");
        let admitted = gate.admit(candidates, &ctx);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].instance().instance_id(), "t");
    }

    #[test]
    fn fault_decision_without_rule_is_none() {
        let gate = TrafficControlGate::permissive();
        let endpoint = endpoints(vec![Instance::builder("a", "svc", "1").build()]).remove(0);
        let decision = gate.fault_decision("svc", &endpoint, &InvocationContext::new());
        assert!(decision.is_none());
    }

    #[test]
    fn fault_decision_uses_endpoint_transport() {
        let config = FaultConfig {
            global: FaultScope::default().with_protocol("rest", FaultRule::abort(100, 503)),
            ..FaultConfig::default()
        };
        let gate = TrafficControlGate::new(IsolationPolicy::disabled(), BTreeMap::new(), config);
        let endpoint = endpoints(vec![Instance::builder("a", "svc", "1").build()]).remove(0);
        let ctx = InvocationContext::new().with_operation("CartEndpoint", "add");
        assert_eq!(gate.fault_decision("svc", &endpoint, &ctx).abort, Some(503));
    }
}
