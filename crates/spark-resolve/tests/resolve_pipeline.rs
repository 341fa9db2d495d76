//! 解析流水线的端到端行为：错误分类、缓存复用、灰度路由与流量治理。

use std::collections::BTreeMap;
use std::sync::Arc;

use spark_discovery::{
    DiscoveryContext, DiscoveryFilter, Endpoint, FilterDescriptor, FilterError, InMemoryRegistry,
    Instance, InstanceStatus, InvocationContext, NamedTransport, RegistryError, ServiceKey,
};
use spark_governance::{FaultRule, FaultScope};
use spark_router::{
    HeaderRule, LatestReason, Matcher, PolicyRuleItem, RouteDecision, RouteItem, TagItem,
};
use spark_resolve::{BuildError, ResolveError, ResolvePipeline, ResolverConfig};

fn instance(id: &str, version: &str) -> Instance {
    Instance::builder(id, "cart", version)
        .endpoint(format!("rest://{id}:8080"))
        .build()
}

fn pipeline_with(registry: &Arc<InMemoryRegistry>, config: ResolverConfig) -> ResolvePipeline {
    ResolvePipeline::builder(Arc::clone(registry) as _)
        .with_config(config)
        .with_transport(NamedTransport::shared("rest"))
        .build()
        .unwrap()
}

fn pipeline(registry: &Arc<InMemoryRegistry>) -> ResolvePipeline {
    pipeline_with(registry, ResolverConfig::default())
}

fn resolve_id(pipeline: &ResolvePipeline, ctx: &InvocationContext) -> String {
    pipeline
        .resolve("cart", "0.0.0+", ctx)
        .unwrap()
        .endpoint
        .instance()
        .instance_id()
        .to_owned()
}

#[test]
fn round_robin_over_all_instances_without_rules() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0"), instance("b", "1.0.0")]);
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new();

    let picked: Vec<_> = (0..4).map(|_| resolve_id(&pipeline, &ctx)).collect();
    assert_eq!(picked, ["a", "b", "a", "b"]);

    let resolution = pipeline.resolve("cart", "0.0.0+", &ctx).unwrap();
    assert!(resolution.route.is_none());
    assert!(resolution.fault.is_none());
    assert_eq!(resolution.balancer_target, "default/cart@0.0.0+#all");
}

#[test]
fn unknown_service_has_no_instances() {
    let registry = Arc::new(InMemoryRegistry::new());
    let pipeline = pipeline(&registry);
    let err = pipeline
        .resolve("cart", "latest", &InvocationContext::new())
        .unwrap_err();
    assert!(matches!(err, ResolveError::NoInstancesFound { .. }));
    assert_eq!(err.code(), "resolve.no_instances");
    assert!(!err.is_transient());
}

#[test]
fn unregistered_transport_is_distinguished_from_no_instances() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [Instance::builder("a", "cart", "1.0.0")
            .endpoint("highway://a:7070")
            .build()],
    );
    let pipeline = pipeline(&registry);
    let err = pipeline
        .resolve("cart", "latest", &InvocationContext::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::NoTransportAvailable { instances: 1, .. }
    ));
    assert_eq!(err.code(), "resolve.no_transport");
}

#[test]
fn transport_filter_restricts_endpoints() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [Instance::builder("a", "cart", "1.0.0")
            .endpoint("rest://a:8080")
            .endpoint("highway://a:7070")
            .build()],
    );
    let pipeline = ResolvePipeline::builder(Arc::clone(&registry) as _)
        .with_config(ResolverConfig {
            transport: "highway".to_owned(),
            ..ResolverConfig::default()
        })
        .with_transport(NamedTransport::shared("rest"))
        .with_transport(NamedTransport::shared("highway"))
        .build()
        .unwrap();
    for _ in 0..3 {
        let resolution = pipeline
            .resolve("cart", "latest", &InvocationContext::new())
            .unwrap();
        assert_eq!(resolution.endpoint.transport_name(), "highway");
    }
}

#[test]
fn registry_outage_is_transient_and_not_cached() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new();

    registry.set_available(false);
    let err = pipeline.resolve("cart", "latest", &ctx).unwrap_err();
    assert!(matches!(
        err,
        ResolveError::Registry {
            source: RegistryError::Unavailable { .. },
            ..
        }
    ));
    assert!(err.is_transient());

    registry.set_available(true);
    assert_eq!(
        pipeline
            .resolve("cart", "latest", &ctx)
            .unwrap()
            .endpoint
            .instance()
            .instance_id(),
        "a"
    );
}

#[test]
fn malformed_version_rule_is_not_transient() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let err = pipeline(&registry)
        .resolve("cart", "2.0.0-1.0.0", &InvocationContext::new())
        .unwrap_err();
    assert_eq!(err.code(), "resolve.registry");
    assert!(!err.is_transient());
}

#[test]
fn version_rule_narrows_candidates() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            instance("old", "1.2.0"),
            instance("mid", "1.10.0"),
            instance("new", "2.0.0"),
        ],
    );
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new();
    for _ in 0..3 {
        let latest = pipeline.resolve("cart", "latest", &ctx).unwrap();
        assert_eq!(latest.endpoint.instance().instance_id(), "new");
        let fixed = pipeline.resolve("cart", "1.10", &ctx).unwrap();
        assert_eq!(fixed.endpoint.instance().instance_id(), "mid");
    }
}

#[test]
fn endpoint_snapshot_is_reused_until_the_registry_changes() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new();
    let key = ServiceKey::new("default", "cart", "0.0.0+");

    for _ in 0..5 {
        pipeline.resolve("cart", "0.0.0+", &ctx).unwrap();
    }
    let cache = pipeline.endpoint_cache(&key).unwrap();
    assert_eq!(cache.rebuild_count(), 1);
    let first = cache.latest_endpoints().unwrap();
    assert!(Arc::ptr_eq(&first, &cache.latest_endpoints().unwrap()));

    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    pipeline.resolve("cart", "0.0.0+", &ctx).unwrap();
    assert_eq!(cache.rebuild_count(), 2);
    assert!(!Arc::ptr_eq(&first, &cache.latest_endpoints().unwrap()));
}

#[test]
fn app_id_in_context_selects_another_application() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    registry.publish("shop", "cart", [instance("s", "1.0.0")]);
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new().with_app_id("shop");
    assert_eq!(resolve_id(&pipeline, &ctx), "s");
    assert_eq!(resolve_id(&pipeline, &InvocationContext::new()), "a");
}

struct Broken;

static BROKEN: FilterDescriptor = FilterDescriptor::new("test.broken", "always fails");

impl DiscoveryFilter for Broken {
    fn descriptor(&self) -> &FilterDescriptor {
        &BROKEN
    }

    fn order(&self) -> i32 {
        0
    }

    fn filter(
        &self,
        _ctx: &DiscoveryContext<'_>,
        _candidates: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, FilterError> {
        Err(FilterError::new("boom"))
    }
}

struct Invalid;

static INVALID: FilterDescriptor = FilterDescriptor::new("test.invalid", "rejects itself");

impl DiscoveryFilter for Invalid {
    fn descriptor(&self) -> &FilterDescriptor {
        &INVALID
    }

    fn order(&self) -> i32 {
        0
    }

    fn validate(&self) -> Result<(), FilterError> {
        Err(FilterError::new("misconfigured"))
    }

    fn filter(
        &self,
        _ctx: &DiscoveryContext<'_>,
        candidates: Vec<Endpoint>,
    ) -> Result<Vec<Endpoint>, FilterError> {
        Ok(candidates)
    }
}

#[test]
fn request_time_filter_failure_is_surfaced() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let pipeline = ResolvePipeline::builder(Arc::clone(&registry) as _)
        .with_transport(NamedTransport::shared("rest"))
        .with_filter(Arc::new(Broken))
        .build()
        .unwrap();
    let err = pipeline
        .resolve("cart", "latest", &InvocationContext::new())
        .unwrap_err();
    match err {
        ResolveError::FilterChainFault { source, .. } => assert_eq!(source.filter(), "test.broken"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn startup_validation_failure_rejects_the_pipeline() {
    let registry = Arc::new(InMemoryRegistry::new());
    let result = ResolvePipeline::builder(registry)
        .with_filter(Arc::new(Invalid))
        .build();
    let Err(err) = result else {
        panic!("pipeline with an invalid filter must not build");
    };
    assert!(matches!(err, BuildError::FilterChain(_)));
    assert_eq!(err.code(), "discovery.filter.invalid");
}

#[test]
fn weighted_rule_splits_traffic_exactly() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            instance("v1-a", "1.0.0"),
            instance("v1-b", "1.0.0"),
            instance("v2-a", "2.0.0"),
        ],
    );
    let pipeline = pipeline(&registry);
    pipeline.rules().replace(
        "cart",
        vec![
            PolicyRuleItem::new(1)
                .with_route(RouteItem::new(80, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::new(20, TagItem::with_version("2.0.0"))),
        ],
    );

    let ctx = InvocationContext::new();
    let mut by_version: BTreeMap<String, usize> = BTreeMap::new();
    for _ in 0..100 {
        let resolution = pipeline.resolve("cart", "0.0.0+", &ctx).unwrap();
        assert!(matches!(resolution.route, Some(RouteDecision::Tagged(_))));
        *by_version
            .entry(resolution.endpoint.instance().version().to_owned())
            .or_default() += 1;
    }
    assert_eq!(by_version["1.0.0"], 80);
    assert_eq!(by_version["2.0.0"], 20);
}

#[test]
fn canary_rule_applies_only_to_matching_headers() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [instance("stable", "1.0.0"), instance("canary", "1.1.0")],
    );
    let config = ResolverConfig::from_toml_str(
        r#"
[[routes.services.cart]]
precedence = 2
match = { headers = { x-canary = { exact = "true" } } }
route = [{ tags = { version = "1.1.0" } }]

[[routes.services.cart]]
precedence = 1
route = [{ tags = { version = "1.0.0" } }]
"#,
    )
    .unwrap();
    let pipeline = pipeline_with(&registry, config);

    let canary = InvocationContext::new().with_header("x-canary", "true");
    let resolution = pipeline.resolve("cart", "0.0.0+", &canary).unwrap();
    assert_eq!(resolution.endpoint.instance().instance_id(), "canary");
    assert_eq!(resolution.balancer_target, "default/cart@0.0.0+#version=1.1.0");

    for _ in 0..3 {
        assert_eq!(resolve_id(&pipeline, &InvocationContext::new()), "stable");
    }
}

#[test]
fn invalid_rule_falls_back_to_latest_version() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [instance("old", "1.0.0"), instance("new", "2.0.0")],
    );
    let pipeline = pipeline(&registry);
    pipeline.rules().replace(
        "cart",
        vec![
            PolicyRuleItem::new(0)
                .with_route(RouteItem::new(50, TagItem::with_version("1.0.0")))
                .with_route(RouteItem::unweighted(TagItem::with_version("2.0.0"))),
        ],
    );

    for _ in 0..4 {
        let resolution = pipeline
            .resolve("cart", "0.0.0+", &InvocationContext::new())
            .unwrap();
        assert_eq!(resolution.endpoint.instance().instance_id(), "new");
        assert_eq!(
            resolution.rule_fault().map(|fault| fault.code()),
            Some("router.rule.missing_weight")
        );
        assert!(resolution.balancer_target.ends_with("#latest"));
    }
}

#[test]
fn unmatched_tag_falls_back_to_latest_version() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [instance("old", "1.0.0"), instance("new", "2.0.0")],
    );
    let pipeline = pipeline(&registry);
    pipeline.rules().replace(
        "cart",
        vec![PolicyRuleItem::new(0).with_route(RouteItem::unweighted(TagItem::with_version("9.9.9")))],
    );
    let resolution = pipeline
        .resolve("cart", "0.0.0+", &InvocationContext::new())
        .unwrap();
    assert_eq!(resolution.endpoint.instance().instance_id(), "new");
    assert_eq!(
        resolution.route,
        Some(RouteDecision::LatestVersion(LatestReason::NoTagMatched))
    );
}

#[test]
fn latest_fallback_skips_instances_that_are_down() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            instance("old", "1.0.0"),
            Instance::builder("new", "cart", "2.0.0")
                .endpoint("rest://new:8080")
                .status(InstanceStatus::Down)
                .build(),
        ],
    );
    let pipeline = pipeline(&registry);
    pipeline.rules().replace(
        "cart",
        vec![PolicyRuleItem::new(0).with_route(RouteItem::new(100, TagItem::with_version("9.9.9")))],
    );
    let resolution = pipeline
        .resolve("cart", "0.0.0+", &InvocationContext::new())
        .unwrap();
    assert_eq!(resolution.endpoint.instance().instance_id(), "old");
    assert_eq!(
        resolution.route,
        Some(RouteDecision::LatestVersion(LatestReason::NoTagMatched))
    );
    assert_eq!(resolution.balancer_target, "default/cart@0.0.0+#latest");
}

#[test]
fn global_rule_applies_when_service_has_none() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [instance("old", "1.0.0"), instance("new", "2.0.0")],
    );
    let pipeline = pipeline(&registry);
    pipeline.rules().replace_global(vec![
        PolicyRuleItem::new(0)
            .with_matcher(Matcher::default().with_header("x-tier", HeaderRule::prefix("gold")))
            .with_route(RouteItem::unweighted(TagItem::with_version("1.0.0"))),
    ]);
    let gold = InvocationContext::new().with_header("x-tier", "gold-plus");
    assert_eq!(resolve_id(&pipeline, &gold), "old");
}

#[test]
fn environment_isolation_can_exhaust_candidates() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            Instance::builder("prod", "cart", "1.0.0")
                .endpoint("rest://prod:8080")
                .environment("production")
                .build(),
            Instance::builder("test", "cart", "1.0.0")
                .endpoint("rest://test:8080")
                .environment("testing")
                .build(),
        ],
    );
    let pipeline = pipeline_with(
        &registry,
        ResolverConfig {
            environment: Some("production".to_owned()),
            ..ResolverConfig::default()
        },
    );

    for _ in 0..3 {
        assert_eq!(resolve_id(&pipeline, &InvocationContext::new()), "prod");
    }
    let testing = InvocationContext::new().with_environment("testing");
    assert_eq!(resolve_id(&pipeline, &testing), "test");

    let staging = InvocationContext::new().with_environment("staging");
    let err = pipeline.resolve("cart", "0.0.0+", &staging).unwrap_err();
    assert!(matches!(err, ResolveError::LoadBalancerExhausted(_)));
    assert_eq!(err.code(), "resolve.load_balancer_exhausted");
}

#[test]
fn required_properties_restrict_candidates() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            Instance::builder("east", "cart", "1.0.0")
                .endpoint("rest://east:8080")
                .property("zone", "east")
                .build(),
            Instance::builder("west", "cart", "1.0.0")
                .endpoint("rest://west:8080")
                .property("zone", "west")
                .build(),
        ],
    );
    let config = ResolverConfig::from_toml_str("[required_properties]\nzone = \"west\"\n").unwrap();
    let pipeline = pipeline_with(&registry, config);
    for _ in 0..3 {
        assert_eq!(resolve_id(&pipeline, &InvocationContext::new()), "west");
    }
}

#[test]
fn priority_property_prefers_the_closest_group() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish(
        "default",
        "cart",
        [
            Instance::builder("gold", "cart", "1.0.0")
                .endpoint("rest://gold:8080")
                .property("tier", "gold")
                .build(),
            Instance::builder("plain", "cart", "1.0.0")
                .endpoint("rest://plain:8080")
                .build(),
        ],
    );
    let config = ResolverConfig::from_toml_str(
        "[priority_property]\nenabled = true\nkey = \"tier\"\n",
    )
    .unwrap();
    let pipeline = pipeline_with(&registry, config);
    assert_eq!(
        pipeline.filter_chain().names(),
        ["spark.discovery.transport-availability", "spark.discovery.priority-property.tier"]
    );

    let gold = InvocationContext::new().with_property("tier", "gold.vip");
    for _ in 0..3 {
        assert_eq!(resolve_id(&pipeline, &gold), "gold");
        assert_eq!(resolve_id(&pipeline, &InvocationContext::new()), "plain");
    }
}

#[test]
fn fault_decision_follows_the_selected_transport() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let mut config = ResolverConfig::default();
    config.fault.global = FaultScope::default().with_protocol("rest", FaultRule::abort(10, 503));
    let pipeline = pipeline_with(&registry, config);

    let ctx = InvocationContext::new().with_operation("CartEndpoint", "add");
    let aborted: Vec<usize> = (1..=100)
        .filter(|_| {
            pipeline
                .resolve("cart", "latest", &ctx)
                .unwrap()
                .fault
                .abort
                .is_some()
        })
        .collect();
    assert_eq!(aborted, [10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
}

#[test]
fn deregistered_transport_drops_cached_endpoints() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    let pipeline = pipeline(&registry);
    let ctx = InvocationContext::new();
    pipeline.resolve("cart", "latest", &ctx).unwrap();

    pipeline.transports().deregister("rest");
    let err = pipeline.resolve("cart", "latest", &ctx).unwrap_err();
    assert!(matches!(err, ResolveError::LoadBalancerExhausted(_)));

    pipeline.transports().register(NamedTransport::shared("rest"));
    let err = pipeline.resolve("cart", "latest", &ctx).unwrap_err();
    assert!(
        matches!(err, ResolveError::LoadBalancerExhausted(_)),
        "a replaced transport does not revive endpoints bound to the old one"
    );

    registry.publish("default", "cart", [instance("a", "1.0.0")]);
    assert!(pipeline.resolve("cart", "latest", &ctx).is_ok());
}

#[test]
fn static_registry_file_feeds_the_pipeline() {
    let registry = Arc::new(InMemoryRegistry::new());
    let services = registry
        .load_toml(
            r#"
app_id = "default"

[[instances]]
instance_id = "cart-1"
service_name = "cart"
version = "1.0.0"
endpoints = ["rest://10.0.0.1:8080"]

[[instances]]
instance_id = "order-1"
service_name = "order"
version = "3.1"
endpoints = ["rest://10.0.0.2:8080"]
"#,
        )
        .unwrap();
    assert_eq!(services, 2);
    let pipeline = pipeline(&registry);
    let order = pipeline
        .resolve("order", "latest", &InvocationContext::new())
        .unwrap();
    assert_eq!(order.endpoint.uri(), "rest://10.0.0.2:8080");
    assert_eq!(order.endpoint.address().port(), Some(8080));
}
