//! # spark-resolve
//!
//! ## 角色定位（Why）
//! - 调用层的唯一入口：给定目标服务、版本规则与调用上下文，返回一个可直接发送的端点，
//!   或者一个能说明“为什么没有端点”的错误；
//! - 发现、路由与治理分别位于 `spark-discovery`、`spark-router`、`spark-governance`，
//!   本 crate 只负责配置、编排与错误归类。
//!
//! ## 快速上手（How）
//! ```no_run
//! use std::sync::Arc;
//! use spark_discovery::{InMemoryRegistry, Instance, InvocationContext, NamedTransport};
//! use spark_resolve::{ResolvePipeline, ResolverConfig};
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! registry.publish(
//!     "default",
//!     "cart",
//!     [Instance::builder("cart-1", "cart", "1.0.0").endpoint("rest://10.0.0.1:8080").build()],
//! );
//! let pipeline = ResolvePipeline::builder(registry)
//!     .with_config(ResolverConfig::default())
//!     .with_transport(NamedTransport::shared("rest"))
//!     .build()?;
//! let resolution = pipeline.resolve("cart", "latest", &InvocationContext::new())?;
//! println!("send to {}", resolution.endpoint.uri());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod telemetry;

pub use config::{ConfigError, IsolationSection, PriorityPropertySection, ResolverConfig};
pub use error::{BuildError, ResolveError};
pub use pipeline::{Resolution, ResolvePipeline, ResolvePipelineBuilder};
pub use telemetry::{TelemetryError, install_tracing};
