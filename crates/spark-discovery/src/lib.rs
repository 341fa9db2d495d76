//! # spark-discovery
//!
//! ## 角色定位（Why）
//! - 负责解析链路的前半段：把注册中心的实例快照变成本进程可调用的端点，
//!   再交给一组可插拔的发现过滤器收窄候选；
//! - 所有快照都是不可变的 `Arc` 数据，更新以“整体替换 + 修订号前进”的方式发生，
//!   请求路径上只有原子加载，没有锁等待。
//!
//! ## 模块导览（What）
//! - [`revision`]：进程内单调修订号；
//! - [`version`]：数值化版本号与版本规则；
//! - [`instance`]：不可变实例描述；
//! - [`registry`]：缓存键、版本化实例快照、注册中心契约与进程内实现；
//! - [`transport`]：传输注册表与端点地址解析；
//! - [`endpoint`]：端点、端点快照与按修订号失效的端点缓存；
//! - [`context`]：调用上下文；
//! - [`filter`]：发现过滤器契约、过滤链与内置过滤器。

pub mod context;
pub mod endpoint;
pub mod filter;
pub mod instance;
pub mod registry;
pub mod revision;
pub mod transport;
pub mod version;

pub use context::{DiscoveryContext, InvocationContext};
pub use endpoint::{Endpoint, EndpointCache, EndpointSet};
pub use filter::{
    ChainError, DiscoveryFilter, DiscoveryFilterChain, DiscoveryFilterChainBuilder,
    FilterDescriptor, FilterError, PriorityPropertyFilter, TransportAvailabilityFilter,
};
pub use instance::{ENVIRONMENT_PROPERTY, Instance, InstanceBuilder, InstanceStatus};
pub use registry::{
    InMemoryRegistry, RegistryClient, RegistryError, RegistryFileError, ServiceKey,
    VersionedInstanceCache,
};
pub use revision::Revision;
pub use transport::{AddressError, EndpointAddress, NamedTransport, Transport, TransportRegistry};
pub use version::{Version, VersionError, VersionRule, compare_versions, versions_agree};
