use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 实例属性中表示部署环境的键。
pub const ENVIRONMENT_PROPERTY: &str = "environment";

/// 注册中心上报的实例状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Testing,
}

/// 服务实例的不可变描述。
///
/// # 教案式说明
/// - **意图 (Why)**：实例在快照中以 `Arc<Instance>` 共享，多条请求并发读取同一份数据，
///   因此类型本身不提供任何修改入口；注册中心推送新数据时直接换掉整个快照。
/// - **契约 (What)**：
///   - `instance_id` 在所属服务内唯一；
///   - `endpoints` 形如 `scheme://host:port?params`，`scheme` 即传输名；
///   - `properties` 为任意字符串键值，`environment` 键参与环境隔离。
/// - **风险 (Trade-offs)**：属性使用 `BTreeMap`，遍历顺序稳定，便于测试与日志比对。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    instance_id: String,
    service_name: String,
    version: String,
    #[serde(default)]
    status: InstanceStatus,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl Instance {
    /// 以必填字段开启构建。
    pub fn builder(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> InstanceBuilder {
        InstanceBuilder {
            instance: Instance {
                instance_id: instance_id.into(),
                service_name: service_name.into(),
                version: version.into(),
                status: InstanceStatus::Up,
                endpoints: Vec::new(),
                properties: BTreeMap::new(),
            },
        }
    }

    /// 以当前实例为底稿构建修改后的副本，原实例不受影响。
    pub fn to_builder(&self) -> InstanceBuilder {
        InstanceBuilder {
            instance: self.clone(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// 声明的部署环境；空字符串视为未声明。
    pub fn environment(&self) -> Option<&str> {
        self.property(ENVIRONMENT_PROPERTY)
            .filter(|value| !value.is_empty())
    }
}

/// [`Instance`] 的构建器，仅在组装阶段可变。
#[derive(Clone, Debug)]
pub struct InstanceBuilder {
    instance: Instance,
}

impl InstanceBuilder {
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.instance.status = status;
        self
    }

    pub fn endpoint(mut self, uri: impl Into<String>) -> Self {
        self.instance.endpoints.push(uri.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.instance.properties.insert(key.into(), value.into());
        self
    }

    pub fn environment(self, environment: impl Into<String>) -> Self {
        self.property(ENVIRONMENT_PROPERTY, environment)
    }

    pub fn build(self) -> Instance {
        self.instance
    }
}
