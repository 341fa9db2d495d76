//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 解析链路的全部静态配置集中在一个 TOML 文档里：调用方身份、隔离开关、属性约束、
//!   优先属性过滤、故障注入与路由规则；
//! - 每个段落都有默认值，空文档即可得到一个“不做治理、只做轮询”的解析器。
//!
//! ## 示例
//! ```toml
//! app_id = "shop"
//! environment = "production"
//! transport = "rest"
//!
//! [isolation]
//! enabled = true
//!
//! [required_properties]
//! zone = "cn-east"
//!
//! [priority_property]
//! enabled = true
//! key = "environment"
//!
//! [fault.global.protocols.rest]
//! abort = { percent = 5, http_status = 503 }
//!
//! [[routes.services.cart]]
//! precedence = 1
//! route = [
//!     { weight = 80, tags = { version = "1.0.0" } },
//!     { weight = 20, tags = { version = "2.0.0" } },
//! ]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use spark_discovery::ENVIRONMENT_PROPERTY;
use spark_governance::{FaultConfig, FaultConfigError};
use spark_router::RouteRuleConfig;
use thiserror::Error;

/// 解析器配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// 调用方所属应用，同时作为实例缓存键的第一段。
    pub app_id: String,
    /// 调用方自身的部署环境；调用上下文中的环境优先。
    pub environment: Option<String>,
    /// 只使用该传输的端点；空字符串表示全部传输。
    pub transport: String,
    pub isolation: IsolationSection,
    /// 实例必须携带的属性键值。
    pub required_properties: BTreeMap<String, String>,
    pub priority_property: PriorityPropertySection,
    pub fault: FaultConfig,
    pub routes: RouteRuleConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            app_id: "default".to_owned(),
            environment: None,
            transport: String::new(),
            isolation: IsolationSection::default(),
            required_properties: BTreeMap::new(),
            priority_property: PriorityPropertySection::default(),
            fault: FaultConfig::default(),
            routes: RouteRuleConfig::default(),
        }
    }
}

impl ResolverConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 语义校验：TOML 结构合法之后仍可能出现的错误。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::EmptyAppId);
        }
        if self.priority_property.enabled && self.priority_property.key.is_empty() {
            return Err(ConfigError::EmptyPriorityKey);
        }
        self.fault.validate()?;
        Ok(())
    }

    /// 调用方环境；空字符串视为未声明。
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref().filter(|env| !env.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationSection {
    pub enabled: bool,
}

impl Default for IsolationSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// 分层优先属性过滤的配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityPropertySection {
    pub enabled: bool,
    /// 参与分组的实例属性名。
    pub key: String,
    /// 调用上下文未携带该属性时使用的值。
    pub value: Option<String>,
}

impl Default for PriorityPropertySection {
    fn default() -> Self {
        Self {
            enabled: false,
            key: ENVIRONMENT_PROPERTY.to_owned(),
            value: None,
        }
    }
}

/// 配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse resolver configuration")]
    Parse(#[from] toml::de::Error),
    #[error("`app_id` must not be empty")]
    EmptyAppId,
    #[error("`priority_property.key` must not be empty when the filter is enabled")]
    EmptyPriorityKey,
    #[error(transparent)]
    Fault(#[from] FaultConfigError),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "config.parse",
            Self::EmptyAppId => "config.empty_app_id",
            Self::EmptyPriorityKey => "config.empty_priority_key",
            Self::Fault(_) => "config.fault",
        }
    }
}
