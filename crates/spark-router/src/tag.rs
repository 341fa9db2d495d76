//! # tag 模块说明
//!
//! ## 角色定位（Why）
//! - 路由规则用“标签”描述目标实例：版本号加任意属性约束；
//! - 实例一侧同样抽象成标签，两者比对得到匹配分数，分数最高的路由项获得该实例。
//!
//! ## 契约（What）
//! - 规则标签声明的每一条约束都必须被实例满足，否则分数为 0；
//! - 全部满足时分数等于声明的约束条数；不声明任何约束的标签对任何实例得 0 分；
//! - 版本比较按数值语义（`2.0` 与 `2.0.0` 视为同一版本）。

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spark_discovery::{Endpoint, Instance, versions_agree};

/// 标签中表示版本号的保留键。
pub const VERSION_TAG: &str = "version";

/// 路由目标的标签集合。
///
/// 序列化形式是扁平的字符串映射，`version` 键映射到版本约束，其余键映射到属性约束。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct TagItem {
    version: Option<String>,
    params: BTreeMap<String, String>,
}

impl TagItem {
    /// 不带任何约束的标签。
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 以路由目标自身的版本与属性构造标签。
    pub fn of_target<T: RouteTarget + ?Sized>(target: &T) -> Self {
        Self {
            version: Some(target.version().to_owned()),
            params: target.properties().clone(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// 声明的约束条数。
    pub fn constraint_count(&self) -> usize {
        usize::from(self.version.is_some()) + self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraint_count() == 0
    }

    /// 计算本标签（规则侧）对目标标签（实例侧）的匹配分数。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：任一约束不满足（值不同或目标缺少该键）返回 0；
    ///   否则返回约束条数。
    /// - **执行 (How)**：先比版本，再按键逐个比属性，遇到不满足立即返回。
    pub fn match_score(&self, target: &TagItem) -> usize {
        let mut score = 0;
        if let Some(version) = &self.version {
            match target.version() {
                Some(actual) if versions_agree(actual, version) => score += 1,
                _ => return 0,
            }
        }
        for (key, expected) in &self.params {
            match target.params.get(key) {
                Some(actual) if actual == expected => score += 1,
                _ => return 0,
            }
        }
        score
    }
}

impl From<BTreeMap<String, String>> for TagItem {
    fn from(mut map: BTreeMap<String, String>) -> Self {
        let version = map.remove(VERSION_TAG);
        Self {
            version,
            params: map,
        }
    }
}

impl From<TagItem> for BTreeMap<String, String> {
    fn from(tag: TagItem) -> Self {
        let mut map = tag.params;
        if let Some(version) = tag.version {
            map.insert(VERSION_TAG.to_owned(), version);
        }
        map
    }
}

impl fmt::Display for TagItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("*");
        }
        let mut first = true;
        if let Some(version) = &self.version {
            write!(f, "{VERSION_TAG}={version}")?;
            first = false;
        }
        for (key, value) in &self.params {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// 可被路由器分桶的目标。
///
/// 路由器对“实例”与“已绑定端点”一视同仁，只需要服务名、版本、属性与健康状态。
pub trait RouteTarget {
    fn service_name(&self) -> &str;
    fn version(&self) -> &str;
    fn properties(&self) -> &BTreeMap<String, String>;

    /// 目标当前能否接收流量；最新版本只从可接收流量的目标中计算。
    fn is_up(&self) -> bool {
        true
    }
}

impl RouteTarget for Instance {
    fn service_name(&self) -> &str {
        Instance::service_name(self)
    }

    fn version(&self) -> &str {
        Instance::version(self)
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        Instance::properties(self)
    }

    fn is_up(&self) -> bool {
        Instance::is_up(self)
    }
}

impl<T: RouteTarget + ?Sized> RouteTarget for Arc<T> {
    fn service_name(&self) -> &str {
        (**self).service_name()
    }

    fn version(&self) -> &str {
        (**self).version()
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        (**self).properties()
    }

    fn is_up(&self) -> bool {
        (**self).is_up()
    }
}

impl RouteTarget for Endpoint {
    fn service_name(&self) -> &str {
        self.instance().service_name()
    }

    fn version(&self) -> &str {
        self.instance().version()
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        self.instance().properties()
    }

    fn is_up(&self) -> bool {
        self.instance().is_up()
    }
}
