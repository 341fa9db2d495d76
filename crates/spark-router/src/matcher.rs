use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use spark_discovery::InvocationContext;

/// 单个请求头的匹配条件。
///
/// `exact` 与 `prefix` 同时声明时两者都必须满足；都未声明时只要求请求头存在。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderRule {
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub case_insensitive: bool,
}

impl HeaderRule {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            exact: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            prefix: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn ignoring_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn matches(&self, value: &str) -> bool {
        let exact_ok = self.exact.as_deref().is_none_or(|expected| {
            if self.case_insensitive {
                expected.eq_ignore_ascii_case(value)
            } else {
                expected == value
            }
        });
        let prefix_ok = self.prefix.as_deref().is_none_or(|prefix| {
            if self.case_insensitive {
                value.len() >= prefix.len()
                    && value
                        .get(..prefix.len())
                        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            } else {
                value.starts_with(prefix)
            }
        });
        exact_ok && prefix_ok
    }
}

/// 规则的入口匹配条件。
///
/// # 教案式说明
/// - **意图 (Why)**：同一服务可配置多条规则，按请求来源与请求头决定走哪一条。
/// - **契约 (What)**：
///   - `source`：调用方服务名必须相等；
///   - `source_tags`：调用方属性必须包含这些键值；
///   - `headers`：每个声明的请求头都必须存在并满足条件，缺失即不匹配；
///   - 全部为空的匹配器接受任何调用。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Matcher {
    pub source: Option<String>,
    pub source_tags: BTreeMap<String, String>,
    pub headers: BTreeMap<String, HeaderRule>,
}

impl Matcher {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_source_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.source_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, rule: HeaderRule) -> Self {
        self.headers.insert(name.into(), rule);
        self
    }

    pub fn matches(&self, ctx: &InvocationContext) -> bool {
        if let Some(source) = &self.source {
            if ctx.caller_service() != Some(source.as_str()) {
                return false;
            }
        }
        let tags_ok = self
            .source_tags
            .iter()
            .all(|(key, value)| ctx.property(key) == Some(value.as_str()));
        tags_ok
            && self
                .headers
                .iter()
                .all(|(name, rule)| ctx.header(name).is_some_and(|value| rule.matches(value)))
    }
}
