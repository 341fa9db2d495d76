use std::collections::BTreeMap;

use crate::registry::ServiceKey;

/// 单次调用携带的上下文：调用方身份、目标操作与请求头。
///
/// # 契约说明（What）
/// - 所有字段可选，缺省值表示“调用方未声明”；
/// - `headers` 参与路由规则匹配，`properties` 描述调用方自身的标签（如环境、区域）；
/// - 结构体按值构建后只读，解析链路中以 `&InvocationContext` 传递。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationContext {
    app_id: Option<String>,
    caller_service: Option<String>,
    environment: Option<String>,
    schema_id: Option<String>,
    operation: Option<String>,
    headers: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_caller_service(mut self, service: impl Into<String>) -> Self {
        self.caller_service = Some(service.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// 目标操作，`schema_id` 与 `operation` 共同定位一次调用。
    pub fn with_operation(mut self, schema_id: impl Into<String>, operation: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self.operation = Some(operation.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn caller_service(&self) -> Option<&str> {
        self.caller_service.as_deref()
    }

    /// 调用方所在环境；空字符串视为未声明。
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref().filter(|value| !value.is_empty())
    }

    pub fn schema_id(&self) -> Option<&str> {
        self.schema_id.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// 过滤链执行时可见的上下文：目标服务键 + 调用上下文。
#[derive(Clone, Copy, Debug)]
pub struct DiscoveryContext<'a> {
    key: &'a ServiceKey,
    invocation: &'a InvocationContext,
}

impl<'a> DiscoveryContext<'a> {
    pub fn new(key: &'a ServiceKey, invocation: &'a InvocationContext) -> Self {
        Self { key, invocation }
    }

    pub fn key(&self) -> &'a ServiceKey {
        self.key
    }

    pub fn invocation(&self) -> &'a InvocationContext {
        self.invocation
    }
}
