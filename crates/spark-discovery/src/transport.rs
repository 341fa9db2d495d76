//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 实例只声明 URI，真正能否建立调用取决于本进程是否注册了对应的传输实现；
//! - [`TransportRegistry`] 是“传输名 → 传输实现”的运行时注册表，端点缓存据此决定
//!   哪些 URI 可以绑定成 [`Endpoint`](crate::endpoint::Endpoint)。
//!
//! ## 契约（What）
//! - 注册、注销可在运行期任意时刻发生，读路径不加全局锁；
//! - [`EndpointAddress`] 把 `scheme://host[:port][/resource][?k=v&...]` 拆成结构化字段。

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

/// 传输实现的最小契约。
///
/// - **契约 (What)**：`name` 与实例 URI 的 scheme 对应；`parse_address` 默认使用
///   [`EndpointAddress::parse`]，协议有特殊地址格式时可以覆写。
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn parse_address(&self, uri: &str) -> Result<EndpointAddress, AddressError> {
        EndpointAddress::parse(uri)
    }
}

/// 只携带名字的传输实现，适用于仅需地址解析的场景。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedTransport {
    name: Arc<str>,
}

impl NamedTransport {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    /// 便捷构造：直接得到可注册的 trait 对象。
    pub fn shared(name: impl Into<Arc<str>>) -> Arc<dyn Transport> {
        Arc::new(Self::new(name))
    }
}

impl Transport for NamedTransport {
    fn name(&self) -> &str {
        &self.name
    }
}

/// 运行时传输注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：传输插件可能在进程运行中加载或卸载，注册表需要支持并发读写。
/// - **契约 (What)**：
///   - 同名注册会替换旧实现并返回旧值；
///   - [`is_current`](Self::is_current) 用于判断某个已绑定的实现是否仍是注册表中的那一个。
/// - **风险 (Trade-offs)**：注销不会主动通知已构建的端点快照，依赖下游过滤器按需剔除。
#[derive(Default)]
pub struct TransportRegistry {
    transports: DashMap<Arc<str>, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let name: Arc<str> = Arc::from(transport.name());
        self.transports.insert(name, transport)
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.remove(name).map(|(_, transport)| transport)
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 给定实现是否仍是该名字下的当前注册项。
    pub fn is_current(&self, transport: &Arc<dyn Transport>) -> bool {
        self.transports
            .get(transport.name())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), transport))
    }

    /// 已注册的传输名，按字典序排列。
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .transports
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.names())
            .finish()
    }
}

/// 地址解析失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("endpoint uri `{uri}` has no `scheme://` prefix")]
    MissingScheme { uri: String },
    #[error("endpoint uri `{uri}` has no host")]
    MissingHost { uri: String },
    #[error("endpoint uri `{uri}` carries invalid port `{port}`")]
    InvalidPort { uri: String, port: String },
}

/// 结构化的端点地址。
///
/// # 契约说明（What）
/// - `scheme`：传输名；
/// - `host`：主机名或 IP，IPv6 字面量不含方括号；
/// - `port`：可选端口；
/// - `resource`：可选路径（不含前导 `/`）；
/// - `params`：查询参数，重复键以最后一次出现为准。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    scheme: String,
    host: String,
    port: Option<u16>,
    resource: Option<String>,
    params: BTreeMap<String, String>,
}

impl EndpointAddress {
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let (scheme, rest) = uri
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| AddressError::MissingScheme {
                uri: uri.to_owned(),
            })?;
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, resource) = match location.split_once('/') {
            Some((authority, resource)) if !resource.is_empty() => {
                (authority, Some(resource.to_owned()))
            }
            Some((authority, _)) => (authority, None),
            None => (location, None),
        };
        let (host, port) = split_host_port(uri, authority)?;
        if host.is_empty() {
            return Err(AddressError::MissingHost {
                uri: uri.to_owned(),
            });
        }
        let params = query
            .into_iter()
            .flat_map(|query| query.split('&'))
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_owned(), value.to_owned()),
                None => (pair.to_owned(), String::new()),
            })
            .collect();
        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            resource,
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

fn split_host_port<'a>(
    uri: &str,
    authority: &'a str,
) -> Result<(&'a str, Option<u16>), AddressError> {
    // IPv6 字面量：[::1]:8080
    if let Some(bracketed) = authority.strip_prefix('[') {
        let Some((host, tail)) = bracketed.split_once(']') else {
            return Err(AddressError::MissingHost {
                uri: uri.to_owned(),
            });
        };
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(uri, port)?))),
            None => Ok((host, None)),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(uri, port)?))),
        None => Ok((authority, None)),
    }
}

fn parse_port(uri: &str, port: &str) -> Result<u16, AddressError> {
    port.parse().map_err(|_| AddressError::InvalidPort {
        uri: uri.to_owned(),
        port: port.to_owned(),
    })
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        for (index, (key, value)) in self.params.iter().enumerate() {
            let separator = if index == 0 { '?' } else { '&' };
            write!(f, "{separator}{key}={value}")?;
        }
        Ok(())
    }
}
