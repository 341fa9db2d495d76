//! # version 模块说明
//!
//! ## 角色定位（Why）
//! - 实例版本号决定了“最新版本”回退与版本规则过滤，必须按数值而非字典序比较；
//! - 缓存键的第三段是版本规则字符串，本模块负责把它解析为可执行的匹配器。
//!
//! ## 契约（What）
//! - [`Version`]：点分数值段，尾部的 `0` 段不参与比较（`1.0` 与 `1.0.0` 相等）；
//! - [`compare_versions`]：对任意原始字符串给出全序，无法解析的版本排在可解析版本之前；
//! - [`VersionRule`]：`latest`、固定版本、`a-b` 左闭右开区间、`a+` 起始版本。

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::instance::Instance;

/// 版本号或版本规则解析失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// 输入为空白字符串。
    #[error("version string is empty")]
    Empty,
    /// 某一段不是无符号整数。
    #[error("version `{raw}` contains non-numeric segment `{segment}`")]
    InvalidSegment { raw: String, segment: String },
    /// 区间规则的上下界颠倒或相等。
    #[error("version range `{raw}` is empty: start must be lower than end")]
    EmptyRange { raw: String },
}

/// 数值化的版本号。
///
/// - **契约 (What)**：`segments` 已去掉尾部零段，因此派生的比较、判等与哈希都满足
///   “`1.0` == `1.0.0`”；`raw` 保留原始写法用于展示。
/// - **风险 (Trade-offs)**：每段以 `u64` 存储，超过范围的段视为非法而不是截断。
#[derive(Clone, Debug)]
pub struct Version {
    raw: Arc<str>,
    segments: Box<[u64]>,
}

impl Version {
    /// 解析点分版本号。
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        let mut segments = trimmed
            .split('.')
            .map(|segment| {
                segment
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidSegment {
                        raw: trimmed.to_owned(),
                        segment: segment.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        while segments.last() == Some(&0) {
            segments.pop();
        }
        Ok(Self {
            raw: Arc::from(trimmed),
            segments: segments.into_boxed_slice(),
        })
    }

    /// 全零版本，等价于“任意版本的下界”。
    pub fn zero() -> Self {
        Self {
            raw: Arc::from("0.0.0"),
            segments: Box::new([]),
        }
    }

    /// 原始写法。
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 去除尾零后的数值段。
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl core::hash::Hash for Version {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 比较两个原始版本字符串。
///
/// 可解析的版本按数值比较；无法解析的版本小于任何可解析版本，彼此之间按字典序比较。
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    match (Version::parse(left), Version::parse(right)) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => left.cmp(right),
    }
}

/// 判断两个版本字符串是否表示同一版本。
pub fn versions_agree(left: &str, right: &str) -> bool {
    match (Version::parse(left), Version::parse(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

/// 版本规则，对应缓存键中的版本规则段。
///
/// # 教案式说明
/// - **意图 (Why)**：同一服务可被不同调用方以不同版本约束订阅，每种约束拥有独立的实例缓存。
/// - **契约 (What)**：
///   - `Latest`：仅保留当前最高版本的实例；
///   - `Fixed`：版本与给定值相等；
///   - `Range`：`start <= v < end`；
///   - `StartFrom`：`v >= start`，`0.0.0+` 即“全部版本”。
/// - **执行 (How)**：[`VersionRule::select`] 对整批实例求值；`Latest` 需要先扫描出最大值，
///   因此无法逐个判断。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VersionRule {
    Latest,
    Fixed(Version),
    Range { start: Version, end: Version },
    StartFrom(Version),
}

impl VersionRule {
    /// 接受全部版本的规则。
    pub fn all() -> Self {
        Self::StartFrom(Version::zero())
    }

    /// 单个版本是否满足规则；`Latest` 在单实例视角下恒为真。
    pub fn accepts(&self, version: &Version) -> bool {
        match self {
            Self::Latest => true,
            Self::Fixed(fixed) => version == fixed,
            Self::Range { start, end } => version >= start && version < end,
            Self::StartFrom(start) => version >= start,
        }
    }

    /// 从一批实例中挑出满足规则的实例，保持输入顺序。
    ///
    /// 版本号无法解析的实例只会在 `Latest` 规则下、且全体实例都无法解析时被选中。
    pub fn select<'a, I>(&self, instances: I) -> Vec<Arc<Instance>>
    where
        I: IntoIterator<Item = &'a Arc<Instance>>,
    {
        let instances: Vec<&Arc<Instance>> = instances.into_iter().collect();
        match self {
            Self::Latest => {
                let Some(latest) = instances
                    .iter()
                    .copied()
                    .map(|instance| instance.version())
                    .max_by(|left, right| compare_versions(left, right))
                else {
                    return Vec::new();
                };
                instances
                    .into_iter()
                    .filter(|instance| versions_agree(instance.version(), latest))
                    .cloned()
                    .collect()
            }
            _ => instances
                .into_iter()
                .filter(|instance| {
                    Version::parse(instance.version())
                        .map(|version| self.accepts(&version))
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
        }
    }
}

impl FromStr for VersionRule {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        if let Some(start) = trimmed.strip_suffix('+') {
            return Ok(Self::StartFrom(Version::parse(start)?));
        }
        if let Some((start, end)) = trimmed.split_once('-') {
            let start = Version::parse(start)?;
            let end = Version::parse(end)?;
            if start >= end {
                return Err(VersionError::EmptyRange {
                    raw: trimmed.to_owned(),
                });
            }
            return Ok(Self::Range { start, end });
        }
        Ok(Self::Fixed(Version::parse(trimmed)?))
    }
}

impl fmt::Display for VersionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Fixed(version) => write!(f, "{version}"),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
            Self::StartFrom(start) => write!(f, "{start}+"),
        }
    }
}
