use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 安装全局日志订阅器失败。
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log directive `{directive}`")]
    InvalidDirective {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet(#[from] tracing_subscriber::util::TryInitError),
}

/// 安装 `fmt + EnvFilter` 订阅器。
///
/// # 教案式说明
/// - **契约 (What)**：`RUST_LOG` 存在且合法时优先使用，否则使用 `default_directive`
///   （例如 `"info,spark_discovery=debug"`）；进程内已有全局订阅器时返回
///   [`TelemetryError::SubscriberAlreadySet`]，不会覆盖。
/// - **风险 (Trade-offs)**：只应在进程入口调用一次；库代码不应调用它。
pub fn install_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(default_directive)?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

fn default_filter(directive: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directive).map_err(|source| TelemetryError::InvalidDirective {
        directive: directive.to_owned(),
        source,
    })
}
