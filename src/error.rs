use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 服务器描述到内核配置的转换错误
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CompileError {
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("failed to parse `{input}`: {reason}")]
    ParseFailure { input: String, reason: String },

    #[error("config synthesis failed: {reason}")]
    Synthesis { reason: String },
}

impl CompileError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 解析失败，`input` 会被截断，避免把整份订阅内容塞进错误信息
    pub fn parse_failure(input: impl AsRef<str>, reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            input: truncate(input.as_ref(), 96),
            reason: reason.into(),
        }
    }

    pub fn synthesis(reason: impl Into<String>) -> Self {
        Self::Synthesis {
            reason: reason.into(),
        }
    }
}

/// 控制器对外暴露的错误
///
/// 所有变体只携带字符串，因此可以 `Clone` 后同时回复给多个等待者
/// （例如被合并的 apply 请求）。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AppError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("proxy core did not become ready within {timeout_ms} ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("proxy core exited unexpectedly: {0}")]
    ProcessCrashed(String),

    #[error("proxy core is not running")]
    NotConnected,

    #[error("failed to write system proxy settings: {0}")]
    OsSettingWriteFailed(String),

    #[error("failed to fetch {url}: {reason}")]
    SubscriptionFetchFailed { url: String, reason: String },

    #[error("PAC server could not bind {addr}: {reason}")]
    PacBindFailed { addr: String, reason: String },

    #[error("server `{0}` not found")]
    ServerNotFound(String),

    #[error("proxy core unavailable: {0}")]
    CoreUnavailable(String),

    #[error("config store error: {0}")]
    Store(String),

    #[error("controller is not running")]
    ControllerUnavailable,
}

impl AppError {
    pub fn startup_timeout(timeout: Duration) -> Self {
        Self::StartupTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn fetch_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::SubscriptionFetchFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn store(err: &anyhow::Error) -> Self {
        Self::Store(format!("{:#}", err))
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_truncates_long_input() {
        let long = "x".repeat(500);
        match CompileError::parse_failure(&long, "bad") {
            CompileError::ParseFailure { input, .. } => {
                assert_eq!(input.chars().count(), 97);
                assert!(input.ends_with('…'));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compile_error_converts_into_app_error() {
        let err: AppError = CompileError::invalid_field("port", "must not be 0").into();
        assert_eq!(err.to_string(), "invalid field `port`: must not be 0");
    }
}
