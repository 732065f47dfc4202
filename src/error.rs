//! 에러 타입 및 로깅 헬퍼
//!
//! ## 분류
//! - **전송(Transport)**: 다운로드 실패: 사용자가 다시 시도
//! - **아카이브/파일시스템**: 손상된 아카이브, 권한, 디스크 부족: 사용자가 다시 시도,
//!   스크래치 디렉터리는 진단용으로 남김
//! - **프로토콜**: 원격 메타데이터/카탈로그 입력 오류: 세션 에러가 아니라 설정 에러로 표시
//!
//! 어떤 에러도 호스트 프로세스를 중단시키지 않으며, 항상 해당 아이템 하나만
//! `Error` 상태로 떨어뜨립니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 업데이터 에러 타입
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum UpdaterError {
    /// 네트워크 연결 실패
    NetworkError {
        message: String,
        recoverable: bool,
    },
    /// HTTP 요청 타임아웃
    Timeout {
        operation: String,
        duration_secs: u64,
    },
    /// 2xx가 아닌 HTTP 응답
    HttpError {
        status_code: u16,
        message: String,
    },
    /// 사용자가 다운로드를 취소함
    Cancelled {
        item: String,
    },
    /// 파일 시스템 오류
    FileSystemError {
        operation: String,
        path: String,
        message: String,
    },
    /// 아카이브 해제 실패
    ArchiveError {
        path: String,
        message: String,
    },
    /// 원격 메타데이터/카탈로그 입력 오류
    ProtocolError {
        message: String,
    },
    /// 설정 오류
    ConfigError {
        message: String,
    },
}

/// 에러 분류 (재시도 UX 결정용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Filesystem,
    Protocol,
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterError::NetworkError { message, .. } => {
                write!(f, "Network error: {}", message)
            }
            UpdaterError::Timeout { operation, duration_secs } => {
                write!(f, "Timeout after {}s: {}", duration_secs, operation)
            }
            UpdaterError::HttpError { status_code, message } => {
                write!(f, "HTTP error ({}): {}", status_code, message)
            }
            UpdaterError::Cancelled { item } => {
                write!(f, "Download cancelled for {}", item)
            }
            UpdaterError::FileSystemError { operation, path, message } => {
                write!(f, "File system error during {} on '{}': {}", operation, path, message)
            }
            UpdaterError::ArchiveError { path, message } => {
                write!(f, "Cannot extract '{}': {}", path, message)
            }
            UpdaterError::ProtocolError { message } => {
                write!(f, "Protocol error: {}", message)
            }
            UpdaterError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
        }
    }
}

impl std::error::Error for UpdaterError {}

impl UpdaterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdaterError::NetworkError { .. }
            | UpdaterError::Timeout { .. }
            | UpdaterError::HttpError { .. }
            | UpdaterError::Cancelled { .. } => ErrorKind::Transport,
            UpdaterError::FileSystemError { .. } | UpdaterError::ArchiveError { .. } => {
                ErrorKind::Filesystem
            }
            UpdaterError::ProtocolError { .. } | UpdaterError::ConfigError { .. } => {
                ErrorKind::Protocol
            }
        }
    }

    /// 사용자가 같은 아이템을 다시 시도해서 해결될 수 있는지
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpdaterError::NetworkError { recoverable, .. } => *recoverable,
            UpdaterError::Timeout { .. } => true,
            // 5xx, 429는 재시도 가능, 나머지 4xx는 불가능
            UpdaterError::HttpError { status_code, .. } => {
                *status_code >= 500 || *status_code == 429
            }
            UpdaterError::Cancelled { .. } => true,
            UpdaterError::FileSystemError { .. } => true,
            UpdaterError::ArchiveError { .. } => true,
            UpdaterError::ProtocolError { .. } => false,
            UpdaterError::ConfigError { .. } => false,
        }
    }

    /// 사용자에게 표시할 메시지
    pub fn user_message(&self) -> String {
        match self {
            UpdaterError::NetworkError { .. } => {
                "인터넷 연결을 확인해주세요.".to_string()
            }
            UpdaterError::Timeout { .. } => {
                "서버 응답이 지연되고 있습니다. 잠시 후 다시 시도해주세요.".to_string()
            }
            UpdaterError::HttpError { status_code, .. } => {
                if *status_code == 404 {
                    "다운로드 파일을 찾을 수 없습니다.".to_string()
                } else if *status_code >= 500 {
                    "서버에 일시적인 문제가 있습니다. 잠시 후 다시 시도해주세요.".to_string()
                } else {
                    format!("서버 오류 ({})", status_code)
                }
            }
            UpdaterError::Cancelled { .. } => "다운로드가 취소되었습니다.".to_string(),
            UpdaterError::FileSystemError { .. } => {
                "파일 저장 중 오류가 발생했습니다. 디스크 공간과 권한을 확인해주세요.".to_string()
            }
            UpdaterError::ArchiveError { .. } => {
                "압축 파일이 손상되었습니다. 다시 다운로드해주세요.".to_string()
            }
            UpdaterError::ProtocolError { message } => {
                format!("플러그인 정보를 해석할 수 없습니다: {}", message)
            }
            UpdaterError::ConfigError { message } => {
                format!("설정 오류: {}", message)
            }
        }
    }

    /// reqwest 에러를 UpdaterError로 변환
    pub fn from_reqwest(err: &reqwest::Error, operation: &str, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            UpdaterError::Timeout {
                operation: operation.to_string(),
                duration_secs: timeout_secs,
            }
        } else if err.is_connect() {
            UpdaterError::NetworkError {
                message: format!("연결 실패: {}", err),
                recoverable: true,
            }
        } else if let Some(status) = err.status() {
            UpdaterError::HttpError {
                status_code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            UpdaterError::NetworkError {
                message: err.to_string(),
                recoverable: err.is_request() || err.is_body(),
            }
        }
    }

    /// IO 에러를 UpdaterError로 변환
    pub fn from_io(err: &std::io::Error, operation: &str, path: &std::path::Path) -> Self {
        UpdaterError::FileSystemError {
            operation: operation.to_string(),
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn archive(path: &std::path::Path, message: impl fmt::Display) -> Self {
        UpdaterError::ArchiveError {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        UpdaterError::ProtocolError { message: message.into() }
    }
}

/// 에러 컨텍스트 (디버깅/로깅용)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: String,
    pub operation: String,
    pub item: Option<String>,
    pub error: UpdaterError,
}

impl ErrorContext {
    pub fn new(operation: &str, error: UpdaterError) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            item: None,
            error,
        }
    }

    pub fn with_item(mut self, item: &str) -> Self {
        self.item = Some(item.to_string());
        self
    }

    /// 로그 출력
    pub fn log(&self) {
        if self.error.is_recoverable() {
            tracing::warn!(
                "[Error] {} - {} (recoverable): {}",
                self.operation,
                self.item.as_deref().unwrap_or("N/A"),
                self.error
            );
        } else {
            tracing::error!(
                "[Error] {} - {} (fatal): {}",
                self.operation,
                self.item.as_deref().unwrap_or("N/A"),
                self.error
            );
        }
    }
}
