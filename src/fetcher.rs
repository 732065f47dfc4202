//! 아카이브 다운로더
//!
//! 하나의 URL을 로컬 파일로 스트리밍 다운로드합니다.
//! - 진행률은 0..=100, 단조 증가 (`AtomicU8::fetch_max`)
//! - 취소 시 전송을 중단: 부분 파일이 남을 수 있으므로 파일 존재를 성공으로 취급하면 안 됨
//! - 자동 재시도 없음 (재시도는 사용자가 세션을 다시 시작)

use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::UpdaterConfig;
use crate::error::UpdaterError;

#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    http: reqwest::Client,
    timeout_secs: u64,
}

impl ArchiveFetcher {
    pub fn new(config: &UpdaterConfig) -> Result<Self, UpdaterError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpdaterError::ConfigError {
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { http, timeout_secs: config.timeout_secs })
    }

    /// `url`을 `dest`로 다운로드하고 받은 바이트 수를 반환
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &AtomicU8,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdaterError> {
        tracing::info!("[Fetcher] Downloading {} → {}", url, dest.display());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(dest)),
            r = self.http.get(url).send() => {
                r.map_err(|e| UpdaterError::from_reqwest(&e, "download", self.timeout_secs))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::HttpError {
                status_code: status.as_u16(),
                message: format!("GET {} returned {}", url, status),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdaterError::from_io(&e, "create download dir", parent))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| UpdaterError::from_io(&e, "create archive", dest))?;

        let total = response.content_length().filter(|len| *len > 0);
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("[Fetcher] Cancelled after {} bytes: {}", received, url);
                    return Err(cancelled(dest));
                }
                next = stream.next() => next,
            };
            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    return Err(UpdaterError::from_reqwest(&e, "download", self.timeout_secs))
                }
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| UpdaterError::from_io(&e, "write archive", dest))?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                // 100은 파일을 닫은 뒤에만 기록
                let pct = (received.saturating_mul(100) / total).min(99) as u8;
                progress.fetch_max(pct, Ordering::SeqCst);
            }
        }

        file.flush()
            .await
            .map_err(|e| UpdaterError::from_io(&e, "flush archive", dest))?;
        drop(file);

        progress.fetch_max(100, Ordering::SeqCst);
        tracing::info!("[Fetcher] Downloaded {} ({} bytes)", dest.display(), received);
        Ok(received)
    }
}

fn cancelled(dest: &Path) -> UpdaterError {
    UpdaterError::Cancelled {
        item: dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}
