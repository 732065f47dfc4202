//! 아이템별 업데이트 상태 머신
//!
//! ```text
//!              ┌──────── cancel ────────┐
//!              ▼                        │
//! Ignored ◄─ Ready ── begin ──► Downloading ──► Staging ──► Complete
//!    │         ▲                   │   ▲           │
//!    └ reinstall                   ▼   │ retry     │
//!                                 Error ◄──────────┘
//! ```
//!
//! 다운로드 완료는 oneshot 채널로 전달됩니다. [`ItemSession::poll`]은 블로킹 없이
//! 결과를 확인하고, [`ItemSession::settle`]은 진행 중인 작업이 끝날 때까지 기다립니다.
//! 두 경우 모두 다운로드가 성공하면 `Staging`으로 넘어가 백그라운드 스레드에서 스테이징합니다.
//! `Complete`는 같은 프로세스 안에서 다시 이전 상태로 돌아가지 않습니다.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::error::{ErrorContext, UpdaterError};
use crate::fetcher::ArchiveFetcher;
use crate::item::{Item, RemoteMetadata};
use crate::staging::{ArchiveFormat, StagingEngine, StagingReport, StagingRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    /// 원격 카탈로그 ID 없음 (표시 전용, 전이 없음)
    NotConfigured,
    Ignored,
    Ready,
    Downloading,
    Staging,
    Complete,
    Error,
}

impl UpdateState {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateState::NotConfigured => "Not Configured",
            UpdateState::Ignored => "Up To Date",
            UpdateState::Ready => "Update Available",
            UpdateState::Downloading => "Downloading",
            UpdateState::Staging => "Staging",
            UpdateState::Complete => "Restart Required",
            UpdateState::Error => "Error",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(UpdateState, UpdateState),
}

pub fn can_transition(from: UpdateState, to: UpdateState) -> bool {
    use UpdateState::*;
    matches!(
        (from, to),
        (Ready, Downloading)
            | (Error, Downloading)
            | (Downloading, Error)
            | (Downloading, Staging)
            | (Downloading, Ready)
            | (Staging, Complete)
            | (Staging, Error)
            | (Ignored, Ready)
            | (Ready, Ignored)
    )
}

/// 세션들이 공유하는 협력 객체
#[derive(Clone)]
pub struct SessionContext {
    pub fetcher: ArchiveFetcher,
    pub engine: Arc<StagingEngine>,
    pub store: Arc<dyn ConfigStore>,
}

enum Pending {
    Download {
        cancel: CancellationToken,
        rx: oneshot::Receiver<Result<u64, UpdaterError>>,
    },
    Staging {
        rx: oneshot::Receiver<Result<StagingReport, UpdaterError>>,
    },
}

/// 아이템 하나의 업데이트 세션 (프로세스 수명 동안 유지)
pub struct ItemSession {
    item: Item,
    remote: Option<RemoteMetadata>,
    state: UpdateState,
    progress: Arc<AtomicU8>,
    error: Option<UpdaterError>,
    archive_path: Option<PathBuf>,
    pending: Option<Pending>,
    ctx: SessionContext,
}

impl ItemSession {
    pub fn new(item: Item, remote: Option<RemoteMetadata>, ctx: SessionContext) -> Self {
        let state = match (item.catalog_id, &remote) {
            (Some(_), Some(remote)) => initial_state(item.last_applied, remote),
            _ => UpdateState::NotConfigured,
        };
        tracing::debug!("[Session] {} starts as {:?}", item.folder_name, state);

        Self {
            item,
            remote,
            state,
            progress: Arc::new(AtomicU8::new(0)),
            error: None,
            archive_path: None,
            pending: None,
            ctx,
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn remote(&self) -> Option<&RemoteMetadata> {
        self.remote.as_ref()
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<&UpdaterError> {
        self.error.as_ref()
    }

    pub fn archive_path(&self) -> Option<&PathBuf> {
        self.archive_path.as_ref()
    }

    /// 이 세션 때문에 호스트 재시작 후 마이그레이션이 필요한지
    pub fn restart_required(&self) -> bool {
        self.state == UpdateState::Complete
    }

    /// 실패한 스테이징이 남긴 스크래치 디렉터리
    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.item
            .catalog_id
            .map(|id| self.ctx.engine.layout().scratch_dir(id))
    }

    fn transition(&mut self, to: UpdateState) -> Result<(), TransitionError> {
        if can_transition(self.state, to) {
            tracing::info!("[Session] {}: {:?} -> {:?}", self.item.folder_name, self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    /// 내부 진행용 전이: 테이블상 항상 허용되는 경로만 호출
    fn advance(&mut self, to: UpdateState) {
        if let Err(e) = self.transition(to) {
            tracing::error!("[Session] {}: {}", self.item.folder_name, e);
        }
    }

    /// 다운로드 시작 (`Ready`/`Error` → `Downloading`). tokio 런타임 안에서 호출해야 함
    pub fn begin_download(&mut self) -> Result<(), TransitionError> {
        let (catalog_id, remote) = match (self.item.catalog_id, self.remote.clone()) {
            (Some(id), Some(remote)) => (id, remote),
            _ => {
                return Err(TransitionError::InvalidTransition(self.state, UpdateState::Downloading))
            }
        };
        self.transition(UpdateState::Downloading)?;

        self.progress.store(0, Ordering::SeqCst);
        self.error = None;

        let format = ArchiveFormat::from_url(&remote.download_url);
        let dest = self.ctx.engine.layout().archive_path(catalog_id, format.extension());
        self.archive_path = Some(dest.clone());

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let fetcher = self.ctx.fetcher.clone();
        let progress = self.progress.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch(&remote.download_url, &dest, &progress, &token).await;
            let _ = tx.send(result);
        });

        self.pending = Some(Pending::Download { cancel, rx });
        Ok(())
    }

    /// 강제 재설치 (`Ignored` → `Ready` → `Downloading`)
    pub fn reinstall(&mut self) -> Result<(), TransitionError> {
        if self.state == UpdateState::Ignored {
            self.transition(UpdateState::Ready)?;
        }
        self.begin_download()
    }

    /// 진행 중인 다운로드 취소 (`Downloading` → `Ready`)
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        if self.state != UpdateState::Downloading {
            return Err(TransitionError::InvalidTransition(self.state, UpdateState::Ready));
        }
        if let Some(Pending::Download { cancel, .. }) = self.pending.take() {
            cancel.cancel();
        }
        self.transition(UpdateState::Ready)
    }

    /// 업데이트를 설치하지 않고 넘김 (`Ready` → `Ignored`). 원격 버전은 본 것으로 기록
    pub fn ignore(&mut self) -> Result<(), TransitionError> {
        self.transition(UpdateState::Ignored)?;
        if let (Some(id), Some(remote)) = (self.item.catalog_id, &self.remote) {
            self.ctx.store.set_last_applied(id, Some(remote.last_updated));
            self.item.last_applied = Some(remote.last_updated);
        }
        Ok(())
    }

    /// 블로킹 없이 완료된 작업을 반영하고 현재 상태 반환
    pub fn poll(&mut self) -> UpdateState {
        loop {
            match self.pending.take() {
                Some(Pending::Download { cancel, mut rx }) => match rx.try_recv() {
                    Ok(result) => self.on_download_finished(result),
                    Err(oneshot::error::TryRecvError::Empty) => {
                        self.pending = Some(Pending::Download { cancel, rx });
                        break;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => self.on_task_lost("download"),
                },
                Some(Pending::Staging { mut rx }) => match rx.try_recv() {
                    Ok(result) => self.on_staging_finished(result),
                    Err(oneshot::error::TryRecvError::Empty) => {
                        self.pending = Some(Pending::Staging { rx });
                        break;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => self.on_task_lost("staging"),
                },
                None => break,
            }
        }
        self.state
    }

    /// 진행 중인 다운로드/스테이징이 끝날 때까지 대기
    pub async fn settle(&mut self) -> UpdateState {
        while let Some(pending) = self.pending.take() {
            match pending {
                Pending::Download { rx, .. } => match rx.await {
                    Ok(result) => self.on_download_finished(result),
                    Err(_) => self.on_task_lost("download"),
                },
                Pending::Staging { rx } => match rx.await {
                    Ok(result) => self.on_staging_finished(result),
                    Err(_) => self.on_task_lost("staging"),
                },
            }
        }
        self.state
    }

    fn on_download_finished(&mut self, result: Result<u64, UpdaterError>) {
        match result {
            Ok(_) => self.start_staging(),
            Err(e) => self.fail("download", e),
        }
    }

    fn on_staging_finished(&mut self, result: Result<StagingReport, UpdaterError>) {
        match result {
            Ok(_) => {
                self.item.last_applied = self.remote.as_ref().map(|r| r.last_updated);
                self.advance(UpdateState::Complete);
            }
            Err(e) => self.fail("stage", e),
        }
    }

    fn on_task_lost(&mut self, operation: &str) {
        self.fail(
            operation,
            UpdaterError::NetworkError {
                message: format!("{} task ended without a result", operation),
                recoverable: true,
            },
        );
    }

    fn fail(&mut self, operation: &str, error: UpdaterError) {
        ErrorContext::new(operation, error.clone())
            .with_item(&self.item.folder_name)
            .log();
        self.error = Some(error);
        self.advance(UpdateState::Error);
    }

    fn start_staging(&mut self) {
        let request = match (self.item.catalog_id, &self.remote, &self.archive_path) {
            (Some(catalog_id), Some(remote), Some(archive)) => Some(StagingRequest {
                catalog_id,
                folder_name: self.item.folder_name.clone(),
                archive: archive.clone(),
                format: ArchiveFormat::from_url(&remote.download_url),
                version: remote.last_updated,
            }),
            _ => None,
        };
        let Some(request) = request else {
            self.fail("stage", UpdaterError::protocol("session has no downloaded archive"));
            return;
        };
        self.advance(UpdateState::Staging);

        let (tx, rx) = oneshot::channel();
        let engine = self.ctx.engine.clone();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(engine.stage(&request));
        });
        self.pending = Some(Pending::Staging { rx });
    }
}

/// 로컬 적용 버전이 원격 버전 이상이면 `Ignored`, 아니면 `Ready`
pub fn initial_state(
    last_applied: Option<chrono::DateTime<chrono::Utc>>,
    remote: &RemoteMetadata,
) -> UpdateState {
    match last_applied {
        Some(applied) if applied >= remote.last_updated => UpdateState::Ignored,
        _ => UpdateState::Ready,
    }
}
