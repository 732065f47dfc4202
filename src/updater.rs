//! 업데이터: 세션 레지스트리 + 종료 조정자
//!
//! 호스트 수명 동안 하나만 존재합니다. 아이템 목록을 탐색하고, 세션을 처음 조회할 때
//! 만들어 캐시하며, 호스트 종료 시 [`Updater::shutdown`]이 세션 상태를 모아
//! 마이그레이션이 필요한지 결정합니다.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kerbal_updater_migration::{HandoffRecord, HostEnvironment};

use crate::config::{ConfigStore, FileConfigStore, UpdaterConfig};
use crate::error::UpdaterError;
use crate::fetcher::ArchiveFetcher;
use crate::handoff::HandoffWriter;
use crate::item::{discover_items, parse_catalog_id, Item, MetadataResolver};
use crate::layout::InstallLayout;
use crate::session::{ItemSession, SessionContext, UpdateState};
use crate::staging::{StagingArea, StagingEngine};

/// 목록 표시용 상태
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ItemStatus {
    /// 이전 마이그레이션이 끝나지 않아 업데이터 비활성화
    Disabled,
    NotMonitored,
    NotConfigured,
    Session { state: UpdateState, progress: u8 },
}

impl ItemStatus {
    pub fn label(&self) -> String {
        match self {
            ItemStatus::Disabled => "Disabled".to_string(),
            ItemStatus::NotMonitored => "Not Monitored".to_string(),
            ItemStatus::NotConfigured => "Not Configured".to_string(),
            ItemStatus::Session { state: UpdateState::Downloading, progress } => {
                format!("Downloading {}%", progress)
            }
            ItemStatus::Session { state, .. } => state.label().to_string(),
        }
    }
}

/// 종료 처리 결과
#[derive(Debug, Clone, Default)]
pub struct ShutdownOutcome {
    pub disabled: bool,
    /// 종료 때문에 취소된 다운로드
    pub cancelled: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Failed/로 옮긴 스크래치 디렉터리
    pub quarantined: Vec<PathBuf>,
    pub handoff: Option<HandoffRecord>,
}

pub struct Updater {
    config: UpdaterConfig,
    layout: InstallLayout,
    area: StagingArea,
    store: Arc<dyn ConfigStore>,
    resolver: Arc<dyn MetadataResolver>,
    ctx: SessionContext,
    items: Vec<Item>,
    sessions: HashMap<String, ItemSession>,
    disabled: bool,
}

impl Updater {
    /// 설정의 설치 루트와 기본 config store로 열기
    pub fn open(config: UpdaterConfig, resolver: Arc<dyn MetadataResolver>) -> Result<Self> {
        let layout = InstallLayout::from_config(&config);
        let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::open(&layout.store_path)?);
        Self::with_store(config, layout, store, resolver)
    }

    pub fn with_store(
        config: UpdaterConfig,
        layout: InstallLayout,
        store: Arc<dyn ConfigStore>,
        resolver: Arc<dyn MetadataResolver>,
    ) -> Result<Self> {
        let area = StagingArea::new(&layout);
        let disabled = area.is_dirty();
        if disabled {
            tracing::error!(
                "[Updater] Staging area {} is not empty; the previous migration did not finish. Updater disabled",
                area.dir.display()
            );
        } else {
            area.ensure()
                .with_context(|| format!("Failed to create {}", area.dir.display()))?;
        }

        let fetcher = ArchiveFetcher::new(&config)?;
        let engine = Arc::new(StagingEngine::new(layout.clone(), config.clone(), store.clone()));
        let ctx = SessionContext { fetcher, engine, store: store.clone() };
        let items = discover_items(&layout, store.as_ref())?;
        tracing::info!("[Updater] Found {} plugin folder(s) in {}", items.len(), layout.data_dir.display());

        Ok(Self {
            config,
            layout,
            area,
            store,
            resolver,
            ctx,
            items,
            sessions: HashMap::new(),
            disabled,
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, folder: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.folder_name == folder)
    }

    fn item_mut(&mut self, folder: &str) -> Result<&mut Item, UpdaterError> {
        self.items
            .iter_mut()
            .find(|i| i.folder_name == folder)
            .ok_or_else(|| UpdaterError::ConfigError {
                message: format!("no plugin folder named '{}'", folder),
            })
    }

    /// 표시용 상태. 세션이 필요하면 이 시점에 생성
    pub fn status(&mut self, folder: &str) -> Result<ItemStatus, UpdaterError> {
        if self.disabled {
            return Ok(ItemStatus::Disabled);
        }
        let item = self.item(folder).ok_or_else(|| UpdaterError::ConfigError {
            message: format!("no plugin folder named '{}'", folder),
        })?;
        if !self.store.toggle(folder) {
            return Ok(ItemStatus::NotMonitored);
        }
        if !item.is_configured() {
            return Ok(ItemStatus::NotConfigured);
        }
        let session = self.session(folder)?;
        let state = session.poll();
        Ok(ItemStatus::Session { state, progress: session.progress() })
    }

    /// 세션 조회 (없으면 원격 메타데이터를 조회해 생성)
    pub fn session(&mut self, folder: &str) -> Result<&mut ItemSession, UpdaterError> {
        if self.disabled {
            return Err(UpdaterError::ConfigError {
                message: "updater is disabled until the pending migration completes".to_string(),
            });
        }

        if !self.sessions.contains_key(folder) {
            let item = self
                .item(folder)
                .cloned()
                .ok_or_else(|| UpdaterError::ConfigError {
                    message: format!("no plugin folder named '{}'", folder),
                })?;
            if !self.store.toggle(folder) {
                return Err(UpdaterError::ConfigError {
                    message: format!("'{}' is not monitored", folder),
                });
            }
            let catalog_id = item.catalog_id.ok_or_else(|| UpdaterError::ConfigError {
                message: format!("'{}' has no catalog id; link it first", folder),
            })?;
            let remote = self.resolver.resolve(catalog_id)?;
            let session = ItemSession::new(item, Some(remote), self.ctx.clone());
            self.sessions.insert(folder.to_string(), session);
        }

        self.sessions.get_mut(folder).ok_or_else(|| UpdaterError::ConfigError {
            message: format!("no session for '{}'", folder),
        })
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ItemSession> {
        self.sessions.values()
    }

    /// 모든 세션의 완료된 작업 반영
    pub fn poll_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.poll();
        }
    }

    /// 진행 중인 모든 작업이 끝날 때까지 대기
    pub async fn settle_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.settle().await;
        }
    }

    pub fn restart_required(&self) -> bool {
        self.sessions.values().any(|s| s.restart_required())
    }

    /// 카탈로그 ID 또는 URL을 폴더에 수동 연결
    pub fn link(&mut self, folder: &str, input: &str) -> Result<u32, UpdaterError> {
        let catalog_id = parse_catalog_id(input)?;
        self.ensure_idle(folder)?;

        let item = self.item_mut(folder)?;
        if item.automatic {
            return Err(UpdaterError::ConfigError {
                message: format!("'{}' is configured by its author and cannot be relinked", folder),
            });
        }
        item.catalog_id = Some(catalog_id);
        item.last_applied = None;

        self.store.set_catalog_override(folder, Some(catalog_id));
        self.store.set_last_applied(catalog_id, None);
        self.sessions.remove(folder);
        tracing::info!("[Updater] Linked {} to catalog id {}", folder, catalog_id);
        Ok(catalog_id)
    }

    /// 모니터링 토글
    pub fn set_monitored(&mut self, folder: &str, enabled: bool) -> Result<(), UpdaterError> {
        self.item_mut(folder)?;
        if !enabled {
            self.ensure_idle(folder)?;
            self.sessions.remove(folder);
        }
        self.store.set_toggle(folder, enabled);
        Ok(())
    }

    /// 세션이 진행 중이거나 완료되었으면 설정 변경 거부
    fn ensure_idle(&self, folder: &str) -> Result<(), UpdaterError> {
        match self.sessions.get(folder).map(|s| s.state()) {
            Some(state @ (UpdateState::Downloading | UpdateState::Staging | UpdateState::Complete)) => {
                Err(UpdaterError::ConfigError {
                    message: format!("'{}' is busy ({:?})", folder, state),
                })
            }
            _ => Ok(()),
        }
    }

    /// 사용자가 호스트 재시작을 요청 (재시작 시그널 생성)
    pub fn request_restart(&self) -> Result<()> {
        if self.disabled {
            anyhow::bail!("updater is disabled");
        }
        self.area
            .request_restart()
            .with_context(|| format!("Failed to create {}", self.area.restart_signal.display()))?;
        tracing::info!("[Updater] Restart requested");
        Ok(())
    }

    /// 호스트 종료 처리
    ///
    /// 1. 진행 중인 다운로드 취소, 진행 중인 스테이징은 완료까지 대기
    /// 2. `Error` 아이템의 스크래치 디렉터리를 `Failed/`로 격리
    /// 3. config store 저장
    /// 4. `Complete` 세션이 있으면 핸드오프 기록 + 러너 실행, 없으면 스테이징 영역 비움
    pub async fn shutdown<E: HostEnvironment>(mut self, env: E) -> Result<ShutdownOutcome> {
        let mut outcome = ShutdownOutcome::default();
        if self.disabled {
            tracing::warn!("[Updater] Disabled; skipping shutdown work");
            outcome.disabled = true;
            return Ok(outcome);
        }

        for (folder, session) in self.sessions.iter_mut() {
            session.poll();
            if session.state() == UpdateState::Downloading && session.cancel().is_ok() {
                outcome.cancelled.push(folder.clone());
            }
        }
        for session in self.sessions.values_mut() {
            session.settle().await;
        }

        for (folder, session) in &self.sessions {
            match session.state() {
                UpdateState::Complete => outcome.completed.push(folder.clone()),
                UpdateState::Error => {
                    outcome.failed.push(folder.clone());
                    if let Some(moved) = self.quarantine(session) {
                        outcome.quarantined.push(moved);
                    }
                }
                _ => {}
            }
        }
        outcome.cancelled.sort();
        outcome.completed.sort();
        outcome.failed.sort();

        if let Err(e) = self.store.save() {
            tracing::warn!("[Updater] Failed to save config store: {:#}", e);
        }

        if outcome.completed.is_empty() {
            self.clear_staging();
            return Ok(outcome);
        }

        if self.config.always_relaunch {
            self.area.request_restart()?;
        }
        let writer = HandoffWriter::new(self.layout.clone(), env);
        outcome.handoff = Some(writer.write_and_launch()?);
        tracing::info!(
            "[Updater] {} item(s) staged, migration scheduled",
            outcome.completed.len()
        );
        Ok(outcome)
    }

    /// 실패한 스크래치 디렉터리는 진단용으로 남기되 라이브 트리로 복사되지 않게 이동
    fn quarantine(&self, session: &ItemSession) -> Option<PathBuf> {
        let scratch = session.scratch_dir()?;
        let catalog_id = session.item().catalog_id?;
        if !scratch.is_dir() {
            return None;
        }
        let target = self.layout.failed_scratch_dir(catalog_id);
        let result = std::fs::create_dir_all(&self.layout.failed_dir)
            .and_then(|_| {
                if target.exists() {
                    std::fs::remove_dir_all(&target)
                } else {
                    Ok(())
                }
            })
            .and_then(|_| std::fs::rename(&scratch, &target));
        match result {
            Ok(()) => {
                tracing::info!("[Updater] Kept failed scratch {} for inspection", target.display());
                Some(target)
            }
            Err(e) => {
                tracing::warn!("[Updater] Failed to move {}: {}", scratch.display(), e);
                None
            }
        }
    }

    /// 완료된 아이템이 없으면 스테이징 잔여물은 적용되지 않으므로 비움
    fn clear_staging(&self) {
        let result = std::fs::remove_dir_all(&self.area.dir).and_then(|_| self.area.ensure());
        if let Err(e) = result {
            tracing::warn!("[Updater] Failed to clear {}: {}", self.area.dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{CatalogFileResolver, RemoteMetadata};
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    struct NoLaunch;

    impl HostEnvironment for NoLaunch {
        fn is_host_running(&self, _process_name: &str) -> bool {
            false
        }
        fn launch(&self, executable: &Path) -> std::io::Result<()> {
            panic!("unexpected launch of {}", executable.display());
        }
    }

    fn fixture() -> (tempfile::TempDir, UpdaterConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = UpdaterConfig::default();
        config.install_root = Some(tmp.path().to_string_lossy().to_string());
        let data = tmp.path().join("GameData");
        std::fs::create_dir_all(data.join("Foo")).unwrap();
        std::fs::create_dir_all(data.join("Bar")).unwrap();
        std::fs::write(data.join("Foo").join("updater.toml"), "catalog_id = 12\n").unwrap();
        (tmp, config)
    }

    fn resolver() -> Arc<CatalogFileResolver> {
        let mut r = CatalogFileResolver::default();
        for id in [12, 34] {
            r.insert(
                id,
                RemoteMetadata {
                    download_url: format!("http://127.0.0.1:9/{}.zip", id),
                    last_updated: Utc.with_ymd_and_hms(2016, 5, 1, 0, 0, 0).unwrap(),
                },
            );
        }
        Arc::new(r)
    }

    #[test]
    fn statuses_follow_toggle_and_configuration() {
        let (_tmp, config) = fixture();
        let mut updater = Updater::open(config, resolver()).unwrap();

        assert!(matches!(
            updater.status("Foo").unwrap(),
            ItemStatus::Session { state: UpdateState::Ready, .. }
        ));
        assert_eq!(updater.status("Bar").unwrap(), ItemStatus::NotConfigured);
        assert!(updater.session("Bar").is_err());

        updater.set_monitored("Foo", false).unwrap();
        assert_eq!(updater.status("Foo").unwrap(), ItemStatus::NotMonitored);
        assert!(updater.status("Missing").is_err());
    }

    #[test]
    fn link_accepts_urls_and_rejects_garbage() {
        let (_tmp, config) = fixture();
        let mut updater = Updater::open(config, resolver()).unwrap();

        let err = updater.link("Bar", "not a url").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);

        assert_eq!(updater.link("Bar", "http://kerbalspaceport.com/?p=34").unwrap(), 34);
        assert_eq!(updater.store().catalog_override("Bar"), Some(34));
        assert_eq!(updater.store().last_applied(34), None);
        assert!(matches!(
            updater.status("Bar").unwrap(),
            ItemStatus::Session { state: UpdateState::Ready, .. }
        ));

        assert!(updater.link("Foo", "34").is_err(), "automatic items keep their own id");
    }

    #[test]
    fn dirty_staging_disables_updater() {
        let (tmp, config) = fixture();
        let layout = InstallLayout::new(tmp.path(), &config);
        std::fs::create_dir_all(layout.staging_dir.join("Foo")).unwrap();

        let mut updater = Updater::open(config, resolver()).unwrap();
        assert!(updater.is_disabled());
        assert_eq!(updater.status("Foo").unwrap(), ItemStatus::Disabled);
        assert!(updater.session("Foo").is_err());
        assert!(updater.request_restart().is_err());
    }

    #[tokio::test]
    async fn shutdown_without_completed_items_writes_no_handoff() {
        let (_tmp, config) = fixture();
        let mut updater = Updater::open(config, resolver()).unwrap();
        updater.session("Foo").unwrap().begin_download().unwrap();
        updater.request_restart().unwrap();
        let layout = updater.layout().clone();

        let outcome = updater.shutdown(NoLaunch).await.unwrap();

        assert_eq!(outcome.cancelled, vec!["Foo"]);
        assert!(outcome.completed.is_empty());
        assert!(outcome.handoff.is_none());
        assert!(!layout.handoff_path.exists());
        assert!(!StagingArea::new(&layout).is_dirty(), "leftovers cleared");
        assert!(layout.store_path.exists(), "store saved");
    }
}
