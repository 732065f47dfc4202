//! 마이그레이션 러너: 호스트 종료 후 스테이징 트리를 라이브 설치에 적용
//!
//! ## 단일 패스 순서
//! 1. 핸드오프 레코드 읽기 (없으면 아무것도 하지 않고 종료)
//! 2. 레코드가 가리키는 호스트 프로세스가 완전히 종료될 때까지 대기 (타임아웃 없음)
//! 3. 레코드 삭제, 재시작 시그널 확인 후 삭제
//! 4. 삭제 큐에 있는 라이브 폴더 삭제 후 큐 삭제 (큐를 읽지 못하면 큐와 스테이징을 그대로 둠)
//! 5. 스테이징 트리 전체를 라이브 루트로 재귀 복사 (덮어쓰기, 파일 단위 실패 허용)
//! 6. 스테이징 디렉터리 삭제 후 빈 디렉터리로 재생성 (실패 시 다음 사이클로 연기)
//! 7. 요청되었으면 호스트 재실행
//!
//! 삭제(4)는 항상 복사(5)보다 먼저 실행되며, 복사를 대체하지 않습니다.

use anyhow::Result;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::process::HostEnvironment;
use crate::record::HandoffRecord;

/// 레코드에서 호스트 이름을 얻지 못했을 때의 기본값
pub const DEFAULT_HOST_PROCESS: &str = "KSP";

/// 호스트 재실행 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchPolicy {
    /// 재시작 시그널 파일이 있을 때만
    OnSignal,
    /// 항상 재실행
    Always,
}

/// 러너 설정
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub handoff_path: PathBuf,
    /// 대기할 호스트 프로세스 이름. `None`이면 레코드의 호스트 실행 파일 이름
    pub host_process_name: Option<String>,
    pub relaunch: RelaunchPolicy,
    pub poll_interval: Duration,
}

impl RunnerOptions {
    pub fn new(handoff_path: PathBuf) -> Self {
        Self {
            handoff_path,
            host_process_name: None,
            relaunch: RelaunchPolicy::OnSignal,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// 환경 변수 오버라이드 적용
    /// - `KERBAL_MIGRATION_HOST`: 대기할 호스트 프로세스 이름
    /// - `KERBAL_MIGRATION_ALWAYS_RELAUNCH=1`: 항상 재실행
    pub fn from_env(handoff_path: PathBuf) -> Self {
        let mut options = Self::new(handoff_path);
        if let Ok(name) = std::env::var("KERBAL_MIGRATION_HOST") {
            if !name.trim().is_empty() {
                options.host_process_name = Some(name.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("KERBAL_MIGRATION_ALWAYS_RELAUNCH") {
            if matches!(v.trim(), "1" | "true" | "yes") {
                options.relaunch = RelaunchPolicy::Always;
            }
        }
        options
    }
}

/// 복사에 실패한 파일
#[derive(Debug, Clone)]
pub struct FailedCopy {
    pub path: PathBuf,
    pub message: String,
}

/// 한 번의 실행 결과
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// 핸드오프 레코드가 있어서 실제로 적용을 수행했는지
    pub performed: bool,
    pub restart_requested: bool,
    /// 삭제된 라이브 폴더
    pub removed: Vec<String>,
    /// 유효하지 않거나 삭제에 실패한 큐 항목
    pub skipped_removals: Vec<String>,
    pub copied: usize,
    pub failed: Vec<FailedCopy>,
    /// 삭제 큐를 읽지 못함 → 큐 파일과 스테이징을 그대로 남김
    pub removal_queue_unread: bool,
    /// 스테이징 정리 실패 → 다음 사이클로 연기
    pub cleanup_deferred: bool,
    pub relaunched: bool,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.skipped_removals.is_empty()
            && !self.removal_queue_unread
            && !self.cleanup_deferred
    }
}

/// 마이그레이션 러너
pub struct MigrationRunner<E: HostEnvironment> {
    options: RunnerOptions,
    env: E,
}

impl<E: HostEnvironment> MigrationRunner<E> {
    pub fn new(options: RunnerOptions, env: E) -> Self {
        Self { options, env }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// 단일 패스 실행
    pub fn run(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        let path = &self.options.handoff_path;
        tracing::info!("[Migration] Loading handoff record {}", path.display());
        let pending = match HandoffRecord::read(path)? {
            Some(r) => r,
            None => {
                tracing::info!("[Migration] No handoff record found, nothing to do");
                return Ok(report);
            }
        };

        self.wait_for_host_exit(&self.host_process_name(&pending));

        let record = match HandoffRecord::take(path)? {
            Some(r) => r,
            None => {
                tracing::info!("[Migration] Handoff record disappeared while waiting, nothing to do");
                return Ok(report);
            }
        };
        report.performed = true;

        report.restart_requested = Self::consume_restart_signal(&record.restart_signal);
        self.remove_abandoned_directories(&record, &mut report);

        tracing::info!(
            "[Migration] Copying {} → {}",
            record.staging_dir.display(),
            record.live_root.display()
        );
        copy_tree(&record.staging_dir, &record.live_root, &record.removal_queue, &mut report);
        tracing::info!(
            "[Migration] Copied {} file(s), {} failure(s)",
            report.copied,
            report.failed.len()
        );

        if report.removal_queue_unread {
            report.cleanup_deferred = true;
        } else {
            self.reset_staging(&record.staging_dir, &mut report);
        }

        if report.restart_requested || self.options.relaunch == RelaunchPolicy::Always {
            match self.env.launch(&record.host_executable) {
                Ok(()) => report.relaunched = true,
                Err(e) => tracing::error!(
                    "[Migration] Failed to relaunch {}: {}",
                    record.host_executable.display(),
                    e
                ),
            }
        }

        Ok(report)
    }

    fn host_process_name(&self, record: &HandoffRecord) -> String {
        self.options
            .host_process_name
            .clone()
            .or_else(|| record.host_process_name())
            .unwrap_or_else(|| DEFAULT_HOST_PROCESS.to_string())
    }

    fn wait_for_host_exit(&self, name: &str) {
        if !self.env.is_host_running(name) {
            return;
        }
        tracing::info!("[Migration] Waiting for {} to quit...", name);
        while self.env.is_host_running(name) {
            std::thread::sleep(self.options.poll_interval);
        }
        tracing::info!("[Migration] {} has exited", name);
    }

    fn consume_restart_signal(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("[Migration] Failed to delete restart signal {}: {}", path.display(), e);
        }
        tracing::info!("[Migration] Restart requested");
        true
    }

    fn remove_abandoned_directories(&self, record: &HandoffRecord, report: &mut MigrationReport) {
        let queue = &record.removal_queue;
        if !queue.exists() {
            return;
        }

        match std::fs::read_to_string(queue) {
            Ok(content) => {
                for line in content.lines() {
                    let name = line.trim();
                    if name.is_empty() {
                        continue;
                    }
                    if !is_plain_folder_name(name) {
                        tracing::warn!("[Migration] Refusing to remove suspicious entry {:?}", name);
                        report.skipped_removals.push(name.to_string());
                        continue;
                    }

                    let target = record.live_root.join(name);
                    if !target.is_dir() {
                        continue;
                    }
                    match std::fs::remove_dir_all(&target) {
                        Ok(()) => {
                            tracing::info!("[Migration] Removed abandoned directory {}", target.display());
                            report.removed.push(name.to_string());
                        }
                        Err(e) => {
                            tracing::warn!("[Migration] Failed to remove {}: {}", target.display(), e);
                            report.skipped_removals.push(name.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    "[Migration] Failed to read removal queue {} ({}), keeping it and the staging area",
                    queue.display(),
                    e
                );
                report.removal_queue_unread = true;
                return;
            }
        }

        if let Err(e) = std::fs::remove_file(queue) {
            tracing::warn!("[Migration] Failed to delete removal queue {}: {}", queue.display(), e);
        }
    }

    fn reset_staging(&self, staging: &Path, report: &mut MigrationReport) {
        let result = std::fs::remove_dir_all(staging).and_then(|_| std::fs::create_dir_all(staging));
        if let Err(e) = result {
            tracing::warn!(
                "[Migration] Could not clear staging area {} ({}), leaving it for the next cycle",
                staging.display(),
                e
            );
            report.cleanup_deferred = true;
        }
    }
}

/// 삭제 큐 항목은 라이브 루트 바로 아래 폴더 이름 하나여야 함
pub fn is_plain_folder_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
        && !name.contains('\\')
}

/// 재귀 복사: 파일 단위 실패는 기록하고 계속 진행. `skip` 경로는 복사하지 않음
fn copy_tree(src: &Path, dst: &Path, skip: &Path, report: &mut MigrationReport) {
    if let Err(e) = std::fs::create_dir_all(dst) {
        tracing::warn!("[Migration] Failed to create {}: {}", dst.display(), e);
        report.failed.push(FailedCopy {
            path: dst.to_path_buf(),
            message: e.to_string(),
        });
        return;
    }

    let entries = match std::fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("[Migration] Failed to read {}: {}", src.display(), e);
            report.failed.push(FailedCopy {
                path: src.to_path_buf(),
                message: e.to_string(),
            });
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path == skip {
            continue;
        }
        let dest = dst.join(entry.file_name());
        if path.is_dir() {
            copy_tree(&path, &dest, skip, report);
        } else {
            match std::fs::copy(&path, &dest) {
                Ok(_) => {
                    tracing::debug!("[Migration] {} → {}", path.display(), dest.display());
                    report.copied += 1;
                }
                Err(e) => {
                    tracing::warn!("[Migration] Failed to copy {}: {}", path.display(), e);
                    report.failed.push(FailedCopy {
                        path: dest,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
