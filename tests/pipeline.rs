//! ═══════════════════════════════════════════════════════════════════
//! 업데이트 파이프라인 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! 1. **다운로드**: 로컬 axum 서버에서 아카이브 제공 (성공, 404, 응답 없음)
//! 2. **스테이징**: 세션이 다운로드 완료 후 스테이징까지 진행
//! 3. **종료 처리**: 핸드오프 기록, 실패 스크래치 격리
//! 4. **마이그레이션**: 같은 프로세스에서 러너를 돌려 라이브 트리 확인
//!
//! 모든 테스트는 `tempdir`을 사용해 파일시스템을 격리합니다.

use axum::routing::get;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use kerbal_updater::{
    ArchiveFormat, CatalogFileResolver, ConfigStore, FileConfigStore, InstallLayout, RemoteMetadata,
    StagingEngine, StagingRequest, UpdateState, Updater, UpdaterConfig, UpdaterError,
};
use kerbal_updater_migration::{
    HostEnvironment, MigrationRunner, RunnerOptions, REMOVAL_QUEUE_FILE_NAME,
};

// ═══════════════════════════════════════════════════════
// 테스트 유틸리티
// ═══════════════════════════════════════════════════════

fn create_test_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip_writer = zip::ZipWriter::new(buf);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    for (name, content) in files {
        zip_writer.start_file(*name, options).unwrap();
        zip_writer.write_all(content.as_bytes()).unwrap();
    }

    zip_writer.finish().unwrap().into_inner()
}

/// `/download/:filename`은 에셋 제공, `/hang/:filename`은 응답하지 않음
async fn start_mock_server(assets: HashMap<String, Vec<u8>>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let assets = Arc::new(assets);

    let app = Router::new()
        .route(
            "/download/:filename",
            get(move |axum::extract::Path(filename): axum::extract::Path<String>| {
                let a = assets.clone();
                async move {
                    match a.get(&filename) {
                        Some(data) => (axum::http::StatusCode::OK, data.clone()),
                        None => (axum::http::StatusCode::NOT_FOUND, b"Not Found".to_vec()),
                    }
                }
            }),
        )
        .route(
            "/hang/:filename",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ""
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 호스트는 항상 종료된 상태, 실행 요청만 기록
#[derive(Default)]
struct FakeEnv {
    launched: RefCell<Vec<PathBuf>>,
}

impl HostEnvironment for &FakeEnv {
    fn is_host_running(&self, _process_name: &str) -> bool {
        false
    }

    fn launch(&self, executable: &Path) -> std::io::Result<()> {
        self.launched.borrow_mut().push(executable.to_path_buf());
        Ok(())
    }
}

fn released() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 5, 1, 12, 0, 0).unwrap()
}

struct Install {
    _tmp: TempDir,
    config: UpdaterConfig,
    layout: InstallLayout,
}

impl Install {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = UpdaterConfig::default();
        config.install_root = Some(tmp.path().to_string_lossy().to_string());
        let layout = InstallLayout::from_config(&config);
        fs::create_dir_all(&layout.data_dir).unwrap();
        Self { _tmp: tmp, config, layout }
    }

    fn write_live(&self, rel: &str, content: &str) {
        let path = self.layout.data_dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read_live(&self, rel: &str) -> String {
        fs::read_to_string(self.layout.data_dir.join(rel)).unwrap()
    }

    fn open(&self, catalog: &[(u32, String)]) -> Updater {
        let mut resolver = CatalogFileResolver::default();
        for (id, url) in catalog {
            resolver.insert(
                *id,
                RemoteMetadata { download_url: url.clone(), last_updated: released() },
            );
        }
        Updater::open(self.config.clone(), Arc::new(resolver)).unwrap()
    }

    fn run_migration(&self, env: &FakeEnv) -> kerbal_updater_migration::MigrationReport {
        let mut options = RunnerOptions::new(self.layout.handoff_path.clone());
        options.poll_interval = Duration::from_millis(1);
        MigrationRunner::new(options, env).run().unwrap()
    }
}

fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            let rel = path.strip_prefix(base).unwrap().to_string_lossy().to_string();
            if path.is_dir() {
                out.push((format!("{}/", rel), Vec::new()));
                walk(base, &path, out);
            } else {
                out.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}

// ═══════════════════════════════════════════════════════
// 시나리오
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn foo_is_downloaded_staged_and_migrated() {
    let install = Install::new();
    install.write_live("Foo/updater.toml", "catalog_id = 1\nname = \"Foo\"\n");
    install.write_live("Foo/Foo.dll", "old dll");

    let mut assets = HashMap::new();
    assets.insert(
        "Foo.zip".to_string(),
        create_test_zip(&[
            ("GameData/Foo/Foo.dll", "new dll"),
            ("GameData/Foo/README.txt", "readme"),
        ]),
    );
    let addr = start_mock_server(assets).await;
    let mut updater = install.open(&[(1, format!("http://{}/download/Foo.zip", addr))]);

    let session = updater.session("Foo").unwrap();
    assert_eq!(session.state(), UpdateState::Ready);
    session.begin_download().unwrap();
    assert_eq!(session.settle().await, UpdateState::Complete);
    assert_eq!(session.progress(), 100);
    assert!(session.restart_required());

    let staging = &install.layout.staging_dir;
    assert_eq!(fs::read(staging.join("Foo/Foo.dll")).unwrap(), b"new dll");
    assert_eq!(fs::read(staging.join("Foo/README.txt")).unwrap(), b"readme");
    assert!(!staging.join(REMOVAL_QUEUE_FILE_NAME).exists(), "names match, nothing to remove");
    assert!(!install.layout.scratch_dir(1).exists());
    assert_eq!(install.read_live("Foo/Foo.dll"), "old dll", "live tree untouched in phase 1");

    let env = FakeEnv::default();
    let outcome = updater.shutdown(&env).await.unwrap();
    assert_eq!(outcome.completed, vec!["Foo"]);
    assert!(outcome.handoff.is_some());
    assert_eq!(env.launched.borrow().as_slice(), &[install.layout.migration_exe.clone()]);

    let runner_env = FakeEnv::default();
    let report = install.run_migration(&runner_env);
    assert!(report.performed);
    assert!(report.is_clean());
    assert_eq!(install.read_live("Foo/Foo.dll"), "new dll");
    assert_eq!(install.read_live("Foo/README.txt"), "readme");
    assert!(install.layout.data_dir.join("Foo/updater.toml").exists());
    assert!(runner_env.launched.borrow().is_empty(), "no restart signal");

    // 적용 버전이 기록되어 다음 세션에서는 최신 상태
    let store = FileConfigStore::open(&install.layout.store_path).unwrap();
    assert_eq!(store.last_applied(1), Some(released()));
    let mut next = install.open(&[(1, format!("http://{}/download/Foo.zip", addr))]);
    assert!(!next.is_disabled());
    assert_eq!(next.session("Foo").unwrap().state(), UpdateState::Ignored);
}

#[tokio::test]
async fn bar_folder_rename_removes_old_folder_before_copy() {
    let install = Install::new();
    install.write_live("BarOld/Bar.dll", "old");

    let mut assets = HashMap::new();
    assets.insert(
        "Bar.zip".to_string(),
        create_test_zip(&[("GameData/BarNew/Bar.dll", "new")]),
    );
    let addr = start_mock_server(assets).await;
    let mut updater = install.open(&[(2, format!("http://{}/download/Bar.zip", addr))]);
    updater.link("BarOld", "2").unwrap();

    let session = updater.session("BarOld").unwrap();
    session.begin_download().unwrap();
    assert_eq!(session.settle().await, UpdateState::Complete);

    let queue = fs::read_to_string(&install.layout.removal_queue).unwrap();
    assert_eq!(queue.lines().collect::<Vec<_>>(), vec!["BarOld"]);

    updater.request_restart().unwrap();
    let env = FakeEnv::default();
    updater.shutdown(&env).await.unwrap();

    let runner_env = FakeEnv::default();
    let report = install.run_migration(&runner_env);
    assert_eq!(report.removed, vec!["BarOld"]);
    assert!(!install.layout.data_dir.join("BarOld").exists());
    assert_eq!(install.read_live("BarNew/Bar.dll"), "new");
    assert!(report.relaunched);
    assert_eq!(runner_env.launched.borrow().as_slice(), &[install.layout.host_exe.clone()]);
}

#[tokio::test]
async fn missing_archive_is_a_transport_error() {
    let install = Install::new();
    install.write_live("Foo/updater.toml", "catalog_id = 1\n");
    let addr = start_mock_server(HashMap::new()).await;
    let mut updater = install.open(&[(1, format!("http://{}/download/Missing.zip", addr))]);

    let session = updater.session("Foo").unwrap();
    session.begin_download().unwrap();
    assert_eq!(session.settle().await, UpdateState::Error);
    assert!(matches!(
        session.error(),
        Some(UpdaterError::HttpError { status_code: 404, .. })
    ));

    let env = FakeEnv::default();
    let outcome = updater.shutdown(&env).await.unwrap();
    assert_eq!(outcome.failed, vec!["Foo"]);
    assert!(outcome.handoff.is_none());
    assert!(env.launched.borrow().is_empty());
}

#[tokio::test]
async fn cancelled_download_returns_to_ready() {
    let install = Install::new();
    install.write_live("Foo/updater.toml", "catalog_id = 1\n");
    let addr = start_mock_server(HashMap::new()).await;
    let mut updater = install.open(&[(1, format!("http://{}/hang/Foo.zip", addr))]);

    let session = updater.session("Foo").unwrap();
    session.begin_download().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.poll(), UpdateState::Downloading);

    session.cancel().unwrap();
    assert_eq!(session.settle().await, UpdateState::Ready);
    assert!(session.error().is_none());
}

#[tokio::test]
async fn corrupt_archive_scratch_is_quarantined_on_shutdown() {
    let install = Install::new();
    install.write_live("Foo/updater.toml", "catalog_id = 3\n");
    let mut assets = HashMap::new();
    assets.insert("Foo.zip".to_string(), b"definitely not a zip".to_vec());
    let addr = start_mock_server(assets).await;
    let mut updater = install.open(&[(3, format!("http://{}/download/Foo.zip", addr))]);

    let session = updater.session("Foo").unwrap();
    session.begin_download().unwrap();
    assert_eq!(session.settle().await, UpdateState::Error);
    assert!(install.layout.scratch_dir(3).exists(), "left for diagnosis");

    let env = FakeEnv::default();
    let outcome = updater.shutdown(&env).await.unwrap();

    assert_eq!(outcome.quarantined, vec![install.layout.failed_scratch_dir(3)]);
    assert!(install.layout.failed_scratch_dir(3).is_dir());
    assert!(!install.layout.scratch_dir(3).exists());
    assert!(!install.open(&[]).is_disabled(), "staging area is clean for the next session");
}

#[test]
fn staging_twice_matches_staging_once() {
    let archive = create_test_zip(&[
        ("GameData/Foo/Foo.dll", "dll"),
        ("GameData/Foo/Parts/part.cfg", "cfg"),
        ("Companion.dll", "companion"),
    ]);

    let stage = |times: usize| {
        let install = Install::new();
        let store = Arc::new(FileConfigStore::open(&install.layout.store_path).unwrap());
        let engine = StagingEngine::new(install.layout.clone(), install.config.clone(), store);
        fs::create_dir_all(&install.layout.staging_dir).unwrap();
        for _ in 0..times {
            let request = StagingRequest {
                catalog_id: 9,
                folder_name: "Foo".to_string(),
                archive: install.layout.archive_path(9, "zip"),
                format: ArchiveFormat::Zip,
                version: released(),
            };
            fs::create_dir_all(&install.layout.downloads_dir).unwrap();
            fs::write(&request.archive, &archive).unwrap();
            engine.stage(&request).unwrap();
        }
        snapshot(&install.layout.staging_dir)
    };

    assert_eq!(stage(2), stage(1));
}
