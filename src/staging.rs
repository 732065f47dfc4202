//! 스테이징 엔진
//!
//! 다운로드한 아카이브를 풀어 라이브 트리와 같은 모양으로 스테이징 영역에 옮겨 둡니다.
//! 라이브 트리는 절대 건드리지 않으며 (예외: 마이그레이션 실행 파일 자체 업데이트),
//! 실제 적용은 호스트 종료 후 마이그레이션 러너가 수행합니다.
//!
//! ## 이름 공간
//! - `Staging/<catalog id>/`: 아이템별 임시 해제 디렉터리 (성공 시 삭제)
//! - `Staging/<folder>/`, `Staging/<file>.dll`: 라이브 트리에 그대로 복사될 결과물
//!
//! 이동은 목적지 이름 기준으로 덮어쓰므로 같은 아이템을 다시 스테이징해도 결과가 같습니다.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConfigStore, UpdaterConfig};
use crate::error::UpdaterError;
use crate::layout::InstallLayout;

/// 지원하는 아카이브 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// 다운로드 URL 경로의 확장자로 결정 (기본값 zip)
    pub fn from_url(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Zip
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

// ═══════════════════════════════════════════════════════
// Staging area
// ═══════════════════════════════════════════════════════

/// 모든 아이템이 공유하는 스테이징 디렉터리와 제어 파일
#[derive(Debug, Clone)]
pub struct StagingArea {
    pub dir: PathBuf,
    pub removal_queue: PathBuf,
    pub restart_signal: PathBuf,
}

impl StagingArea {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            dir: layout.staging_dir.clone(),
            removal_queue: layout.removal_queue.clone(),
            restart_signal: layout.restart_signal.clone(),
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// 이전 사이클의 잔여물이 있는지 (마이그레이션 미완료)
    pub fn is_dirty(&self) -> bool {
        match fs::read_dir(&self.dir) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }

    pub fn queued_removals(&self) -> Vec<String> {
        fs::read_to_string(&self.removal_queue)
            .map(|c| {
                c.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 삭제 큐에 폴더 이름 추가. 이미 있으면 false
    pub fn queue_removal(&self, folder: &str) -> std::io::Result<bool> {
        if self.queued_removals().iter().any(|n| n == folder) {
            return Ok(false);
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.removal_queue)?;
        writeln!(file, "{}", folder)?;
        Ok(true)
    }

    /// 재시작 시그널 생성 (0바이트 마커)
    pub fn request_restart(&self) -> std::io::Result<()> {
        self.ensure()?;
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.restart_signal)?;
        Ok(())
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_signal.exists()
    }
}

// ═══════════════════════════════════════════════════════
// Staging engine
// ═══════════════════════════════════════════════════════

/// 스테이징 한 건의 입력
#[derive(Debug, Clone)]
pub struct StagingRequest {
    pub catalog_id: u32,
    /// 아이템의 라이브 폴더 이름
    pub folder_name: String,
    pub archive: PathBuf,
    pub format: ArchiveFormat,
    /// 성공 시 기록할 원격 버전
    pub version: DateTime<Utc>,
}

/// 스테이징 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingReport {
    pub directories: Vec<String>,
    pub files: Vec<String>,
    /// 라이브 폴더가 삭제 큐에 들어갔는지
    pub queued_removal: bool,
    pub migration_exe_replaced: bool,
}

pub struct StagingEngine {
    layout: InstallLayout,
    config: UpdaterConfig,
    area: StagingArea,
    store: Arc<dyn ConfigStore>,
}

impl StagingEngine {
    pub fn new(layout: InstallLayout, config: UpdaterConfig, store: Arc<dyn ConfigStore>) -> Self {
        let area = StagingArea::new(&layout);
        Self { layout, config, area, store }
    }

    pub fn area(&self) -> &StagingArea {
        &self.area
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// 블로킹: async 컨텍스트에서는 `spawn_blocking`으로 호출
    pub fn stage(&self, request: &StagingRequest) -> Result<StagingReport, UpdaterError> {
        let scratch = self.layout.scratch_dir(request.catalog_id);
        tracing::info!(
            "[Staging] {} ({}) → {}",
            request.folder_name,
            request.catalog_id,
            scratch.display()
        );

        // 1. 아이템별 스크래치 디렉터리로 해제
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .map_err(|e| UpdaterError::from_io(&e, "clear scratch", &scratch))?;
        }
        fs::create_dir_all(&scratch).map_err(|e| UpdaterError::from_io(&e, "create scratch", &scratch))?;
        match request.format {
            ArchiveFormat::Zip => extract_zip(&request.archive, &scratch)?,
            ArchiveFormat::TarGz => extract_tar_gz(&request.archive, &scratch)?,
        }

        // 2. 게임 루트 기준 패키지면 데이터 폴더로 내려감
        let root = self.detect_root(&scratch)?;
        let mut report = StagingReport::default();

        // 3. 업데이터 자신: 마이그레이션 실행 파일은 라이브 위치로 바로 교체
        if self.layout.is_updater_folder(&request.folder_name) {
            report.migration_exe_replaced = self.replace_migration_exe(&root)?;
        }

        // 4. 최상위 디렉터리 이동
        let (dirs, files) = list_children(&root)?;
        for dir in &dirs {
            let name = file_name(dir);
            move_replacing(dir, &self.area.dir.join(&name))?;
            report.directories.push(name);
        }
        if !report.directories.iter().any(|d| d == &request.folder_name) {
            report.queued_removal = self
                .area
                .queue_removal(&request.folder_name)
                .map_err(|e| UpdaterError::from_io(&e, "append removal queue", &self.area.removal_queue))?;
            tracing::info!(
                "[Staging] {} no longer ships folder '{}', queued for removal",
                request.catalog_id,
                request.folder_name
            );
        }

        // 5. 느슨한 플러그인 바이너리
        for file in files.iter().filter(|f| self.config.is_plugin_extension(f)) {
            let name = file_name(file);
            move_replacing(file, &self.area.dir.join(&name))?;
            report.files.push(name);
        }

        // 6. 아카이브와 스크래치 정리
        fs::remove_file(&request.archive)
            .map_err(|e| UpdaterError::from_io(&e, "delete archive", &request.archive))?;
        fs::remove_dir_all(&scratch).map_err(|e| UpdaterError::from_io(&e, "delete scratch", &scratch))?;

        // 7. 적용 버전 기록
        self.store.set_last_applied(request.catalog_id, Some(request.version));
        if let Err(e) = self.store.save() {
            tracing::warn!("[Staging] Failed to persist applied version for {}: {:#}", request.catalog_id, e);
        }

        tracing::info!(
            "[Staging] {} staged: {} dir(s), {} file(s)",
            request.folder_name,
            report.directories.len(),
            report.files.len()
        );
        Ok(report)
    }

    fn detect_root(&self, scratch: &Path) -> Result<PathBuf, UpdaterError> {
        let (dirs, _) = list_children(scratch)?;
        Ok(dirs
            .into_iter()
            .find(|d| self.layout.is_data_folder_name(&file_name(d)))
            .map(|d| {
                tracing::debug!("[Staging] Archive is packaged from the game root");
                d
            })
            .unwrap_or_else(|| scratch.to_path_buf()))
    }

    fn replace_migration_exe(&self, root: &Path) -> Result<bool, UpdaterError> {
        let packaged = self.layout.packaged_migration_exe(root);
        if !packaged.is_file() {
            return Ok(false);
        }
        let live = &self.layout.migration_exe;
        tracing::info!("[Staging] Replacing migration runner {}", live.display());
        if live.exists() {
            fs::remove_file(live).map_err(|e| UpdaterError::from_io(&e, "delete migration runner", live))?;
        }
        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent).map_err(|e| UpdaterError::from_io(&e, "create plugins dir", parent))?;
        }
        fs::rename(&packaged, live).map_err(|e| UpdaterError::from_io(&e, "move migration runner", live))?;
        Ok(true)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 최상위 (디렉터리, 파일) 목록: 이름 순
fn list_children(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), UpdaterError> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| UpdaterError::from_io(&e, "read dir", dir))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

/// 목적지에 같은 이름이 있으면 지우고 이동
fn move_replacing(src: &Path, dst: &Path) -> Result<(), UpdaterError> {
    if dst.is_dir() {
        fs::remove_dir_all(dst).map_err(|e| UpdaterError::from_io(&e, "replace", dst))?;
    } else if dst.exists() {
        fs::remove_file(dst).map_err(|e| UpdaterError::from_io(&e, "replace", dst))?;
    }
    fs::rename(src, dst).map_err(|e| UpdaterError::from_io(&e, "move", dst))?;
    tracing::debug!("[Staging] {} → {}", src.display(), dst.display());
    Ok(())
}

fn extract_zip(archive: &Path, target_dir: &Path) -> Result<(), UpdaterError> {
    let file = fs::File::open(archive).map_err(|e| UpdaterError::from_io(&e, "open archive", archive))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| UpdaterError::archive(archive, e))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| UpdaterError::archive(archive, e))?;
        let rel = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                tracing::warn!("[Staging] Skipping unsafe zip entry {:?}", entry.name());
                continue;
            }
        };
        let out_path = target_dir.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| UpdaterError::from_io(&e, "extract", &out_path))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| UpdaterError::from_io(&e, "extract", parent))?;
            }
            let mut outfile =
                fs::File::create(&out_path).map_err(|e| UpdaterError::from_io(&e, "extract", &out_path))?;
            std::io::copy(&mut entry, &mut outfile).map_err(|e| UpdaterError::archive(archive, e))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, target_dir: &Path) -> Result<(), UpdaterError> {
    let file = fs::File::open(archive).map_err(|e| UpdaterError::from_io(&e, "open archive", archive))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let entries = tar.entries().map_err(|e| UpdaterError::archive(archive, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| UpdaterError::archive(archive, e))?;
        // unpack_in은 루트 밖으로 나가는 경로를 거부하고 false 반환
        let unpacked = entry.unpack_in(target_dir).map_err(|e| UpdaterError::archive(archive, e))?;
        if !unpacked {
            let name = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            tracing::warn!("[Staging] Skipping unsafe tar entry {:?}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfigStore;
    use chrono::TimeZone;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    struct Setup {
        _tmp: tempfile::TempDir,
        layout: InstallLayout,
        store: Arc<FileConfigStore>,
        engine: StagingEngine,
    }

    fn setup() -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let config = UpdaterConfig::default();
        let layout = InstallLayout::new(tmp.path(), &config);
        fs::create_dir_all(&layout.staging_dir).unwrap();
        let store = Arc::new(FileConfigStore::open(&layout.store_path).unwrap());
        let engine = StagingEngine::new(layout.clone(), config, store.clone());
        Setup { _tmp: tmp, layout, store, engine }
    }

    fn request(layout: &InstallLayout, id: u32, folder: &str) -> StagingRequest {
        StagingRequest {
            catalog_id: id,
            folder_name: folder.to_string(),
            archive: layout.archive_path(id, "zip"),
            format: ArchiveFormat::Zip,
            version: Utc.with_ymd_and_hms(2016, 5, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn format_from_url() {
        assert_eq!(ArchiveFormat::from_url("http://x/Foo.zip"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_url("http://x/Foo.TAR.GZ?dl=1"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_url("http://x/Foo.tgz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_url("http://x/download?id=3"), ArchiveFormat::Zip);
    }

    #[test]
    fn descends_into_data_folder() {
        let s = setup();
        let req = request(&s.layout, 1, "Foo");
        write_zip(&req.archive, &[("GameData/Foo/Foo.dll", "dll"), ("GameData/Foo/README.txt", "hi")]);

        let report = s.engine.stage(&req).unwrap();

        assert_eq!(report.directories, vec!["Foo"]);
        assert!(!report.queued_removal);
        assert!(s.layout.staging_dir.join("Foo/Foo.dll").is_file());
        assert!(s.layout.staging_dir.join("Foo/README.txt").is_file());
        assert!(!s.layout.staging_dir.join("GameData").exists());
        assert!(!s.layout.scratch_dir(1).exists());
        assert!(!req.archive.exists());
        assert_eq!(s.store.last_applied(1), Some(req.version));
    }

    #[test]
    fn lowercase_data_folder_is_detected() {
        let s = setup();
        let req = request(&s.layout, 2, "Foo");
        write_zip(&req.archive, &[("gamedata/Foo/Foo.dll", "dll")]);
        let report = s.engine.stage(&req).unwrap();
        assert_eq!(report.directories, vec!["Foo"]);
    }

    #[test]
    fn flat_archive_is_taken_as_is_with_loose_binaries() {
        let s = setup();
        let req = request(&s.layout, 3, "Foo");
        write_zip(
            &req.archive,
            &[("Foo/Foo.dll", "dll"), ("ModuleManager.dll", "mm"), ("README.md", "readme")],
        );

        let report = s.engine.stage(&req).unwrap();

        assert_eq!(report.directories, vec!["Foo"]);
        assert_eq!(report.files, vec!["ModuleManager.dll"]);
        assert!(s.layout.staging_dir.join("ModuleManager.dll").is_file());
        assert!(!s.layout.staging_dir.join("README.md").exists());
    }

    #[test]
    fn renamed_folder_is_queued_once() {
        let s = setup();
        let req = request(&s.layout, 4, "BarOld");
        write_zip(&req.archive, &[("GameData/BarNew/Bar.dll", "v1")]);
        assert!(s.engine.stage(&req).unwrap().queued_removal);

        write_zip(&req.archive, &[("GameData/BarNew/Bar.dll", "v2")]);
        let second = s.engine.stage(&req).unwrap();
        assert!(!second.queued_removal, "already queued");

        assert_eq!(s.engine.area().queued_removals(), vec!["BarOld"]);
        assert_eq!(fs::read(s.layout.staging_dir.join("BarNew/Bar.dll")).unwrap(), b"v2");
    }

    #[test]
    fn updater_self_update_replaces_migration_runner() {
        let s = setup();
        let exe = kerbal_updater_migration::migration_executable_name();
        fs::write(&s.layout.migration_exe, b"old runner").unwrap();

        let req = request(&s.layout, 5, "KerbalUpdater");
        let packaged = format!("GameData/KerbalUpdater/Plugins/{}", exe);
        write_zip(
            &req.archive,
            &[(packaged.as_str(), "new runner"), ("GameData/KerbalUpdater/Plugins/KerbalUpdater.dll", "dll")],
        );

        let report = s.engine.stage(&req).unwrap();

        assert!(report.migration_exe_replaced);
        assert_eq!(fs::read(&s.layout.migration_exe).unwrap(), b"new runner");
        let staged_plugins = s.layout.staging_dir.join("KerbalUpdater/Plugins");
        assert!(staged_plugins.join("KerbalUpdater.dll").is_file());
        assert!(!staged_plugins.join(&exe).exists());
    }

    #[test]
    fn corrupt_archive_leaves_scratch_for_diagnosis() {
        let s = setup();
        let req = request(&s.layout, 6, "Foo");
        fs::create_dir_all(&s.layout.downloads_dir).unwrap();
        fs::write(&req.archive, b"this is not a zip").unwrap();

        let err = s.engine.stage(&req).unwrap_err();

        assert!(matches!(err, UpdaterError::ArchiveError { .. }));
        assert!(s.layout.scratch_dir(6).exists());
        assert_eq!(s.store.last_applied(6), None);
    }

    #[test]
    fn tar_gz_archives_are_supported() {
        let s = setup();
        let mut req = request(&s.layout, 7, "Foo");
        req.format = ArchiveFormat::TarGz;
        req.archive = s.layout.archive_path(7, "tar.gz");
        fs::create_dir_all(&s.layout.downloads_dir).unwrap();

        let file = fs::File::create(&req.archive).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        let data = b"dll";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "GameData/Foo/Foo.dll", &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        s.engine.stage(&req).unwrap();
        assert_eq!(fs::read(s.layout.staging_dir.join("Foo/Foo.dll")).unwrap(), b"dll");
    }

    #[test]
    fn restart_signal_and_dirty_detection() {
        let s = setup();
        let area = s.engine.area();
        assert!(!area.is_dirty());
        assert!(!area.restart_requested());
        area.request_restart().unwrap();
        assert!(area.restart_requested());
        assert!(area.is_dirty());
        assert_eq!(fs::metadata(&area.restart_signal).unwrap().len(), 0);
    }
}
