//! 설정 관리
//!
//! - [`UpdaterConfig`]: 실행 환경 설정 (`config/updater.toml`)
//! - [`ConfigStore`]: 아이템별 영속 상태 (모니터링 토글, 카탈로그 ID 오버라이드, 마지막 적용 버전)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// 설정 파일 경로를 지정하는 환경 변수
pub const CONFIG_ENV_VAR: &str = "KERBAL_UPDATER_CONFIG";

/// 업데이터 실행 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// 호스트 설치 루트 (None이면 현재 디렉터리)
    pub install_root: Option<String>,
    /// 라이브 트리의 최상위 데이터 폴더 이름
    pub data_folder: String,
    /// 업데이터 자신의 플러그인 폴더 이름
    pub updater_folder: String,
    /// 호스트 실행 파일 이름 (확장자 제외)
    pub host_executable: String,
    /// 스테이징 루트로 옮길 느슨한 파일의 확장자
    pub plugin_extensions: Vec<String>,
    /// 재시작 요청이 없어도 마이그레이션 후 항상 호스트 재실행
    pub always_relaunch: bool,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            install_root: None,
            data_folder: "GameData".to_string(),
            updater_folder: kerbal_updater_migration::DEFAULT_UPDATER_FOLDER.to_string(),
            host_executable: "KSP".to_string(),
            plugin_extensions: vec!["dll".to_string()],
            always_relaunch: false,
            user_agent: format!("kerbal-updater/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 300,
        }
    }
}

impl UpdaterConfig {
    /// 설치 루트 경로
    pub fn install_root(&self) -> PathBuf {
        match &self.install_root {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// 확장자가 플러그인 바이너리 목록에 있는지 (대소문자 무시)
    pub fn is_plugin_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.plugin_extensions.iter().any(|p| p.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// 기본 경로에서 로드 (파일이 없으면 기본값)
    pub fn load() -> Result<Self> {
        match config_file_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("[Config] No updater.toml found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: toml::Value = content
            .parse()
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        tracing::info!("[Config] Loaded {}", path.display());
        Ok(parse_config(&parsed))
    }
}

/// 설정 파일 경로 결정
pub fn config_file_path() -> Option<PathBuf> {
    // 1. 환경 변수
    if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }

    // 2. 실행 파일 옆 config/updater.toml
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let cfg = dir.join("config").join("updater.toml");
            if cfg.exists() {
                return Some(cfg);
            }
        }
    }

    // 3. CWD의 config/updater.toml
    let cwd_cfg = PathBuf::from("config").join("updater.toml");
    if cwd_cfg.exists() {
        return Some(cwd_cfg);
    }

    None
}

/// 알 수 없는 키는 무시하고, 없는 키는 기본값 유지
pub fn parse_config(val: &toml::Value) -> UpdaterConfig {
    let mut cfg = UpdaterConfig::default();
    if let Some(v) = val.get("install_root").and_then(|v| v.as_str()) {
        cfg.install_root = Some(v.to_string());
    }
    if let Some(v) = val.get("data_folder").and_then(|v| v.as_str()) {
        cfg.data_folder = v.to_string();
    }
    if let Some(v) = val.get("updater_folder").and_then(|v| v.as_str()) {
        cfg.updater_folder = v.to_string();
    }
    if let Some(v) = val.get("host_executable").and_then(|v| v.as_str()) {
        cfg.host_executable = v.to_string();
    }
    if let Some(v) = val.get("plugin_extensions").and_then(|v| v.as_array()) {
        cfg.plugin_extensions = v
            .iter()
            .filter_map(|e| e.as_str())
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
    }
    if let Some(v) = val.get("always_relaunch").and_then(|v| v.as_bool()) {
        cfg.always_relaunch = v;
    }
    if let Some(v) = val.get("user_agent").and_then(|v| v.as_str()) {
        cfg.user_agent = v.to_string();
    }
    if let Some(v) = val.get("timeout_secs").and_then(|v| v.as_integer()) {
        if v > 0 {
            cfg.timeout_secs = v as u64;
        }
    }
    cfg
}

// ═══════════════════════════════════════════════════════
// Config store
// ═══════════════════════════════════════════════════════

/// 아이템별 영속 상태 저장소
///
/// 파이프라인은 이 저장소를 동기적이고 항상 사용 가능한 것으로 취급합니다.
/// 변경은 메모리에 반영되고 `save()` 호출 시 디스크에 기록됩니다.
pub trait ConfigStore: Send + Sync {
    /// 모니터링 토글 (기본값: 켜짐)
    fn toggle(&self, folder: &str) -> bool;
    fn set_toggle(&self, folder: &str, enabled: bool);

    fn last_applied(&self, catalog_id: u32) -> Option<DateTime<Utc>>;
    fn set_last_applied(&self, catalog_id: u32, version: Option<DateTime<Utc>>);

    fn catalog_override(&self, folder: &str) -> Option<u32>;
    fn set_catalog_override(&self, folder: &str, catalog_id: Option<u32>);

    fn save(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    toggles: BTreeMap<String, bool>,
    #[serde(default)]
    overrides: BTreeMap<String, u32>,
    #[serde(default)]
    last_applied: BTreeMap<String, DateTime<Utc>>,
}

/// TOML 파일 기반 저장소
pub struct FileConfigStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileConfigStore {
    /// 파일이 없으면 빈 저장소로 시작
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Invalid config store {}", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data: RwLock::new(data) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConfigStore for FileConfigStore {
    fn toggle(&self, folder: &str) -> bool {
        self.read().toggles.get(folder).copied().unwrap_or(true)
    }

    fn set_toggle(&self, folder: &str, enabled: bool) {
        self.write().toggles.insert(folder.to_string(), enabled);
    }

    fn last_applied(&self, catalog_id: u32) -> Option<DateTime<Utc>> {
        self.read().last_applied.get(&catalog_id.to_string()).copied()
    }

    fn set_last_applied(&self, catalog_id: u32, version: Option<DateTime<Utc>>) {
        let mut data = self.write();
        match version {
            Some(v) => {
                data.last_applied.insert(catalog_id.to_string(), v);
            }
            None => {
                data.last_applied.remove(&catalog_id.to_string());
            }
        }
    }

    fn catalog_override(&self, folder: &str) -> Option<u32> {
        self.read().overrides.get(folder).copied()
    }

    fn set_catalog_override(&self, folder: &str, catalog_id: Option<u32>) {
        let mut data = self.write();
        match catalog_id {
            Some(id) => {
                data.overrides.insert(folder.to_string(), id);
            }
            None => {
                data.overrides.remove(folder);
            }
        }
    }

    /// 쓰기 잠금을 쥔 채 임시 파일에 쓰고 교체
    fn save(&self) -> Result<()> {
        let data = self.write();
        let content = toml::to_string_pretty(&*data)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        drop(data);
        tracing::debug!("[Config] Saved {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_config_overrides_known_keys_only() {
        let val: toml::Value = r#"
            data_folder = "GameData"
            host_executable = "KSP_x64"
            plugin_extensions = [".dll", "so"]
            always_relaunch = true
            timeout_secs = 30
            unknown_key = "ignored"
        "#
        .parse()
        .unwrap();

        let cfg = parse_config(&val);
        assert_eq!(cfg.host_executable, "KSP_x64");
        assert_eq!(cfg.plugin_extensions, vec!["dll", "so"]);
        assert!(cfg.always_relaunch);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.updater_folder, "KerbalUpdater");
    }

    #[test]
    fn plugin_extension_match_ignores_case() {
        let cfg = UpdaterConfig::default();
        assert!(cfg.is_plugin_extension(Path::new("Foo.DLL")));
        assert!(!cfg.is_plugin_extension(Path::new("README.txt")));
        assert!(!cfg.is_plugin_extension(Path::new("noext")));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("updater.toml");
        std::fs::write(&path, "install_root = \"/games/ksp\"\n").unwrap();
        let cfg = UpdaterConfig::load_from(&path).unwrap();
        assert_eq!(cfg.install_root(), PathBuf::from("/games/ksp"));
    }

    #[test]
    fn store_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let when = Utc.with_ymd_and_hms(2016, 5, 1, 12, 0, 0).unwrap();

        let store = FileConfigStore::open(&path).unwrap();
        assert!(store.toggle("Foo"), "monitored by default");
        store.set_toggle("Foo", false);
        store.set_catalog_override("Bar", Some(1234));
        store.set_last_applied(1234, Some(when));
        store.save().unwrap();

        let reopened = FileConfigStore::open(&path).unwrap();
        assert!(!reopened.toggle("Foo"));
        assert_eq!(reopened.catalog_override("Bar"), Some(1234));
        assert_eq!(reopened.last_applied(1234), Some(when));

        reopened.set_last_applied(1234, None);
        reopened.set_catalog_override("Bar", None);
        assert_eq!(reopened.last_applied(1234), None);
        assert_eq!(reopened.catalog_override("Bar"), None);
    }

    #[test]
    fn concurrent_saves_leave_a_readable_store() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let store = std::sync::Arc::new(FileConfigStore::open(&path).unwrap());
        let when = Utc.with_ymd_and_hms(2016, 5, 1, 12, 0, 0).unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        store.set_last_applied(id, Some(when));
                        store.save().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = FileConfigStore::open(&path).unwrap();
        for id in 0..8u32 {
            assert_eq!(reopened.last_applied(id), Some(when));
        }
        assert!(!path.with_extension("toml.tmp").exists());
    }
}
