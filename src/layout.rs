//! 설치 경로 배치
//!
//! ```text
//! <install_root>/
//! ├── KSP(.exe)                                 호스트 실행 파일
//! └── GameData/                                 라이브 트리 (data_dir)
//!     └── KerbalUpdater/
//!         └── Plugins/                          plugins_dir
//!             ├── kerbal-updater-migration(.exe)
//!             └── PluginData/KerbalUpdater/     plugin_data_dir
//!                 ├── config.toml
//!                 ├── Downloads/
//!                 ├── Failed/
//!                 └── Staging/                  staging_dir
//!                     ├── CONSTANTS
//!                     ├── RESTART
//!                     └── REMOVE_QUEUE
//! ```

use std::path::{Path, PathBuf};

use kerbal_updater_migration::{
    handoff_path_for, migration_executable_name, staging_dir_for, REMOVAL_QUEUE_FILE_NAME,
    RESTART_SIGNAL_FILE_NAME,
};

use crate::config::UpdaterConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub install_root: PathBuf,
    pub data_folder: String,
    pub updater_folder: String,
    pub data_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub plugin_data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub handoff_path: PathBuf,
    pub restart_signal: PathBuf,
    pub removal_queue: PathBuf,
    pub migration_exe: PathBuf,
    pub host_exe: PathBuf,
    pub store_path: PathBuf,
}

impl InstallLayout {
    pub fn new(install_root: impl Into<PathBuf>, config: &UpdaterConfig) -> Self {
        let install_root = install_root.into();
        let data_dir = install_root.join(&config.data_folder);
        let plugins_dir = data_dir.join(&config.updater_folder).join("Plugins");
        let plugin_data_dir = plugins_dir.join("PluginData").join(&config.updater_folder);
        let staging_dir = staging_dir_for(&plugins_dir, &config.updater_folder);

        Self {
            data_folder: config.data_folder.clone(),
            updater_folder: config.updater_folder.clone(),
            downloads_dir: plugin_data_dir.join("Downloads"),
            failed_dir: plugin_data_dir.join("Failed"),
            store_path: plugin_data_dir.join("config.toml"),
            handoff_path: handoff_path_for(&plugins_dir, &config.updater_folder),
            restart_signal: staging_dir.join(RESTART_SIGNAL_FILE_NAME),
            removal_queue: staging_dir.join(REMOVAL_QUEUE_FILE_NAME),
            migration_exe: plugins_dir.join(migration_executable_name()),
            host_exe: install_root.join(format!(
                "{}{}",
                config.host_executable,
                std::env::consts::EXE_SUFFIX
            )),
            install_root,
            data_dir,
            plugins_dir,
            plugin_data_dir,
            staging_dir,
        }
    }

    /// 설정의 install_root 기준
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(config.install_root(), config)
    }

    /// 아이템별 스크래치 디렉터리 (카탈로그 ID 이름)
    pub fn scratch_dir(&self, catalog_id: u32) -> PathBuf {
        self.staging_dir.join(catalog_id.to_string())
    }

    pub fn failed_scratch_dir(&self, catalog_id: u32) -> PathBuf {
        self.failed_dir.join(catalog_id.to_string())
    }

    pub fn archive_path(&self, catalog_id: u32, extension: &str) -> PathBuf {
        self.downloads_dir.join(format!("{}.{}", catalog_id, extension))
    }

    /// 업데이터 자신의 폴더인지
    pub fn is_updater_folder(&self, folder: &str) -> bool {
        folder == self.updater_folder
    }

    /// 폴더 이름이 데이터 폴더 규칙과 일치하는지 (ASCII 대소문자 무시)
    pub fn is_data_folder_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.data_folder)
    }

    /// 업데이터 패키지 안에서 마이그레이션 실행 파일의 상대 위치
    pub fn packaged_migration_exe(&self, package_root: &Path) -> PathBuf {
        package_root
            .join(&self.updater_folder)
            .join("Plugins")
            .join(migration_executable_name())
    }
}
