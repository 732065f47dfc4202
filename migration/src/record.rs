//! 핸드오프 레코드: 호스트 프로세스에서 마이그레이션 러너로 경로 전달
//!
//! ## 포맷
//! UTF-8 평문, 정확히 5줄 (순서 고정, 이스케이프 없음):
//! 1. 스테이징 디렉터리
//! 2. 라이브 설치 루트 (예: `GameData/`)
//! 3. 재시작 시그널 파일
//! 4. 삭제 큐 파일
//! 5. 호스트 실행 파일
//!
//! 호스트 종료 시 한 번 기록되고, 러너가 한 번 읽은 뒤 삭제합니다.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// 스테이징 디렉터리 안의 핸드오프 레코드 파일명
pub const HANDOFF_FILE_NAME: &str = "CONSTANTS";
/// 재시작 시그널 마커 파일명 (존재 = 재시작 요청)
pub const RESTART_SIGNAL_FILE_NAME: &str = "RESTART";
/// 삭제 큐 파일명 (한 줄에 폴더 이름 하나)
pub const REMOVAL_QUEUE_FILE_NAME: &str = "REMOVE_QUEUE";
/// 업데이터 자신이 설치되는 플러그인 폴더 이름
pub const DEFAULT_UPDATER_FOLDER: &str = "KerbalUpdater";
/// 마이그레이션 러너 바이너리 이름 (확장자 제외)
pub const MIGRATION_BINARY_NAME: &str = "kerbal-updater-migration";

const RECORD_LINES: usize = 5;

/// 플랫폼별 마이그레이션 러너 실행 파일명
pub fn migration_executable_name() -> String {
    format!("{}{}", MIGRATION_BINARY_NAME, std::env::consts::EXE_SUFFIX)
}

/// 업데이터 플러그인 바이너리 디렉터리 기준 스테이징 디렉터리
///
/// 러너는 자기 실행 파일 위치만 알고 시작하므로 호스트 쪽 레이아웃과
/// 러너가 같은 함수를 사용해야 합니다.
pub fn staging_dir_for(plugins_dir: &Path, updater_folder: &str) -> PathBuf {
    plugins_dir
        .join("PluginData")
        .join(updater_folder)
        .join("Staging")
}

/// 업데이터 플러그인 바이너리 디렉터리 기준 핸드오프 레코드 경로
pub fn handoff_path_for(plugins_dir: &Path, updater_folder: &str) -> PathBuf {
    staging_dir_for(plugins_dir, updater_folder).join(HANDOFF_FILE_NAME)
}

/// 러너 실행 파일 위치(`<data>/<updater>/Plugins`)에서 업데이터 폴더 이름 추출
///
/// 설치 폴더 이름을 바꿔도 레코드를 찾을 수 있도록 상수 대신 실제 경로를 따릅니다.
pub fn updater_folder_for(plugins_dir: &Path) -> String {
    plugins_dir
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_UPDATER_FOLDER)
        .to_string()
}

/// 러너 실행 파일 디렉터리만으로 핸드오프 레코드 경로 결정
pub fn locate_handoff_record(plugins_dir: &Path) -> PathBuf {
    handoff_path_for(plugins_dir, &updater_folder_for(plugins_dir))
}

/// 2단계(적용)에 필요한 절대 경로 묶음
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    pub staging_dir: PathBuf,
    pub live_root: PathBuf,
    pub restart_signal: PathBuf,
    pub removal_queue: PathBuf,
    pub host_executable: PathBuf,
}

impl HandoffRecord {
    fn fields(&self) -> [&Path; RECORD_LINES] {
        [
            &self.staging_dir,
            &self.live_root,
            &self.restart_signal,
            &self.removal_queue,
            &self.host_executable,
        ]
    }

    /// 대기 대상 호스트 프로세스 이름 (5번째 줄의 파일 이름)
    pub fn host_process_name(&self) -> Option<String> {
        self.host_executable
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
    }

    /// 5줄 텍스트로 직렬화
    pub fn to_text(&self) -> Result<String> {
        let mut out = String::new();
        for path in self.fields() {
            let line = path
                .to_str()
                .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))?;
            if line.contains('\n') || line.contains('\r') {
                bail!("Path contains a line break: {:?}", line);
            }
            if line.is_empty() {
                bail!("Handoff record cannot contain an empty path");
            }
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    /// 5줄 텍스트 파싱. 줄 수가 다르거나 빈 줄이 있으면 에러
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() != RECORD_LINES {
            bail!(
                "Malformed handoff record: expected {} lines, found {}",
                RECORD_LINES,
                lines.len()
            );
        }
        if let Some(idx) = lines.iter().position(|l| l.trim().is_empty()) {
            bail!("Malformed handoff record: line {} is empty", idx + 1);
        }

        Ok(Self {
            staging_dir: PathBuf::from(lines[0]),
            live_root: PathBuf::from(lines[1]),
            restart_signal: PathBuf::from(lines[2]),
            removal_queue: PathBuf::from(lines[3]),
            host_executable: PathBuf::from(lines[4]),
        })
    }

    /// 레코드 파일 기록 (부모 디렉터리 생성 포함)
    pub fn write(&self, path: &Path) -> Result<()> {
        let text = self.to_text()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write handoff record {}", path.display()))?;
        Ok(())
    }

    /// 레코드 파일 로드. 파일이 없으면 `Ok(None)`
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read handoff record {}", path.display()))?;
        Self::parse(&text).map(Some)
    }

    /// 레코드를 읽고 삭제 (정확히 한 번 소비)
    ///
    /// 파싱에 실패하면 파일은 그대로 남고 에러를 반환합니다.
    pub fn take(path: &Path) -> Result<Option<Self>> {
        let record = match Self::read(path)? {
            Some(r) => r,
            None => return Ok(None),
        };
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete handoff record {}", path.display()))?;
        Ok(Some(record))
    }
}
