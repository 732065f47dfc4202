//! # Kerbal Updater 마이그레이션 러너
//!
//! 호스트(KSP)가 실행 중일 때는 자기 파일을 잠그고 있기 때문에,
//! 업데이트 적용은 호스트가 종료된 뒤 별도 프로세스에서 수행합니다.
//!
//! ## 2단계 커밋
//! - **1단계 (호스트 내부)**: 다운로드 + 스테이징, 라이브 트리는 건드리지 않음
//! - **2단계 (이 크레이트)**: 호스트 종료 대기 → 삭제 큐 처리 → 스테이징 복사 → 정리 → 재실행
//!
//! 두 단계 사이의 유일한 연결 고리는 핸드오프 레코드(`record.rs`)입니다.
//! 레코드가 없으면 러너는 아무것도 변경하지 않습니다.

pub mod process;
pub mod record;
pub mod runner;

pub use process::{
    HostEnvironment, SystemEnvironment, spawn_detached, is_process_running, process_name_matches,
};
pub use record::{
    HandoffRecord, handoff_path_for, locate_handoff_record, staging_dir_for, updater_folder_for,
    migration_executable_name,
    DEFAULT_UPDATER_FOLDER, HANDOFF_FILE_NAME, MIGRATION_BINARY_NAME,
    REMOVAL_QUEUE_FILE_NAME, RESTART_SIGNAL_FILE_NAME,
};
pub use runner::{FailedCopy, MigrationReport, MigrationRunner, RelaunchPolicy, RunnerOptions};
