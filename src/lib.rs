//! # Kerbal Updater
//!
//! 호스트(KSP)가 실행 중인 동안 플러그인 업데이트를 내려받아 스테이징 영역에 준비하고,
//! 호스트가 종료되면 별도 프로세스(`kerbal-updater-migration`)가 라이브 트리에 적용합니다.
//!
//! ## 구성
//! - [`item`]: 플러그인 탐색, 원격 메타데이터 리졸버
//! - [`fetcher`]: 아카이브 다운로드 (진행률, 취소)
//! - [`staging`]: 아카이브 해제 및 스테이징 영역 배치
//! - [`session`]: 아이템별 업데이트 상태 머신
//! - [`handoff`]: 핸드오프 레코드 기록 및 러너 실행
//! - [`updater`]: 세션 레지스트리 + 종료 조정자

pub mod config;
pub mod error;
pub mod fetcher;
pub mod handoff;
pub mod item;
pub mod layout;
pub mod session;
pub mod staging;
pub mod updater;

pub use config::{ConfigStore, FileConfigStore, UpdaterConfig};
pub use error::{ErrorContext, ErrorKind, UpdaterError};
pub use fetcher::ArchiveFetcher;
pub use handoff::HandoffWriter;
pub use item::{CatalogFileResolver, Item, MetadataResolver, RemoteMetadata};
pub use layout::InstallLayout;
pub use session::{ItemSession, SessionContext, TransitionError, UpdateState};
pub use staging::{ArchiveFormat, StagingArea, StagingEngine, StagingReport, StagingRequest};
pub use updater::{ItemStatus, ShutdownOutcome, Updater};
