//! 핸드오프 기록 및 마이그레이션 러너 실행
//!
//! 호스트 종료 시 한 번만 동기적으로 실행됩니다. 레코드를 쓴 뒤 러너를 분리된
//! 프로세스로 띄우고 기다리지 않고 반환합니다: 호스트가 먼저 종료되어야
//! 러너의 종료 대기 단계가 끝날 수 있습니다.

use anyhow::{Context, Result};

use kerbal_updater_migration::{HandoffRecord, HostEnvironment};

use crate::layout::InstallLayout;

pub struct HandoffWriter<E: HostEnvironment> {
    layout: InstallLayout,
    env: E,
}

impl<E: HostEnvironment> HandoffWriter<E> {
    pub fn new(layout: InstallLayout, env: E) -> Self {
        Self { layout, env }
    }

    pub fn record(&self) -> HandoffRecord {
        HandoffRecord {
            staging_dir: self.layout.staging_dir.clone(),
            live_root: self.layout.data_dir.clone(),
            restart_signal: self.layout.restart_signal.clone(),
            removal_queue: self.layout.removal_queue.clone(),
            host_executable: self.layout.host_exe.clone(),
        }
    }

    /// 레코드 기록 후 러너 실행
    pub fn write_and_launch(&self) -> Result<HandoffRecord> {
        let record = self.record();
        record
            .write(&self.layout.handoff_path)
            .with_context(|| format!("Failed to write handoff record {}", self.layout.handoff_path.display()))?;
        tracing::info!("[Handoff] Wrote {}", self.layout.handoff_path.display());

        let runner = &self.layout.migration_exe;
        self.env
            .launch(runner)
            .with_context(|| format!("Failed to launch migration runner {}", runner.display()))?;
        tracing::info!("[Handoff] Launched {}", runner.display());
        Ok(record)
    }
}
