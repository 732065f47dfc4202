//! 프로세스 유틸리티: 호스트 실행 여부 확인 및 분리(detached) 실행

use std::path::Path;
use std::process::{Command, Stdio};
use sysinfo::System;

/// 러너가 바깥 세계와 접촉하는 지점 (테스트에서 대체 가능)
pub trait HostEnvironment {
    /// 이름이 일치하는 프로세스가 하나라도 실행 중인지
    fn is_host_running(&self, process_name: &str) -> bool;
    /// 실행 파일을 분리된 프로세스로 시작
    fn launch(&self, executable: &Path) -> std::io::Result<()>;
}

/// 실제 OS 프로세스 테이블과 `std::process`를 사용하는 구현
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl HostEnvironment for SystemEnvironment {
    fn is_host_running(&self, process_name: &str) -> bool {
        is_process_running(process_name)
    }

    fn launch(&self, executable: &Path) -> std::io::Result<()> {
        spawn_detached(executable)
    }
}

/// 프로세스 이름 비교: 확장자(`.exe`, `.x86_64` 등)를 떼고 대소문자 무시
pub fn process_name_matches(actual: &str, wanted: &str) -> bool {
    let stem = |s: &str| {
        Path::new(s)
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or(s)
            .to_string()
    };
    stem(actual).eq_ignore_ascii_case(&stem(wanted))
}

/// 크로스 플랫폼: 프로세스 이름으로 실행 중인지 확인
pub fn is_process_running(process_name: &str) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    let own_pid = std::process::id();

    sys.processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .any(|(_, process)| process_name_matches(process.name(), process_name))
}

/// 부모와 분리된 프로세스로 실행 (stdio 없음, 작업 디렉터리 = 실행 파일 위치)
pub fn spawn_detached(executable: &Path) -> std::io::Result<()> {
    let mut cmd = Command::new(executable);

    if let Some(dir) = executable.parent().filter(|d| d.is_dir()) {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        // DETACHED_PROCESS | CREATE_BREAKAWAY_FROM_JOB | CREATE_NEW_PROCESS_GROUP
        cmd.creation_flags(0x00000008 | 0x01000000 | 0x00000200);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    tracing::info!("[Process] Spawned {}", executable.display());
    Ok(())
}
