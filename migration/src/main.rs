//! 마이그레이션 러너 실행 파일
//!
//! 인자 없이 실행됩니다. 자기 실행 파일 위치(`<data>/<updater>/Plugins`)에서
//! 업데이터 폴더 이름을 얻어 핸드오프 레코드를 찾고, 레코드에 적힌 호스트가
//! 종료될 때까지 기다립니다.

use kerbal_updater_migration::{
    locate_handoff_record, MigrationReport, MigrationRunner, RunnerOptions, SystemEnvironment,
};

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    println!("KERBAL UPDATER");
    println!("--------------");

    let plugins_dir = match std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
    {
        Some(dir) => dir,
        None => {
            eprintln!("✗ Cannot determine the migration executable location");
            std::process::exit(1);
        }
    };

    let options = RunnerOptions::from_env(locate_handoff_record(&plugins_dir));
    let runner = MigrationRunner::new(options, SystemEnvironment);

    match runner.run() {
        Ok(report) => print_summary(&report),
        Err(e) => {
            eprintln!("✗ Migration aborted: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn print_summary(report: &MigrationReport) {
    if !report.performed {
        println!("Nothing to apply.");
        return;
    }

    for name in &report.removed {
        println!("  - removed {}", name);
    }
    for failed in &report.failed {
        println!("  ✗ failed to copy {}: {}", failed.path.display(), failed.message);
    }
    println!("✓ {} file(s) copied", report.copied);
    if report.removal_queue_unread {
        println!("⚠ Removal queue could not be read; it was kept for the next attempt.");
    }
    if report.cleanup_deferred {
        println!("⚠ Staging area could not be cleared; it will be retried next time.");
    }
    if report.relaunched {
        println!("Restarting game...");
    }
}
