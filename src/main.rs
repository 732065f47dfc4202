//! 헤드리스 업데이터 CLI
//!
//! 한 번의 실행이 호스트 세션 하나에 해당합니다. 명령을 수행한 뒤 항상 종료 처리를
//! 거치므로, `update`로 스테이징한 항목이 있으면 마지막에 마이그레이션 러너가 실행됩니다.
//!
//! ## 사용법
//! ```
//! kerbal-updater list [--json]              # 플러그인 목록과 상태
//! kerbal-updater status <folder>            # 한 플러그인의 상태
//! kerbal-updater update [<folder>] [--force] [--restart]
//!                                           # 업데이트 (폴더 생략 시 업데이트 가능한 전체)
//! kerbal-updater ignore <folder>            # 이번 버전 건너뛰기
//! kerbal-updater monitor <folder> on|off    # 모니터링 토글
//! kerbal-updater link <folder> <id|url>     # 카탈로그 ID 수동 연결
//! kerbal-updater finish                     # 대기 중인 마이그레이션을 이 프로세스에서 실행
//! ```
//!
//! 공통 옵션: `--root <path>` (설치 루트), `--catalog <path>` (카탈로그 JSON)

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kerbal_updater::{
    CatalogFileResolver, InstallLayout, ItemStatus, MetadataResolver, ShutdownOutcome, UpdateState,
    Updater, UpdaterConfig,
};
use kerbal_updater_migration::{MigrationRunner, RelaunchPolicy, RunnerOptions, SystemEnvironment};

#[derive(Debug, Default)]
struct CliOptions {
    root: Option<String>,
    catalog: Option<PathBuf>,
    json: bool,
    force: bool,
    restart: bool,
    positional: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args).await {
        eprintln!("✗ Error: {:#}", e);
        std::process::exit(1);
    }
}

fn parse_args(args: Vec<String>) -> Result<CliOptions> {
    let mut opts = CliOptions::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--root" => match iter.next() {
                Some(v) => opts.root = Some(v),
                None => bail!("--root requires a path"),
            },
            "--catalog" => match iter.next() {
                Some(v) => opts.catalog = Some(PathBuf::from(v)),
                None => bail!("--catalog requires a path"),
            },
            "--json" => opts.json = true,
            "--force" => opts.force = true,
            "--restart" => opts.restart = true,
            _ => opts.positional.push(arg),
        }
    }
    Ok(opts)
}

async fn run(args: Vec<String>) -> Result<()> {
    let opts = parse_args(args)?;
    let pos: Vec<&str> = opts.positional.iter().map(|s| s.as_str()).collect();

    if pos.is_empty() || matches!(pos[0], "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }
    if matches!(pos[0], "--version" | "-V") {
        println!("kerbal-updater {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = UpdaterConfig::load()?;
    if let Some(root) = &opts.root {
        config.install_root = Some(root.clone());
    }
    let layout = InstallLayout::from_config(&config);

    if pos[0] == "finish" {
        return finish(&config, &layout);
    }

    let resolver = load_resolver(&layout, opts.catalog.as_deref());
    let mut updater = Updater::open(config, resolver)?;
    if updater.is_disabled() {
        eprintln!("⚠ A previous update has not been applied yet. Quit the game or run `kerbal-updater finish`.");
    }

    match pos[0] {
        "list" => cmd_list(&mut updater, opts.json)?,
        "status" => {
            let folder = required(&pos, 1, "status <folder>")?;
            println!("{}: {}", folder, describe(&mut updater, folder));
        }
        "update" => cmd_update(&mut updater, pos.get(1).copied(), opts.force).await?,
        "ignore" => {
            let folder = required(&pos, 1, "ignore <folder>")?;
            updater.session(folder)?.ignore()?;
            println!("✓ {} will not be offered until a newer version appears", folder);
        }
        "monitor" => {
            let folder = required(&pos, 1, "monitor <folder> on|off")?;
            let enabled = match required(&pos, 2, "monitor <folder> on|off")? {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                other => bail!("expected on|off, got '{}'", other),
            };
            updater.set_monitored(folder, enabled)?;
            println!("✓ {} monitoring {}", folder, if enabled { "enabled" } else { "disabled" });
        }
        "link" => {
            let folder = required(&pos, 1, "link <folder> <id|url>")?;
            let input = required(&pos, 2, "link <folder> <id|url>")?;
            let id = updater.link(folder, input).map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("✓ {} linked to catalog id {}", folder, id);
        }
        other => bail!("Unknown command '{}'. Run `kerbal-updater help`.", other),
    }

    if opts.restart && updater.restart_required() {
        updater.request_restart()?;
    }

    let outcome = updater.shutdown(SystemEnvironment).await?;
    print_outcome(&outcome);
    Ok(())
}

fn required<'a>(pos: &[&'a str], idx: usize, usage: &str) -> Result<&'a str> {
    match pos.get(idx) {
        Some(v) => Ok(v),
        None => bail!("Usage: kerbal-updater {}", usage),
    }
}

fn load_resolver(layout: &InstallLayout, path: Option<&Path>) -> Arc<dyn MetadataResolver> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.plugin_data_dir.join("catalog.json"));
    match CatalogFileResolver::load(&path) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::warn!("[Catalog] {}; no remote metadata available", e);
            Arc::new(CatalogFileResolver::default())
        }
    }
}

fn describe(updater: &mut Updater, folder: &str) -> String {
    match updater.status(folder) {
        Ok(ItemStatus::Session { state: UpdateState::Error, .. }) => {
            let message = updater
                .session(folder)
                .ok()
                .and_then(|s| s.error().map(|e| e.user_message()))
                .unwrap_or_default();
            format!("Error: {}", message)
        }
        Ok(status) => status.label(),
        Err(e) => format!("Configuration error: {}", e.user_message()),
    }
}

fn cmd_list(updater: &mut Updater, json: bool) -> Result<()> {
    let items = updater.items().to_vec();

    if json {
        let rows: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                let status = updater.status(&item.folder_name).ok();
                serde_json::json!({ "item": item, "status": status })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<28} {:<28} {:>8}  STATUS", "FOLDER", "NAME", "ID");
    for item in &items {
        let id = item.catalog_id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        let status = describe(updater, &item.folder_name);
        println!("{:<28} {:<28} {:>8}  {}", item.folder_name, item.display_name, id, status);
    }
    Ok(())
}

async fn cmd_update(updater: &mut Updater, folder: Option<&str>, force: bool) -> Result<()> {
    let targets: Vec<String> = match folder {
        Some(f) => vec![f.to_string()],
        None => {
            let folders: Vec<String> = updater.items().iter().map(|i| i.folder_name.clone()).collect();
            folders
                .into_iter()
                .filter(|f| {
                    matches!(
                        updater.status(f),
                        Ok(ItemStatus::Session { state: UpdateState::Ready | UpdateState::Error, .. })
                    )
                })
                .collect()
        }
    };
    if targets.is_empty() {
        println!("✓ Everything is up to date");
        return Ok(());
    }

    for target in &targets {
        let session = updater.session(target)?;
        if force {
            session.reinstall()?;
        } else {
            session.begin_download()?;
        }
    }

    // 세션을 폴링해 진행률과 완료를 반영
    let mut shown: HashMap<String, u8> = HashMap::new();
    loop {
        updater.poll_all();
        let mut busy = false;
        for session in updater.sessions() {
            match session.state() {
                UpdateState::Downloading => {
                    busy = true;
                    let name = &session.item().folder_name;
                    let progress = session.progress();
                    if shown.get(name) != Some(&progress) {
                        eprintln!("  {} {}%", name, progress);
                        shown.insert(name.clone(), progress);
                    }
                }
                UpdateState::Staging => busy = true,
                _ => {}
            }
        }
        if !busy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for target in &targets {
        println!("{}: {}", target, describe(updater, target));
    }
    Ok(())
}

/// 핸드오프 레코드를 이 프로세스에서 직접 적용
fn finish(config: &UpdaterConfig, layout: &InstallLayout) -> Result<()> {
    let mut options = RunnerOptions::from_env(layout.handoff_path.clone());
    if config.always_relaunch {
        options.relaunch = RelaunchPolicy::Always;
    }

    let report = MigrationRunner::new(options, SystemEnvironment).run()?;
    if !report.performed {
        println!("✓ Nothing to apply");
        return Ok(());
    }
    println!(
        "✓ Applied {} file(s), removed {} folder(s), {} failure(s)",
        report.copied,
        report.removed.len(),
        report.failed.len()
    );
    for failed in &report.failed {
        println!("  ✗ {}: {}", failed.path.display(), failed.message);
    }
    Ok(())
}

fn print_outcome(outcome: &ShutdownOutcome) {
    if outcome.disabled {
        return;
    }
    for folder in &outcome.cancelled {
        println!("  - {} download cancelled", folder);
    }
    for folder in &outcome.failed {
        println!("  ✗ {} failed", folder);
    }
    for dir in &outcome.quarantined {
        println!("    scratch kept at {}", dir.display());
    }
    if outcome.handoff.is_some() {
        println!(
            "✓ {} update(s) staged; they will be applied once the game has exited",
            outcome.completed.len()
        );
    }
}

fn print_help() {
    println!("kerbal-updater {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  kerbal-updater <command> [options]");
    println!();
    println!("COMMANDS:");
    println!("  list [--json]                       List plugins and their update status");
    println!("  status <folder>                     Show the status of one plugin");
    println!("  update [<folder>] [--force] [--restart]");
    println!("                                      Download and stage updates");
    println!("  ignore <folder>                     Skip the currently offered version");
    println!("  monitor <folder> on|off             Enable or disable update checks");
    println!("  link <folder> <id|url>              Link a plugin to a catalog entry");
    println!("  finish                              Apply a pending update in this process");
    println!();
    println!("OPTIONS:");
    println!("  --root <path>                       Game install root");
    println!("  --catalog <path>                    Catalog index (JSON)");
}
