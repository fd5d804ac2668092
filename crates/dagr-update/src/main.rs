mod cli;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dagr_core::{
    Backup, BumpKind, ProgressReporter, UpdateConfig, UpdateOrchestrator, UpdateOutcome,
    UpdateProgress,
};
use dagr_platform::{GitCommitProbe, InstallPaths, SystemdService};
use log::{error, warn};
use tokio::sync::mpsc;

use crate::cli::{Cli, Command};

const EXIT_FAILURE: u8 = 1;
const EXIT_SETUP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match cli.root.clone() {
        Some(root) => InstallPaths::new(root),
        None => InstallPaths::from_env(),
    };
    let paths = match paths {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("dagr-update: {error}");
            return ExitCode::from(EXIT_SETUP);
        }
    };
    if let Err(error) = paths.ensure_dirs() {
        eprintln!("dagr-update: failed to prepare directories: {error}");
        return ExitCode::from(EXIT_SETUP);
    }
    logging::init_logging(&paths.log_file(), cli.debug);

    let config = match UpdateConfig::load(&paths.update_config_file()) {
        Ok(config) => config,
        Err(error) => {
            error!("Could not load update config: {error}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let client = match reqwest::Client::builder()
        .user_agent(concat!("dagr-update/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            error!("Could not create HTTP client: {error}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let (progress_tx, progress_rx) = mpsc::channel(64);
    let service = Arc::new(SystemdService::new(config.service_name.clone()));
    let commit_probe = Arc::new(GitCommitProbe::new(paths.project_root.clone()));
    let orchestrator = match UpdateOrchestrator::new(paths, config, client, service, commit_probe) {
        Ok(orchestrator) => orchestrator.with_progress(ProgressReporter::new(progress_tx)),
        Err(error) => {
            error!("Invalid update config: {error}");
            return ExitCode::from(EXIT_SETUP);
        }
    };
    tokio::spawn(print_download_progress(progress_rx));

    if let Err(error) = orchestrator.cleanup_stale_scratch() {
        warn!("Skipping stale scratch cleanup: {error}");
    }

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling download");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Check => check(&orchestrator).await,
        Command::Update { url } => update(&orchestrator, url.as_deref()).await,
        Command::Rollback { name } => rollback(&orchestrator, &name).await,
        Command::Backups { json } => backups(&orchestrator, json),
        Command::Version => version(&orchestrator),
        Command::Bump { kind, dry_run } => bump(&orchestrator, kind, dry_run).await,
    }
}

async fn check(orchestrator: &UpdateOrchestrator) -> ExitCode {
    match orchestrator.check_for_updates().await {
        Ok(check) => {
            println!("Current version: {}", check.current_version);
            println!("Latest version:  {}", check.release.remote_version);
            if check.update_available {
                println!("An update is available.");
                if let Some(notes) = &check.release.notes {
                    println!("\n{notes}");
                }
            } else {
                println!("Up to date.");
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("Current version: {}", failure.current_version);
            eprintln!("Update check failed: {}", failure.source);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn update(orchestrator: &UpdateOrchestrator, url: Option<&str>) -> ExitCode {
    let outcome = if let Some(url) = url {
        orchestrator.perform_update(url).await
    } else {
        let check = match orchestrator.check_for_updates().await {
            Ok(check) => check,
            Err(failure) => {
                eprintln!("Update check failed: {}", failure.source);
                return ExitCode::from(EXIT_FAILURE);
            }
        };
        if !check.update_available {
            println!("Already up to date ({}).", check.current_version);
            return ExitCode::SUCCESS;
        }
        orchestrator.perform_release_update(&check.release).await
    };
    report_update(&outcome)
}

fn report_update(outcome: &UpdateOutcome) -> ExitCode {
    if let Some(backup) = &outcome.backup {
        println!("Backup: {backup}");
    }
    match (&outcome.error, &outcome.new_version) {
        (None, Some(new_version)) => {
            println!("Updated {} -> {new_version}", outcome.previous_version);
            ExitCode::SUCCESS
        }
        (Some(error), _) => {
            eprintln!("Update failed while {}: {error}", outcome.stage);
            if error.installation_inconsistent() {
                eprintln!("The installation may be partially updated; roll back with `dagr-update rollback <name>`.");
            }
            ExitCode::from(EXIT_FAILURE)
        }
        (None, None) => ExitCode::from(EXIT_FAILURE),
    }
}

async fn rollback(orchestrator: &UpdateOrchestrator, name: &str) -> ExitCode {
    let outcome = orchestrator.rollback_to_backup(name).await;
    match (&outcome.error, &outcome.version) {
        (None, Some(version)) => {
            println!("Restored backup '{name}', installation at {version}");
            ExitCode::SUCCESS
        }
        (Some(error), _) => {
            eprintln!("Rollback failed while {}: {error}", outcome.stage);
            ExitCode::from(EXIT_FAILURE)
        }
        (None, None) => ExitCode::from(EXIT_FAILURE),
    }
}

fn backups(orchestrator: &UpdateOrchestrator, json: bool) -> ExitCode {
    let backups = match orchestrator.list_backups() {
        Ok(backups) => backups,
        Err(error) => {
            eprintln!("Could not list backups: {error}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if json {
        let entries: Vec<serde_json::Value> = backups.iter().map(backup_json).collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(text) => println!("{text}"),
            Err(error) => {
                eprintln!("Could not encode backups: {error}");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    } else if backups.is_empty() {
        println!("No backups.");
    } else {
        for backup in &backups {
            println!(
                "{:<28} {:<12} {:>6} files  {}",
                backup.name,
                backup.manifest.version.to_string(),
                backup.file_count(),
                backup.manifest.backup_date.to_rfc3339(),
            );
        }
    }
    ExitCode::SUCCESS
}

fn backup_json(backup: &Backup) -> serde_json::Value {
    serde_json::json!({
        "name": backup.name,
        "path": backup.path,
        "backup_date": backup.manifest.backup_date,
        "version": backup.manifest.version,
        "git_commit": backup.manifest.git_commit,
        "file_count": backup.file_count(),
    })
}

fn version(orchestrator: &UpdateOrchestrator) -> ExitCode {
    let store = orchestrator.version_store();
    let info = store.info();
    println!("Version:          {}", info.version);
    println!("Build date:       {}", info.build_date.to_rfc3339());
    println!(
        "Git commit:       {}",
        info.git_commit.as_deref().unwrap_or("unknown")
    );
    println!("Update channel:   {}", info.update_channel);
    println!(
        "Last check:       {}",
        info.last_update_check
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
    );
    println!(
        "Available:        {}",
        info.available_version
            .map_or_else(|| "-".to_string(), |version| version.to_string())
    );
    println!("Update available: {}", store.is_update_available());
    ExitCode::SUCCESS
}

async fn bump(orchestrator: &UpdateOrchestrator, kind: BumpKind, dry_run: bool) -> ExitCode {
    let store = orchestrator.version_store();
    let current = store.current();
    let next = current.bump(kind);
    if dry_run {
        println!("{current} -> {next} (dry run)");
        return ExitCode::SUCCESS;
    }
    match store.set(&next).await {
        Ok(()) => {
            println!("{current} -> {next}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Could not write version: {error}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn print_download_progress(mut rx: mpsc::Receiver<UpdateProgress>) {
    let mut last_decile = None;
    while let Some(event) = rx.recv().await {
        match event {
            UpdateProgress::Downloading {
                downloaded,
                total: Some(total),
            } if total > 0 => {
                let decile = downloaded.saturating_mul(10) / total;
                if last_decile != Some(decile) {
                    last_decile = Some(decile);
                    eprintln!("Downloaded {downloaded} of {total} bytes");
                }
            }
            UpdateProgress::Stage(_) | UpdateProgress::Rollback(_) => last_decile = None,
            UpdateProgress::Downloading { .. } => {}
        }
    }
}
