mod commands;
mod logging;
mod progress;

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use media_vault_core::proxy::ProxyState;
use media_vault_core::{
    AppConfig, BatchReport, ExternalHandle, ImportSource, ImportedMedia, LibraryBuilder,
    MediaId, MediaLibrary, MediaRecord, ProjectId,
};
use progress::CliReporter;
use serde::Serialize;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.verbose);

    let loaded = match &args.config {
        Some(path) => media_vault_core::config::load_configuration_from(path),
        None => media_vault_core::config::load_configuration(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let Some(command) = args.command else {
        let _ = Cli::command().print_long_help();
        return;
    };

    if let Err(err) = run(config, ProjectId::from(args.project), command).await {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

async fn run(config: AppConfig, project: ProjectId, command: Commands) -> anyhow::Result<()> {
    if let Commands::Config { write } = &command {
        return print_config(&config, write.as_ref());
    }

    let library = LibraryBuilder::new(config)
        .with_reporter(Arc::new(CliReporter::new()))
        .build()
        .context("failed to open media library")?;
    let count = library.open_project(project.clone()).await?;
    info!("Project {} has {} media", project.to_string().cyan(), count);

    match command {
        Commands::Import { paths, copy } => run_import(&library, paths, copy).await,
        Commands::List { csv } => run_list(&library, csv),
        Commands::Remove { ids } => {
            let ids: Vec<MediaId> = ids.into_iter().map(MediaId::from).collect();
            let report = library.remove_batch(&ids).await?;
            for outcome in &report.succeeded {
                let status = if outcome.content_deleted {
                    "removed, content deleted".green()
                } else if outcome.purged {
                    "removed".green()
                } else if outcome.association_removed {
                    "removed from project, still used elsewhere".yellow()
                } else {
                    "not in project".yellow()
                };
                println!("{} {}", outcome.media_id, status);
            }
            print_failures(&report);
            Ok(())
        }
        Commands::Relink { id, path } => {
            let record = library.relink(&MediaId::from(id), ExternalHandle::new(path))?;
            println!("{} now points at {}", record.id, record.file_name.green());
            Ok(())
        }
        Commands::Copy { id, target } => {
            let copy = library
                .copy_to_project(&MediaId::from(id), &ProjectId::from(target.clone()))
                .await?;
            println!("Copied to {} as {}", target.cyan(), copy.id);
            Ok(())
        }
        Commands::Attach { id, target } => {
            let added = library.attach_to_project(&MediaId::from(id), &ProjectId::from(target.clone()))?;
            if added {
                println!("Attached to {}", target.cyan());
            } else {
                println!("Already in {}", target.cyan());
            }
            Ok(())
        }
        Commands::Verify => {
            let broken = library.verify_project().await?;
            if broken.is_empty() {
                println!("{}", "All media reachable".green());
            }
            for (id, reason) in broken {
                println!("{} {}", id, reason.to_string().red());
            }
            Ok(())
        }
        Commands::Fsck { repair, yes } => run_fsck(&library, repair, yes).await,
        Commands::Proxy { id, cancel } => run_proxy(&library, MediaId::from(id), cancel).await,
        Commands::Thumbnails { ids } => {
            let ids: Vec<MediaId> = ids.into_iter().map(MediaId::from).collect();
            let report = library.regenerate_thumbnails(&ids).await?;
            print_failures(&report);
            Ok(())
        }
        Commands::Export { id } => {
            let path = library.export_media(&MediaId::from(id)).await?;
            println!("Exported to {}", path.display().to_string().green());
            Ok(())
        }
        Commands::Stats => run_stats(&library).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn run_import(library: &MediaLibrary, paths: Vec<PathBuf>, copy: bool) -> anyhow::Result<()> {
    if paths.is_empty() {
        bail!("nothing to import");
    }

    let mut files = Vec::new();
    let mut imported = Vec::new();
    for path in paths {
        if path.is_dir() {
            let report = library.import_directory(&path).await?;
            imported.extend(print_imported(&report));
        } else if copy {
            files.push(ImportSource::File(path));
        } else {
            files.push(ImportSource::Handle(ExternalHandle::new(path)));
        }
    }
    if !files.is_empty() {
        let report = library.import_batch(files).await?;
        imported.extend(print_imported(&report));
    }

    // Proxy jobs run on this runtime; leaving now would drop them halfway.
    let settled = library.settle_proxies(&imported).await;
    for (id, state) in settled {
        if let ProxyState::Error(message) = state {
            warn!("Proxy for {} failed: {}", id, message);
        }
    }
    Ok(())
}

fn print_imported(report: &BatchReport<ImportedMedia>) -> Vec<MediaId> {
    let mut ids = Vec::with_capacity(report.succeeded.len());
    for imported in &report.succeeded {
        let note = if imported.is_duplicate {
            " (already in project)".yellow()
        } else if !imported.audio_supported {
            " (audio codec not playable)".yellow()
        } else {
            "".normal()
        };
        println!("{} {}{}", imported.record.id, imported.record.file_name, note);
        ids.push(imported.record.id.clone());
    }
    print_failures(report);
    ids
}

fn print_failures<T>(report: &BatchReport<T>) {
    for failure in &report.failures {
        println!("{} {}: {}", "failed".red(), failure.label, failure.error);
    }
}

#[derive(Serialize)]
struct MediaRow<'a> {
    id: &'a str,
    file_name: &'a str,
    kind: &'a str,
    mime_type: &'a str,
    file_size: u64,
    storage: &'a str,
    duration: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    broken: String,
}

impl<'a> MediaRow<'a> {
    fn new(record: &'a MediaRecord) -> Self {
        Self {
            id: record.id.as_str(),
            file_name: &record.file_name,
            kind: record.kind().map(|kind| kind.as_str()).unwrap_or(""),
            mime_type: &record.mime_type,
            file_size: record.file_size,
            storage: if record.content_hash().is_some() {
                "stored"
            } else {
                "linked"
            },
            duration: record.properties.duration,
            width: record.properties.width,
            height: record.properties.height,
            broken: record
                .broken_reason
                .map(|reason| reason.to_string())
                .unwrap_or_default(),
        }
    }
}

fn run_list(library: &MediaLibrary, csv: bool) -> anyhow::Result<()> {
    let records = library.list_media()?;
    if csv {
        let mut writer = csv::Writer::from_writer(io::stdout());
        for record in &records {
            writer.serialize(MediaRow::new(record))?;
        }
        writer.flush()?;
        return Ok(());
    }

    for record in &records {
        let row = MediaRow::new(record);
        let dims = match (row.width, row.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => String::new(),
        };
        let line = format!(
            "{}  {:<6} {:<7} {:>12}  {:<10} {}",
            row.id, row.kind, row.storage, row.file_size, dims, row.file_name
        );
        if row.broken.is_empty() {
            println!("{}", line);
        } else {
            println!("{} {}", line.red(), row.broken.red());
        }
    }
    Ok(())
}

async fn run_fsck(library: &MediaLibrary, repair: bool, yes: bool) -> anyhow::Result<()> {
    let report = library.check_integrity(false).await?;
    println!("Checked {} stored files", report.checked);
    for hash in &report.corrupt {
        println!("{} {}", "corrupt".red(), hash);
    }
    for hash in &report.missing {
        println!("{} {}", "missing".red(), hash);
    }
    for path in &report.orphans {
        println!("{} {}", "orphan".yellow(), path.display());
    }
    for path in &report.stale_temp {
        println!("{} {}", "stale".yellow(), path.display());
    }
    for hash in &report.zero_ref {
        println!("{} {}", "unreferenced".yellow(), hash);
    }
    for mismatch in &report.mismatches {
        println!(
            "{} {} recorded {} actual {}",
            "refcount".yellow(),
            mismatch.hash,
            mismatch.recorded,
            mismatch.actual
        );
    }
    if report.is_clean() {
        println!("{}", "Content store is consistent".green());
        return Ok(());
    }
    if !repair {
        return Ok(());
    }

    if !yes && !prompt_confirm("Repair the problems listed above?", Some(false))? {
        return Ok(());
    }
    let repaired = library.check_integrity(true).await?;
    println!("Repaired {} entries", repaired.repaired.to_string().green());
    if !repaired.corrupt.is_empty() || !repaired.missing.is_empty() {
        warn!("Corrupt or missing content needs the original files re-imported");
    }
    Ok(())
}

async fn run_proxy(library: &MediaLibrary, id: MediaId, cancel: bool) -> anyhow::Result<()> {
    if cancel {
        if library.cancel_proxy(&id).await? {
            println!("Cancelled proxy generation for {}", id);
        } else {
            println!("No proxy generation running for {}", id);
        }
        return Ok(());
    }

    if let ProxyState::Ready(info) = library.proxy_state(&id) {
        println!("Proxy already at {}", info.path.display());
        return Ok(());
    }
    if !library.start_proxy(&id).await? {
        println!("{} does not need a proxy", id);
        return Ok(());
    }
    match library.proxies().wait_settled(&id).await {
        ProxyState::Ready(info) => {
            println!("Proxy written to {}", info.path.display().to_string().green());
            Ok(())
        }
        ProxyState::Error(message) => bail!("proxy generation failed: {}", message),
        other => bail!("proxy generation ended as {}", other.name()),
    }
}

async fn run_stats(library: &MediaLibrary) -> anyhow::Result<()> {
    let stats = library.stats()?;
    let estimate = library.storage_estimate().await?;

    println!(
        "{} media ({} stored, {} linked, {} broken) in {} projects",
        stats.media_count.to_string().cyan(),
        stats.content_addressed,
        stats.handle_backed,
        stats.broken.to_string().red(),
        stats.project_count
    );
    println!(
        "{} content entries, {} references",
        stats.content_entries, stats.total_refs
    );
    println!(
        "{} bytes stored, {} bytes logical, {} bytes saved by deduplication",
        stats.stored_bytes,
        stats.logical_bytes,
        stats.dedup_savings().to_string().green()
    );
    println!("{} of {} bytes quota used", estimate.usage, estimate.quota);
    Ok(())
}

fn print_config(config: &AppConfig, write: Option<&PathBuf>) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    print!("{}", rendered);
    if let Some(path) = write {
        fs::write(path, &rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Configuration written to {}", path.display());
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
