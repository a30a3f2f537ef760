use anyhow::{Context, Result};
use clap::Parser;
use std::{
    io::IsTerminal,
    sync::{Arc, atomic::AtomicBool},
};

use patients_enricher::{
    args::{Args, Command},
    cache::PatientCache,
    common::install_ctrlc_handler,
    config::Settings,
    enrich::{
        EnrichOptions, check_connection, download_patients_file, enrich_patients_file,
        parse_file_date,
    },
    import::{import_names, write_import_example},
};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config)?;
    settings.apply(&args.connection.overrides())?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(shutdown_requested.clone());
    let show_progress = std::io::stderr().is_terminal();

    match args.cmd {
        Command::Enrich(cmd) => {
            let options = EnrichOptions {
                cache_only: cmd.cache_only,
                show_progress: show_progress && !cmd.no_progress,
            };
            enrich_patients_file(&settings, &cmd.patients_file, options, &shutdown_requested)
                .await
                .context("enrich failed")?;
        }
        Command::Download(cmd) => {
            let on_date = parse_file_date(cmd.file_date.as_deref())?;
            download_patients_file(&settings, on_date, &cmd.patients_file)
                .await
                .context("download failed")?;
            if cmd.enrich {
                let options = EnrichOptions {
                    cache_only: false,
                    show_progress,
                };
                enrich_patients_file(&settings, &cmd.patients_file, options, &shutdown_requested)
                    .await
                    .context("enrich failed")?;
            }
        }
        Command::Import(cmd) => {
            let mut cache = PatientCache::open(&settings.cache_db)?;
            import_names(&mut cache, &cmd.input).context("import failed")?;
        }
        Command::ImportExample(cmd) => write_import_example(&cmd.output)?,
        Command::Check => {
            check_connection(&settings)
                .await
                .context("connection check failed")?;
        }
        Command::ClearCache => {
            let cache = PatientCache::open(&settings.cache_db)?;
            let removed = cache.clear()?;
            println!(
                "Removed {removed} cached names from {}.",
                settings.cache_db.display()
            );
        }
        Command::ExportCache(cmd) => {
            let cache = PatientCache::open(&settings.cache_db)?;
            let written = cache.export_csv(&cmd.output)?;
            println!("Exported {written} cached names to {}.", cmd.output.display());
        }
    }
    Ok(())
}
