use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::{
    config::Overrides,
    constants::{DEFAULT_IMPORT_EXAMPLE, DEFAULT_PATIENTS_FILE, DEFAULT_SETTINGS_PATH},
};

#[derive(Parser, Debug)]
#[command(name = "patients_enricher")]
#[command(about = "Fill patient names in the attached-patients list from the insurance registry")]
pub struct Args {
    /// JSON settings file (credentials, endpoint, limits).
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    pub config: PathBuf,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fill missing names from the cache, then from the registry.
    Enrich(EnrichArgs),
    /// Download the attached-patients export for a date and convert it to CSV.
    Download(DownloadArgs),
    /// Load known names from a CSV file into the cache.
    Import(ImportArgs),
    /// Write an example file for `import`.
    ImportExample(ImportExampleArgs),
    /// Log in with the first credential and log out again.
    Check,
    /// Remove every cached name.
    ClearCache,
    /// Write the cache contents to a CSV file.
    ExportCache(ExportCacheArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Registry base URL (overrides the settings file).
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[arg(long, global = true, requires = "proxy_port")]
    pub proxy_address: Option<String>,

    #[arg(long, global = true, requires = "proxy_address")]
    pub proxy_port: Option<u16>,

    /// Max concurrent registry sessions.
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Max registry lookups in this run.
    #[arg(long, global = true)]
    pub request_limit: Option<usize>,

    /// SQLite cache of resolved names.
    #[arg(long, global = true)]
    pub cache_db: Option<PathBuf>,
}

impl ConnectionArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            base_url: self.base_url.clone(),
            proxy_address: self.proxy_address.clone(),
            proxy_port: self.proxy_port,
            thread_limit: self.threads,
            request_limit: self.request_limit,
            cache_db: self.cache_db.clone(),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct EnrichArgs {
    /// Patients CSV with ENP and FIO columns.
    #[arg(long, default_value = DEFAULT_PATIENTS_FILE)]
    pub patients_file: PathBuf,

    /// Skip registry requests and only use cached names.
    #[arg(long, default_value_t = false)]
    pub cache_only: bool,

    /// Hide the progress bar and log progress instead.
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Export date as dd.mm.yyyy; defaults to today.
    #[arg(long)]
    pub file_date: Option<String>,

    /// Where the converted CSV is written.
    #[arg(long, default_value = DEFAULT_PATIENTS_FILE)]
    pub patients_file: PathBuf,

    /// Run `enrich` on the downloaded file right away.
    #[arg(long, default_value_t = false)]
    pub enrich: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ImportArgs {
    /// CSV with Полис, Фамилия, Имя, Отчество columns.
    pub input: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ImportExampleArgs {
    #[arg(long, default_value = DEFAULT_IMPORT_EXAMPLE)]
    pub output: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportCacheArgs {
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_subcommand() {
        let args = Args::try_parse_from([
            "patients_enricher",
            "enrich",
            "--patients-file",
            "in.csv",
            "--threads",
            "3",
            "--cache-only",
        ])
        .unwrap();
        assert_eq!(args.connection.threads, Some(3));
        match args.cmd {
            Command::Enrich(enrich) => {
                assert!(enrich.cache_only);
                assert_eq!(enrich.patients_file, PathBuf::from("in.csv"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn proxy_parts_require_each_other() {
        let parsed =
            Args::try_parse_from(["patients_enricher", "check", "--proxy-address", "10.0.0.2"]);
        assert!(parsed.is_err());
    }
}
