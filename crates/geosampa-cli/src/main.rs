use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use geosampa_crawler::{run_import, ImportConfig};
use geosampa_storage::HttpClientConfig;
use geosampa_sync::{run_export, ExportConfig, NamedOrganization, StaticCredentials};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "geosampa")]
#[command(about = "Mirror the GeoSampa portal and publish it to a CKAN catalog")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the portal and download every file with its metadata
    Import {
        /// Snapshot directory (must exist)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only crawl this theme (exact folder name, e.g. "01_Cartografia")
        #[arg(long)]
        theme: Option<String>,
        /// Only crawl this sub-theme
        #[arg(long)]
        sub_theme: Option<String>,
        /// Portal base URL
        #[arg(long)]
        host: Option<String>,
    },
    /// Publish a snapshot to an external catalog
    Export {
        #[command(subcommand)]
        target: ExportTarget,
    },
}

#[derive(Debug, Subcommand)]
enum ExportTarget {
    /// Upsert packages and resources into a CKAN site
    Ckan {
        /// Snapshot directory produced by `import`
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// CKAN base URL
        #[arg(long)]
        site: Option<String>,
        /// Create packages as public
        #[arg(long)]
        public: bool,
        #[arg(long)]
        api_key: Option<String>,
        /// Organization name that owns created packages
        #[arg(long)]
        organization: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Import {
            output,
            theme,
            sub_theme,
            host,
        } => {
            let mut config = ImportConfig::from_env();
            if let Some(output) = output {
                config.output = output;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if theme.is_some() {
                config.filter.theme = theme;
            }
            if sub_theme.is_some() {
                config.filter.sub_theme = sub_theme;
            }

            let summary = run_import(config, HttpClientConfig::from_env()).await?;
            println!(
                "import complete: discovered={} downloaded={} already_present={} failed={} crawl_errors={}",
                summary.discovered,
                summary.downloaded,
                summary.already_present,
                summary.failed,
                summary.crawl_errors
            );
        }
        Commands::Export {
            target:
                ExportTarget::Ckan {
                    input,
                    site,
                    public,
                    api_key,
                    organization,
                },
        } => {
            let mut config = ExportConfig::from_env();
            if let Some(input) = input {
                config.input = input;
            }
            if site.is_some() {
                config.site = site;
            }
            if api_key.is_some() {
                config.api_key = api_key;
            }
            if organization.is_some() {
                config.organization = organization;
            }
            config.public |= public;

            let credentials = StaticCredentials::new(config.api_key.clone());
            let resolver = NamedOrganization::new(config.organization.clone());
            let summary =
                run_export(config, HttpClientConfig::from_env(), &credentials, &resolver).await?;
            println!(
                "export complete: run_id={} organization={} succeeded={} skipped={} failed={} packages_created={} packages_updated={}",
                summary.run_id,
                summary.organization,
                summary.succeeded(),
                summary.skipped(),
                summary.failed(),
                summary.packages_created,
                summary.packages_updated
            );
            for failure in &summary.failures {
                eprintln!("  [{}] {}: {}", failure.kind, failure.sidecar, failure.detail);
            }
        }
    }

    Ok(())
}
