use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mortviz_core::Selection;
use mortviz_pipeline::AppConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mortviz")]
#[command(about = "World mortality visualiser command-line interface")]
struct Cli {
    /// Mortality CSV (defaults to MORTVIZ_DATASET or ./static/raw_data.csv)
    #[arg(long, global = true)]
    dataset: Option<PathBuf>,
    /// Artifact cache root (defaults to MORTVIZ_RESOURCES_DIR or ./resources)
    #[arg(long, global = true)]
    resources: Option<PathBuf>,
    /// Answer lookups from a JSON fixture instead of the REST service
    #[arg(long, global = true)]
    lookup_fixture: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve,
    Countries,
    Map { year: i32 },
    Bars {
        #[arg(required = true)]
        entities: Vec<String>,
    },
    Region { region: String },
}

impl Cli {
    fn config(&self) -> AppConfig {
        let mut config = AppConfig::from_env();
        if let Some(dataset) = &self.dataset {
            config.dataset_path = dataset.clone();
        }
        if let Some(resources) = &self.resources {
            config.resources_dir = resources.clone();
        }
        if let Some(fixture) = &self.lookup_fixture {
            config.lookup_fixture = Some(fixture.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mortviz_storage=info".parse()?)
                .add_directive("mortviz_lookup=info".parse()?)
                .add_directive("mortviz_pipeline=info".parse()?)
                .add_directive("mortviz_web=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => mortviz_web::serve(config).await?,
        Commands::Countries => {
            let service = mortviz_pipeline::build_service(&config)?;
            for country in service.countries() {
                println!("{country}");
            }
        }
        Commands::Map { year } => {
            let service = mortviz_pipeline::build_service(&config)?;
            match service.enrich_for_year(year).await? {
                Selection::Found(artifacts) => println!("{}", serde_json::to_string_pretty(&artifacts)?),
                Selection::Empty => println!("no data for year {year}"),
            }
        }
        Commands::Bars { entities } => {
            let service = mortviz_pipeline::build_service(&config)?;
            match service.enrich_for_entities(entities.as_slice()).await? {
                Selection::Found(artifacts) => println!("{}", serde_json::to_string_pretty(&artifacts)?),
                Selection::Empty => println!("no data for {}", entities.join(", ")),
            }
        }
        Commands::Region { region } => {
            let service = mortviz_pipeline::build_service(&config)?;
            let countries = service.reference_for_region(&region).await?;
            println!("{}", serde_json::to_string_pretty(&countries)?);
        }
    }

    Ok(())
}
