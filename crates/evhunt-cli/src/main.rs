use anyhow::Result;
use clap::{Parser, Subcommand};
use evhunt_storage::CatalogStore;
use evhunt_sync::{run_scrape_once_from_env, PipelineConfig, RunStatus};

#[derive(Debug, Parser)]
#[command(name = "evhunt-cli")]
#[command(about = "EV Price Hunt command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape all enabled stores and merge into the catalog.
    Scrape,
    /// Print the best cross-store price spreads from the last run.
    Deals {
        /// How many matches to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let summary = run_scrape_once_from_env().await?;
            match summary.status {
                RunStatus::Completed => println!(
                    "scrape complete: run_id={} stores={} new={} updated={} total={} matches={}",
                    summary.run_id,
                    summary.stores_scraped,
                    summary.stats.new_count,
                    summary.stats.updated_count,
                    summary.stats.total_count,
                    summary.matches
                ),
                RunStatus::NoProducts => println!(
                    "scrape finished with no products: run_id={} stores={} (catalog untouched)",
                    summary.run_id, summary.stores_scraped
                ),
            }
        }
        Commands::Deals { limit } => {
            let config = PipelineConfig::from_env();
            let store = CatalogStore::new(config.data_dir);
            let matches = store.load_matches().await?;
            if matches.is_empty() {
                println!("no matches yet; run `evhunt-cli scrape` first");
                return Ok(());
            }
            for m in matches.iter().take(limit) {
                println!(
                    "{:>3}% off  ${:>8.2} vs ${:>8.2}  [{}] {}",
                    m.savings_percent,
                    m.lowest_price,
                    m.highest_price,
                    m.category,
                    m.products
                        .first()
                        .map(|p| p.title.as_str())
                        .unwrap_or(&m.match_key),
                );
                for p in &m.products {
                    println!("        ${:>8.2}  {}  {}", p.price, p.source, p.url);
                }
            }
        }
    }

    Ok(())
}
