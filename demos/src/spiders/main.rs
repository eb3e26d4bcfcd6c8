use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use spiders_for_all::{registry, store::Rows, Platform, RunContext, Settings};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "spiders", about = "Crawl bilibili and xiaohongshu into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every available spider.
    List,
    /// Run one spider.
    Crawl {
        platform: Platform,
        name: String,
        /// Uploader / author id for per-author spiders.
        #[arg(long)]
        target: Option<String>,
        /// Stop after this many items.
        #[arg(long)]
        total: Option<usize>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long, default_value_t = 1)]
        start_page: u32,
    },
    /// Download media for stored items.
    Download {
        platform: Platform,
        /// SQL `WHERE` expression selecting the items.
        #[arg(long = "where")]
        filter: Option<String>,
        #[arg(long)]
        table: Option<String>,
        #[arg(long, default_value = "downloads")]
        save_dir: PathBuf,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Show the most viewed rows of a stored table.
    Top {
        platform: Platform,
        table: String,
        #[arg(short, long, default_value_t = 10)]
        n: usize,
    },
    /// List the tables each platform's spiders write.
    Tables { platform: Option<Platform> },
    /// Run an SQL statement against a platform's database.
    Query { platform: Platform, sql: String },
}

fn print_rows(rows: &Rows) {
    if rows.rows.is_empty() {
        println!("(no rows)");
        return;
    }
    let widths: Vec<usize> = rows
        .columns
        .iter()
        .enumerate()
        .map(|(index, name)| {
            rows.rows
                .iter()
                .map(|row| row[index].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("  ")
    };
    println!("{}", line(&rows.columns));
    for row in &rows.rows {
        println!("{}", line(row));
    }
}

fn print_result(result: Result<Rows, spiders_for_all::CrawlError>) -> ExitCode {
    match result {
        Ok(rows) => {
            print_rows(&rows);
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&settings.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::List => {
            for spider in registry::catalog() {
                println!(
                    "{:<10}{:<20}{:<12}{}",
                    spider.platform.as_str(), spider.name, spider.alias, spider.table
                );
            }
            ExitCode::SUCCESS
        }
        Command::Crawl {
            platform,
            name,
            target,
            total,
            page_size,
            start_page,
        } => {
            let mut ctx = RunContext::new().start_page(start_page);
            ctx.target = target;
            ctx.total = total;
            ctx.page_size = page_size;
            match registry::run_named(&settings, platform, &name, &ctx).await {
                Ok(report) => {
                    println!("{} items saved over {} pages", report.items, report.pages);
                    ExitCode::SUCCESS
                }
                Err(failure) => {
                    tracing::error!("{}", failure);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Download {
            platform,
            filter,
            table,
            save_dir,
            concurrency,
        } => {
            let summary = registry::download_named(
                &settings,
                platform,
                table.as_deref(),
                filter.as_deref(),
                &save_dir,
                concurrency,
            )
            .await;
            match summary {
                Ok(summary) if summary.failed.is_empty() => ExitCode::SUCCESS,
                Ok(summary) => {
                    for (id, reason) in &summary.failed {
                        eprintln!("{}: {}", id, reason);
                    }
                    ExitCode::FAILURE
                }
                Err(err) => {
                    tracing::error!("{}", err);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Top { platform, table, n } => {
            print_result(registry::top_named(&settings, platform, &table, n).await)
        }
        Command::Tables { platform } => {
            for info in registry::tables(platform) {
                println!(
                    "{:<10}{:<32}{:<10}{}",
                    info.platform.as_str(),
                    info.table,
                    info.key,
                    info.name
                );
            }
            ExitCode::SUCCESS
        }
        Command::Query { platform, sql } => {
            print_result(registry::query_platform(&settings, platform, &sql).await)
        }
    }
}
