//! Rates command - USD/GBP rate table maintenance

use super::open_engine;
use anyhow::Context;
use clap::{Args, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tabled::{settings::Style, Table, Tabled};

#[derive(Args, Debug)]
pub struct RatesCommand {
    #[command(subcommand)]
    action: RatesAction,
}

#[derive(Subcommand, Debug)]
enum RatesAction {
    /// Import a CSV of rates (Bank of England export or date,rate rows)
    Import {
        /// CSV file, first row is a header
        file: PathBuf,
    },
    /// List the rate table
    List,
}

#[derive(Debug, Tabled)]
struct RateRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "USD/GBP")]
    rate: String,
    #[tabled(rename = "Description")]
    description: String,
}

impl RatesCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = open_engine(data)?;
        match &self.action {
            RatesAction::Import { file } => {
                let reader = File::open(file)
                    .with_context(|| format!("Failed to open {}", file.display()))?;
                let summary = engine.import_rates(BufReader::new(reader))?;
                println!(
                    "Imported {} rates ({} already present, {} skipped)",
                    summary.inserted, summary.existing, summary.skipped
                );
            }
            RatesAction::List => {
                let rows: Vec<RateRow> = engine
                    .rates()
                    .into_iter()
                    .map(|r| RateRow {
                        date: r.date.format("%Y-%m-%d").to_string(),
                        rate: r.usd_gbp.to_string(),
                        description: r.description.unwrap_or_default(),
                    })
                    .collect();
                if rows.is_empty() {
                    println!("No rates recorded");
                } else {
                    println!("{}", Table::new(rows).with(Style::rounded()));
                }
            }
        }
        Ok(())
    }
}
