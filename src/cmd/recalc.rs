//! Recalc command - recompute and commit tax years

use super::{format_gbp, open_engine, years};
use clap::Args;
use std::path::Path;

#[derive(Args, Debug)]
pub struct RecalcCommand {
    /// Tax year by its starting year (e.g., 2024 for 2024/25). All years with sales if omitted.
    #[arg(short, long)]
    year: Option<i32>,
}

impl RecalcCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = open_engine(data)?;
        let years = years(&engine, self.year);
        if years.is_empty() {
            println!("No sales recorded, nothing to calculate");
            return Ok(());
        }

        let mut failed = 0;
        for year in years {
            match engine.recalculate(year) {
                Ok(result) => println!(
                    "{}: {} disposal fragments, net gain {}, estimated CGT {}",
                    year,
                    result.fragments.len(),
                    format_gbp(result.summary.net_gain),
                    format_gbp(result.summary.estimated_cgt)
                ),
                Err(e) => {
                    failed += 1;
                    println!("{}: FAILED - {}", year, e);
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{} tax year(s) could not be recalculated", failed);
        }
        Ok(())
    }
}
