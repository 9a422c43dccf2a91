//! Export command - SA108 figures or the per-disposal schedule

use super::open_engine;
use crate::core::sa108::write_disposals_csv;
use crate::core::TaxYear;
use crate::server::dto::Sa108Response;
use clap::Args;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct ExportCommand {
    /// Tax year by its starting year (e.g., 2024 for 2024/25)
    #[arg(short, long)]
    year: i32,

    /// Write the disposal schedule as CSV instead of SA108 JSON
    #[arg(long)]
    csv: bool,

    /// Output file. Writes to stdout if not specified.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl ExportCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = open_engine(data)?;
        let year = TaxYear(self.year);
        let mut out: Box<dyn Write> = match &self.output {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout().lock()),
        };

        if self.csv {
            let result = engine.result(year)?;
            write_disposals_csv(out, &result.fragments)?;
        } else {
            let export = engine.sa108(year)?;
            serde_json::to_writer_pretty(&mut out, &Sa108Response::from(&export))?;
            writeln!(out)?;
        }
        if let Some(path) = &self.output {
            log::info!("Wrote {} export to {}", year, path.display());
        }
        Ok(())
    }
}
