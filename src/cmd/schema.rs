//! Schema command - print expected input and export formats

use crate::core::rates::RateCsvRow;
use crate::core::sa108::DisposalCsvRecord;
use crate::core::schema::CsvField;
use crate::core::{ExchangeRate, LedgerEntry};
use clap::{Args, ValueEnum};
use schemars::schema_for;

#[derive(Args, Debug)]
pub struct SchemaCommand {
    /// Which format to describe
    #[arg(value_enum, default_value = "ledger")]
    target: SchemaTarget,

    /// For CSV formats, print only the header row
    #[arg(long)]
    header: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchemaTarget {
    /// JSON Schema for a ledger entry (vesting, ESPP purchase or sale)
    Ledger,
    /// JSON Schema for an exchange rate
    Rate,
    /// CSV columns accepted by `rates import`
    RatesCsv,
    /// CSV columns written by `export --csv`
    DisposalsCsv,
}

impl SchemaCommand {
    pub fn exec(&self) -> anyhow::Result<()> {
        match self.target {
            SchemaTarget::Ledger => {
                let schema = schema_for!(LedgerEntry);
                println!("{}", serde_json::to_string_pretty(&schema)?);
            }
            SchemaTarget::Rate => {
                let schema = schema_for!(ExchangeRate);
                println!("{}", serde_json::to_string_pretty(&schema)?);
            }
            SchemaTarget::RatesCsv => self.print_csv(
                "Exchange Rate CSV",
                &RateCsvRow::csv_header(),
                RateCsvRow::csv_schema(),
            ),
            SchemaTarget::DisposalsCsv => self.print_csv(
                "Disposal Schedule CSV",
                &DisposalCsvRecord::csv_header(),
                DisposalCsvRecord::csv_schema(),
            ),
        }
        Ok(())
    }

    fn print_csv(&self, title: &str, header: &str, fields: &[CsvField]) {
        if self.header {
            println!("{}", header);
            return;
        }
        println!("{}", title);
        println!("{}", "=".repeat(title.len()));
        println!();
        for field in fields {
            let req = if field.required { "required" } else { "optional" };
            println!("{:16} ({:8})  {}", field.name, req, field.description);
            if let Some(example) = field.example {
                println!("{:28}e.g. {}", "", example);
            }
        }
        println!();
        println!("Rates are US dollars per pound sterling: GBP = USD / rate");
    }
}
