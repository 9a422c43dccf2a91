//! Summary command - annual CGT computation

use super::{format_gbp, open_engine};
use crate::core::{CgtSummary, TaxYear};
use crate::server::dto::SummaryResponse;
use clap::Args;
use rust_decimal::Decimal;
use std::path::Path;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Args, Debug)]
pub struct SummaryCommand {
    /// Tax year by its starting year (e.g., 2024 for 2024/25)
    #[arg(short, long)]
    year: i32,

    /// Output as JSON instead of formatted table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Tabled)]
struct SummaryRow {
    #[tabled(rename = "Item")]
    item: &'static str,
    #[tabled(rename = "Amount")]
    amount: String,
}

impl SummaryCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = open_engine(data)?;
        let summary = engine.summary(TaxYear(self.year))?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&SummaryResponse::from(&summary))?
            );
        } else {
            print_summary(&summary);
        }
        Ok(())
    }
}

fn print_summary(s: &CgtSummary) {
    println!();
    println!(
        "CGT SUMMARY {} ({} to {})",
        s.tax_year, s.tax_year_start, s.tax_year_end
    );
    println!();

    let row = |item: &'static str, amount: Decimal| SummaryRow {
        item,
        amount: format_gbp(amount),
    };
    let rows = vec![
        SummaryRow {
            item: "Disposals",
            amount: s.total_disposals.to_string(),
        },
        row("Total proceeds", s.total_proceeds),
        row("Total allowable costs", s.total_cost),
        row("Gains", s.pos),
        row("Losses", -s.neg),
        row("Net gain", s.net_gain),
        row("Losses brought forward", s.carry_forward_loss_gbp),
        row("Losses used", s.carry_forward_used),
        row("Net gain after losses", s.net_gain_after_losses),
        row("Annual exempt amount", s.cgt_allowance_gbp),
        row("Exempt amount used", s.allowance_used),
        row("Taxable gain", s.taxable_after_allowance),
        row("  at basic rate", s.basic_taxable_gain),
        row("  at higher rate", s.higher_taxable_gain),
        row("Estimated CGT", s.estimated_cgt),
        row("Losses carried forward", s.loss_carried_out),
    ];

    let table = Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{}", table);
    println!(
        "Effective rate: {:.2}%",
        crate::core::rounding::round_money(s.effective_rate_percent)
    );
}
