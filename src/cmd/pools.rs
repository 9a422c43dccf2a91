//! Pools command - Section 104 holding at the end of a tax year

use super::{format_gbp, format_quantity, open_engine, years};
use crate::core::matcher::PoolLotView;
use crate::core::{SaleSnapshot, YearEndPool};
use crate::server::dto::{LotView, SaleSnapshotView};
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Args, Debug)]
pub struct PoolsCommand {
    /// Tax year by its starting year (e.g., 2024 for 2024/25). All years if omitted.
    #[arg(short, long)]
    year: Option<i32>,

    /// Also show the pool after each sale
    #[arg(long)]
    sales: bool,

    /// Output as JSON instead of formatted table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Tabled)]
struct LotRow {
    #[tabled(rename = "Lot")]
    lot: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Acquired")]
    date: String,
    #[tabled(rename = "Shares")]
    shares: String,
    #[tabled(rename = "Cost/Share")]
    per_share: String,
    #[tabled(rename = "Cost (GBP)")]
    cost: String,
}

impl From<&PoolLotView> for LotRow {
    fn from(lot: &PoolLotView) -> Self {
        LotRow {
            lot: lot.entry.to_string(),
            source: lot.source.display().to_string(),
            date: lot.date.format("%Y-%m-%d").to_string(),
            shares: format_quantity(lot.remaining),
            per_share: format_gbp(lot.per_share_cost),
            cost: format_gbp(lot.remaining * lot.per_share_cost),
        }
    }
}

#[derive(Debug, Serialize)]
struct YearEndView {
    tax_year: String,
    shares: f64,
    cost_gbp: f64,
    lots: Vec<LotView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sales: Vec<SaleSnapshotView>,
}

impl PoolsCommand {
    pub fn exec(&self, data: &Path) -> anyhow::Result<()> {
        let engine = open_engine(data)?;
        let mut views = Vec::new();
        for year in years(&engine, self.year) {
            let result = engine.result(year)?;
            let sales: &[SaleSnapshot] = if self.sales { &result.snapshots } else { &[] };
            match &result.year_end {
                Some(pool) if self.json => views.push(YearEndView {
                    tax_year: year.display(),
                    shares: crate::server::dto::shares(pool.quantity),
                    cost_gbp: crate::server::dto::money(pool.cost_gbp),
                    lots: pool.lots.iter().map(LotView::from).collect(),
                    sales: sales.iter().map(SaleSnapshotView::from).collect(),
                }),
                Some(pool) => print_year_end(pool, sales),
                None => println!("Tax Year {}: no pool", year),
            }
        }
        if self.json {
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Ok(())
    }
}

fn print_year_end(pool: &YearEndPool, sales: &[SaleSnapshot]) {
    println!();
    println!("POOL AT END OF {}", pool.tax_year);
    println!();
    for sale in sales {
        println!(
            "After sale {} on {} ({} shares):",
            sale.sale_id,
            sale.sale_date,
            format_quantity(sale.shares)
        );
        print_lots(&sale.pool_after);
    }
    print_lots(&pool.lots);
    println!(
        "Total: {} shares, cost {}, average {}",
        format_quantity(pool.quantity),
        format_gbp(pool.cost_gbp),
        format_gbp(average(pool.quantity, pool.cost_gbp))
    );
}

fn print_lots(lots: &[PoolLotView]) {
    if lots.is_empty() {
        println!("  (empty)");
        println!();
        return;
    }
    let rows: Vec<LotRow> = lots.iter().map(LotRow::from).collect();
    let table = Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{}", table);
    println!();
}

fn average(quantity: Decimal, cost_gbp: Decimal) -> Decimal {
    if quantity.is_zero() {
        Decimal::ZERO
    } else {
        cost_gbp / quantity
    }
}
