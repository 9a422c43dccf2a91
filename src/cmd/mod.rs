pub mod export;
pub mod pools;
pub mod rates;
pub mod recalc;
pub mod schema;
pub mod serve;
pub mod summary;

use crate::core::rounding::{round_money, round_shares};
use crate::core::TaxYear;
use crate::engine::Engine;
use crate::store::Store;
use anyhow::Context;
use rust_decimal::Decimal;
use std::path::Path;

/// Open the engine over the data file, creating nothing until the first save
pub fn open_engine(data: &Path) -> anyhow::Result<Engine> {
    Engine::open(Store::new(data))
        .with_context(|| format!("Failed to open data file {}", data.display()))
}

/// Years to act on: the one asked for, or every year the ledger knows about
pub fn years(engine: &Engine, year: Option<i32>) -> Vec<TaxYear> {
    match year {
        Some(y) => vec![TaxYear(y)],
        None => engine.tax_years(),
    }
}

pub fn format_gbp(amount: Decimal) -> String {
    let rounded = round_money(amount);
    if rounded < Decimal::ZERO {
        format!("-£{:.2}", -rounded)
    } else {
        format!("£{:.2}", rounded)
    }
}

pub fn format_quantity(qty: Decimal) -> String {
    let s = format!("{:.6}", round_shares(qty));
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
