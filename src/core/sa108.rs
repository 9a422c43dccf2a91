//! SA108 capital gains pages: line items and per-disposal schedule

use super::bands::CgtSummary;
use super::matcher::{DisposalFragment, PoolLotView, SaleSnapshot, YearEndPool};
use super::rounding::{round_money, round_shares};
use super::schema::CsvSchema;
use super::uk::TaxYear;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sa108Disposal {
    pub date: NaiveDate,
    pub description: String,
    pub proceeds: Decimal,
    pub cost: Decimal,
    pub gain_loss: Decimal,
}

/// Read-side projection of an already computed year. Amounts keep full precision;
/// rounding happens where they are displayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sa108Export {
    pub tax_year: TaxYear,
    pub tax_year_start: NaiveDate,
    pub tax_year_end: NaiveDate,
    pub total_proceeds: Decimal,
    pub total_costs: Decimal,
    pub total_gains: Decimal,
    /// Positive amount
    pub total_losses: Decimal,
    pub net_gain: Decimal,
    /// In-year losses allowable against gains
    pub allowable_loss: Decimal,
    pub carry_forward_loss_used: Decimal,
    pub net_gain_after_losses: Decimal,
    pub cgt_allowance_used: Decimal,
    pub chargeable_gain: Decimal,
    pub disposals: Vec<Sa108Disposal>,
}

impl Sa108Export {
    pub fn new(summary: &CgtSummary, fragments: &[DisposalFragment]) -> Self {
        let disposals = fragments
            .iter()
            .filter(|f| f.tax_year == summary.tax_year)
            .map(|f| Sa108Disposal {
                date: f.sale_date,
                description: format!("Shares disposal (match: {})", f.matching_type),
                proceeds: f.proceeds_gbp,
                cost: f.cost_basis_gbp,
                gain_loss: f.gain_gbp,
            })
            .collect();

        Sa108Export {
            tax_year: summary.tax_year,
            tax_year_start: summary.tax_year_start,
            tax_year_end: summary.tax_year_end,
            total_proceeds: summary.total_proceeds,
            total_costs: summary.total_cost,
            total_gains: summary.pos,
            total_losses: -summary.neg,
            net_gain: summary.net_gain,
            allowable_loss: -summary.neg,
            carry_forward_loss_used: summary.carry_forward_used,
            net_gain_after_losses: summary.net_gain_after_losses,
            cgt_allowance_used: summary.allowance_used,
            chargeable_gain: summary.taxable_after_allowance,
            disposals,
        }
    }
}

/// One row of the disposals download
#[derive(Debug, Clone, Serialize, Deserialize, CsvSchema)]
pub struct DisposalCsvRecord {
    /// Fragment id, stable while the ledger is unchanged
    #[csv(example = "12")]
    pub disposal_id: u64,
    /// Sale date (YYYY-MM-DD)
    #[csv(example = "2024-07-01")]
    pub date: String,
    /// Tax year, e.g. 2024/25
    #[csv(example = "2024/25")]
    pub tax_year: String,
    /// Ledger id of the sale
    pub sale_id: u64,
    /// Same-day, 30-day or Section 104
    #[csv(example = "Section 104")]
    pub matching_type: String,
    /// Acquisition matched, V:<id> or E:<id>; empty for the pool
    pub lot_entry: Option<String>,
    /// Acquisition date for same-day and 30-day matches
    pub matched_date: Option<String>,
    /// Shares matched
    pub shares: String,
    /// Disposal proceeds net of costs (GBP)
    pub proceeds_gbp: String,
    /// Allowable cost (GBP)
    pub cost_gbp: String,
    /// Gain, negative for a loss (GBP)
    pub gain_gbp: String,
}

impl From<&DisposalFragment> for DisposalCsvRecord {
    fn from(f: &DisposalFragment) -> Self {
        DisposalCsvRecord {
            disposal_id: f.disposal_id,
            date: f.sale_date.format("%Y-%m-%d").to_string(),
            tax_year: f.tax_year.display(),
            sale_id: f.sale_input_id,
            matching_type: f.matching_type.to_string(),
            lot_entry: f.lot_entry.map(|l| l.to_string()),
            matched_date: f.matched_date.map(|d| d.format("%Y-%m-%d").to_string()),
            shares: round_shares(f.matched_shares).normalize().to_string(),
            proceeds_gbp: money(f.proceeds_gbp),
            cost_gbp: money(f.cost_basis_gbp),
            gain_gbp: money(f.gain_gbp),
        }
    }
}

fn money(amount: Decimal) -> String {
    format!("{:.2}", round_money(amount))
}

pub fn write_disposals_csv<'a, W: Write>(
    writer: W,
    fragments: impl IntoIterator<Item = &'a DisposalFragment>,
) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for fragment in fragments {
        wtr.serialize(DisposalCsvRecord::from(fragment))?;
    }
    wtr.flush()?;
    Ok(())
}

/// One row of the pool download: the pool after each sale, then at year end
#[derive(Debug, Clone, Serialize, Deserialize, CsvSchema)]
pub struct PoolCsvRecord {
    /// Tax year, e.g. 2024/25
    #[csv(example = "2024/25")]
    pub tax_year: String,
    /// `sale` after a disposal, `year end` at 5 April
    #[csv(example = "sale")]
    pub point: String,
    /// Sale date, or the last day of the tax year
    #[csv(example = "2024-07-01")]
    pub date: String,
    /// Ledger id of the sale; empty at year end
    pub sale_id: Option<u64>,
    /// Shares held in the pool
    pub total_shares: String,
    /// Allowable cost of the pool (GBP)
    pub total_cost_gbp: String,
    /// Pool cost per share (GBP)
    pub avg_cost_gbp: String,
    /// Remaining shares by lot
    #[csv(example = "V:1=60;E:2=12")]
    pub lots: String,
}

impl PoolCsvRecord {
    fn new(
        tax_year: TaxYear,
        point: &str,
        date: NaiveDate,
        sale_id: Option<u64>,
        lots: &[PoolLotView],
    ) -> Self {
        let quantity: Decimal = lots.iter().map(|l| l.remaining).sum();
        let cost: Decimal = lots.iter().map(|l| l.remaining * l.per_share_cost).sum();
        let average = if quantity.is_zero() {
            Decimal::ZERO
        } else {
            cost / quantity
        };
        PoolCsvRecord {
            tax_year: tax_year.display(),
            point: point.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            sale_id,
            total_shares: shares(quantity),
            total_cost_gbp: money(cost),
            avg_cost_gbp: money(average),
            lots: lots
                .iter()
                .map(|l| format!("{}={}", l.entry, shares(l.remaining)))
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

fn shares(quantity: Decimal) -> String {
    round_shares(quantity).normalize().to_string()
}

pub fn write_pool_csv<W: Write>(
    writer: W,
    tax_year: TaxYear,
    sales: &[SaleSnapshot],
    year_end: Option<&YearEndPool>,
) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for sale in sales {
        wtr.serialize(PoolCsvRecord::new(
            tax_year,
            "sale",
            sale.sale_date,
            Some(sale.sale_id),
            &sale.pool_after,
        ))?;
    }
    if let Some(pool) = year_end {
        wtr.serialize(PoolCsvRecord::new(
            tax_year,
            "year end",
            tax_year.end_date(),
            None,
            &pool.lots,
        ))?;
    }
    wtr.flush()?;
    Ok(())
}

/// The year summary download, a single row
#[derive(Debug, Clone, Serialize, Deserialize, CsvSchema)]
pub struct SummaryCsvRecord {
    /// Tax year, e.g. 2024/25
    #[csv(example = "2024/25")]
    pub tax_year: String,
    /// 6 April (YYYY-MM-DD)
    pub tax_year_start: String,
    /// 5 April of the next year (YYYY-MM-DD)
    pub tax_year_end: String,
    /// Annual exempt amount applied (GBP)
    pub cgt_allowance_gbp: String,
    /// Losses brought forward (GBP)
    pub carry_forward_loss_gbp: String,
    /// Number of disposal fragments
    pub total_disposals: usize,
    pub total_proceeds: String,
    pub total_cost: String,
    pub total_gain: String,
    /// Gains less in-year losses
    pub net_gain: String,
    pub net_gain_after_losses: String,
    pub allowance_used: String,
    pub taxable_after_allowance: String,
    pub basic_taxable_gain: String,
    pub higher_taxable_gain: String,
    pub estimated_cgt: String,
    /// Estimated CGT as a percentage of the net gain after losses
    pub effective_rate_percent: String,
}

impl From<&CgtSummary> for SummaryCsvRecord {
    fn from(s: &CgtSummary) -> Self {
        SummaryCsvRecord {
            tax_year: s.tax_year.display(),
            tax_year_start: s.tax_year_start.format("%Y-%m-%d").to_string(),
            tax_year_end: s.tax_year_end.format("%Y-%m-%d").to_string(),
            cgt_allowance_gbp: money(s.cgt_allowance_gbp),
            carry_forward_loss_gbp: money(s.carry_forward_loss_gbp),
            total_disposals: s.total_disposals,
            total_proceeds: money(s.total_proceeds),
            total_cost: money(s.total_cost),
            total_gain: money(s.total_gain),
            net_gain: money(s.net_gain),
            net_gain_after_losses: money(s.net_gain_after_losses),
            allowance_used: money(s.allowance_used),
            taxable_after_allowance: money(s.taxable_after_allowance),
            basic_taxable_gain: money(s.basic_taxable_gain),
            higher_taxable_gain: money(s.higher_taxable_gain),
            estimated_cgt: money(s.estimated_cgt),
            effective_rate_percent: money(s.effective_rate_percent),
        }
    }
}

pub fn write_summary_csv<W: Write>(writer: W, summary: &CgtSummary) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.serialize(SummaryCsvRecord::from(summary))?;
    wtr.flush()?;
    Ok(())
}
