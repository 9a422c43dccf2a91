//! Response bodies. Amounts are rounded here and nowhere else.

use crate::core::matcher::{LotChange, PoolLotView};
use crate::core::rounding::{round_money, round_shares};
use crate::core::{
    CalculationStep, CgtSummary, DisposalFragment, FragmentTrace, LotSource, Sa108Export,
    SaleSnapshot, Settings, SettingKey, TaxYear, YearEndPool,
};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// GBP at 2dp
pub fn money(amount: Decimal) -> f64 {
    round_money(amount).to_f64().unwrap_or_default()
}

/// Share quantities at 6dp
pub fn shares(quantity: Decimal) -> f64 {
    round_shares(quantity).to_f64().unwrap_or_default()
}

fn exact(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionItem {
    pub disposal_id: u64,
    pub sale_date: NaiveDate,
    pub tax_year: TaxYear,
    pub sale_input_id: u64,
    /// Position within the sale, from 1
    pub fragment_index: u32,
    pub matched_shares: f64,
    pub matching_type: String,
    pub lot_entry: Option<String>,
    pub matched_date: Option<NaiveDate>,
    pub source: Option<LotSource>,
    pub rate_used: f64,
    pub avg_cost_gbp: f64,
    pub proceeds_gbp: f64,
    pub cost_basis_gbp: f64,
    pub gain_gbp: f64,
    pub pool_rsu_pct: f64,
    pub pool_espp_pct: f64,
    pub calculation_snippet: Vec<String>,
}

impl From<&DisposalFragment> for TransactionItem {
    fn from(f: &DisposalFragment) -> Self {
        TransactionItem {
            disposal_id: f.disposal_id,
            sale_date: f.sale_date,
            tax_year: f.tax_year,
            sale_input_id: f.sale_input_id,
            fragment_index: f.fragment_index + 1,
            matched_shares: shares(f.matched_shares),
            matching_type: f.matching_type.to_string(),
            lot_entry: f.lot_entry.map(|l| l.to_string()),
            matched_date: f.matched_date,
            source: f.source(),
            rate_used: exact(f.rate_used),
            avg_cost_gbp: money(f.avg_cost_gbp),
            proceeds_gbp: money(f.proceeds_gbp),
            cost_basis_gbp: money(f.cost_basis_gbp),
            gain_gbp: money(f.gain_gbp),
            pool_rsu_pct: money(f.pool_after.rsu_pct),
            pool_espp_pct: money(f.pool_after.espp_pct),
            calculation_snippet: f.trace.equations.iter().take(3).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsResponse {
    pub items: Vec<TransactionItem>,
    pub count: usize,
}

/// One fragment with its full derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetail {
    #[serde(flatten)]
    pub item: TransactionItem,
    pub calculation: FragmentTrace,
    pub steps: Vec<CalculationStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotView {
    pub entry: String,
    pub date: NaiveDate,
    pub source: LotSource,
    pub remaining: f64,
    pub per_share_cost_gbp: f64,
}

impl From<&PoolLotView> for LotView {
    fn from(lot: &PoolLotView) -> Self {
        LotView {
            entry: lot.entry.to_string(),
            date: lot.date,
            source: lot.source,
            remaining: shares(lot.remaining),
            per_share_cost_gbp: money(lot.per_share_cost),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotChangeView {
    pub matching: String,
    pub before: f64,
    pub after: f64,
    pub delta: f64,
}

impl From<&LotChange> for LotChangeView {
    fn from(c: &LotChange) -> Self {
        LotChangeView {
            matching: c.matching.to_string(),
            before: shares(c.before),
            after: shares(c.after),
            delta: shares(c.delta),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleSnapshotView {
    pub sale_id: u64,
    pub sale_date: NaiveDate,
    pub shares: f64,
    pub changed: BTreeMap<String, LotChangeView>,
    pub pool_after: Vec<LotView>,
    pub error: Option<String>,
}

impl From<&SaleSnapshot> for SaleSnapshotView {
    fn from(s: &SaleSnapshot) -> Self {
        SaleSnapshotView {
            sale_id: s.sale_id,
            sale_date: s.sale_date,
            shares: shares(s.shares),
            changed: s
                .changed
                .iter()
                .map(|(k, v)| (k.clone(), v.into()))
                .collect(),
            pool_after: s.pool_after.iter().map(LotView::from).collect(),
            error: s.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub tax_year: TaxYear,
    pub total_shares: f64,
    pub total_cost_gbp: f64,
    pub avg_cost_gbp: f64,
    pub sales: Vec<SaleSnapshotView>,
}

impl SnapshotResponse {
    pub fn new(tax_year: TaxYear, sales: &[SaleSnapshot], year_end: Option<&YearEndPool>) -> Self {
        let (quantity, cost) = year_end.map_or((Decimal::ZERO, Decimal::ZERO), |p| {
            (p.quantity, p.cost_gbp)
        });
        let average = if quantity.is_zero() {
            Decimal::ZERO
        } else {
            cost / quantity
        };
        SnapshotResponse {
            tax_year,
            total_shares: shares(quantity),
            total_cost_gbp: money(cost),
            avg_cost_gbp: money(average),
            sales: sales.iter().map(SaleSnapshotView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub tax_year: String,
    pub tax_year_start: NaiveDate,
    pub tax_year_end: NaiveDate,
    pub cgt_allowance_gbp: f64,
    pub carry_forward_loss_gbp: f64,
    pub carry_forward_used_gbp: f64,
    pub loss_carried_out_gbp: f64,
    pub net_gain_after_losses: f64,
    pub non_savings_income: f64,
    pub basic_threshold: f64,
    pub basic_band_available: f64,
    pub total_disposals: usize,
    pub total_proceeds: f64,
    pub total_cost: f64,
    pub total_gain: f64,
    pub pos: f64,
    /// Losses as a positive amount
    pub neg: f64,
    pub net_gain: f64,
    pub allowance_used: f64,
    pub taxable_after_allowance: f64,
    pub basic_taxable_gain: f64,
    pub higher_taxable_gain: f64,
    pub estimated_cgt: f64,
    pub effective_rate_percent: f64,
}

impl From<&CgtSummary> for SummaryResponse {
    fn from(s: &CgtSummary) -> Self {
        SummaryResponse {
            tax_year: s.tax_year.display(),
            tax_year_start: s.tax_year_start,
            tax_year_end: s.tax_year_end,
            cgt_allowance_gbp: money(s.cgt_allowance_gbp),
            carry_forward_loss_gbp: money(s.carry_forward_loss_gbp),
            carry_forward_used_gbp: money(s.carry_forward_used),
            loss_carried_out_gbp: money(s.loss_carried_out),
            net_gain_after_losses: money(s.net_gain_after_losses),
            non_savings_income: money(s.non_savings_income),
            basic_threshold: money(s.basic_threshold),
            basic_band_available: money(s.basic_band_available),
            total_disposals: s.total_disposals,
            total_proceeds: money(s.total_proceeds),
            total_cost: money(s.total_cost),
            total_gain: money(s.total_gain),
            pos: money(s.pos),
            neg: money(-s.neg),
            net_gain: money(s.net_gain),
            allowance_used: money(s.allowance_used),
            taxable_after_allowance: money(s.taxable_after_allowance),
            basic_taxable_gain: money(s.basic_taxable_gain),
            higher_taxable_gain: money(s.higher_taxable_gain),
            estimated_cgt: money(s.estimated_cgt),
            effective_rate_percent: money(s.effective_rate_percent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sa108DisposalView {
    pub date: NaiveDate,
    pub description: String,
    pub proceeds: f64,
    pub cost: f64,
    pub gain_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sa108Response {
    pub tax_year: String,
    pub tax_year_start: NaiveDate,
    pub tax_year_end: NaiveDate,
    pub total_proceeds: f64,
    pub total_costs: f64,
    pub total_gains: f64,
    pub total_losses: f64,
    pub net_gain: f64,
    pub allowable_loss: f64,
    pub carry_forward_loss_used: f64,
    pub net_gain_after_losses: f64,
    pub cgt_allowance_used: f64,
    pub chargeable_gain: f64,
    pub disposals: Vec<Sa108DisposalView>,
}

impl From<&Sa108Export> for Sa108Response {
    fn from(e: &Sa108Export) -> Self {
        Sa108Response {
            tax_year: e.tax_year.display(),
            tax_year_start: e.tax_year_start,
            tax_year_end: e.tax_year_end,
            total_proceeds: money(e.total_proceeds),
            total_costs: money(e.total_costs),
            total_gains: money(e.total_gains),
            total_losses: money(e.total_losses),
            net_gain: money(e.net_gain),
            allowable_loss: money(e.allowable_loss),
            carry_forward_loss_used: money(e.carry_forward_loss_used),
            net_gain_after_losses: money(e.net_gain_after_losses),
            cgt_allowance_used: money(e.cgt_allowance_used),
            chargeable_gain: money(e.chargeable_gain),
            disposals: e
                .disposals
                .iter()
                .map(|d| Sa108DisposalView {
                    date: d.date,
                    description: d.description.clone(),
                    proceeds: money(d.proceeds),
                    cost: money(d.cost),
                    gain_loss: money(d.gain_loss),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub values: BTreeMap<String, f64>,
    pub carry_forward_losses: BTreeMap<TaxYear, f64>,
}

impl From<&Settings> for SettingsResponse {
    fn from(s: &Settings) -> Self {
        SettingsResponse {
            values: SettingKey::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), money(s.get(*k))))
                .collect(),
            carry_forward_losses: s
                .carry_forward_losses
                .iter()
                .map(|(y, a)| (*y, money(*a)))
                .collect(),
        }
    }
}

// ---- request bodies ----

#[derive(Debug, Clone, Deserialize)]
pub struct RecalcRequest {
    pub tax_year: TaxYear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalcResponse {
    pub tax_year: TaxYear,
    pub ledger_version: u64,
    pub fragments: usize,
    pub net_gain: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingRequest {
    pub key: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarryForwardRequest {
    pub tax_year: TaxYear,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepsQuery {
    pub tax_year: Option<TaxYear>,
    pub sale_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionsQuery {
    pub tax_year: Option<TaxYear>,
    pub matching: Option<String>,
    /// Substring of the lot entry or sale id
    pub q: Option<String>,
    pub limit: Option<usize>,
}

impl TransactionsQuery {
    pub fn apply(&self, fragments: &[DisposalFragment]) -> Vec<TransactionItem> {
        let needle = self.q.as_deref().map(str::to_lowercase);
        fragments
            .iter()
            .filter(|f| self.tax_year.map_or(true, |y| f.tax_year == y))
            .filter(|f| {
                self.matching
                    .as_deref()
                    .map_or(true, |m| f.matching_type.display() == m)
            })
            .filter(|f| {
                needle.as_deref().map_or(true, |q| {
                    f.lot_entry
                        .is_some_and(|l| l.to_string().to_lowercase().contains(q))
                        || f.sale_input_id.to_string().contains(q)
                })
            })
            .take(self.limit.unwrap_or(usize::MAX))
            .map(TransactionItem::from)
            .collect()
    }
}
