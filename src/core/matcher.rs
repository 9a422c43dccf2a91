//! Disposal matching: same-day, thirty-day, then the Section 104 pool

use super::audit::{FragmentTrace, StepDraft};
use super::errors::{EngineError, ReconciliationError};
use super::ledger::{EntryId, Ledger, LedgerEntry, Sale};
use super::pool::{Acquisition, Composition, LotId, LotSource, PoolLot, SharePool};
use super::rates::ExchangeRateTable;
use super::uk::TaxYear;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Acquisitions this many days after a sale are matched to it
pub const THIRTY_DAY_WINDOW: i64 = 30;

/// Fragment ids of one sale occupy `sale_id * FRAGMENTS_PER_SALE + 1..`
pub const FRAGMENTS_PER_SALE: u64 = 1000;

/// Ledger-wide fragment id, stable while the sale's matching is unchanged
pub fn disposal_id(sale_id: EntryId, fragment_index: u32) -> u64 {
    sale_id * FRAGMENTS_PER_SALE + u64::from(fragment_index) + 1
}

/// Which HMRC identification rule produced a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "Same-day")]
    SameDay,
    #[serde(rename = "30-day")]
    ThirtyDay,
    #[serde(rename = "Section 104")]
    Section104,
}

impl MatchType {
    pub fn display(&self) -> &'static str {
        match self {
            MatchType::SameDay => "Same-day",
            MatchType::ThirtyDay => "30-day",
            MatchType::Section104 => "Section 104",
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// One slice of a sale matched against one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisposalFragment {
    /// See [`disposal_id`]
    pub disposal_id: u64,
    pub sale_input_id: EntryId,
    pub sale_date: NaiveDate,
    pub tax_year: TaxYear,
    pub fragment_index: u32,
    pub matching_type: MatchType,
    pub matched_shares: Decimal,
    /// Acquisition matched by the same-day and thirty-day rules; `None` for the pool
    pub lot_entry: Option<LotId>,
    pub matched_date: Option<NaiveDate>,
    /// USD/GBP rate used for the sale
    pub rate_used: Decimal,
    /// Per-share cost of the matched source
    pub avg_cost_gbp: Decimal,
    pub proceeds_gbp: Decimal,
    pub cost_basis_gbp: Decimal,
    pub gain_gbp: Decimal,
    /// Pool mix right after this fragment was matched
    pub pool_after: Composition,
    pub trace: FragmentTrace,
}

impl DisposalFragment {
    pub fn source(&self) -> Option<LotSource> {
        self.lot_entry.map(|l| l.source)
    }
}

/// Quantity movement on one lot caused by one sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotChange {
    pub matching: MatchType,
    pub before: Decimal,
    pub after: Decimal,
    pub delta: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLotView {
    pub entry: LotId,
    pub date: NaiveDate,
    pub source: LotSource,
    pub remaining: Decimal,
    pub per_share_cost: Decimal,
}

impl From<&PoolLot> for PoolLotView {
    fn from(lot: &PoolLot) -> Self {
        PoolLotView {
            entry: lot.lot,
            date: lot.date,
            source: lot.lot.source,
            remaining: lot.quantity,
            per_share_cost: lot.per_share_cost(),
        }
    }
}

/// Pool state right after a sale was matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleSnapshot {
    pub sale_id: EntryId,
    pub sale_date: NaiveDate,
    pub shares: Decimal,
    pub changed: BTreeMap<String, LotChange>,
    pub pool_after: Vec<PoolLotView>,
    pub error: Option<String>,
}

/// Pool at the close of a tax year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearEndPool {
    pub tax_year: TaxYear,
    pub quantity: Decimal,
    pub cost_gbp: Decimal,
    pub lots: Vec<PoolLotView>,
}

/// Why matching stopped. Every tax year ending on or after `affects_from`
/// is unreliable.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalcFailure {
    pub affects_from: NaiveDate,
    pub error: EngineError,
}

/// Everything one matching run derives from the ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub fragments: Vec<DisposalFragment>,
    pub snapshots: Vec<SaleSnapshot>,
    pub steps: Vec<StepDraft>,
    pub year_end: Vec<YearEndPool>,
    pub failure: Option<RecalcFailure>,
}

impl MatchOutcome {
    /// The error that invalidates `year`, if any
    pub fn failure_for(&self, year: TaxYear) -> Option<&EngineError> {
        self.failure
            .as_ref()
            .filter(|f| f.affects_from <= year.end_date())
            .map(|f| &f.error)
    }

    pub fn fragments_for(&self, year: TaxYear) -> impl Iterator<Item = &DisposalFragment> {
        self.fragments.iter().filter(move |f| f.tax_year == year)
    }

    pub fn snapshots_for(&self, year: TaxYear) -> impl Iterator<Item = &SaleSnapshot> {
        self.snapshots.iter().filter(move |s| year.contains(s.sale_date))
    }

    pub fn steps_for(&self, year: TaxYear) -> impl Iterator<Item = &StepDraft> {
        self.steps.iter().filter(move |s| year.contains(s.date))
    }

    pub fn year_end_for(&self, year: TaxYear) -> Option<&YearEndPool> {
        self.year_end.iter().find(|p| p.tax_year == year)
    }
}

/// A sale with its GBP figures resolved
struct PricedSale<'a> {
    sale: &'a Sale,
    rate: Decimal,
    /// shares x price / rate, before costs
    gross_gbp: Decimal,
}

/// Same-day or thirty-day match found before the pool replay
struct ShortMatch {
    acquisition: usize,
    quantity: Decimal,
    rule: MatchType,
    before: Decimal,
}

/// Match every sale in the ledger.
///
/// Same-day matches for all sales are taken first, then thirty-day matches
/// in sale order, then the ledger is replayed chronologically through the
/// pool. Replay stops at the first sale the pool cannot cover.
pub fn match_disposals(ledger: &Ledger, rates: &ExchangeRateTable) -> MatchOutcome {
    let mut ordered: Vec<&LedgerEntry> = ledger.entries().iter().collect();
    ordered.sort_by_key(|e| (e.date(), e.id()));

    let mut failure: Option<RecalcFailure> = None;
    let mut acquisitions: Vec<Acquisition> = Vec::new();
    for entry in &ordered {
        match Acquisition::from_entry(entry, rates) {
            Some(Ok(acq)) => acquisitions.push(acq),
            Some(Err(error)) => {
                // a later acquisition can still be matched to sales up to thirty days before it
                failure = Some(RecalcFailure {
                    affects_from: entry.date() - Duration::days(THIRTY_DAY_WINDOW),
                    error,
                });
                break;
            }
            None => {}
        }
    }

    let mut sales: Vec<PricedSale> = Vec::new();
    for entry in &ordered {
        let LedgerEntry::Sale(sale) = entry else {
            continue;
        };
        if failure.as_ref().is_some_and(|f| sale.date >= f.affects_from) {
            break;
        }
        match rates.resolve(sale.date, sale.exchange_rate) {
            Ok(rate) => sales.push(PricedSale {
                sale,
                rate,
                gross_gbp: sale.shares_sold * sale.sale_price_usd / rate,
            }),
            Err(error) => {
                failure = Some(RecalcFailure {
                    affects_from: sale.date,
                    error: error.into(),
                });
                break;
            }
        }
    }

    let short_matches = match_short_windows(&sales, &acquisitions);
    let mut outcome = replay(&sales, &acquisitions, short_matches, failure.as_ref());
    if outcome.failure.is_none() {
        outcome.failure = failure;
    }
    outcome
}

fn match_short_windows(sales: &[PricedSale], acquisitions: &[Acquisition]) -> Vec<Vec<ShortMatch>> {
    let mut available: Vec<Decimal> = acquisitions.iter().map(|a| a.quantity).collect();
    let mut matches: Vec<Vec<ShortMatch>> = sales.iter().map(|_| Vec::new()).collect();
    let mut unmatched: Vec<Decimal> = sales.iter().map(|s| s.sale.shares_sold).collect();

    // 1. Same-day rule
    for (s, priced) in sales.iter().enumerate() {
        let date = priced.sale.date;
        for (a, acq) in acquisitions.iter().enumerate() {
            if acq.date != date {
                continue;
            }
            take(&mut available, &mut unmatched[s], &mut matches[s], a, MatchType::SameDay);
        }
    }

    // 2. Thirty-day rule, earliest sale first, earliest acquisition first
    for (s, priced) in sales.iter().enumerate() {
        let date = priced.sale.date;
        let window_end = date + Duration::days(THIRTY_DAY_WINDOW);
        for (a, acq) in acquisitions.iter().enumerate() {
            if acq.date <= date || acq.date > window_end {
                continue;
            }
            take(&mut available, &mut unmatched[s], &mut matches[s], a, MatchType::ThirtyDay);
        }
    }

    matches
}

fn take(
    available: &mut [Decimal],
    unmatched: &mut Decimal,
    matches: &mut Vec<ShortMatch>,
    acquisition: usize,
    rule: MatchType,
) {
    if unmatched.is_zero() || available[acquisition].is_zero() {
        return;
    }
    let quantity = (*unmatched).min(available[acquisition]);
    matches.push(ShortMatch {
        acquisition,
        quantity,
        rule,
        before: available[acquisition],
    });
    available[acquisition] -= quantity;
    *unmatched -= quantity;
}

enum Event {
    Sale(usize),
    Acquisition(usize),
}

fn replay(
    sales: &[PricedSale],
    acquisitions: &[Acquisition],
    short_matches: Vec<Vec<ShortMatch>>,
    earlier_failure: Option<&RecalcFailure>,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    // what is left of each acquisition for the pool once short matches are taken
    let mut pool_entry: Vec<Decimal> = acquisitions.iter().map(|a| a.quantity).collect();
    for m in short_matches.iter().flatten() {
        pool_entry[m.acquisition] -= m.quantity;
    }

    // sales before acquisitions on the same day, then ledger order
    let mut events: Vec<(NaiveDate, u8, EntryId, Event)> = sales
        .iter()
        .enumerate()
        .map(|(i, s)| (s.sale.date, 0, s.sale.id, Event::Sale(i)))
        .chain(
            acquisitions
                .iter()
                .enumerate()
                .map(|(i, a)| (a.date, 1, a.lot.entry_id, Event::Acquisition(i))),
        )
        .collect();
    events.sort_by_key(|(date, rank, id, _)| (*date, *rank, *id));
    if let Some(f) = earlier_failure {
        events.retain(|(date, _, _, _)| *date < f.affects_from);
    }

    let mut pool = SharePool::new();
    let mut current_year: Option<TaxYear> = None;

    for (date, _, _, event) in events {
        let year = TaxYear::from_date(date);
        if let Some(open) = current_year.filter(|y| *y < year) {
            outcome.year_end.push(year_end(open, &pool));
        }
        current_year = Some(year);

        match event {
            Event::Acquisition(i) => {
                let acq = &acquisitions[i];
                let to_pool = pool_entry[i];
                pool.add(acq, to_pool);
                let mut message = format!(
                    "{} acquired {}: {} shares costing £{:.2} (£{:.4}/share)",
                    acq.lot,
                    acq.date,
                    acq.quantity.normalize(),
                    acq.cost_gbp,
                    acq.per_share_cost()
                );
                if to_pool < acq.quantity {
                    message.push_str(&format!(
                        "; {} already matched to earlier sales",
                        (acq.quantity - to_pool).normalize()
                    ));
                }
                message.push_str(&format!(
                    "; pool now {} shares at £{:.4} average",
                    pool.quantity().normalize(),
                    pool.average_cost()
                ));
                outcome.steps.push(StepDraft {
                    date,
                    sale_input_id: None,
                    message,
                });
            }
            Event::Sale(i) => {
                let priced = &sales[i];
                let result = match_sale(
                    priced,
                    acquisitions,
                    &short_matches[i],
                    &mut pool,
                    &mut outcome,
                );
                if let Err(error) = result {
                    log::warn!("Matching stopped at sale {}: {}", priced.sale.id, error);
                    outcome.steps.push(StepDraft {
                        date,
                        sale_input_id: Some(priced.sale.id),
                        message: format!("Matching failed: {}", error),
                    });
                    outcome.failure = Some(RecalcFailure {
                        affects_from: date,
                        error,
                    });
                    return outcome;
                }
            }
        }
    }

    if let Some(open) = current_year {
        outcome.year_end.push(year_end(open, &pool));
    }
    outcome
}

fn year_end(tax_year: TaxYear, pool: &SharePool) -> YearEndPool {
    YearEndPool {
        tax_year,
        quantity: pool.quantity(),
        cost_gbp: pool.cost(),
        lots: pool.lots().iter().map(PoolLotView::from).collect(),
    }
}

/// A matched slice before proceeds are allocated
struct Part {
    rule: MatchType,
    quantity: Decimal,
    cost: Decimal,
    lot: Option<LotId>,
    matched_date: Option<NaiveDate>,
    composition: Composition,
    acquisition: Option<usize>,
    pool_before: Option<(Decimal, Decimal)>,
}

fn match_sale(
    priced: &PricedSale,
    acquisitions: &[Acquisition],
    short: &[ShortMatch],
    pool: &mut SharePool,
    outcome: &mut MatchOutcome,
) -> Result<(), EngineError> {
    let sale = priced.sale;
    let net_proceeds = priced.gross_gbp - sale.incidental_costs_gbp;
    outcome.steps.push(StepDraft {
        date: sale.date,
        sale_input_id: Some(sale.id),
        message: format!(
            "Sale {} on {}: {} shares at ${} (rate {}), proceeds £{:.2} less £{:.2} costs = £{:.2}",
            sale.id,
            sale.date,
            sale.shares_sold.normalize(),
            sale.sale_price_usd.normalize(),
            priced.rate.normalize(),
            priced.gross_gbp,
            sale.incidental_costs_gbp,
            net_proceeds
        ),
    });

    let mut changed = BTreeMap::new();
    let mut parts: Vec<Part> = Vec::new();
    let composition = pool.composition();
    for m in short {
        let acq = &acquisitions[m.acquisition];
        changed.insert(
            acq.lot.to_string(),
            LotChange {
                matching: m.rule,
                before: m.before,
                after: m.before - m.quantity,
                delta: -m.quantity,
            },
        );
        parts.push(Part {
            rule: m.rule,
            quantity: m.quantity,
            cost: acq.cost_of(m.quantity),
            lot: Some(acq.lot),
            matched_date: Some(acq.date),
            composition,
            acquisition: Some(m.acquisition),
            pool_before: None,
        });
    }

    let short_total: Decimal = short.iter().map(|m| m.quantity).sum();
    let remainder = sale.shares_sold - short_total;
    if remainder > Decimal::ZERO {
        let before: Vec<PoolLot> = pool.lots().to_vec();
        let pool_before = (pool.quantity(), pool.cost());
        let draw = pool.draw(remainder).map_err(|shortfall| {
            ReconciliationError::PoolExhausted {
                sale_id: sale.id,
                date: sale.date,
                requested: shortfall.requested,
                available: shortfall.available,
            }
        })?;
        for (lot, quantity, _) in &draw.per_lot {
            let prior = before
                .iter()
                .find(|l| l.lot == *lot)
                .map(|l| l.quantity)
                .unwrap_or_default();
            changed.insert(
                lot.to_string(),
                LotChange {
                    matching: MatchType::Section104,
                    before: prior,
                    after: prior - *quantity,
                    delta: -*quantity,
                },
            );
        }
        parts.push(Part {
            rule: MatchType::Section104,
            quantity: draw.quantity,
            cost: draw.cost_gbp,
            lot: None,
            matched_date: None,
            composition: pool.composition(),
            acquisition: None,
            pool_before: Some(pool_before),
        });
    }

    let matched: Decimal = parts.iter().map(|p| p.quantity).sum();
    if matched != sale.shares_sold {
        return Err(ReconciliationError::FragmentMismatch {
            sale_id: sale.id,
            matched,
            sold: sale.shares_sold,
        }
        .into());
    }
    if parts.len() as u64 >= FRAGMENTS_PER_SALE {
        return Err(ReconciliationError::TooManyFragments {
            sale_id: sale.id,
            fragments: parts.len(),
        }
        .into());
    }

    let last = parts.len().saturating_sub(1);
    let mut allocated = Decimal::ZERO;
    for (index, part) in parts.iter().enumerate() {
        let proceeds = if index == last {
            net_proceeds - allocated
        } else {
            fragment_proceeds(priced, part.quantity)
        };
        allocated += proceeds;
        let fragment = build_fragment(
            disposal_id(sale.id, index as u32),
            index as u32,
            priced,
            part,
            proceeds,
            part.acquisition.map(|a| &acquisitions[a]),
        );

        outcome.steps.push(StepDraft {
            date: sale.date,
            sale_input_id: Some(sale.id),
            message: match (part.rule, part.lot) {
                (MatchType::Section104, _) => format!(
                    "Section 104: {} shares at pool average £{:.4}, cost £{:.2}, gain £{:.2}; pool now {} shares costing £{:.2}",
                    part.quantity.normalize(),
                    fragment.avg_cost_gbp,
                    fragment.cost_basis_gbp,
                    fragment.gain_gbp,
                    pool.quantity().normalize(),
                    pool.cost()
                ),
                (rule, lot) => format!(
                    "{}: {} shares matched against {} acquired {} at £{:.4}/share, cost £{:.2}, gain £{:.2}",
                    rule,
                    part.quantity.normalize(),
                    lot.map(|l| l.to_string()).unwrap_or_default(),
                    part.matched_date.map(|d| d.to_string()).unwrap_or_default(),
                    fragment.avg_cost_gbp,
                    fragment.cost_basis_gbp,
                    fragment.gain_gbp
                ),
            },
        });
        log::debug!(
            "Sale {} fragment {}: {} {} shares, proceeds={}, cost={}, gain={}",
            sale.id,
            index,
            part.rule,
            part.quantity,
            fragment.proceeds_gbp,
            fragment.cost_basis_gbp,
            fragment.gain_gbp
        );
        outcome.fragments.push(fragment);
    }

    outcome.snapshots.push(SaleSnapshot {
        sale_id: sale.id,
        sale_date: sale.date,
        shares: sale.shares_sold,
        changed,
        pool_after: pool.lots().iter().map(PoolLotView::from).collect(),
        error: None,
    });
    Ok(())
}

/// Pro-rata proceeds of `quantity` shares, net of the same share of costs
fn fragment_proceeds(priced: &PricedSale, quantity: Decimal) -> Decimal {
    let sale = priced.sale;
    priced.gross_gbp * quantity / sale.shares_sold
        - sale.incidental_costs_gbp * quantity / sale.shares_sold
}

fn build_fragment(
    disposal_id: u64,
    fragment_index: u32,
    priced: &PricedSale,
    part: &Part,
    proceeds: Decimal,
    acquisition: Option<&Acquisition>,
) -> DisposalFragment {
    let sale = priced.sale;
    let per_share_proceeds = sale.sale_price_usd / priced.rate;
    let per_share_cost = part.cost / part.quantity;
    let incidental_share = sale.incidental_costs_gbp * part.quantity / sale.shares_sold;
    let gain = proceeds - part.cost;

    let mut trace = FragmentTrace::default();
    trace.input("sale_date", sale.date);
    trace.input("sale_shares", sale.shares_sold.normalize());
    trace.input("matching_type", part.rule);
    if let Some(lot) = part.lot {
        trace.input("lot_entry", lot);
    }
    if let Some(date) = part.matched_date {
        trace.input("matched_date", date);
    }

    trace.equation(format!(
        "Proceeds per share (GBP) = ${} / {} = £{:.4}",
        sale.sale_price_usd.normalize(),
        priced.rate.normalize(),
        per_share_proceeds
    ));
    trace.equation(format!(
        "Gross proceeds = {} x £{:.4} = £{:.2}",
        part.quantity.normalize(),
        per_share_proceeds,
        per_share_proceeds * part.quantity
    ));
    if !sale.incidental_costs_gbp.is_zero() {
        trace.equation(format!(
            "Incidental costs share = £{:.2} x {} / {} = £{:.2}",
            sale.incidental_costs_gbp,
            part.quantity.normalize(),
            sale.shares_sold.normalize(),
            incidental_share
        ));
    }
    trace.equation(format!("Total proceeds = £{:.2}", proceeds));
    match (acquisition, part.pool_before) {
        (Some(acq), _) => {
            trace.equation(format!(
                "Cost per share (GBP) = (${:.2} / {} + £{:.2} + £{:.2}) / {} = £{:.4}",
                acq.usd_total,
                acq.rate_used.normalize(),
                acq.paye_gbp,
                acq.incidental_gbp,
                acq.quantity.normalize(),
                per_share_cost
            ));
            trace.value("lot_usd_total", acq.usd_total);
            trace.value("lot_rate_used", acq.rate_used);
            trace.value("lot_paye_gbp", acq.paye_gbp);
        }
        (None, Some((quantity, cost))) => {
            trace.equation(format!(
                "Pool average cost = £{:.2} / {} = £{:.4}",
                cost,
                quantity.normalize(),
                per_share_cost
            ));
            trace.value("pool_quantity_before", quantity);
            trace.value("pool_cost_before", cost);
        }
        (None, None) => {}
    }
    trace.equation(format!(
        "Total cost = {} x £{:.4} = £{:.2}",
        part.quantity.normalize(),
        per_share_cost,
        part.cost
    ));
    trace.equation(format!(
        "Gain = £{:.2} - £{:.2} = £{:.2}",
        proceeds, part.cost, gain
    ));

    trace.value("sale_price_usd", sale.sale_price_usd);
    trace.value("rate_for_sale", priced.rate);
    trace.value("proceeds_per_share_gbp", per_share_proceeds);
    trace.value("proceeds_total_gbp", proceeds);
    trace.value("incidental_share_gbp", incidental_share);
    trace.value("cost_per_share_gbp", per_share_cost);
    trace.value("cost_total_gbp", part.cost);
    trace.value("gain_gbp", gain);
    trace.value("shares_matched", part.quantity);
    trace.value("fragment_index", Decimal::from(fragment_index));

    DisposalFragment {
        disposal_id,
        sale_input_id: sale.id,
        sale_date: sale.date,
        tax_year: TaxYear::from_date(sale.date),
        fragment_index,
        matching_type: part.rule,
        matched_shares: part.quantity,
        lot_entry: part.lot,
        matched_date: part.matched_date,
        rate_used: priced.rate,
        avg_cost_gbp: per_share_cost,
        proceeds_gbp: proceeds,
        cost_basis_gbp: part.cost,
        gain_gbp: gain,
        pool_after: part.composition,
        trace,
    }
}
