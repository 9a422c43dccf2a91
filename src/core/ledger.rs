//! Raw share transactions: RSU vestings, ESPP purchases and sales

use super::errors::{EngineError, ValidationError};
use super::uk::TaxYear;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ledger ids come from one counter shared by every kind of entry, so id order is
/// insertion order.
pub type EntryId = u64;

/// Largest discount (percent of market value) a qualifying ESPP may give
pub const MAX_QUALIFYING_DISCOUNT: Decimal = dec!(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Vesting,
    Espp,
    Sale,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryKind::Vesting => "vesting",
            EntryKind::Espp => "ESPP purchase",
            EntryKind::Sale => "sale",
        };
        write!(f, "{}", s)
    }
}

/// RSU vesting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Vesting {
    /// Assigned by the ledger; ignored on input
    #[serde(default)]
    pub id: EntryId,
    pub date: NaiveDate,
    #[schemars(with = "f64")]
    pub shares_vested: Decimal,
    /// Market value per share at vest
    #[schemars(with = "f64")]
    pub price_usd: Decimal,
    /// USD per GBP; looked up from the rate table when absent
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub exchange_rate: Option<Decimal>,
    /// Income tax paid through PAYE on the vest
    #[serde(default)]
    #[schemars(with = "f64")]
    pub tax_paid_gbp: Decimal,
    #[serde(default)]
    #[schemars(with = "f64")]
    pub incidental_costs_gbp: Decimal,
    /// Shares withheld (sold to cover) that never enter the pool
    #[serde(default)]
    #[schemars(with = "f64")]
    pub shares_sold: Decimal,
}

impl Vesting {
    pub fn net_shares(&self) -> Decimal {
        self.shares_vested - self.shares_sold
    }

    fn validate(&self) -> Result<(), ValidationError> {
        positive("shares_vested", self.shares_vested)?;
        non_negative("price_usd", self.price_usd)?;
        non_negative("tax_paid_gbp", self.tax_paid_gbp)?;
        non_negative("incidental_costs_gbp", self.incidental_costs_gbp)?;
        non_negative("shares_sold", self.shares_sold)?;
        explicit_rate(self.exchange_rate)?;
        if self.net_shares() <= Decimal::ZERO {
            return Err(ValidationError::WithheldNotBelowVested {
                vested: self.shares_vested,
                withheld: self.shares_sold,
            });
        }
        Ok(())
    }
}

/// ESPP purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EsppPurchase {
    #[serde(default)]
    pub id: EntryId,
    pub date: NaiveDate,
    #[schemars(with = "f64")]
    pub shares_retained: Decimal,
    #[schemars(with = "f64")]
    pub purchase_price_usd: Decimal,
    #[schemars(with = "f64")]
    pub market_price_usd: Decimal,
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub exchange_rate: Option<Decimal>,
    /// Discount was taxed as employment income, PAYE joins the cost
    #[serde(default = "default_true")]
    pub discount_taxed_paye: bool,
    #[serde(default = "default_true")]
    pub qualifying: bool,
    #[serde(default)]
    #[schemars(with = "f64")]
    pub paye_tax_gbp: Decimal,
    #[serde(default)]
    #[schemars(with = "f64")]
    pub incidental_costs_gbp: Decimal,
}

fn default_true() -> bool {
    true
}

impl EsppPurchase {
    /// Discount as a percentage of market value
    pub fn discount_percent(&self) -> Decimal {
        if self.market_price_usd.is_zero() {
            return Decimal::ZERO;
        }
        (self.market_price_usd - self.purchase_price_usd) / self.market_price_usd * dec!(100)
    }

    /// Non-qualifying purchases are costed at market value
    pub fn effective_price_usd(&self) -> Decimal {
        if self.qualifying {
            self.purchase_price_usd
        } else {
            self.market_price_usd
        }
    }

    /// PAYE forms part of the cost only when the discount was taxed through payroll
    pub fn allowable_paye_gbp(&self) -> Decimal {
        if self.discount_taxed_paye {
            self.paye_tax_gbp
        } else {
            Decimal::ZERO
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        positive("shares_retained", self.shares_retained)?;
        positive("market_price_usd", self.market_price_usd)?;
        non_negative("purchase_price_usd", self.purchase_price_usd)?;
        non_negative("paye_tax_gbp", self.paye_tax_gbp)?;
        non_negative("incidental_costs_gbp", self.incidental_costs_gbp)?;
        explicit_rate(self.exchange_rate)?;
        if self.purchase_price_usd > self.market_price_usd {
            return Err(ValidationError::PurchaseAboveMarket {
                purchase: self.purchase_price_usd,
                market: self.market_price_usd,
            });
        }
        let discount = self.discount_percent();
        if self.qualifying && discount > MAX_QUALIFYING_DISCOUNT {
            return Err(ValidationError::DiscountTooLarge { discount });
        }
        Ok(())
    }
}

/// Open-market sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Sale {
    #[serde(default)]
    pub id: EntryId,
    pub date: NaiveDate,
    #[schemars(with = "f64")]
    pub shares_sold: Decimal,
    #[schemars(with = "f64")]
    pub sale_price_usd: Decimal,
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub exchange_rate: Option<Decimal>,
    /// Dealing fees, spread over the sale's fragments pro rata
    #[serde(default)]
    #[schemars(with = "f64")]
    pub incidental_costs_gbp: Decimal,
}

impl Sale {
    fn validate(&self) -> Result<(), ValidationError> {
        positive("shares_sold", self.shares_sold)?;
        non_negative("sale_price_usd", self.sale_price_usd)?;
        non_negative("incidental_costs_gbp", self.incidental_costs_gbp)?;
        explicit_rate(self.exchange_rate)
    }
}

/// One ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Vesting(Vesting),
    Espp(EsppPurchase),
    Sale(Sale),
}

impl LedgerEntry {
    pub fn id(&self) -> EntryId {
        match self {
            LedgerEntry::Vesting(v) => v.id,
            LedgerEntry::Espp(e) => e.id,
            LedgerEntry::Sale(s) => s.id,
        }
    }

    fn set_id(&mut self, id: EntryId) {
        match self {
            LedgerEntry::Vesting(v) => v.id = id,
            LedgerEntry::Espp(e) => e.id = id,
            LedgerEntry::Sale(s) => s.id = id,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            LedgerEntry::Vesting(_) => EntryKind::Vesting,
            LedgerEntry::Espp(_) => EntryKind::Espp,
            LedgerEntry::Sale(_) => EntryKind::Sale,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            LedgerEntry::Vesting(v) => v.date,
            LedgerEntry::Espp(e) => e.date,
            LedgerEntry::Sale(s) => s.date,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            LedgerEntry::Vesting(v) => v.validate(),
            LedgerEntry::Espp(e) => e.validate(),
            LedgerEntry::Sale(s) => s.validate(),
        }
    }
}

/// Result of a successful ledger change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub kind: EntryKind,
    pub id: EntryId,
    pub version: u64,
    /// Earliest date whose derived state may have changed
    pub earliest_date: NaiveDate,
}

/// The source of truth. Every change bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    version: u64,
    next_id: EntryId,
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, kind: EntryKind, id: EntryId) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| e.kind() == kind && e.id() == id)
    }

    pub fn vestings(&self) -> impl Iterator<Item = &Vesting> {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::Vesting(v) => Some(v),
            _ => None,
        })
    }

    pub fn espp_purchases(&self) -> impl Iterator<Item = &EsppPurchase> {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::Espp(p) => Some(p),
            _ => None,
        })
    }

    pub fn sales(&self) -> impl Iterator<Item = &Sale> {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::Sale(s) => Some(s),
            _ => None,
        })
    }

    /// Tax years holding at least one sale
    pub fn sale_years(&self) -> BTreeSet<TaxYear> {
        self.sales().map(|s| TaxYear::from_date(s.date)).collect()
    }

    /// Validate and append; the entry's id is replaced by a fresh one
    pub fn insert(&mut self, mut entry: LedgerEntry) -> Result<Mutation, ValidationError> {
        entry.validate()?;
        self.next_id += 1;
        entry.set_id(self.next_id);
        let mutation = self.bump(&entry, entry.date());
        log::debug!("Ledger v{}: added {} {}", self.version, entry.kind(), entry.id());
        self.entries.push(entry);
        Ok(mutation)
    }

    /// Replace an existing entry in place, keeping its id and position
    pub fn update(&mut self, id: EntryId, mut entry: LedgerEntry) -> Result<Mutation, EngineError> {
        entry.validate()?;
        let kind = entry.kind();
        let idx = self.position(kind, id)?;
        entry.set_id(id);
        let earliest = self.entries[idx].date().min(entry.date());
        let mutation = self.bump(&entry, earliest);
        log::debug!("Ledger v{}: updated {} {}", self.version, kind, id);
        self.entries[idx] = entry;
        Ok(mutation)
    }

    pub fn remove(&mut self, kind: EntryKind, id: EntryId) -> Result<Mutation, EngineError> {
        let idx = self.position(kind, id)?;
        let entry = self.entries.remove(idx);
        let mutation = self.bump(&entry, entry.date());
        log::debug!("Ledger v{}: removed {} {}", self.version, kind, id);
        Ok(mutation)
    }

    fn position(&self, kind: EntryKind, id: EntryId) -> Result<usize, EngineError> {
        self.entries
            .iter()
            .position(|e| e.kind() == kind && e.id() == id)
            .ok_or(EngineError::EntryNotFound { kind, id })
    }

    fn bump(&mut self, entry: &LedgerEntry, earliest_date: NaiveDate) -> Mutation {
        self.version += 1;
        Mutation {
            kind: entry.kind(),
            id: entry.id(),
            version: self.version,
            earliest_date,
        }
    }
}

fn positive(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::NotPositive { field, value });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value < Decimal::ZERO {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

fn explicit_rate(rate: Option<Decimal>) -> Result<(), ValidationError> {
    match rate {
        Some(r) => positive("exchange_rate", r),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn vesting(d: &str, shares: Decimal, withheld: Decimal) -> LedgerEntry {
        LedgerEntry::Vesting(Vesting {
            id: 0,
            date: date(d),
            shares_vested: shares,
            price_usd: dec!(50),
            exchange_rate: Some(dec!(1.25)),
            tax_paid_gbp: Decimal::ZERO,
            incidental_costs_gbp: Decimal::ZERO,
            shares_sold: withheld,
        })
    }

    fn espp(purchase: Decimal, market: Decimal, qualifying: bool) -> EsppPurchase {
        EsppPurchase {
            id: 0,
            date: date("2024-05-01"),
            shares_retained: dec!(10),
            purchase_price_usd: purchase,
            market_price_usd: market,
            exchange_rate: None,
            discount_taxed_paye: false,
            qualifying,
            paye_tax_gbp: Decimal::ZERO,
            incidental_costs_gbp: Decimal::ZERO,
        }
    }

    fn sale(d: &str, shares: Decimal) -> LedgerEntry {
        LedgerEntry::Sale(Sale {
            id: 0,
            date: date(d),
            shares_sold: shares,
            sale_price_usd: dec!(60),
            exchange_rate: None,
            incidental_costs_gbp: Decimal::ZERO,
        })
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let mut ledger = Ledger::new();
        let a = ledger.insert(vesting("2024-05-01", dec!(100), dec!(0))).unwrap();
        let b = ledger.insert(sale("2024-06-01", dec!(10))).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(b.version, 2);
        assert_eq!(ledger.sales().count(), 1);
        assert_eq!(ledger.vestings().count(), 1);
    }

    #[test]
    fn withheld_shares_must_leave_a_positive_lot() {
        let mut ledger = Ledger::new();
        let err = ledger
            .insert(vesting("2024-05-01", dec!(100), dec!(100)))
            .unwrap_err();
        assert!(matches!(err, ValidationError::WithheldNotBelowVested { .. }));
        assert!(ledger.entries().is_empty());
        assert_eq!(ledger.version(), 0);
    }

    #[test]
    fn rejects_zero_quantity_sale() {
        let mut ledger = Ledger::new();
        let err = ledger.insert(sale("2024-06-01", dec!(0))).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NotPositive {
                field: "shares_sold",
                value: dec!(0)
            }
        );
    }

    #[test]
    fn espp_discount_boundary_is_inclusive() {
        let at_limit = espp(dec!(8.50), dec!(10.00), true);
        assert_eq!(at_limit.discount_percent(), dec!(15));
        assert!(at_limit.validate().is_ok());

        let over = espp(dec!(8.49999), dec!(10.00), true);
        assert_eq!(over.discount_percent(), dec!(15.0001));
        assert!(matches!(
            over.validate(),
            Err(ValidationError::DiscountTooLarge { .. })
        ));

        // the cap only binds qualifying plans
        let non_qualifying = espp(dec!(8.49999), dec!(10.00), false);
        assert!(non_qualifying.validate().is_ok());
    }

    #[test]
    fn non_qualifying_espp_costed_at_market() {
        assert_eq!(espp(dec!(8.5), dec!(10), true).effective_price_usd(), dec!(8.5));
        assert_eq!(espp(dec!(8.5), dec!(10), false).effective_price_usd(), dec!(10));
    }

    #[test]
    fn paye_only_counts_when_taxed_through_payroll() {
        let mut p = espp(dec!(8.5), dec!(10), true);
        p.paye_tax_gbp = dec!(12);
        assert_eq!(p.allowable_paye_gbp(), Decimal::ZERO);
        p.discount_taxed_paye = true;
        assert_eq!(p.allowable_paye_gbp(), dec!(12));
    }

    #[test]
    fn posted_purchase_defaults_to_paye_taxed_discount() {
        let p: EsppPurchase = serde_json::from_str(
            r#"{"date":"2024-06-28","shares_retained":20,"purchase_price_usd":42.5,
                "market_price_usd":50,"paye_tax_gbp":30}"#,
        )
        .unwrap();
        assert!(p.discount_taxed_paye);
        assert!(p.qualifying);
        assert_eq!(p.allowable_paye_gbp(), dec!(30));
    }

    #[test]
    fn update_keeps_id_and_reports_earliest_date() {
        let mut ledger = Ledger::new();
        let m = ledger.insert(sale("2024-06-01", dec!(10))).unwrap();
        let updated = ledger.update(m.id, sale("2024-05-20", dec!(12))).unwrap();
        assert_eq!(updated.id, m.id);
        assert_eq!(updated.earliest_date, date("2024-05-20"));
        match ledger.get(EntryKind::Sale, m.id).unwrap() {
            LedgerEntry::Sale(s) => assert_eq!(s.shares_sold, dec!(12)),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn update_and_remove_unknown_entry() {
        let mut ledger = Ledger::new();
        ledger.insert(sale("2024-06-01", dec!(10))).unwrap();
        assert_eq!(
            ledger.remove(EntryKind::Vesting, 1),
            Err(EngineError::EntryNotFound {
                kind: EntryKind::Vesting,
                id: 1
            })
        );
        assert!(ledger.update(9, sale("2024-06-01", dec!(1))).is_err());
        assert!(ledger.remove(EntryKind::Sale, 1).is_ok());
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn entries_deserialize_as_tagged_union() {
        let json = r#"{"kind":"sale","date":"2024-06-01","shares_sold":"10","sale_price_usd":60.5}"#;
        let entry: LedgerEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.kind(), EntryKind::Sale);
        assert_eq!(entry.id(), 0);
    }
}
