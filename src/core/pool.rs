//! Section 104 share pool

use super::errors::{EngineError, ValidationError};
use super::ledger::{EntryId, EsppPurchase, Ledger, LedgerEntry, Vesting};
use super::rates::ExchangeRateTable;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which scheme an acquisition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LotSource {
    #[serde(rename = "RSU")]
    Rsu,
    #[serde(rename = "ESPP")]
    Espp,
}

impl LotSource {
    pub fn display(&self) -> &'static str {
        match self {
            LotSource::Rsu => "RSU",
            LotSource::Espp => "ESPP",
        }
    }
}

/// Identity of an acquisition lot, shown as "V:12" or "E:7"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LotId {
    pub source: LotSource,
    pub entry_id: EntryId,
}

impl std::fmt::Display for LotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.source {
            LotSource::Rsu => "V",
            LotSource::Espp => "E",
        };
        write!(f, "{}:{}", prefix, self.entry_id)
    }
}

/// An acquisition costed in GBP, before any matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub lot: LotId,
    pub date: NaiveDate,
    pub quantity: Decimal,
    /// Total allowable cost of `quantity` shares
    pub cost_gbp: Decimal,
    pub rate_used: Decimal,
    /// Dollar value the cost was converted from
    pub usd_total: Decimal,
    /// Income tax added to the cost
    pub paye_gbp: Decimal,
    pub incidental_gbp: Decimal,
}

impl Acquisition {
    pub fn from_vesting(v: &Vesting, rates: &ExchangeRateTable) -> Result<Self, EngineError> {
        let lot = LotId {
            source: LotSource::Rsu,
            entry_id: v.id,
        };
        let quantity = v.net_shares();
        if quantity <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveLot {
                lot: lot.to_string(),
                quantity,
            }
            .into());
        }
        let rate = rates.resolve(v.date, v.exchange_rate)?;
        // withheld shares were still acquired, so the whole vest value is cost of the net lot
        let usd_total = v.shares_vested * v.price_usd;
        let cost_gbp = usd_total / rate + v.tax_paid_gbp + v.incidental_costs_gbp;
        Ok(Acquisition {
            lot,
            date: v.date,
            quantity,
            cost_gbp,
            rate_used: rate,
            usd_total,
            paye_gbp: v.tax_paid_gbp,
            incidental_gbp: v.incidental_costs_gbp,
        })
    }

    pub fn from_espp(p: &EsppPurchase, rates: &ExchangeRateTable) -> Result<Self, EngineError> {
        let lot = LotId {
            source: LotSource::Espp,
            entry_id: p.id,
        };
        if p.shares_retained <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveLot {
                lot: lot.to_string(),
                quantity: p.shares_retained,
            }
            .into());
        }
        let rate = rates.resolve(p.date, p.exchange_rate)?;
        let usd_total = p.shares_retained * p.effective_price_usd();
        let paye = p.allowable_paye_gbp();
        let cost_gbp = usd_total / rate + paye + p.incidental_costs_gbp;
        Ok(Acquisition {
            lot,
            date: p.date,
            quantity: p.shares_retained,
            cost_gbp,
            rate_used: rate,
            usd_total,
            paye_gbp: paye,
            incidental_gbp: p.incidental_costs_gbp,
        })
    }

    /// `None` for sales
    pub fn from_entry(
        entry: &LedgerEntry,
        rates: &ExchangeRateTable,
    ) -> Option<Result<Self, EngineError>> {
        match entry {
            LedgerEntry::Vesting(v) => Some(Self::from_vesting(v, rates)),
            LedgerEntry::Espp(p) => Some(Self::from_espp(p, rates)),
            LedgerEntry::Sale(_) => None,
        }
    }

    pub fn per_share_cost(&self) -> Decimal {
        self.cost_gbp / self.quantity
    }

    /// Cost of part of this acquisition
    pub fn cost_of(&self, quantity: Decimal) -> Decimal {
        if quantity == self.quantity {
            self.cost_gbp
        } else {
            self.cost_gbp * quantity / self.quantity
        }
    }
}

/// All acquisitions dated on or before `cutoff`, in replay order
/// (date, then ledger insertion order)
pub fn acquisitions(
    ledger: &Ledger,
    rates: &ExchangeRateTable,
    cutoff: Option<NaiveDate>,
) -> Result<Vec<Acquisition>, EngineError> {
    let mut entries: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| cutoff.is_none_or(|c| e.date() <= c))
        .collect();
    entries.sort_by_key(|e| (e.date(), e.id()));
    entries
        .into_iter()
        .filter_map(|e| Acquisition::from_entry(e, rates))
        .collect()
}

/// Remaining holding from one acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLot {
    pub lot: LotId,
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub cost_gbp: Decimal,
}

impl PoolLot {
    pub fn per_share_cost(&self) -> Decimal {
        if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.cost_gbp / self.quantity
        }
    }
}

/// Shares taken out of the pool by one disposal
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDraw {
    pub quantity: Decimal,
    pub cost_gbp: Decimal,
    /// (lot, quantity, cost) taken from each lot
    pub per_lot: Vec<(LotId, Decimal, Decimal)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShortfall {
    pub requested: Decimal,
    pub available: Decimal,
}

/// Share of the pool by source, in percent of quantity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub rsu_pct: Decimal,
    pub espp_pct: Decimal,
}

/// Section 104 holding. Lots keep their identity so the pool can report where
/// its shares came from, but every draw is at the pool average and takes the
/// same fraction from each lot, leaving the average and the mix unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharePool {
    lots: Vec<PoolLot>,
}

impl SharePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add part (or all) of an acquisition at its own per-share cost
    pub fn add(&mut self, acquisition: &Acquisition, quantity: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let cost = acquisition.cost_of(quantity);
        self.lots.push(PoolLot {
            lot: acquisition.lot,
            date: acquisition.date,
            quantity,
            cost_gbp: cost,
        });
        log::debug!(
            "Pool ADD {}: qty={}, cost={}. New total: qty={}, cost={}",
            acquisition.lot,
            quantity,
            cost,
            self.quantity(),
            self.cost()
        );
    }

    pub fn quantity(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    pub fn cost(&self) -> Decimal {
        self.lots.iter().map(|l| l.cost_gbp).sum()
    }

    pub fn average_cost(&self) -> Decimal {
        let quantity = self.quantity();
        if quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.cost() / quantity
        }
    }

    pub fn lots(&self) -> &[PoolLot] {
        &self.lots
    }

    pub fn lot(&self, id: LotId) -> Option<&PoolLot> {
        self.lots.iter().find(|l| l.lot == id)
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    /// Take `quantity` shares at the pool average. The last lot absorbs any
    /// rounding so the draw's quantity and cost are exact.
    pub fn draw(&mut self, quantity: Decimal) -> Result<PoolDraw, PoolShortfall> {
        let available = self.quantity();
        if quantity > available {
            return Err(PoolShortfall {
                requested: quantity,
                available,
            });
        }

        if quantity == available {
            let cost = self.cost();
            let per_lot = self
                .lots
                .drain(..)
                .map(|l| (l.lot, l.quantity, l.cost_gbp))
                .collect();
            log::debug!("Pool REMOVE ALL: qty={}, cost={}", quantity, cost);
            return Ok(PoolDraw {
                quantity,
                cost_gbp: cost,
                per_lot,
            });
        }

        let fraction = quantity / available;
        let total_cost = self.cost() * fraction;
        let last = self.lots.len() - 1;
        let mut taken_qty = Decimal::ZERO;
        let mut taken_cost = Decimal::ZERO;
        let mut per_lot = Vec::with_capacity(self.lots.len());
        for (i, lot) in self.lots.iter_mut().enumerate() {
            let (q, c) = if i == last {
                (quantity - taken_qty, total_cost - taken_cost)
            } else {
                (lot.quantity * fraction, lot.cost_gbp * fraction)
            };
            lot.quantity -= q;
            lot.cost_gbp -= c;
            taken_qty += q;
            taken_cost += c;
            per_lot.push((lot.lot, q, c));
        }
        self.lots.retain(|l| l.quantity > Decimal::ZERO);

        log::debug!(
            "Pool REMOVE: qty={}, cost={}. Remaining: qty={}, cost={}",
            quantity,
            total_cost,
            self.quantity(),
            self.cost()
        );
        Ok(PoolDraw {
            quantity,
            cost_gbp: total_cost,
            per_lot,
        })
    }

    pub fn composition(&self) -> Composition {
        let total = self.quantity();
        if total.is_zero() {
            return Composition::default();
        }
        let rsu: Decimal = self
            .lots
            .iter()
            .filter(|l| l.lot.source == LotSource::Rsu)
            .map(|l| l.quantity)
            .sum();
        let rsu_pct = rsu / total * dec!(100);
        Composition {
            rsu_pct,
            espp_pct: dec!(100) - rsu_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rates::ExchangeRate;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn rsu(id: EntryId, quantity: Decimal, cost: Decimal) -> Acquisition {
        Acquisition {
            lot: LotId {
                source: LotSource::Rsu,
                entry_id: id,
            },
            date: date("2024-05-01"),
            quantity,
            cost_gbp: cost,
            rate_used: dec!(1),
            usd_total: cost,
            paye_gbp: Decimal::ZERO,
            incidental_gbp: Decimal::ZERO,
        }
    }

    fn espp_lot(id: EntryId, quantity: Decimal, cost: Decimal) -> Acquisition {
        Acquisition {
            lot: LotId {
                source: LotSource::Espp,
                entry_id: id,
            },
            ..rsu(id, quantity, cost)
        }
    }

    fn vesting() -> Vesting {
        Vesting {
            id: 1,
            date: date("2024-05-01"),
            shares_vested: dec!(100),
            price_usd: dec!(50),
            exchange_rate: Some(dec!(1.25)),
            tax_paid_gbp: Decimal::ZERO,
            incidental_costs_gbp: Decimal::ZERO,
            shares_sold: Decimal::ZERO,
        }
    }

    #[test]
    fn rsu_lot_cost() {
        let acq = Acquisition::from_vesting(&vesting(), &ExchangeRateTable::new()).unwrap();
        assert_eq!(acq.quantity, dec!(100));
        assert_eq!(acq.cost_gbp, dec!(4000));
        assert_eq!(acq.per_share_cost(), dec!(40));
        assert_eq!(acq.lot.to_string(), "V:1");
    }

    #[test]
    fn rsu_withheld_shares_spread_cost_over_net() {
        let v = Vesting {
            shares_sold: dec!(20),
            tax_paid_gbp: dec!(800),
            incidental_costs_gbp: dec!(10),
            ..vesting()
        };
        let acq = Acquisition::from_vesting(&v, &ExchangeRateTable::new()).unwrap();
        assert_eq!(acq.quantity, dec!(80));
        assert_eq!(acq.cost_gbp, dec!(4810));
        assert_eq!(acq.per_share_cost(), dec!(60.125));
    }

    #[test]
    fn espp_lot_uses_table_rate_and_qualifying_price() {
        let mut rates = ExchangeRateTable::new();
        rates
            .insert(ExchangeRate {
                date: date("2024-04-30"),
                usd_gbp: dec!(1.25),
                description: None,
            })
            .unwrap();
        let p = EsppPurchase {
            id: 4,
            date: date("2024-05-01"),
            shares_retained: dec!(10),
            purchase_price_usd: dec!(8.5),
            market_price_usd: dec!(10),
            exchange_rate: None,
            discount_taxed_paye: true,
            qualifying: false,
            paye_tax_gbp: dec!(3),
            incidental_costs_gbp: dec!(1),
        };
        let acq = Acquisition::from_espp(&p, &rates).unwrap();
        // non-qualifying: 10 x $10 / 1.25 + 3 + 1
        assert_eq!(acq.cost_gbp, dec!(84));
        assert_eq!(acq.rate_used, dec!(1.25));
        assert_eq!(acq.lot.to_string(), "E:4");
    }

    #[test]
    fn missing_rate_is_reported() {
        let v = Vesting {
            exchange_rate: None,
            ..vesting()
        };
        let err = Acquisition::from_vesting(&v, &ExchangeRateTable::new()).unwrap_err();
        assert!(matches!(err, EngineError::ExternalUnavailable(_)));
    }

    #[test]
    fn non_positive_lot_is_rejected() {
        let v = Vesting {
            shares_sold: dec!(100),
            ..vesting()
        };
        let err = Acquisition::from_vesting(&v, &ExchangeRateTable::new()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::NonPositiveLot { .. })
        ));
    }

    #[test]
    fn average_cost_is_total_over_quantity() {
        let mut pool = SharePool::new();
        pool.add(&rsu(1, dec!(100), dec!(4000)), dec!(100));
        pool.add(&espp_lot(2, dec!(30), dec!(200)), dec!(30));
        assert_eq!(pool.quantity(), dec!(130));
        assert_eq!(pool.cost(), dec!(4200));
        assert_eq!(pool.average_cost(), pool.cost() / pool.quantity());
    }

    #[test]
    fn draw_is_proportional_and_keeps_average() {
        let mut pool = SharePool::new();
        pool.add(&rsu(1, dec!(75), dec!(3000)), dec!(75));
        pool.add(&espp_lot(2, dec!(25), dec!(500)), dec!(25));
        let before = pool.average_cost();
        let mix_before = pool.composition();
        assert_eq!(mix_before.rsu_pct, dec!(75));

        let draw = pool.draw(dec!(40)).unwrap();
        assert_eq!(draw.quantity, dec!(40));
        assert_eq!(draw.cost_gbp, dec!(1400));
        let drawn: Decimal = draw.per_lot.iter().map(|(_, q, _)| *q).sum();
        assert_eq!(drawn, dec!(40));

        assert_eq!(pool.quantity(), dec!(60));
        assert_eq!(pool.cost(), dec!(2100));
        assert_eq!(pool.average_cost(), before);
        assert_eq!(pool.composition(), mix_before);
    }

    #[test]
    fn draw_everything_empties_pool() {
        let mut pool = SharePool::new();
        pool.add(&rsu(1, dec!(3), dec!(100)), dec!(3));
        let draw = pool.draw(dec!(3)).unwrap();
        assert_eq!(draw.cost_gbp, dec!(100));
        assert!(pool.is_empty());
        assert_eq!(pool.average_cost(), Decimal::ZERO);
        assert_eq!(pool.composition(), Composition::default());
    }

    #[test]
    fn draw_more_than_held_fails_without_change() {
        let mut pool = SharePool::new();
        pool.add(&rsu(1, dec!(10), dec!(100)), dec!(10));
        let err = pool.draw(dec!(11)).unwrap_err();
        assert_eq!(
            err,
            PoolShortfall {
                requested: dec!(11),
                available: dec!(10)
            }
        );
        assert_eq!(pool.quantity(), dec!(10));
    }

    #[test]
    fn thirds_reconcile_exactly() {
        let mut pool = SharePool::new();
        pool.add(&rsu(1, dec!(3), dec!(10)), dec!(3));
        pool.add(&espp_lot(2, dec!(3), dec!(10)), dec!(3));
        let draw = pool.draw(dec!(1)).unwrap();
        let (q, c) = draw
            .per_lot
            .iter()
            .fold((Decimal::ZERO, Decimal::ZERO), |(q, c), (_, lq, lc)| {
                (q + lq, c + lc)
            });
        assert_eq!(q, dec!(1));
        assert_eq!(c, draw.cost_gbp);
        assert_eq!(pool.quantity(), dec!(5));
    }

    #[test]
    fn acquisitions_in_replay_order_with_cutoff() {
        let mut ledger = Ledger::new();
        ledger
            .insert(LedgerEntry::Vesting(Vesting {
                date: date("2024-06-01"),
                ..vesting()
            }))
            .unwrap();
        ledger.insert(LedgerEntry::Vesting(vesting())).unwrap();
        let all = acquisitions(&ledger, &ExchangeRateTable::new(), None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].date, date("2024-05-01"));
        assert_eq!(all[0].lot.entry_id, 2);

        let early = acquisitions(&ledger, &ExchangeRateTable::new(), Some(date("2024-05-15")))
            .unwrap();
        assert_eq!(early.len(), 1);
    }
}
