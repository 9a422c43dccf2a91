//! USD/GBP exchange rate table

use super::errors::{RateError, ValidationError};
use super::schema::CsvSchema;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::str::FromStr;

/// Rate quoted as US dollars per pound sterling: GBP = USD / usd_gbp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExchangeRate {
    pub date: NaiveDate,
    #[schemars(with = "f64")]
    pub usd_gbp: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

/// Column layout accepted by [`ExchangeRateTable::import_csv`]
#[derive(Debug, Clone, Serialize, Deserialize, CsvSchema)]
pub struct RateCsvRow {
    /// Rate date, "02 Jan 24" (Bank of England export) or YYYY-MM-DD
    #[csv(example = "02 Jan 24")]
    pub date: String,
    /// US dollars per pound sterling
    #[csv(example = "1.2714")]
    pub usd_gbp: String,
    /// Free-text note kept alongside the rate
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub inserted: usize,
    /// Dates already present in the table, left untouched
    pub existing: usize,
    /// Rows that could not be parsed
    pub skipped: usize,
}

const DATE_FORMATS: &[&str] = &["%d %b %y", "%Y-%m-%d", "%d %b %Y", "%d/%m/%Y"];

/// Sparse date-indexed rate table. Lookups resolve to the latest rate on or before
/// the requested date; a later rate is never substituted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateTable {
    rates: BTreeMap<NaiveDate, ExchangeRate>,
}

impl ExchangeRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the rate for a date
    pub fn insert(&mut self, rate: ExchangeRate) -> Result<(), ValidationError> {
        if rate.usd_gbp <= Decimal::ZERO {
            return Err(ValidationError::NotPositive {
                field: "usd_gbp",
                value: rate.usd_gbp,
            });
        }
        log::debug!("Rate {} = {}", rate.date, rate.usd_gbp);
        self.rates.insert(rate.date, rate);
        Ok(())
    }

    pub fn remove(&mut self, date: NaiveDate) -> Option<ExchangeRate> {
        self.rates.remove(&date)
    }

    pub fn get(&self, date: NaiveDate) -> Option<&ExchangeRate> {
        self.rates.get(&date)
    }

    /// Rate in force on `date`
    pub fn rate_for(&self, date: NaiveDate) -> Result<&ExchangeRate, RateError> {
        self.rates
            .range(..=date)
            .next_back()
            .map(|(_, rate)| rate)
            .ok_or(RateError::NoRateOnOrBefore(date))
    }

    /// An explicit per-record rate wins over the table
    pub fn resolve(&self, date: NaiveDate, explicit: Option<Decimal>) -> Result<Decimal, RateError> {
        match explicit {
            Some(rate) => Ok(rate),
            None => self.rate_for(date).map(|r| r.usd_gbp),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExchangeRate> {
        self.rates.values()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Bulk import. The first row is a header. Dates already present keep their rate.
    pub fn import_csv<R: Read>(&mut self, reader: R) -> Result<ImportSummary, ValidationError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        // parse everything first so a bad row leaves the table untouched
        let mut summary = ImportSummary::default();
        let mut pending: BTreeMap<NaiveDate, ExchangeRate> = BTreeMap::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| ValidationError::InvalidCsv(e.to_string()))?;
            let parsed = record
                .get(0)
                .and_then(parse_rate_date)
                .zip(record.get(1).and_then(|r| Decimal::from_str(r).ok()));
            let Some((date, usd_gbp)) = parsed.filter(|(_, r)| *r > Decimal::ZERO) else {
                log::warn!("Skipping rate row {}: {:?}", row + 2, record);
                summary.skipped += 1;
                continue;
            };
            if self.rates.contains_key(&date) || pending.contains_key(&date) {
                summary.existing += 1;
                continue;
            }
            let description = record
                .get(2)
                .filter(|d| !d.is_empty())
                .map(|d| d.to_string());
            pending.insert(
                date,
                ExchangeRate {
                    date,
                    usd_gbp,
                    description,
                },
            );
        }
        summary.inserted = pending.len();
        self.rates.append(&mut pending);
        log::info!(
            "Imported {} rates ({} existing, {} skipped)",
            summary.inserted,
            summary.existing,
            summary.skipped
        );
        Ok(summary)
    }
}

fn parse_rate_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn table(rates: &[(&str, Decimal)]) -> ExchangeRateTable {
        let mut t = ExchangeRateTable::new();
        for (d, r) in rates {
            t.insert(ExchangeRate {
                date: date(d),
                usd_gbp: *r,
                description: None,
            })
            .unwrap();
        }
        t
    }

    #[test]
    fn exact_date_hit() {
        let t = table(&[("2024-01-02", dec!(1.27)), ("2024-01-05", dec!(1.26))]);
        assert_eq!(t.rate_for(date("2024-01-05")).unwrap().usd_gbp, dec!(1.26));
    }

    #[test]
    fn gap_resolves_to_latest_earlier_rate() {
        let t = table(&[("2024-01-02", dec!(1.27)), ("2024-01-05", dec!(1.26))]);
        // weekend/holiday gap: the 4th uses the 2nd, never the closer 5th
        assert_eq!(t.rate_for(date("2024-01-04")).unwrap().usd_gbp, dec!(1.27));
        assert_eq!(t.rate_for(date("2024-02-01")).unwrap().usd_gbp, dec!(1.26));
    }

    #[test]
    fn date_before_first_rate_is_unavailable() {
        let t = table(&[("2024-01-02", dec!(1.27))]);
        assert_eq!(
            t.rate_for(date("2024-01-01")),
            Err(RateError::NoRateOnOrBefore(date("2024-01-01")))
        );
    }

    #[test]
    fn explicit_rate_wins() {
        let t = table(&[("2024-01-02", dec!(1.27))]);
        assert_eq!(
            t.resolve(date("2024-01-03"), Some(dec!(1.30))).unwrap(),
            dec!(1.30)
        );
        assert_eq!(t.resolve(date("2024-01-03"), None).unwrap(), dec!(1.27));
        assert!(ExchangeRateTable::new()
            .resolve(date("2024-01-03"), Some(dec!(1.1)))
            .is_ok());
    }

    #[test]
    fn rejects_non_positive_rate() {
        let mut t = ExchangeRateTable::new();
        let err = t
            .insert(ExchangeRate {
                date: date("2024-01-02"),
                usd_gbp: Decimal::ZERO,
                description: None,
            })
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotPositive { .. }));
        assert!(t.is_empty());
    }

    #[test]
    fn imports_bank_of_england_export() {
        let csv = "Date,Spot exchange rate US$ into Sterling\n\
                   02 Jan 24,1.2714\n\
                   03 Jan 24,1.2630\n\
                   bad row,xyz\n\
                   2024-01-08,1.2700,manual\n";
        let mut t = table(&[("2024-01-03", dec!(1.20))]);
        let summary = t.import_csv(csv.as_bytes()).unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                inserted: 2,
                existing: 1,
                skipped: 1
            }
        );
        assert_eq!(t.get(date("2024-01-02")).unwrap().usd_gbp, dec!(1.2714));
        // existing dates are not overwritten
        assert_eq!(t.get(date("2024-01-03")).unwrap().usd_gbp, dec!(1.20));
        assert_eq!(
            t.get(date("2024-01-08")).unwrap().description.as_deref(),
            Some("manual")
        );
    }

    #[test]
    fn unreadable_last_row_imports_nothing() {
        let mut csv = b"date,rate\n2024-01-02,1.2714\n2024-01-03,1.2630\n".to_vec();
        csv.extend_from_slice(b"2024-01-04,\xff\xfe\n");
        let mut t = table(&[("2023-12-29", dec!(1.27))]);
        let before = t.clone();

        let err = t.import_csv(csv.as_slice()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCsv(_)));
        assert_eq!(t, before);
        assert!(t.get(date("2024-01-02")).is_none());
    }

    #[test]
    fn repeated_date_in_one_file_counts_once() {
        let csv = "date,rate\n2024-01-02,1.2714\n2024-01-02,1.3000\n";
        let mut t = ExchangeRateTable::new();
        let summary = t.import_csv(csv.as_bytes()).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.existing, 1);
        assert_eq!(t.get(date("2024-01-02")).unwrap().usd_gbp, dec!(1.2714));
    }

    #[test]
    fn csv_layout_header() {
        assert_eq!(RateCsvRow::csv_header(), "date,usd_gbp,description");
        let schema = RateCsvRow::csv_schema();
        assert!(schema[0].required);
        assert!(!schema[2].required);
        assert_eq!(schema[1].example, Some("1.2714"));
    }
}
