use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;

/// Income tax band a slice of gain falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaxBand {
    #[default]
    Basic,
    Higher,
}

/// UK Tax Year (runs 6 April to 5 April)
/// The year value is the calendar year the tax year starts in (e.g., 2024 = 2024/25)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct TaxYear(pub i32);

impl TaxYear {
    pub const FIRST: i32 = 1900;
    pub const LAST: i32 = 9998;

    /// Tax year starting in `year`, rejecting years outside `FIRST..=LAST`
    pub fn new(year: i32) -> Result<Self, ValidationError> {
        if (Self::FIRST..=Self::LAST).contains(&year) {
            Ok(TaxYear(year))
        } else {
            Err(ValidationError::TaxYearOutOfRange {
                year,
                first: Self::FIRST,
                last: Self::LAST,
            })
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        Self::new(self.0).map(|_| ())
    }

    /// Tax year a date falls in
    pub fn from_date(date: NaiveDate) -> Self {
        let year = date.year();
        if (date.month(), date.day()) >= (4, 6) {
            TaxYear(year)
        } else {
            TaxYear(year - 1)
        }
    }

    /// 6 April of the start year
    pub fn start_date(&self) -> NaiveDate {
        april(self.0, 6)
    }

    /// 5 April of the following year
    pub fn end_date(&self) -> NaiveDate {
        april(self.0.saturating_add(1), 5)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date() && date <= self.end_date()
    }

    pub fn previous(&self) -> TaxYear {
        TaxYear(self.0 - 1)
    }

    pub fn next(&self) -> TaxYear {
        TaxYear(self.0 + 1)
    }

    /// Display as "2024/25" format
    pub fn display(&self) -> String {
        format!("{}/{:02}", self.0, (self.0 + 1) % 100)
    }

    /// Statutory CGT annual exempt amount
    pub fn cgt_exempt_amount(&self) -> Decimal {
        match self.0 {
            // 2024/25 onwards: £3,000
            2024.. => dec!(3000),
            // 2023/24: £6,000
            2023 => dec!(6000),
            // 2020/21 to 2022/23: £12,300
            2020..=2022 => dec!(12300),
            _ => dec!(12300),
        }
    }

    /// CGT rate on shares for a band
    pub fn cgt_rate(&self, band: TaxBand) -> Decimal {
        match band {
            TaxBand::Basic => dec!(0.10),
            TaxBand::Higher => dec!(0.20),
        }
    }
}

/// April `day` of `year`, saturating at the ends of chrono's calendar
fn april(year: i32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 4, day).unwrap_or(if year < 0 {
        NaiveDate::MIN
    } else {
        NaiveDate::MAX
    })
}

impl TryFrom<i32> for TaxYear {
    type Error = ValidationError;

    fn try_from(year: i32) -> Result<Self, Self::Error> {
        TaxYear::new(year)
    }
}

impl From<TaxYear> for i32 {
    fn from(year: TaxYear) -> i32 {
        year.0
    }
}

impl std::fmt::Display for TaxYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
