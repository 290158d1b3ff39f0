//! Reporting value types and period arithmetic

use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::DateRange;

/// Bucket size for valuation series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesInterval {
    /// Monday to Sunday
    #[default]
    Weekly,
    /// Calendar month
    Monthly,
}

/// Split a range into weekly or monthly buckets, clipped to the range
pub fn period_buckets(range: DateRange, interval: SeriesInterval) -> Vec<DateRange> {
    let mut buckets = Vec::new();
    let mut day = range.start;

    while day <= range.end {
        let bucket_end = match interval {
            SeriesInterval::Weekly => {
                day + Duration::days(6 - i64::from(day.weekday().num_days_from_monday()))
            }
            SeriesInterval::Monthly => last_day_of_month(day),
        };
        let end = bucket_end.min(range.end);
        buckets.push(DateRange { start: day, end });
        day = end + Duration::days(1);
    }

    buckets
}

fn last_day_of_month(day: NaiveDate) -> NaiveDate {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|first| first - Duration::days(1))
        .unwrap_or(day)
}

/// Cost-of-goods-sold figures for a period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmvFigures {
    pub opening_value: Decimal,
    pub purchases: Decimal,
    pub closing_value: Decimal,
    /// Value of every exit posted in the period
    pub movement_cogs: Decimal,
    /// Opening + purchases - closing
    pub theoretical_cogs: Decimal,
    /// Movement COGS minus theoretical COGS
    pub difference: Decimal,
}

impl CmvFigures {
    pub fn compute(
        opening_value: Decimal,
        purchases: Decimal,
        closing_value: Decimal,
        movement_cogs: Decimal,
    ) -> Self {
        let theoretical_cogs = opening_value + purchases - closing_value;
        Self {
            opening_value,
            purchases,
            closing_value,
            movement_cogs,
            theoretical_cogs,
            difference: movement_cogs - theoretical_cogs,
        }
    }
}
