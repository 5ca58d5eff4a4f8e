use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_PAY_DAY: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// A salary-to-salary budgeting period. It starts on the pay day and ends the
/// day before the next one. Pay days past the end of a short month fall on
/// that month's last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayPeriod {
    pub pay_day: u32,
    pub range: DateRange,
}

impl PayPeriod {
    /// Returns `None` when `pay_day` is outside 1..=31.
    pub fn containing(date: NaiveDate, pay_day: u32) -> Option<PayPeriod> {
        if !(1..=31).contains(&pay_day) {
            return None;
        }
        let this_month = pay_date(date.year(), date.month(), pay_day)?;
        let (start, next) = if date >= this_month {
            let next_month = this_month.checked_add_months(Months::new(1))?;
            (this_month, pay_date(next_month.year(), next_month.month(), pay_day)?)
        } else {
            let prev_month = this_month.checked_sub_months(Months::new(1))?;
            (pay_date(prev_month.year(), prev_month.month(), pay_day)?, this_month)
        };
        Some(PayPeriod {
            pay_day,
            range: DateRange::new(start, next.pred_opt()?),
        })
    }

    pub fn next_pay_date(&self) -> Option<NaiveDate> {
        self.range.end.succ_opt()
    }

    pub fn days_until_pay(&self, today: NaiveDate) -> i64 {
        self.next_pay_date()
            .map(|next| (next - today).num_days().max(0))
            .unwrap_or(0)
    }

    pub fn label(&self) -> String {
        format!(
            "{} - {}",
            self.range.start.format("%d %b"),
            self.range.end.format("%d %b")
        )
    }
}

fn pay_date(year: i32, month: u32, pay_day: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let last_day = first.checked_add_months(Months::new(1))?.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, pay_day.min(last_day))
}
