use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::ValidationError;

pub mod consumption;
pub mod login;

pub use consumption::{ConsumptionFetcher, ConsumptionRecord, EnergyFlows};
pub use login::{Credentials, Session};

/// The aggregation level of a consumption report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    /// Hourly points of one day
    Day,
    /// Daily points of one month
    Month,
    /// Monthly points of one year
    Year,
}

impl PeriodKind {
    pub fn name(&self) -> &'static str {
        match self {
            PeriodKind::Day => "day",
            PeriodKind::Month => "month",
            PeriodKind::Year => "year",
        }
    }

    /// Value of the portal's `period` query parameter.
    fn api_code(&self) -> &'static str {
        match self {
            PeriodKind::Day => "D",
            PeriodKind::Month => "M",
            PeriodKind::Year => "Y",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PeriodKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(PeriodKind::Day),
            "month" => Ok(PeriodKind::Month),
            "year" => Ok(PeriodKind::Year),
            _ => Err(ValidationError::UnknownPeriod(s.to_string())),
        }
    }
}

/// Granularity of the report data points, the portal's `granularity` parameter.
enum Granularity {
    Hour,
    Day,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = match self {
            Granularity::Hour => "H",
            Granularity::Day => "D",
        };
        write!(f, "{}", g)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodSpec {
    Day { year: i32, month: u32, day: u32 },
    Month { year: i32, month: u32 },
    Year { year: i32 },
}

impl PeriodSpec {
    /// Builds a period from loosely specified parts, as they come from the
    /// command line. Parts the period needs but were not given default to
    /// `today`; parts the period has no use for are an error.
    pub fn from_parts(
        kind: PeriodKind,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
        today: NaiveDate,
    ) -> Result<Self, ValidationError> {
        let year = year.unwrap_or_else(|| today.year());

        let spec = match kind {
            PeriodKind::Year => {
                if month.is_some() {
                    return Err(unexpected(kind, "month"));
                }
                if day.is_some() {
                    return Err(unexpected(kind, "day"));
                }
                PeriodSpec::Year { year }
            }
            PeriodKind::Month => {
                if day.is_some() {
                    return Err(unexpected(kind, "day"));
                }
                PeriodSpec::Month {
                    year,
                    month: month.unwrap_or_else(|| today.month()),
                }
            }
            PeriodKind::Day => PeriodSpec::Day {
                year,
                month: month.unwrap_or_else(|| today.month()),
                day: day.unwrap_or_else(|| today.day()),
            },
        };

        spec.validate()?;
        Ok(spec)
    }

    pub fn kind(&self) -> PeriodKind {
        match self {
            PeriodSpec::Day { .. } => PeriodKind::Day,
            PeriodSpec::Month { .. } => PeriodKind::Month,
            PeriodSpec::Year { .. } => PeriodKind::Year,
        }
    }

    /// Checks that every component is a real calendar value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (year, month, day) = match *self {
            PeriodSpec::Day { year, month, day } => (year, Some(month), Some(day)),
            PeriodSpec::Month { year, month } => (year, Some(month), None),
            PeriodSpec::Year { year } => (year, None, None),
        };

        if !(1..=9999).contains(&year) {
            return Err(ValidationError::YearOutOfRange(year));
        }
        if let Some(month) = month {
            if !(1..=12).contains(&month) {
                return Err(ValidationError::MonthOutOfRange(month));
            }
            if let Some(day) = day {
                if NaiveDate::from_ymd_opt(year, month, day).is_none() {
                    return Err(ValidationError::InvalidDate { year, month, day });
                }
            }
        }
        Ok(())
    }

    fn to_query_string(&self) -> Vec<(String, String)> {
        let mut qs = vec![];
        match *self {
            PeriodSpec::Year { year } => {
                qs.push(("year".to_string(), year.to_string()));
            }
            PeriodSpec::Month { year, month } => {
                qs.push(("year".to_string(), year.to_string()));
                qs.push(("month".to_string(), format!("{:02}", month)));
                qs.push(("granularity".to_string(), Granularity::Day.to_string()));
            }
            PeriodSpec::Day { year, month, day } => {
                qs.push((
                    "date".to_string(),
                    format!("{:02}.{:02}.{:04}", day, month, year),
                ));
                qs.push(("granularity".to_string(), Granularity::Hour.to_string()));
            }
        }
        qs
    }
}

impl fmt::Display for PeriodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodSpec::Day { year, month, day } => write!(f, "{:04}-{:02}-{:02}", year, month, day),
            PeriodSpec::Month { year, month } => write!(f, "{:04}-{:02}", year, month),
            PeriodSpec::Year { year } => write!(f, "{:04}", year),
        }
    }
}

fn unexpected(kind: PeriodKind, field: &'static str) -> ValidationError {
    ValidationError::UnexpectedField {
        period: kind.name(),
        field,
    }
}

/// The metered property: its EIC code and the meter installed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectReference {
    pub object_id: String,
    pub meter_id: String,
}

impl ObjectReference {
    pub fn new(object_id: String, meter_id: String) -> Result<Self, ValidationError> {
        if object_id.trim().is_empty() {
            return Err(ValidationError::Empty("object ID"));
        }
        if meter_id.trim().is_empty() {
            return Err(ValidationError::Empty("meter ID"));
        }
        Ok(ObjectReference {
            object_id,
            meter_id,
        })
    }
}

/// Query parameters of the consumption chart page.
fn data_query_string(object: &ObjectReference, period: &PeriodSpec) -> Vec<(String, String)> {
    let mut qs = vec![
        ("objectEic".to_string(), object.object_id.clone()),
        ("counterNumber".to_string(), object.meter_id.clone()),
        ("period".to_string(), period.kind().api_code().to_string()),
    ];
    qs.append(&mut period.to_query_string());
    qs
}

/// Parses the loosely typed boolean flags of the command line (`True`, `false`, `1`, ...).
pub fn parse_flag(value: &str) -> Result<bool, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(ValidationError::InvalidFlag(value.to_string())),
    }
}
