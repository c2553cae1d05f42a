// ================================================================================================
// Leakage Guard
// ================================================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{GatewayError, WorldlineResult},
    gateway::{DataGatewayContext, TemporalMode, source::SourceSpec},
};

/// Temporal isolation levels.
///
/// Level 1 warns on sources without temporal metadata; level 2 requires a timestamp
/// field and filters records beyond the cutoff; level 3 additionally fails the request
/// if any record would be dropped. A source with no timestamp field at level 3 is
/// treated as blocked.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Permissive,
    Filter,
    Strict,
}

impl IsolationLevel {
    pub fn from_u8(level: u8) -> Self {
        match level {
            0 | 1 => Self::Permissive,
            2 => Self::Filter,
            _ => Self::Strict,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Permissive => 1,
            Self::Filter => 2,
            Self::Strict => 3,
        }
    }
}

/// Outcome of temporal filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub kept: Vec<Value>,
    pub dropped: usize,
}

/// Stateless temporal-isolation policy. All decisions derive from the request context;
/// the guard itself holds nothing mutable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakageGuard;

impl LeakageGuard {
    /// Pre-fetch checks: administrative blocks and source availability relative to the
    /// cutoff.
    pub fn check_source(
        &self,
        source: &SourceSpec,
        context: &DataGatewayContext,
    ) -> WorldlineResult<()> {
        if source.blocked {
            return Err(GatewayError::SourceBlocked {
                source_name: source.name.clone(),
                reason: "administratively blocked".to_string(),
            }
            .into());
        }
        if let (Some(cutoff), Some(earliest)) =
            (context.cutoff_time, source.earliest_available_at)
        {
            if earliest > cutoff {
                return Err(GatewayError::SourceBlocked {
                    source_name: source.name.clone(),
                    reason: format!(
                        "source data starts {earliest}, after cutoff {cutoff}"
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Filter fetched records so `timestamp_field ≤ cutoff_time`.
    ///
    /// Live mode and absent cutoffs pass everything through. Records whose timestamp
    /// is missing or unparseable are treated as beyond the cutoff at levels 2 and 3.
    pub fn filter_records(
        &self,
        records: Vec<Value>,
        timestamp_field: Option<&str>,
        context: &DataGatewayContext,
        source_name: &str,
    ) -> WorldlineResult<FilterOutcome> {
        let cutoff = match (context.temporal_mode, context.cutoff_time) {
            (TemporalMode::Live, _) | (_, None) => {
                return Ok(FilterOutcome {
                    kept: records,
                    dropped: 0,
                });
            }
            (TemporalMode::Backtest, Some(cutoff)) => cutoff,
        };

        let field = match timestamp_field {
            Some(field) => field,
            None => {
                return match context.isolation_level {
                    IsolationLevel::Permissive => {
                        warn!(
                            source = source_name,
                            "source has no temporal metadata; passing through unfiltered"
                        );
                        Ok(FilterOutcome {
                            kept: records,
                            dropped: 0,
                        })
                    }
                    IsolationLevel::Filter | IsolationLevel::Strict => {
                        Err(GatewayError::MissingTimestampField(source_name.to_string()).into())
                    }
                };
            }
        };

        let mut kept = Vec::with_capacity(records.len());
        let mut dropped = 0usize;
        for record in records {
            let within = record
                .get(field)
                .and_then(parse_timestamp)
                .is_some_and(|ts| ts <= cutoff);
            if within {
                kept.push(record);
            } else {
                dropped += 1;
            }
        }

        if dropped > 0 && context.isolation_level == IsolationLevel::Strict {
            return Err(GatewayError::FutureDataAccess {
                source_name: source_name.to_string(),
                dropped,
            }
            .into());
        }

        Ok(FilterOutcome { kept, dropped })
    }
}

/// Parse a record timestamp: RFC 3339, `YYYY-MM-DD`, or a bare year.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt))
            }),
        Value::Number(n) => {
            let year = n.as_i64()?;
            if (1800..=3000).contains(&year) {
                Utc.with_ymd_and_hms(year as i32, 1, 1, 0, 0, 0).single()
            } else {
                // Seconds since epoch.
                Utc.timestamp_opt(year, 0).single()
            }
        }
        _ => None,
    }
}
