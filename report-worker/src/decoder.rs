use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::PipelineError;
use crate::players::PlayerResolver;
use crate::types::{ReportFields, ReportRecord, ReportV1, ReportV2, WireReport, V1_VERSION, V2_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVersion {
    V1,
    V2,
}

impl WireVersion {
    /// Reads `metadata.version`. Payloads without one are legacy V1 reports.
    pub fn of(payload: &Value) -> Result<Self, PipelineError> {
        let Some(object) = payload.as_object() else {
            return Err(PipelineError::MalformedMessage(
                "payload is not a JSON object".to_string(),
            ));
        };

        let version = match object.get("metadata") {
            None | Some(Value::Null) => return Ok(WireVersion::V1),
            Some(Value::Object(metadata)) => metadata.get("version"),
            Some(other) => {
                return Err(PipelineError::MalformedMessage(format!(
                    "metadata is not an object: {other}"
                )))
            }
        };

        match version {
            None | Some(Value::Null) => Ok(WireVersion::V1),
            Some(Value::String(v)) if v == V1_VERSION => Ok(WireVersion::V1),
            Some(Value::String(v)) if v == V2_VERSION => Ok(WireVersion::V2),
            Some(other) => Err(PipelineError::MalformedMessage(format!(
                "unknown version {other}"
            ))),
        }
    }
}

/// Validates a payload against the schema of its version.
pub fn parse(payload: &Value) -> Result<WireReport, PipelineError> {
    let report = match WireVersion::of(payload)? {
        WireVersion::V1 => ReportV1::deserialize(payload).map(WireReport::V1),
        WireVersion::V2 => ReportV2::deserialize(payload).map(WireReport::V2),
    };
    report.map_err(|e| PipelineError::MalformedMessage(e.to_string()))
}

/// Turns raw payloads of any known version into canonical records.
pub struct Decoder {
    resolver: Arc<PlayerResolver>,
    max_future_skew: chrono::Duration,
}

impl Decoder {
    pub fn new(resolver: Arc<PlayerResolver>, max_future_skew: Duration) -> Self {
        Self {
            resolver,
            max_future_skew: chrono::Duration::from_std(max_future_skew)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub async fn decode(&self, payload: &Value) -> Result<ReportRecord, PipelineError> {
        let report = parse(payload)?;
        let fields = report.fields();

        validate_location(fields)?;
        // Checked before resolution so out of policy reports never create players
        let timestamp = self.check_timestamp(fields.ts)?;

        let (reporter_id, reported_id) = match &report {
            WireReport::V1(report) => {
                let reporter = self.resolver.resolve(&report.reporter).await?;
                let reported = self.resolver.resolve(&report.reported).await?;
                (reporter.id, reported.id)
            }
            WireReport::V2(report) => {
                if report.reporter_id <= 0 || report.reported_id <= 0 {
                    return Err(PipelineError::MalformedMessage(format!(
                        "player ids must be positive, got {} and {}",
                        report.reporter_id, report.reported_id
                    )));
                }
                (report.reporter_id, report.reported_id)
            }
        };

        Ok(ReportRecord::new(reporter_id, reported_id, timestamp, fields))
    }

    fn check_timestamp(&self, ts: i64) -> Result<DateTime<Utc>, PipelineError> {
        let timestamp = DateTime::from_timestamp(ts, 0).ok_or_else(|| {
            PipelineError::MalformedMessage(format!("timestamp {ts} is out of range"))
        })?;

        let bound = Utc::now()
            .checked_add_signed(self.max_future_skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if timestamp > bound {
            return Err(PipelineError::RejectedRecord(format!(
                "timestamp {timestamp} is after {bound}"
            )));
        }
        Ok(timestamp)
    }
}

fn validate_location(fields: &ReportFields) -> Result<(), PipelineError> {
    let coordinates = [
        ("region_id", fields.region_id),
        ("x_coord", fields.x_coord),
        ("y_coord", fields.y_coord),
        ("z_coord", fields.z_coord),
    ];
    for (name, value) in coordinates {
        if value < 0 {
            return Err(PipelineError::MalformedMessage(format!(
                "{name} must not be negative, got {value}"
            )));
        }
    }
    Ok(())
}
