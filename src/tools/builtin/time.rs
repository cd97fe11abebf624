//! `current_time`: lets the model anchor relative dates.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};

use crate::context::JobContext;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally shift it by a UTC offset in hours."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Offset from UTC, e.g. -5 or 5.5 (default: 0)",
                    "default": 0
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let hours = params
            .get("utc_offset_hours")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32).ok_or_else(|| {
            ToolError::InvalidParameters(format!("utc_offset_hours out of range: {hours}"))
        })?;

        let now = Utc::now();
        let local = now.with_timezone(&offset);
        Ok(ToolOutput::success(
            serde_json::json!({
                "iso": local.to_rfc3339(),
                "weekday": local.format("%A").to_string(),
                "unix": now.timestamp(),
            }),
            start.elapsed(),
        ))
    }
}
