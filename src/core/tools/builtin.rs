//! Built-in tools: control tool descriptors and the local date/time tool.

use async_trait::async_trait;
use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::{NO_RESPONSE_TOOL, RESTART_SESSION_TOOL, ToolError, ToolHandler, ToolResult};
use crate::core::realtime::ToolDef;

fn empty_parameters() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

/// Descriptors for the tools the dispatcher handles itself.
pub fn control_tool_descriptors() -> Vec<ToolDef> {
    vec![
        ToolDef::function(
            RESTART_SESSION_TOOL,
            "Clears and restarts the conversation",
            empty_parameters(),
        ),
        ToolDef::function(
            NO_RESPONSE_TOOL,
            "Call this if no response is needed or necessary, if you wish to remain silent \
             and say nothing, or to break out of a loop. Do not call this repeatedly.",
            empty_parameters(),
        ),
    ]
}

/// Reports the current time in UTC and in the host's local offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentDateTimeTool;

impl CurrentDateTimeTool {
    pub const NAME: &'static str = "get_current_datetime";

    fn describe(now: OffsetDateTime, offset: UtcOffset) -> ToolResult<Value> {
        let failed = |e: time::error::Format| ToolError::Failed {
            name: Self::NAME.to_string(),
            reason: e.to_string(),
        };
        let utc = now.to_offset(UtcOffset::UTC);
        let local = now.to_offset(offset);

        let iso = utc.format(&Rfc3339).map_err(failed)?;
        let local_string = local
            .format(format_description!(
                "[month]/[day]/[year], [hour repr:12 padding:none]:[minute]:[second] [period]"
            ))
            .map_err(failed)?;
        let local_iso = local
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
            ))
            .map_err(failed)?;

        Ok(json!({
            "utc": iso,
            "local": local_string,
            "unix": utc.unix_timestamp(),
            "iso": iso,
            "localString": local_string,
            "localIsoWithOffset": local_iso,
        }))
    }
}

#[async_trait]
impl ToolHandler for CurrentDateTimeTool {
    fn descriptor(&self) -> ToolDef {
        ToolDef::function(
            Self::NAME,
            "Get the current date and time in UTC and local time.",
            empty_parameters(),
        )
    }

    async fn call(&self, _arguments: Value) -> ToolResult<Value> {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
            tracing::debug!("Local offset unavailable, using UTC: {}", e);
            UtcOffset::UTC
        });
        Self::describe(OffsetDateTime::now_utc(), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn test_control_descriptors() {
        let tools = control_tool_descriptors();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["clear_conversation", "no_response"]);
        assert!(tools.iter().all(|t| t.tool_type == "function"));
    }

    #[test]
    fn test_describe_fixed_instant() {
        let now = datetime!(2025-03-04 17:05:09 UTC);
        let value = CurrentDateTimeTool::describe(now, offset!(-5)).unwrap();

        assert_eq!(value["utc"], "2025-03-04T17:05:09Z");
        assert_eq!(value["iso"], value["utc"]);
        assert_eq!(value["unix"], 1741107909);
        assert_eq!(value["localIsoWithOffset"], "2025-03-04T12:05:09-05:00");
        assert_eq!(value["localString"], "03/04/2025, 12:05:09 PM");
    }

    #[tokio::test]
    async fn test_call_returns_all_fields() {
        let value = CurrentDateTimeTool.call(json!({})).await.unwrap();
        for key in ["utc", "local", "unix", "iso", "localString", "localIsoWithOffset"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
