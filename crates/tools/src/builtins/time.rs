//! Deterministic-tier time tool.
//!
//! Answers "what time is it" style queries without any LLM involvement —
//! the router's fast-path dispatches straight here on a `time` intent match.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;

use crate::{Tool, ToolOutput, ToolParam, ToolSpec};

pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".to_string(),
            description: "Return the current local date and time.".to_string(),
            params: vec![ToolParam {
                name: "format".to_string(),
                description: "Optional strftime format override".to_string(),
                required: false,
            }],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let fmt = args
            .get("format")
            .map(String::as_str)
            .unwrap_or("%A %d %B %Y, %H:%M");
        let now = Local::now();
        Ok(ToolOutput {
            success: true,
            output: now.format(fmt).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_time_runs_without_args() {
        let tool = TimeTool;
        let out = tool.run(&HashMap::new()).await.unwrap();
        assert!(out.success);
        assert!(!out.output.is_empty());
    }
}
