//! Deterministic-tier reminder CRUD tool.
//!
//! The tool itself holds no scheduling state — it forwards requests through an
//! mpsc channel to whichever component owns the reminder queue (the runtime's
//! scheduler). This keeps `tools` decoupled from `runtime` and lets the
//! scheduler remain the single writer of reminder state, as required by the
//! concurrency model.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Tool, ToolOutput, ToolParam, ToolSpec};

/// A request emitted by the tool, consumed by the scheduler task.
#[derive(Debug, Clone)]
pub enum ReminderRequest {
    Create { message: String, trigger_at: chrono::DateTime<chrono::Utc> },
    Clear,
}

pub struct RemindMeTool {
    sender: mpsc::UnboundedSender<ReminderRequest>,
}

impl RemindMeTool {
    pub fn new(sender: mpsc::UnboundedSender<ReminderRequest>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Tool for RemindMeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "remind_me".to_string(),
            description: "Schedule or clear a reminder.".to_string(),
            params: vec![
                ToolParam {
                    name: "message".to_string(),
                    description: "Reminder text".to_string(),
                    required: false,
                },
                ToolParam {
                    name: "trigger_at".to_string(),
                    description: "RFC3339 timestamp the reminder should fire at".to_string(),
                    required: false,
                },
                ToolParam {
                    name: "action".to_string(),
                    description: "\"create\" (default) or \"clear\"".to_string(),
                    required: false,
                },
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let action = args.get("action").map(String::as_str).unwrap_or("create");

        if action == "clear" {
            self.sender
                .send(ReminderRequest::Clear)
                .map_err(|_| anyhow::anyhow!("reminder scheduler channel closed"))?;
            return Ok(ToolOutput {
                success: true,
                output: "all reminders cleared".to_string(),
            });
        }

        let message = args
            .get("message")
            .ok_or_else(|| anyhow::anyhow!("missing required param: message"))?
            .clone();
        let trigger_at = args
            .get("trigger_at")
            .ok_or_else(|| anyhow::anyhow!("missing required param: trigger_at"))?;
        let trigger_at = chrono::DateTime::parse_from_rfc3339(trigger_at)
            .map_err(|e| anyhow::anyhow!("invalid trigger_at: {e}"))?
            .with_timezone(&chrono::Utc);

        self.sender
            .send(ReminderRequest::Create { message: message.clone(), trigger_at })
            .map_err(|_| anyhow::anyhow!("reminder scheduler channel closed"))?;

        Ok(ToolOutput {
            success: true,
            output: format!("reminder '{message}' scheduled for {}", trigger_at.to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_requires_message_and_trigger_at() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tool = RemindMeTool::new(tx);
        let out = tool.run(&HashMap::new()).await;
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn create_forwards_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tool = RemindMeTool::new(tx);
        let mut args = HashMap::new();
        args.insert("message".to_string(), "llamar al banco".to_string());
        args.insert("trigger_at".to_string(), chrono::Utc::now().to_rfc3339());

        let out = tool.run(&args).await.unwrap();
        assert!(out.success);
        let req = rx.recv().await.unwrap();
        matches!(req, ReminderRequest::Create { .. });
    }

    #[tokio::test]
    async fn clear_forwards_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tool = RemindMeTool::new(tx);
        let mut args = HashMap::new();
        args.insert("action".to_string(), "clear".to_string());

        let out = tool.run(&args).await.unwrap();
        assert!(out.success);
        let req = rx.recv().await.unwrap();
        matches!(req, ReminderRequest::Clear);
    }
}
