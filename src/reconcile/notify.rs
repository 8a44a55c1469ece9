//! Notification channel and alert message formatting

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::SluiceError;

use super::snapshot::EventRecord;

const RECIPIENT_PLACEHOLDER: &str = "{to}";

/// Identifier returned by the transport for one delivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, recipient: &str, message: &str) -> Result<DeliveryId, SluiceError>;
}

/// Runs an external command per message: the message arrives on stdin,
/// `{to}` in the arguments is replaced by the recipient, and the trimmed
/// stdout (if any) is the delivery id
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    template: Vec<String>,
}

impl CommandNotifier {
    pub fn parse(command: &str) -> Result<Self, SluiceError> {
        let template = shell_words::split(command)
            .map_err(|e| SluiceError::Config(format!("invalid --notify-cmd: {}", e)))?;
        if template.is_empty() {
            return Err(SluiceError::Config("--notify-cmd is empty".to_string()));
        }
        Ok(Self { template })
    }
}

impl Notifier for CommandNotifier {
    fn send(&self, recipient: &str, message: &str) -> Result<DeliveryId, SluiceError> {
        let failed = |message: String| SluiceError::Notification {
            recipient: recipient.to_string(),
            message,
        };

        let argv: Vec<String> = self
            .template
            .iter()
            .map(|arg| arg.replace(RECIPIENT_PLACEHOLDER, recipient))
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| failed("notification command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to start '{}': {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .map_err(|e| failed(format!("failed to write message: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("failed to wait for '{}': {}", program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(DeliveryId(if id.is_empty() {
            format!("{}:ok", program)
        } else {
            id
        }))
    }
}

/// Logs messages instead of sending them
#[derive(Debug, Default)]
pub struct LogNotifier {
    sent: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for LogNotifier {
    fn send(&self, recipient: &str, message: &str) -> Result<DeliveryId, SluiceError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(recipient, message, "notification (log only)");
        Ok(DeliveryId(format!("log-{}", n)))
    }
}

/// Renders one delta entry as a human-readable alert
pub trait AlertMessage {
    fn alert_message(&self, key: &str) -> String;
}

fn event_message(title: &str, date: &str, time: &str, location: &str, url: Option<&str>) -> String {
    let mut message = format!("New event! {} — {} at {}", title, date, time.trim());
    if !location.trim().is_empty() {
        message.push_str(&format!(" in {}", location.trim()));
    }
    if let Some(url) = url.filter(|u| !u.is_empty()) {
        message.push_str(&format!(": {}", url));
    }
    message
}

impl AlertMessage for EventRecord {
    fn alert_message(&self, _key: &str) -> String {
        event_message(
            &self.title,
            &self.date,
            &self.time,
            &self.location,
            self.url.as_deref(),
        )
    }
}

impl AlertMessage for Value {
    fn alert_message(&self, key: &str) -> String {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| self.get(*name).and_then(Value::as_str))
                .unwrap_or("")
        };
        let title = match field(&["title", "show_title"]) {
            "" => key,
            title => title,
        };
        let date = field(&["date"]);
        let time = field(&["time"]);
        let url = field(&["url"]);

        if date.is_empty() && time.is_empty() {
            return if url.is_empty() {
                format!("New entry! {}", title)
            } else {
                format!("New entry! {}: {}", title, url)
            };
        }

        event_message(title, date, time, field(&["location", "room"]), Some(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_message() {
        let record = EventRecord {
            title: "Kill Tony".to_string(),
            date: "Saturday, Mar 15".to_string(),
            time: "9:30 PM - 11:00 PM".to_string(),
            location: "Main Room".to_string(),
            url: None,
        };
        assert_eq!(
            record.alert_message("kill-tony-20250315-2130"),
            "New event! Kill Tony — Saturday, Mar 15 at 9:30 PM - 11:00 PM in Main Room"
        );
    }

    #[test]
    fn test_value_messages() {
        let listing = json!({"url": "/shows/late-123", "date": "Friday, Mar 14", "time": "10 PM"});
        assert_eq!(
            listing.alert_message("late-123"),
            "New event! late-123 — Friday, Mar 14 at 10 PM: /shows/late-123"
        );
        assert_eq!(json!(2).alert_message("b"), "New entry! b");
    }

    #[test]
    fn test_log_notifier_ids() {
        let notifier = LogNotifier::new();
        assert_eq!(notifier.send("+15555555555", "hi").unwrap(), DeliveryId("log-1".to_string()));
        assert_eq!(notifier.send("+15555555555", "hi").unwrap().to_string(), "log-2");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_notifier_passes_message_and_recipient() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("sent.txt");
        let command = format!(
            "sh -c 'cat > \"$1\"; echo SM-{{to}}' sh {}",
            shell_words::quote(&out.to_string_lossy())
        );
        let notifier = CommandNotifier::parse(&command).unwrap();

        let id = notifier.send("alice", "New event! x").unwrap();
        assert_eq!(id, DeliveryId("SM-alice".to_string()));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "New event! x");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_notifier_failure() {
        let notifier = CommandNotifier::parse("sh -c 'echo rate limited >&2; exit 1'").unwrap();
        let err = notifier.send("alice", "hello").unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("rate limited"));
    }
}
