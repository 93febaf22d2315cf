//! Operational alerts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Critical => "CRITICAL",
            AlertPriority::High => "HIGH",
            AlertPriority::Medium => "MEDIUM",
            AlertPriority::Low => "LOW",
        }
    }
}

impl core::fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ops escalation. Stateless, fire-and-log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub priority: AlertPriority,
    pub title: String,
    pub details: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Alert {
    pub fn critical(title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            priority: AlertPriority::Critical,
            title: title.into(),
            details: details.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Single-line chat rendering: `*[PRIORITY]* title\ndetails\n_tags: a, b_`.
    pub fn to_chat_text(&self) -> String {
        format!(
            "*[{}]* {}\n{}\n_tags: {}_",
            self.priority,
            self.title,
            self.details,
            self.tags.join(", ")
        )
    }
}
