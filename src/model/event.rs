//! Event model

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named event registered on the control plane, matched by name and labels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,

    /// Opaque payload carried by the event
    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Whether the event carries every given label with the same value.
    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}
