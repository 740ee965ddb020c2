// Core domain types shared across the Sandpit crates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The full file set of a playground, as loaded from the blob store and
/// served to newly admitted sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaygroundFiles {
    /// File identifiers in display order.
    pub files: Vec<String>,
    /// Authoritative file id -> content mapping.
    pub files_data: HashMap<String, String>,
    /// Prompt shown alongside the playground, seeded at creation time.
    #[serde(default)]
    pub problem_statement: String,
}

impl PlaygroundFiles {
    /// Total number of cached files.
    pub fn len(&self) -> usize {
        self.files_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files_data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::PlaygroundFiles;

    #[test]
    fn playground_files_round_trips_through_json() {
        let mut playground = PlaygroundFiles::default();
        playground.files.push("index.js".to_string());
        playground.files_data.insert("index.js".to_string(), "console.log(1)".to_string());
        playground.problem_statement = "Print a number.".to_string();

        let encoded = serde_json::to_string(&playground).expect("playground should serialize");
        let decoded: PlaygroundFiles =
            serde_json::from_str(&encoded).expect("playground should deserialize");

        assert_eq!(decoded, playground);
    }

    #[test]
    fn problem_statement_defaults_to_empty_when_absent() {
        let decoded: PlaygroundFiles =
            serde_json::from_str(r#"{"files":[],"files_data":{}}"#)
                .expect("payload without problem_statement should deserialize");

        assert!(decoded.problem_statement.is_empty());
        assert!(decoded.is_empty());
    }
}
