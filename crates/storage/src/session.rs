use bastion_core::types::Turn;
use bastion_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum SessionLine {
    #[serde(rename = "metadata")]
    Metadata {
        created_at: String,
        updated_at: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(untagged)]
    Turn(Box<Turn>),
}

/// Session history as JSONL: one metadata line, then one completed turn per line.
#[derive(Clone)]
pub struct SessionStore {
    paths: Paths,
}

impl SessionStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn load(&self, session_key: &str) -> Result<Vec<Turn>> {
        let path = self.paths.session_file(session_key);

        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut turns = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<SessionLine>(&line) {
                Ok(SessionLine::Turn(turn)) => turns.push(*turn),
                Ok(SessionLine::Metadata { .. }) => {}
                Err(e) => {
                    debug!(error = %e, "Failed to parse session line, skipping");
                }
            }
        }

        Ok(turns)
    }

    pub fn save(&self, session_key: &str, turns: &[Turn]) -> Result<()> {
        let path = self.paths.session_file(session_key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut file = File::create(&path)?;

        let metadata = SessionLine::Metadata {
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::json!({ "session_key": session_key }),
        };
        writeln!(file, "{}", serde_json::to_string(&metadata)?)?;

        for turn in turns {
            writeln!(file, "{}", serde_json::to_string(turn)?)?;
        }

        Ok(())
    }

    /// Append one finished turn. Turns are never rewritten in place.
    pub fn append(&self, session_key: &str, turn: &Turn) -> Result<()> {
        let path = self.paths.session_file(session_key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !path.exists() {
            let now = chrono::Utc::now().to_rfc3339();
            let mut file = File::create(&path)?;
            let metadata = SessionLine::Metadata {
                created_at: now.clone(),
                updated_at: now,
                metadata: serde_json::json!({ "session_key": session_key }),
            };
            writeln!(file, "{}", serde_json::to_string(&metadata)?)?;
        }

        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(turn)?)?;

        Ok(())
    }

    pub fn exists(&self, session_key: &str) -> bool {
        self.paths.session_file(session_key).exists()
    }
}
