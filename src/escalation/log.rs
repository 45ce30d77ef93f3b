use super::EscalationCase;
use crate::error::EngineError;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-only log of archived cases, one JSON document per line
#[derive(Debug, Clone)]
pub struct CaseLog {
    path: PathBuf,
}

impl CaseLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, case: &EscalationCase) -> Result<(), EngineError> {
        let line = serde_json::to_string(case)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::Persistence(format!("{}: {e}", self.path.display())))?;
        writeln!(file, "{line}")?;
        tracing::debug!(case_id = %case.id, path = %self.path.display(), "Archived escalation case");
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<EscalationCase>, EngineError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut cases = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            cases.push(serde_json::from_str(&line)?);
        }
        Ok(cases)
    }
}
