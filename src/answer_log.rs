use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AnswerEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub source: String,
    pub answer: String,
}

/// Markdown record of model answers. Screenshots themselves are never written.
#[derive(Debug, Clone)]
pub struct AnswerLog {
    path: PathBuf,
}

impl AnswerLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AnswerEntry) -> Result<()> {
        let mut file = self.open()?;
        writeln!(
            file,
            "## Answer {} at {}",
            entry.sequence,
            entry.timestamp.to_rfc3339()
        )?;
        writeln!(
            file,
            "- Screen: {}x{} via {}",
            entry.width, entry.height, entry.source
        )?;
        writeln!(file)?;
        writeln!(file, "{}", entry.answer.trim())?;
        writeln!(file)?;
        Ok(())
    }

    pub fn append_failure(
        &self,
        sequence: u64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let mut file = self.open()?;
        writeln!(
            file,
            "## Failed answer {} at {}",
            sequence,
            timestamp.to_rfc3339()
        )?;
        writeln!(file, "- Reason: {}", reason.replace('\n', " "))?;
        writeln!(file)?;
        Ok(())
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create answer log directory {}",
                    parent.display()
                )
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open answer log {}", self.path.display()))
    }
}
