use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;

const BACKUP_MARKER: &str = "_backup_";

/// Timestamped JSON snapshots of pipeline stages.
pub struct BackupWriter {
    dir: PathBuf,
    enabled: bool,
}

impl BackupWriter {
    #[must_use]
    pub fn new(dir: PathBuf, enabled: bool) -> Self {
        Self { dir, enabled }
    }

    /// Writes `<dir>/<prefix>_backup_<YYYYmmdd_HHMMSS>.json`. Returns `None` when disabled.
    pub fn write<T: Serialize + ?Sized>(
        &self,
        value: &T,
        prefix: &str,
    ) -> anyhow::Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create backup dir: {}", self.dir.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("{}{BACKUP_MARKER}{stamp}.json", sanitize_filename(prefix)));
        let text = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize snapshot: {prefix}"))?;
        std::fs::write(&path, text).with_context(|| format!("write backup: {}", path.display()))?;
        Ok(Some(path))
    }

    /// Removes every `*_backup_*.json` in the backup directory, regardless of `enabled`.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let pattern = self.dir.join(format!("*{BACKUP_MARKER}*.json"));
        let pattern = pattern.to_string_lossy().into_owned();
        let mut removed = 0usize;
        for entry in glob::glob(&pattern).with_context(|| format!("backup pattern: {pattern}"))? {
            let path = match entry {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(error = %err, "skip unreadable backup entry");
                    continue;
                }
            };
            std::fs::remove_file(&path)
                .with_context(|| format!("remove backup: {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}
