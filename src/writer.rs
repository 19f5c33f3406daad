use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tree::{item_id_key, parse_json_lenient, Record, DATA_LIST};

/// Appends source items whose id is absent (or missing) from `target`. Existing ids are never
/// overwritten.
pub fn merge_datalists(target: &mut Vec<Value>, source: Vec<Value>) {
    let mut known: HashSet<String> = target.iter().filter_map(item_id_key).collect();
    for item in source {
        match item_id_key(&item) {
            Some(k) => {
                if known.insert(k) {
                    target.push(item);
                }
            }
            None => target.push(item),
        }
    }
}

/// Pretty JSON with 2-space indent and CRLF line endings.
pub fn to_crlf_json(value: &Value) -> anyhow::Result<String> {
    let text = serde_json::to_string_pretty(value).context("serialize target json")?;
    Ok(text.replace('\n', "\r\n"))
}

pub fn target_path(output_root: &Path, lang: &str, record_id: &str) -> PathBuf {
    let mut p = output_root.join(lang);
    for part in record_id.split('/') {
        p.push(part);
    }
    p
}

/// Merges every translated record into its counterpart under `output_root/lang`.
/// Returns the number of files written.
pub fn putback(records: &[Record], output_root: &Path, lang: &str) -> anyhow::Result<usize> {
    let mut written = 0usize;
    for rec in records {
        let Some(source) = rec.data_list() else {
            tracing::warn!(record = %rec.id, "skip: content has no dataList");
            continue;
        };

        let path = target_path(output_root, lang, &rec.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }

        let mut target = match std::fs::read(&path) {
            Ok(bytes) => parse_json_lenient(&bytes)
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({ DATA_LIST: [] })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => json!({ DATA_LIST: [] }),
            Err(err) => {
                return Err(err).with_context(|| format!("read target: {}", path.display()));
            }
        };
        let Some(obj) = target.as_object_mut() else {
            continue;
        };
        let entry = obj
            .entry(DATA_LIST.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(list) = entry {
            merge_datalists(list, source.clone());
        }

        std::fs::write(&path, to_crlf_json(&target)?)
            .with_context(|| format!("write: {}", path.display()))?;
        written += 1;
    }
    Ok(written)
}

/// Copies `src` into `dst` recursively unless `dst` already exists.
/// Returns whether anything was copied.
pub fn copy_asset_dir(src: &Path, dst: &Path) -> anyhow::Result<bool> {
    if dst.exists() || !src.is_dir() {
        return Ok(false);
    }
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walk: {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relative path: {}", entry.path().display()))?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out)
                .with_context(|| format!("create dir: {}", out.display()))?;
        } else {
            std::fs::copy(entry.path(), &out)
                .with_context(|| format!("copy: {}", entry.path().display()))?;
        }
    }
    Ok(true)
}
