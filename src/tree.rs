use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

pub const DATA_LIST: &str = "dataList";

/// One JSON document of a language tree, keyed by its prefix-stripped relative path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    #[serde(rename = "rel_path")]
    pub id: String,
    pub filename: String,
    #[serde(rename = "full_path")]
    pub source_path: PathBuf,
    /// `None` when the file is not valid JSON.
    pub content: Option<Value>,
}

impl Record {
    #[must_use]
    pub fn data_list(&self) -> Option<&Vec<Value>> {
        self.content.as_ref()?.get(DATA_LIST)?.as_array()
    }

    pub fn data_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.content.as_mut()?.get_mut(DATA_LIST)?.as_array_mut()
    }
}

/// Strips known language prefixes (repeatedly) so `KR_foo.json` and `foo.json` share an id.
pub fn normalize_filename<S: AsRef<str>>(filename: &str, prefixes: &[S]) -> String {
    let mut name = filename;
    'outer: loop {
        for p in prefixes {
            let p = p.as_ref();
            if !p.is_empty() {
                if let Some(rest) = name.strip_prefix(p) {
                    name = rest;
                    continue 'outer;
                }
            }
        }
        break;
    }
    name.to_string()
}

pub fn record_id(rel_dir: &Path, filename: &str) -> String {
    let mut parts: Vec<String> = rel_dir
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.push(filename.to_string());
    parts.join("/")
}

/// Reads every `.json` file under `root/lang` into a map keyed by record id.
pub fn extract_files_content<S: AsRef<str>>(
    root: &Path,
    lang: &str,
    prefixes: &[S],
) -> anyhow::Result<BTreeMap<String, Record>> {
    let lang_dir = root.join(lang);
    let mut out = BTreeMap::new();
    if !lang_dir.is_dir() {
        tracing::warn!(dir = %lang_dir.display(), "language folder not found");
        return Ok(out);
    }

    for entry in WalkDir::new(&lang_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk: {}", lang_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let raw_name = entry.file_name().to_string_lossy().into_owned();
        if !raw_name.to_lowercase().ends_with(".json") {
            continue;
        }
        let path = entry.path();
        let rel_dir = path
            .parent()
            .and_then(|p| p.strip_prefix(&lang_dir).ok())
            .unwrap_or_else(|| Path::new(""));
        let filename = normalize_filename(&raw_name, prefixes);
        let id = record_id(rel_dir, &filename);

        let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
        let content = parse_json_lenient(&bytes);
        if content.is_none() {
            tracing::warn!(file = %path.display(), "invalid JSON, treating as new");
        }
        out.insert(
            id.clone(),
            Record {
                id,
                filename,
                source_path: path.to_path_buf(),
                content,
            },
        );
    }
    Ok(out)
}

/// UTF-8 with or without BOM; anything unparsable becomes `None`.
pub fn parse_json_lenient(bytes: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(bytes).ok()?;
    serde_json::from_str(text.trim_start_matches('\u{FEFF}')).ok()
}

/// Canonical form of an item id, or `None` when the item has no usable id.
pub fn item_id_key(item: &Value) -> Option<String> {
    match item.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.to_string()),
    }
}

fn is_empty_content(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Number(_) => false,
    }
}

/// Records (or items) present in `origin` but missing from `existing`.
///
/// Lists of equal length are assumed unchanged, so edits that keep the length are not detected.
pub fn find_new_content(
    origin: &BTreeMap<String, Record>,
    existing: &BTreeMap<String, Record>,
) -> Vec<Record> {
    let mut delta = Vec::new();
    for (id, src) in origin {
        let Some(src_content) = src.content.as_ref() else {
            continue;
        };
        if is_empty_content(src_content) {
            continue;
        }

        let target = existing.get(id).filter(|r| r.content.is_some());
        let Some(target) = target else {
            delta.push(src.clone());
            continue;
        };

        let (Some(src_items), Some(dst_items)) = (src.data_list(), target.data_list()) else {
            continue;
        };
        if src_items.len() == dst_items.len() {
            continue;
        }

        let known: HashSet<String> = dst_items.iter().filter_map(item_id_key).collect();
        let fresh: Vec<Value> = src_items
            .iter()
            .filter(|item| item_id_key(item).is_some_and(|k| !known.contains(&k)))
            .cloned()
            .collect();
        if fresh.is_empty() {
            continue;
        }

        let mut rec = src.clone();
        if let Some(list) = rec.data_list_mut() {
            *list = fresh;
        }
        delta.push(rec);
    }
    delta
}

/// UTF-8 byte total of every string inside the records' item lists.
#[must_use]
pub fn count_text_bytes(records: &[Record]) -> usize {
    fn walk(v: &Value) -> usize {
        match v {
            Value::String(s) => s.len(),
            Value::Array(a) => a.iter().map(walk).sum(),
            Value::Object(m) => m.values().map(walk).sum(),
            _ => 0,
        }
    }
    records
        .iter()
        .filter_map(Record::data_list)
        .flat_map(|items| items.iter())
        .map(walk)
        .sum()
}
