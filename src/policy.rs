use std::collections::HashSet;

use anyhow::{anyhow, Context};
use glob::Pattern;

use crate::config::PolicyDef;

pub const DEFAULT_POLICY: &str = "default";

#[derive(Clone, Debug)]
struct FilePattern {
    pattern: Pattern,
    extract_fields: Option<Vec<String>>,
}

/// A named rule deciding which fields of which files go to which model with which prompt.
#[derive(Clone, Debug)]
pub struct Policy {
    pub name: String,
    pub priority: i64,
    pub model: String,
    pub prompt_file: String,
    pub extract_fields: Option<Vec<String>>,
    patterns: Vec<FilePattern>,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolvedPolicy<'a> {
    pub policy: &'a Policy,
    pub extract_fields: Option<&'a [String]>,
}

#[derive(Clone, Debug)]
pub struct PolicySet {
    // Ascending priority; ties keep declaration order.
    policies: Vec<Policy>,
    default_idx: usize,
}

impl PolicySet {
    pub fn new(defs: &[PolicyDef]) -> anyhow::Result<Self> {
        let mut policies = Vec::with_capacity(defs.len());
        let mut names = HashSet::with_capacity(defs.len());
        for def in defs {
            if !names.insert(def.name.as_str()) {
                return Err(anyhow!("duplicate translation policy name {:?}", def.name));
            }
            let mut patterns = Vec::with_capacity(def.file_patterns.len());
            for fp in &def.file_patterns {
                let pattern = Pattern::new(&fp.pattern).with_context(|| {
                    format!("policy {}: invalid file pattern {:?}", def.name, fp.pattern)
                })?;
                patterns.push(FilePattern {
                    pattern,
                    extract_fields: fp
                        .extract_fields
                        .clone()
                        .or_else(|| def.extract_fields.clone()),
                });
            }
            policies.push(Policy {
                name: def.name.clone(),
                priority: def.priority,
                model: def.model.clone(),
                prompt_file: def.prompt_file.clone(),
                extract_fields: def.extract_fields.clone(),
                patterns,
            });
        }
        policies.sort_by_key(|p| p.priority);

        let default_idx = policies
            .iter()
            .position(|p| p.name == DEFAULT_POLICY)
            .ok_or_else(|| anyhow!("no translation policy named {DEFAULT_POLICY:?} configured"))?;
        Ok(Self {
            policies,
            default_idx,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    #[must_use]
    pub fn default_policy(&self) -> &Policy {
        &self.policies[self.default_idx]
    }

    /// Every matching pattern entry, in priority order, or the default policy alone.
    ///
    /// A pattern matches when it matches either the full relative path or the bare filename.
    /// A policy with several matching entries appears once per entry, each carrying that
    /// entry's field list.
    #[must_use]
    pub fn resolve_all(&self, file_path: &str) -> Vec<ResolvedPolicy<'_>> {
        let full = file_path.replace('\\', "/");
        let name = full.rsplit('/').next().unwrap_or(&full).to_string();

        let mut out = Vec::new();
        for policy in &self.policies {
            for fp in &policy.patterns {
                if fp.pattern.matches(&full) || fp.pattern.matches(&name) {
                    out.push(ResolvedPolicy {
                        policy,
                        extract_fields: fp.extract_fields.as_deref(),
                    });
                }
            }
        }
        if out.is_empty() {
            let policy = self.default_policy();
            out.push(ResolvedPolicy {
                policy,
                extract_fields: policy.extract_fields.as_deref(),
            });
        }
        out
    }

    #[must_use]
    pub fn resolve_first(&self, file_path: &str) -> ResolvedPolicy<'_> {
        let all = self.resolve_all(file_path);
        all[0]
    }
}
