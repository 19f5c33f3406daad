use std::collections::HashMap;
use std::sync::Arc;

use crate::terminology::TermMatcher;

use super::config::{ProfileKey, RequestProfile};

/// One string leaf headed for translation. `index` addresses its slot in the result table.
#[derive(Clone, Debug)]
pub struct TranslationTask {
    pub index: usize,
    pub text: String,
    pub profile: Arc<RequestProfile>,
}

#[derive(Clone, Debug)]
pub struct BatchEntry {
    pub index: usize,
    /// Text after terminology substitution; this is what gets sent and what a failed batch
    /// falls back to.
    pub prepared: String,
}

#[derive(Clone, Debug)]
pub struct Batch {
    pub id: usize,
    pub profile: Arc<RequestProfile>,
    pub entries: Vec<BatchEntry>,
    pub bytes: usize,
}

impl Batch {
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.prepared.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Schedule {
    pub batches: Vec<Batch>,
    /// Empty inputs, resolved without a request.
    pub passthrough: Vec<(usize, String)>,
    pub groups: usize,
    pub substituted: usize,
    pub total_tasks: usize,
}

struct Group {
    profile: Arc<RequestProfile>,
    entries: Vec<BatchEntry>,
}

/// Groups tasks by request profile (first-seen order), substitutes glossary terms, then packs
/// each group greedily so a batch's UTF-8 byte total stays within `max_bytes`. A single entry
/// larger than the budget becomes its own batch.
#[must_use]
pub fn schedule(tasks: Vec<TranslationTask>, matcher: &TermMatcher, max_bytes: usize) -> Schedule {
    let mut out = Schedule {
        total_tasks: tasks.len(),
        ..Schedule::default()
    };
    let mut order: Vec<Group> = Vec::new();
    let mut by_key: HashMap<ProfileKey, usize> = HashMap::new();

    for task in tasks {
        if task.text.is_empty() {
            out.passthrough.push((task.index, task.text));
            continue;
        }
        let (prepared, changed) = matcher.apply(&task.text);
        if changed {
            out.substituted += 1;
        }
        let slot = *by_key.entry(task.profile.key()).or_insert_with(|| {
            order.push(Group {
                profile: Arc::clone(&task.profile),
                entries: Vec::new(),
            });
            order.len() - 1
        });
        order[slot].entries.push(BatchEntry {
            index: task.index,
            prepared,
        });
    }
    out.groups = order.len();

    for group in order {
        let mut current: Vec<BatchEntry> = Vec::new();
        let mut bytes = 0usize;
        for entry in group.entries {
            let len = entry.prepared.len();
            if !current.is_empty() && bytes + len > max_bytes {
                out.batches.push(Batch {
                    id: out.batches.len(),
                    profile: Arc::clone(&group.profile),
                    entries: std::mem::take(&mut current),
                    bytes,
                });
                bytes = 0;
            }
            bytes += len;
            current.push(entry);
        }
        if !current.is_empty() {
            out.batches.push(Batch {
                id: out.batches.len(),
                profile: Arc::clone(&group.profile),
                entries: current,
                bytes,
            });
        }
    }
    out
}
