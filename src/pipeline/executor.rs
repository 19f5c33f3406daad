use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use sha2::{Digest, Sha256};

use crate::progress::ConsoleProgress;
use crate::sentinels::parse_numbered_reply;

use super::backend::{BackendErrorKind, ChatRequest, TranslationBackend};
use super::batch::{Batch, Schedule};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Translated(String),
    /// The batch failed or the reply skipped this entry; holds the substituted source text.
    Fallback(String),
    /// Empty input, never sent.
    Passthrough(String),
}

impl TaskOutcome {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Translated(s) | Self::Fallback(s) | Self::Passthrough(s) => s,
        }
    }

    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Translated(s) | Self::Fallback(s) | Self::Passthrough(s) => s,
        }
    }
}

/// Write-once slots addressed by task index. Workers write disjoint indices.
pub struct ResultTable {
    slots: Vec<OnceLock<TaskOutcome>>,
}

impl ResultTable {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Returns false when the slot was already filled or out of range.
    pub fn set(&self, index: usize, outcome: TaskOutcome) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.set(outcome).is_ok())
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TaskOutcome> {
        self.slots.get(index).and_then(OnceLock::get)
    }

    #[must_use]
    pub fn into_outcomes(self) -> Vec<Option<TaskOutcome>> {
        self.slots.into_iter().map(OnceLock::into_inner).collect()
    }
}

/// Parsed replies of one run, keyed by a SHA-256 of the request profile and the batch texts.
/// Only replies that yielded at least one entry are stored.
#[derive(Default)]
pub struct BatchCache {
    replies: Mutex<HashMap<String, HashMap<usize, String>>>,
}

impl BatchCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(batch: &Batch) -> String {
        let mut hasher = Sha256::new();
        hasher.update(batch.profile.key().fingerprint().as_bytes());
        for text in batch.texts() {
            hasher.update([0x1e]);
            hasher.update(text.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<HashMap<usize, String>> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, parsed: HashMap<usize, String>) {
        if !parsed.is_empty() {
            self.lock().insert(key, parsed);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<usize, String>>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug)]
pub enum BatchOutcome {
    /// Parsed reply, keyed by 0-based position inside the batch.
    Parsed(HashMap<usize, String>),
    Failed { kind: BackendErrorKind, attempts: u32 },
}

#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub max_workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub batches: usize,
    pub failed_batches: usize,
    pub requests: usize,
    /// Batches answered from the run cache without a request.
    pub cached_batches: usize,
    pub translated: usize,
    pub fallback: usize,
    pub passthrough: usize,
}

#[derive(Debug)]
struct BatchReport {
    id: usize,
    tasks: usize,
    translated: usize,
    fallback: usize,
    failed: bool,
    cached: bool,
}

/// Answers one batch from `cache`, or sends it and caches a usable reply. The flag is true on a
/// cache hit.
pub fn dispatch_batch(
    backend: &dyn TranslationBackend,
    batch: &Batch,
    settings: &ExecutorSettings,
    requests: &AtomicUsize,
    cache: &BatchCache,
) -> (BatchOutcome, bool) {
    let key = BatchCache::key(batch);
    if let Some(parsed) = cache.get(&key) {
        tracing::debug!(batch = batch.id, "batch answered from cache");
        return (BatchOutcome::Parsed(parsed), true);
    }
    let outcome = send_with_retry(backend, batch, settings, requests);
    if let BatchOutcome::Parsed(parsed) = &outcome {
        cache.insert(key, parsed.clone());
    }
    (outcome, false)
}

/// Sends one batch, retrying up to `max_retries` times after the first attempt.
fn send_with_retry(
    backend: &dyn TranslationBackend,
    batch: &Batch,
    settings: &ExecutorSettings,
    requests: &AtomicUsize,
) -> BatchOutcome {
    let request = ChatRequest::for_batch(&batch.profile, batch.texts());
    requests.fetch_add(1, Ordering::Relaxed);

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match backend.complete(&request) {
            Ok(reply) => {
                tracing::debug!(batch = batch.id, attempts, "batch translated");
                return BatchOutcome::Parsed(parse_numbered_reply(&reply));
            }
            Err(err) if attempts > settings.max_retries => {
                tracing::warn!(batch = batch.id, attempts, error = %err, "batch failed, keeping source text");
                return BatchOutcome::Failed {
                    kind: err.kind,
                    attempts,
                };
            }
            Err(err) => {
                tracing::warn!(batch = batch.id, attempt = attempts, error = %err, "request failed, retrying");
                if !settings.retry_delay.is_zero() {
                    std::thread::sleep(settings.retry_delay);
                }
            }
        }
    }
}

/// Writes one outcome per batch entry. Missing reply entries become `Fallback`.
fn reconcile(
    batch: &Batch,
    outcome: BatchOutcome,
    cached: bool,
    table: &ResultTable,
) -> BatchReport {
    let mut report = BatchReport {
        id: batch.id,
        tasks: batch.entries.len(),
        translated: 0,
        fallback: 0,
        failed: matches!(outcome, BatchOutcome::Failed { .. }),
        cached,
    };
    let mut parsed = match outcome {
        BatchOutcome::Parsed(map) => map,
        BatchOutcome::Failed { .. } => HashMap::new(),
    };
    for (pos, entry) in batch.entries.iter().enumerate() {
        let outcome = match parsed.remove(&pos) {
            Some(text) if !text.is_empty() => {
                report.translated += 1;
                TaskOutcome::Translated(text)
            }
            _ => {
                report.fallback += 1;
                TaskOutcome::Fallback(entry.prepared.clone())
            }
        };
        if !table.set(entry.index, outcome) {
            tracing::warn!(batch = batch.id, task = entry.index, "result slot already filled");
        }
    }
    if !report.failed && report.fallback > 0 {
        tracing::warn!(
            batch = batch.id,
            missing = report.fallback,
            "reply skipped entries, keeping source text"
        );
    }
    report
}

/// Runs every batch of `schedule` on a pool of `min(max_workers, batches)` threads. Progress is
/// rendered on the calling thread.
pub fn execute(
    backend: &dyn TranslationBackend,
    schedule: Schedule,
    settings: &ExecutorSettings,
    progress: &ConsoleProgress,
    cache: &BatchCache,
) -> (ResultTable, ExecutionStats) {
    let table = ResultTable::new(schedule.total_tasks);
    let mut stats = ExecutionStats {
        batches: schedule.batches.len(),
        passthrough: schedule.passthrough.len(),
        ..ExecutionStats::default()
    };
    for (index, text) in schedule.passthrough {
        table.set(index, TaskOutcome::Passthrough(text));
    }
    if schedule.batches.is_empty() {
        return (table, stats);
    }

    let total_batches = schedule.batches.len();
    let total_tasks: usize = schedule.batches.iter().map(|b| b.entries.len()).sum();
    let workers = settings.max_workers.max(1).min(total_batches);
    progress.info(format!(
        "translating {total_tasks} fields in {total_batches} batches with {workers} workers"
    ));

    let (job_tx, job_rx) = unbounded::<Batch>();
    for batch in schedule.batches {
        if job_tx.send(batch).is_err() {
            break;
        }
    }
    drop(job_tx);

    let (done_tx, done_rx) = unbounded::<BatchReport>();
    let requests = AtomicUsize::new(0);
    let started = Instant::now();

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let table = &table;
            let requests = &requests;
            s.spawn(move || {
                for batch in job_rx.iter() {
                    let (outcome, cached) =
                        dispatch_batch(backend, &batch, settings, requests, cache);
                    let report = reconcile(&batch, outcome, cached, table);
                    if done_tx.send(report).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        let mut done_tasks = 0usize;
        for report in done_rx.iter() {
            done_tasks += report.tasks;
            stats.translated += report.translated;
            stats.fallback += report.fallback;
            if report.failed {
                stats.failed_batches += 1;
            }
            if report.cached {
                stats.cached_batches += 1;
            }
            tracing::debug!(batch = report.id, tasks = report.tasks, "batch done");
            progress.rate(
                "fields",
                done_tasks,
                total_tasks,
                requests.load(Ordering::Relaxed),
                started,
                &outcome_detail(&stats),
            );
        }
    });

    stats.requests = requests.load(Ordering::Relaxed);
    (table, stats)
}

fn outcome_detail(stats: &ExecutionStats) -> String {
    format!("{} translated, {} fallback", stats.translated, stats.fallback)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::pipeline::backend::{BackendError, BackendErrorKind, ChatRequest, TranslationBackend};
    use crate::pipeline::batch::tests::profile;
    use crate::pipeline::batch::{schedule, TranslationTask};
    use crate::progress::ConsoleProgress;
    use crate::terminology::{Glossary, TermMatcher};

    use super::{execute, outcome_detail, BatchCache, ExecutionStats, ExecutorSettings, TaskOutcome};

    struct AlwaysFail {
        calls: AtomicUsize,
    }

    impl TranslationBackend for AlwaysFail {
        fn complete(&self, _request: &ChatRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::new(BackendErrorKind::Transport, "connection refused"))
        }
    }

    /// Answers `[n]` for every numbered line except the ones listed in `skip`.
    struct Echo {
        skip: Vec<String>,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(skip: &[&str]) -> Self {
            Self {
                skip: skip.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TranslationBackend for Echo {
        fn complete(&self, request: &ChatRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = String::new();
            for line in request.user_content().lines() {
                let Some((num, text)) = line.split_once(". ") else {
                    continue;
                };
                if self.skip.iter().any(|s| s == text) {
                    continue;
                }
                out.push_str(&format!("{num}. [{text}]\n---SPLITTER---\n"));
            }
            Ok(out)
        }
    }

    fn settings(max_retries: u32) -> ExecutorSettings {
        ExecutorSettings {
            max_workers: 4,
            max_retries,
            retry_delay: Duration::ZERO,
        }
    }

    fn tasks(texts: &[&str]) -> Vec<TranslationTask> {
        let p = profile("m");
        texts
            .iter()
            .enumerate()
            .map(|(index, t)| TranslationTask {
                index,
                text: t.to_string(),
                profile: Arc::clone(&p),
            })
            .collect()
    }

    #[test]
    fn exhausted_retries_fall_back_to_substituted_text() {
        let glossary: Glossary = [("HP", "生命值")].into_iter().collect();
        let matcher = TermMatcher::compile(&glossary).expect("matcher");
        let sched = schedule(tasks(&["Max HP: 100", "", "Attack"]), &matcher, 2200);
        let backend = AlwaysFail {
            calls: AtomicUsize::new(0),
        };

        let (table, stats) = execute(
            &backend,
            sched,
            &settings(3),
            &ConsoleProgress::new(false),
            &BatchCache::new(),
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.requests, 1);
        assert_eq!(table.get(0), Some(&TaskOutcome::Fallback("Max 生命值: 100".to_string())));
        assert_eq!(table.get(1), Some(&TaskOutcome::Passthrough(String::new())));
        assert_eq!(table.get(2), Some(&TaskOutcome::Fallback("Attack".to_string())));
    }

    #[test]
    fn partial_reply_keeps_skipped_entries() {
        let matcher = TermMatcher::compile(&Glossary::new()).expect("matcher");
        let sched = schedule(tasks(&["a", "b", "c"]), &matcher, 2200);
        let backend = Echo::new(&["b"]);

        let (table, stats) = execute(
            &backend,
            sched,
            &settings(0),
            &ConsoleProgress::new(false),
            &BatchCache::new(),
        );
        assert_eq!(stats.translated, 2);
        assert_eq!(stats.fallback, 1);
        assert_eq!(stats.failed_batches, 0);
        let texts: Vec<String> = table
            .into_outcomes()
            .into_iter()
            .map(|o| o.expect("filled").into_text())
            .collect();
        assert_eq!(texts, vec!["[a]", "b", "[c]"]);
    }

    #[test]
    fn every_task_resolves_across_many_batches() {
        let matcher = TermMatcher::compile(&Glossary::new()).expect("matcher");
        let texts: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        // Any two texts exceed the 8-byte budget: one task per batch.
        let sched = schedule(tasks(&refs), &matcher, 8);
        assert_eq!(sched.batches.len(), 50);
        let backend = Echo::new(&[]);

        let (table, stats) = execute(
            &backend,
            sched,
            &settings(0),
            &ConsoleProgress::new(false),
            &BatchCache::new(),
        );
        assert_eq!(stats.requests, 50);
        for (i, t) in texts.iter().enumerate() {
            assert_eq!(table.get(i), Some(&TaskOutcome::Translated(format!("[{t}]"))));
        }
    }

    #[test]
    fn identical_batches_are_sent_once_per_run() {
        let matcher = TermMatcher::compile(&Glossary::new()).expect("matcher");
        // "Confirm" is 7 bytes: four single-entry batches with the same text.
        let sched = schedule(tasks(&["Confirm"; 4]), &matcher, 7);
        assert_eq!(sched.batches.len(), 4);
        let backend = Echo::new(&[]);
        let serial = ExecutorSettings {
            max_workers: 1,
            ..settings(0)
        };

        let (table, stats) = execute(
            &backend,
            sched,
            &serial,
            &ConsoleProgress::new(false),
            &BatchCache::new(),
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.cached_batches, 3);
        assert_eq!(stats.translated, 4);
        for i in 0..4 {
            assert_eq!(table.get(i), Some(&TaskOutcome::Translated("[Confirm]".to_string())));
        }
    }

    #[test]
    fn failed_batches_are_not_cached() {
        let matcher = TermMatcher::compile(&Glossary::new()).expect("matcher");
        let sched = schedule(tasks(&["Confirm", "Confirm"]), &matcher, 7);
        let backend = AlwaysFail {
            calls: AtomicUsize::new(0),
        };
        let serial = ExecutorSettings {
            max_workers: 1,
            ..settings(1)
        };

        let (_, stats) = execute(
            &backend,
            sched,
            &serial,
            &ConsoleProgress::new(false),
            &BatchCache::new(),
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.cached_batches, 0);
        assert_eq!(stats.failed_batches, 2);
    }

    #[test]
    fn cache_key_depends_on_profile_and_texts() {
        let matcher = TermMatcher::compile(&Glossary::new()).expect("matcher");
        let a = schedule(tasks(&["x"]), &matcher, 100);
        let b = schedule(tasks(&["y"]), &matcher, 100);
        let mut other = tasks(&["x"]);
        other[0].profile = profile("other-model");
        let c = schedule(other, &matcher, 100);
        let key = BatchCache::key(&a.batches[0]);
        assert_eq!(key.len(), 64);
        assert_ne!(key, BatchCache::key(&b.batches[0]));
        assert_ne!(key, BatchCache::key(&c.batches[0]));
        assert_eq!(key, BatchCache::key(&schedule(tasks(&["x"]), &matcher, 100).batches[0]));
    }

    #[test]
    fn progress_detail_reports_translated_and_fallback() {
        let stats = ExecutionStats {
            translated: 5,
            fallback: 2,
            ..ExecutionStats::default()
        };
        assert_eq!(outcome_detail(&stats), "5 translated, 2 fallback");
    }

    #[test]
    fn result_slots_are_write_once() {
        let table = super::ResultTable::new(1);
        assert!(table.set(0, TaskOutcome::Translated("a".to_string())));
        assert!(!table.set(0, TaskOutcome::Translated("b".to_string())));
        assert!(!table.set(5, TaskOutcome::Translated("c".to_string())));
        assert_eq!(table.get(0).map(TaskOutcome::text), Some("a"));
    }
}
