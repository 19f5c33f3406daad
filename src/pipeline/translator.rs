use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;

use crate::fields::{extract, inject, render_path, JsonPath, PathSegment};
use crate::progress::ConsoleProgress;
use crate::terminology::TermCache;
use crate::tree::{count_text_bytes, extract_files_content, find_new_content, Record, DATA_LIST};
use crate::writer::{copy_asset_dir, putback};

use super::backend::{HttpBackend, TranslationBackend};
use super::batch::{schedule, TranslationTask};
use super::config::{PipelineConfig, RunMode};
use super::executor::{execute, BatchCache, ExecutorSettings};
use super::trace::BackupWriter;

#[derive(Clone, Debug)]
pub struct UpdateOptions {
    pub mode: RunMode,
    /// Source language folder; defaults to `origin_language`.
    pub lang: Option<String>,
    /// Target language folder; defaults to `target_direction`.
    pub target: Option<String>,
    pub log: bool,
    pub assume_yes: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Normal,
            lang: None,
            target: None,
            log: false,
            assume_yes: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranslationSummary {
    pub records: usize,
    pub fields: usize,
    pub translated: usize,
    pub fallback: usize,
    pub passthrough: usize,
    pub substituted: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub cached_batches: usize,
    pub requests: usize,
    pub inject_errors: usize,
    pub files_written: usize,
}

/// Where a collected field lives: record index plus a path rooted at the record's `dataList`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskPosition {
    pub record: usize,
    pub path: JsonPath,
}

pub struct TranslatorPipeline {
    cfg: PipelineConfig,
    progress: ConsoleProgress,
    backend: Box<dyn TranslationBackend>,
    terms: TermCache,
}

impl TranslatorPipeline {
    pub fn new(cfg: PipelineConfig, progress: ConsoleProgress) -> Self {
        let backend = Box::new(HttpBackend::new(cfg.request_timeout()));
        Self::with_backend(cfg, progress, backend)
    }

    pub fn with_backend(
        cfg: PipelineConfig,
        progress: ConsoleProgress,
        backend: Box<dyn TranslationBackend>,
    ) -> Self {
        Self {
            cfg,
            progress,
            backend,
            terms: TermCache::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Diff, translate and merge. Returns `None` when there was nothing to do or the user declined.
    pub fn update(&mut self, opts: &UpdateOptions) -> anyhow::Result<Option<TranslationSummary>> {
        let origin_lang = opts
            .lang
            .clone()
            .unwrap_or_else(|| self.cfg.settings.origin_language.clone());
        let target_lang = opts
            .target
            .clone()
            .unwrap_or_else(|| self.cfg.settings.target_direction.clone());
        let source_root = self.cfg.source_root(opts.mode)?.to_path_buf();
        let output_root = self.cfg.output_root(opts.mode)?.to_path_buf();
        let backups = BackupWriter::new(
            self.cfg.dir_or("backup_dir", "backup"),
            opts.log || self.cfg.options.log_snapshots,
        );
        let prefixes = &self.cfg.settings.strip_prefixes;

        self.progress
            .info(format!("Scan source: {}", source_root.join(&origin_lang).display()));
        let origin = extract_files_content(&source_root, &origin_lang, prefixes)?;
        self.progress
            .info(format!("Scan target: {}", output_root.join(&target_lang).display()));
        let existing = extract_files_content(&output_root, &target_lang, prefixes)?;

        let mut delta = find_new_content(&origin, &existing);
        backups.write(&delta, "Delta")?;
        backups.write(&origin.values().collect::<Vec<_>>(), "Ori")?;
        backups.write(&existing.values().collect::<Vec<_>>(), "Old")?;

        if delta.is_empty() {
            self.progress.info("No new content, target is up to date");
            self.finish(&backups)?;
            return Ok(None);
        }

        let total_bytes = count_text_bytes(&delta);
        self.progress.info(format!(
            "{} files with new content, {total_bytes} bytes of text",
            delta.len()
        ));
        if self.cfg.options.confirm_before_translation
            && !opts.assume_yes
            && !confirm(&format!("Translate {total_bytes} bytes? (y/n): "))?
        {
            self.progress.info("Translation cancelled");
            return Ok(None);
        }

        let started = Instant::now();
        let mut summary = self.modify(&mut delta)?;
        self.progress
            .info(format!("Translation took {}", fmt_duration(started.elapsed())));
        backups.write(&delta, "translation_result")?;

        summary.files_written = putback(&delta, &output_root, &target_lang)?;
        self.progress.info(format!(
            "Wrote {} files into {}",
            summary.files_written,
            output_root.join(&target_lang).display()
        ));

        if opts.mode == RunMode::Normal {
            self.copy_font(&output_root.join(&target_lang));
        }
        self.finish(&backups)?;
        self.progress.info(summary_line(&summary));
        Ok(Some(summary))
    }

    /// Replays a saved record list (a `translation_result` snapshot) into the target tree.
    pub fn load(&self, path: &Path, lang: &str, mode: RunMode) -> anyhow::Result<usize> {
        let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("decode utf-8: {}", path.display()))?;
        let records: Vec<Record> = serde_json::from_str(text.trim_start_matches('\u{FEFF}'))
            .with_context(|| format!("parse record list: {}", path.display()))?;
        let output_root = self.cfg.output_root(mode)?;
        let written = putback(&records, output_root, lang)?;
        self.progress.info(format!(
            "Loaded {} records, wrote {written} files into {}",
            records.len(),
            output_root.join(lang).display()
        ));
        Ok(written)
    }

    /// Collects one task per string field. Each `(record, path)` is claimed by the first policy
    /// that extracts it; later policies skip it.
    pub fn collect_tasks(
        &self,
        records: &[Record],
    ) -> anyhow::Result<(Vec<TranslationTask>, Vec<TaskPosition>)> {
        let mut tasks = Vec::new();
        let mut positions = Vec::new();
        let mut processed: HashSet<TaskPosition> = HashSet::new();

        for (record_idx, record) in records.iter().enumerate() {
            let Some(items) = record.data_list() else {
                continue;
            };
            let resolved = self.cfg.policies.resolve_all(&record.id);
            let mut profiles = Vec::with_capacity(resolved.len());
            for r in &resolved {
                profiles.push(self.cfg.profile(&r.policy.name)?);
            }

            for (item_idx, item) in items.iter().enumerate() {
                for (r, profile) in resolved.iter().zip(&profiles) {
                    let walker = extract(
                        item,
                        &self.cfg.blacklist,
                        vec![PathSegment::Index(item_idx)],
                        r.extract_fields,
                    );
                    for (path, text) in walker {
                        let pos = TaskPosition {
                            record: record_idx,
                            path,
                        };
                        if processed.contains(&pos) {
                            continue;
                        }
                        processed.insert(pos.clone());
                        tasks.push(TranslationTask {
                            index: tasks.len(),
                            text: text.to_string(),
                            profile: profile.clone(),
                        });
                        positions.push(pos);
                    }
                }
            }
        }
        Ok((tasks, positions))
    }

    /// Translates every collected field of `records` in place.
    pub fn modify(&mut self, records: &mut [Record]) -> anyhow::Result<TranslationSummary> {
        let (tasks, positions) = self.collect_tasks(records)?;
        let mut summary = TranslationSummary {
            records: records.len(),
            fields: tasks.len(),
            ..TranslationSummary::default()
        };
        if tasks.is_empty() {
            self.progress.info("No translatable text found");
            return Ok(summary);
        }
        self.progress
            .info(format!("Collected {} fields from {} files", tasks.len(), records.len()));

        let matcher = self.terms.matcher_for(&self.cfg.glossary)?;
        let sched = schedule(tasks, &matcher, self.cfg.settings.max_chars_per_batch);
        summary.substituted = sched.substituted;
        self.progress.info(format!(
            "{} request profiles, {} batches, {} fields changed by terminology",
            sched.groups,
            sched.batches.len(),
            sched.substituted
        ));

        let settings = ExecutorSettings {
            max_workers: self.cfg.settings.max_workers,
            max_retries: self.cfg.settings.max_retries,
            retry_delay: Duration::from_millis(self.cfg.settings.retry_delay_ms),
        };
        let cache = BatchCache::new();
        let (table, stats) =
            execute(self.backend.as_ref(), sched, &settings, &self.progress, &cache);
        summary.translated = stats.translated;
        summary.fallback = stats.fallback;
        summary.passthrough = stats.passthrough;
        summary.batches = stats.batches;
        summary.failed_batches = stats.failed_batches;
        summary.cached_batches = stats.cached_batches;
        summary.requests = stats.requests;

        for (pos, outcome) in positions.iter().zip(table.into_outcomes()) {
            let Some(outcome) = outcome else {
                continue;
            };
            let record = &mut records[pos.record];
            let Some(list) = record
                .content
                .as_mut()
                .and_then(|c| c.get_mut(DATA_LIST))
            else {
                continue;
            };
            if let Err(err) = inject(list, &pos.path, Value::String(outcome.into_text())) {
                summary.inject_errors += 1;
                tracing::warn!(
                    record = %record.id,
                    path = %render_path(&pos.path),
                    error = %err,
                    "write back failed"
                );
            }
        }
        Ok(summary)
    }

    fn copy_font(&self, target_lang_dir: &Path) {
        let src = self.cfg.dir_or("font_dir", "Font");
        let name = src
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("Font"));
        let dst = target_lang_dir.join(name);
        match copy_asset_dir(&src, &dst) {
            Ok(true) => self.progress.info(format!("Copied font folder to {}", dst.display())),
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "font folder copy failed"),
        }
    }

    fn finish(&self, backups: &BackupWriter) -> anyhow::Result<()> {
        if !self.cfg.options.keep_backup_files {
            let removed = backups.cleanup()?;
            if removed > 0 {
                self.progress.info(format!("Removed {removed} backup files"));
            }
        }
        Ok(())
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let mut stderr = io::stderr().lock();
    write!(stderr, "{prompt}").context("write prompt")?;
    stderr.flush().context("flush prompt")?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read confirmation")?;
    Ok(answer_is_yes(&line))
}

fn answer_is_yes(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("y")
}

fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    format!("{secs:.2}s ({:.2} min)", secs / 60.0)
}

pub fn summary_line(s: &TranslationSummary) -> String {
    format!(
        "Done: {} fields ({} translated, {} kept source, {} empty), {} batches ({} failed, {} cached), {} requests, {} files written",
        s.fields,
        s.translated,
        s.fallback,
        s.passthrough,
        s.batches,
        s.failed_batches,
        s.cached_batches,
        s.requests,
        s.files_written
    )
}
