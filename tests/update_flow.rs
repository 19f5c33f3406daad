use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use gamedata_translator::config::load_config;
use gamedata_translator::pipeline::{
    BackendError, BackendErrorKind, ChatRequest, PipelineConfig, RunMode, TranslationBackend,
    TranslatorPipeline, UpdateOptions,
};
use gamedata_translator::progress::ConsoleProgress;

const CONFIG: &str = r#"
[translation_settings]
origin_language = "KR"
target_direction = "LLC_zh-CN"
max_retries = 1
max_workers = 3
max_chars_per_batch = 64

[file_paths]
test_dir_in = "in"
test_dir_out = "out"
backup_dir = "backup"

[options]
confirm_before_translation = true
keep_backup_files = true

[models.mock]
api_key = "k"
base_url = "http://127.0.0.1:9/v1/chat/completions"

[[policies]]
name = "default"
model = "mock"
"#;

/// Replies `译:<text>` for every numbered entry.
struct Translating {
    calls: Arc<AtomicUsize>,
}

impl TranslationBackend for Translating {
    fn complete(&self, request: &ChatRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = String::new();
        for line in request.user_content().lines() {
            if let Some((n, text)) = line.split_once(". ") {
                out.push_str(&format!("{n}. 译:{text}\n---SPLITTER---\n"));
            }
        }
        Ok(out)
    }
}

struct Down;

impl TranslationBackend for Down {
    fn complete(&self, _request: &ChatRequest) -> Result<String, BackendError> {
        Err(BackendError::new(BackendErrorKind::Status(503), "unavailable"))
    }
}

fn write_json(path: &Path, value: &Value) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, serde_json::to_string_pretty(value).expect("json")).expect("write");
}

fn read_json(path: &Path) -> Value {
    let text = std::fs::read_to_string(path).expect("read");
    serde_json::from_str(&text).expect("json")
}

fn setup(root: &Path) -> PipelineConfig {
    std::fs::write(root.join("gamedata-translator.toml"), CONFIG).expect("config");
    std::fs::write(root.join("prompt.txt"), "translate").expect("prompt");
    std::fs::write(
        root.join("terminology.json"),
        r#"{"terminology": {"HP": "生命值"}}"#,
    )
    .expect("terms");
    std::fs::write(root.join("BlackList.json"), r#"{"BlackList": ["id", "model"]}"#)
        .expect("blacklist");

    write_json(
        &root.join("in/KR/Battle/KR_Skills.json"),
        &json!({"dataList": [
            {"id": 1, "model": "s1", "desc": "Slash"},
            {"id": 2, "model": "s2", "desc": "Max HP: 100"},
            {"id": 3, "model": "s3", "desc": ""}
        ]}),
    );
    write_json(
        &root.join("in/KR/UI.json"),
        &json!({"dataList": [{"id": "title", "text": "Start"}]}),
    );
    write_json(
        &root.join("out/LLC_zh-CN/Battle/Skills.json"),
        &json!({"dataList": [{"id": 1, "model": "s1", "desc": "斩击"}]}),
    );

    let cfg_path = root.join("gamedata-translator.toml");
    let app = load_config(&cfg_path).expect("load config");
    PipelineConfig::load(app, &cfg_path).expect("pipeline config")
}

fn test_run() -> UpdateOptions {
    UpdateOptions {
        mode: RunMode::Test,
        assume_yes: true,
        ..UpdateOptions::default()
    }
}

#[test]
fn update_translates_only_the_delta_and_merges() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = setup(dir.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = Box::new(Translating {
        calls: Arc::clone(&calls),
    });
    let mut pipeline = TranslatorPipeline::with_backend(cfg, ConsoleProgress::new(false), backend);

    let summary = pipeline.update(&test_run()).expect("update").expect("summary");
    assert_eq!(summary.fields, 3);
    assert_eq!(summary.translated, 2);
    assert_eq!(summary.passthrough, 1);
    assert_eq!(summary.fallback, 0);
    assert_eq!(summary.files_written, 2);

    let skills = dir.path().join("out/LLC_zh-CN/Battle/Skills.json");
    let raw = std::fs::read_to_string(&skills).expect("read");
    assert!(raw.contains("\r\n"));
    assert_eq!(
        read_json(&skills),
        json!({"dataList": [
            {"id": 1, "model": "s1", "desc": "斩击"},
            {"id": 2, "model": "s2", "desc": "译:Max 生命值: 100"},
            {"id": 3, "model": "s3", "desc": ""}
        ]})
    );
    assert_eq!(
        read_json(&dir.path().join("out/LLC_zh-CN/UI.json")),
        json!({"dataList": [{"id": "title", "text": "译:Start"}]})
    );

    // Second run: nothing new.
    let before = calls.load(Ordering::SeqCst);
    assert!(pipeline.update(&test_run()).expect("rerun").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), before);
}

#[test]
fn failed_backend_keeps_substituted_source_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = setup(dir.path());
    let mut pipeline = TranslatorPipeline::with_backend(cfg, ConsoleProgress::new(false), Box::new(Down));

    let summary = pipeline.update(&test_run()).expect("update").expect("summary");
    assert_eq!(summary.translated, 0);
    assert_eq!(summary.fallback, 2);
    assert!(summary.failed_batches >= 1);

    let skills = read_json(&dir.path().join("out/LLC_zh-CN/Battle/Skills.json"));
    assert_eq!(skills["dataList"][1]["desc"], "Max 生命值: 100");
}

#[test]
fn log_writes_snapshots_and_load_replays_them() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = setup(dir.path());
    let backend = Box::new(Translating {
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let mut pipeline = TranslatorPipeline::with_backend(cfg, ConsoleProgress::new(false), backend);

    let opts = UpdateOptions {
        log: true,
        ..test_run()
    };
    pipeline.update(&opts).expect("update");

    let backup_dir = dir.path().join("backup");
    let snapshot = std::fs::read_dir(&backup_dir)
        .expect("backup dir")
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("translation_result_backup_"))
        })
        .expect("translation_result snapshot");

    let written = pipeline
        .load(&snapshot, "LLC_en", RunMode::Test)
        .expect("load");
    assert_eq!(written, 2);
    let replayed = read_json(&dir.path().join("out/LLC_en/UI.json"));
    assert_eq!(replayed, json!({"dataList": [{"id": "title", "text": "译:Start"}]}));
}
