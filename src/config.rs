use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;

pub const CONFIG_FILENAME: &str = "gamedata-translator.toml";
pub const CONFIG_ENV: &str = "GAMEDATA_TRANSLATOR_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub translation_settings: TranslationSettings,
    /// Named directories (`input_direction`, `output_direction`, `test_dir_in`, ...).
    #[serde(default)]
    pub file_paths: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub options: OptionsSection,
    #[serde(default)]
    pub config_files: ConfigFilesSection,
    #[serde(default)]
    pub models: HashMap<String, ModelDef>,
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    pub max_workers: usize,
    /// Byte budget of one batch (UTF-8 bytes of the substituted texts).
    pub max_chars_per_batch: usize,
    /// Pause between attempts of the same batch.
    pub retry_delay_ms: u64,
    pub origin_language: String,
    pub target_direction: String,
    pub strip_prefixes: Vec<String>,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: 60,
            max_workers: 5,
            max_chars_per_batch: 2200,
            retry_delay_ms: 0,
            origin_language: "KR".to_string(),
            target_direction: "LLC_zh-CN".to_string(),
            strip_prefixes: vec!["KR_".to_string(), "JP_".to_string(), "EN_".to_string()],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OptionsSection {
    pub confirm_before_translation: bool,
    pub keep_backup_files: bool,
    /// Write debug snapshots of every stage into `backup_dir` (same as `update --log`).
    pub log_snapshots: bool,
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            confirm_before_translation: true,
            keep_backup_files: true,
            log_snapshots: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConfigFilesSection {
    pub terminology: String,
    pub blacklist: String,
    pub base_prompt: String,
}

impl Default for ConfigFilesSection {
    fn default() -> Self {
        Self {
            terminology: "terminology.json".to_string(),
            blacklist: "BlackList.json".to_string(),
            base_prompt: "prompt.txt".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ModelDef {
    #[serde(default)]
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub enable_thinking: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_prompt_file")]
    pub prompt_file: String,
    #[serde(default)]
    pub extract_fields: Option<Vec<String>>,
    #[serde(default)]
    pub file_patterns: Vec<FilePatternDef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FilePatternDef {
    pub pattern: String,
    #[serde(default)]
    pub extract_fields: Option<Vec<String>>,
}

fn default_priority() -> i64 {
    999
}

fn default_model() -> String {
    "deepseek".to_string()
}

fn default_prompt_file() -> String {
    "prompt.txt".to_string()
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

/// `--config`, then `$GAMEDATA_TRANSLATOR_CONFIG`, then an upward search.
pub fn locate_config(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| find_default_config(CONFIG_FILENAME))
        .ok_or_else(|| {
            anyhow!("config not found: {CONFIG_FILENAME} (run: gamedata-translator --init-config)")
        })
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text).with_context(|| format!("parse config: {}", path.display()))
}

pub fn parse_config(text: &str) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(text).context("parse config toml")?;
    Ok(cfg)
}
