use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::config::{AppConfig, ModelDef, OptionsSection, TranslationSettings, CONFIG_FILENAME};
use crate::policy::PolicySet;
use crate::terminology::Glossary;

use super::prompts::{PromptCatalog, DEFAULT_PROMPT_FILE, DEFAULT_PROMPT_TEXT};

const DEFAULT_CHAT_MODEL: &str = "deepseek-chat";
const DEFAULT_TEMPERATURE: f64 = 0.1;

/// Everything one request needs: endpoint, credentials, sampling parameters and system prompt.
#[derive(Clone, Debug)]
pub struct RequestProfile {
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub enable_thinking: bool,
    pub prompt_file: String,
    pub prompt: Arc<str>,
}

/// Grouping key: two policies with identical request parameters share batches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    api_key: String,
    base_url: String,
    model: String,
    temperature_bits: u64,
    enable_thinking: bool,
    prompt_file: String,
}

impl ProfileKey {
    /// Every request parameter in one string, for content hashing.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.api_key,
            self.base_url,
            self.model,
            self.temperature_bits,
            self.enable_thinking,
            self.prompt_file
        )
    }
}

impl RequestProfile {
    #[must_use]
    pub fn key(&self) -> ProfileKey {
        ProfileKey {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature_bits: self.temperature.to_bits(),
            enable_thinking: self.enable_thinking,
            prompt_file: self.prompt_file.clone(),
        }
    }

    fn resolve(
        model_name: &str,
        def: &ModelDef,
        prompt_file: &str,
        prompt: Arc<str>,
    ) -> anyhow::Result<Self> {
        let mut api_key = def.api_key.trim().to_string();
        if api_key.is_empty() {
            if let Some(var) = def.api_key_env.as_deref() {
                api_key = std::env::var(var).unwrap_or_default().trim().to_string();
            }
        }
        if api_key.is_empty() {
            return Err(anyhow!(
                "model {model_name}: empty api_key (set models.{model_name}.api_key or api_key_env)"
            ));
        }
        let base_url = def.base_url.trim().to_string();
        if base_url.is_empty() {
            return Err(anyhow!("model {model_name}: empty base_url"));
        }
        Ok(Self {
            model_name: model_name.to_string(),
            api_key,
            base_url,
            model: def
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            temperature: def.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            enable_thinking: def.enable_thinking,
            prompt_file: prompt_file.to_string(),
            prompt,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    /// Uses `test_dir_in` / `test_dir_out` and skips the font copy.
    Test,
}

/// Immutable, fully validated settings for one run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub config_dir: PathBuf,
    pub settings: TranslationSettings,
    pub options: OptionsSection,
    file_paths: HashMap<String, PathBuf>,
    pub glossary: Glossary,
    pub blacklist: HashSet<String>,
    pub policies: PolicySet,
    profiles: HashMap<String, Arc<RequestProfile>>,
}

#[derive(Deserialize)]
struct BlacklistFile {
    #[serde(rename = "BlackList", default)]
    black_list: Vec<String>,
}

impl PipelineConfig {
    /// Resolves the on-disk config: glossary, blacklist and prompt files are read relative to
    /// `config_path`'s directory.
    pub fn load(app: AppConfig, config_path: &Path) -> anyhow::Result<Self> {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let glossary_path = config_dir.join(&app.config_files.terminology);
        let glossary = if glossary_path.exists() {
            Glossary::from_json_file(&glossary_path)?
        } else {
            tracing::warn!(file = %glossary_path.display(), "terminology not found, using empty glossary");
            Glossary::new()
        };

        let blacklist_path = config_dir.join(&app.config_files.blacklist);
        let blacklist = if blacklist_path.exists() {
            let text = std::fs::read_to_string(&blacklist_path)
                .with_context(|| format!("read blacklist: {}", blacklist_path.display()))?;
            let file: BlacklistFile = serde_json::from_str(text.trim_start_matches('\u{FEFF}'))
                .with_context(|| format!("parse blacklist: {}", blacklist_path.display()))?;
            file.black_list.into_iter().collect()
        } else {
            tracing::warn!(file = %blacklist_path.display(), "blacklist not found, using empty blacklist");
            HashSet::new()
        };

        let prompts = PromptCatalog::load(
            &config_dir,
            &app.config_files.base_prompt,
            app.policies.iter().map(|p| p.prompt_file.as_str()),
        )
        .context("load prompts")?;

        Self::from_sources(app, config_dir, glossary, blacklist, prompts)
    }

    /// Validates policies and model entries. Fails before any request is made when the default
    /// policy, a model entry or its credentials are missing.
    pub fn from_sources(
        app: AppConfig,
        config_dir: PathBuf,
        glossary: Glossary,
        blacklist: HashSet<String>,
        prompts: PromptCatalog,
    ) -> anyhow::Result<Self> {
        let policies = PolicySet::new(&app.policies).context("load translation policies")?;

        let mut profiles = HashMap::new();
        for policy in policies.iter() {
            let def = app.models.get(&policy.model).ok_or_else(|| {
                anyhow!(
                    "policy {}: model {:?} is not configured in [models]",
                    policy.name,
                    policy.model
                )
            })?;
            let profile = RequestProfile::resolve(
                &policy.model,
                def,
                &policy.prompt_file,
                prompts.get(&policy.prompt_file),
            )
            .with_context(|| format!("policy {}", policy.name))?;
            profiles.insert(policy.name.clone(), Arc::new(profile));
        }

        let mut settings = app.translation_settings;
        settings.max_workers = settings.max_workers.max(1);
        settings.max_chars_per_batch = settings.max_chars_per_batch.max(1);

        let file_paths = app
            .file_paths
            .into_iter()
            .map(|(k, v)| {
                let v = if v.is_relative() { config_dir.join(v) } else { v };
                (k, v)
            })
            .collect();

        Ok(Self {
            config_dir,
            settings,
            options: app.options,
            file_paths,
            glossary,
            blacklist,
            policies,
            profiles,
        })
    }

    pub fn dir(&self, key: &str) -> anyhow::Result<&Path> {
        self.file_paths
            .get(key)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("file_paths.{key} is not configured"))
    }

    /// Optional directories fall back to `config_dir/<default>`.
    #[must_use]
    pub fn dir_or(&self, key: &str, default: &str) -> PathBuf {
        self.file_paths
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.config_dir.join(default))
    }

    pub fn source_root(&self, mode: RunMode) -> anyhow::Result<&Path> {
        match mode {
            RunMode::Normal => self.dir("input_direction"),
            RunMode::Test => self.dir("test_dir_in"),
        }
    }

    pub fn output_root(&self, mode: RunMode) -> anyhow::Result<&Path> {
        match mode {
            RunMode::Normal => self.dir("output_direction"),
            RunMode::Test => self.dir("test_dir_out"),
        }
    }

    pub fn profile(&self, policy_name: &str) -> anyhow::Result<Arc<RequestProfile>> {
        self.profiles
            .get(policy_name)
            .cloned()
            .ok_or_else(|| anyhow!("no request profile for policy {policy_name}"))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout.max(1))
    }
}

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILENAME);

    let files: [(&str, &str); 3] = [
        (DEFAULT_PROMPT_FILE, DEFAULT_PROMPT_TEXT),
        ("terminology.json", DEFAULT_TERMINOLOGY_JSON),
        ("BlackList.json", DEFAULT_BLACKLIST_JSON),
    ];
    for (fname, body) in files {
        let p = dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_TERMINOLOGY_JSON: &str = r#"{
  "terminology": {
    "HP": "生命值"
  }
}
"#;

const DEFAULT_BLACKLIST_JSON: &str = r#"{
  "BlackList": ["id", "model", "teller", "place", "bgm", "sound"]
}
"#;

const DEFAULT_CONFIG_TOML: &str = r#"[translation_settings]
origin_language = "KR"
target_direction = "LLC_zh-CN"
max_retries = 3
# seconds per request
timeout = 60
max_workers = 5
# UTF-8 bytes per request
max_chars_per_batch = 2200
retry_delay_ms = 1000
strip_prefixes = ["KR_", "JP_", "EN_"]

[file_paths]
input_direction = "game/Assets/Resources_moved/Localize"
output_direction = "game/LimbusCompany_Data/Lang"
test_dir_in = "test/in"
test_dir_out = "test/out"
backup_dir = "backup"
font_dir = "Font"

[options]
confirm_before_translation = true
keep_backup_files = true
log_snapshots = false

[config_files]
terminology = "terminology.json"
blacklist = "BlackList.json"
base_prompt = "prompt.txt"

[models.deepseek]
api_key = ""
api_key_env = "DEEPSEEK_API_KEY"
base_url = "https://api.deepseek.com/chat/completions"
model = "deepseek-chat"
temperature = 0.1
enable_thinking = false

[[policies]]
name = "default"
priority = 999
model = "deepseek"
prompt_file = "prompt.txt"

# Story files: only dialogue fields, dedicated prompt (falls back to prompt.txt when missing).
# [[policies]]
# name = "story"
# priority = 1
# model = "deepseek"
# prompt_file = "prompt_story.txt"
#
# [[policies.file_patterns]]
# pattern = "StoryData/*"
# extract_fields = ["content", "dlg", "title"]
"#;
