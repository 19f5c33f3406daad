use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};

/// System prompts keyed by the `prompt_file` name used in policies.
#[derive(Clone, Debug)]
pub struct PromptCatalog {
    base: Arc<str>,
    named: HashMap<String, Arc<str>>,
}

impl PromptCatalog {
    /// Reads the base prompt plus every named prompt. A named prompt that does not exist falls
    /// back to the base prompt; a missing base prompt is an error.
    pub fn load<'a>(
        config_dir: &Path,
        base_prompt: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) -> anyhow::Result<Self> {
        let base_path = config_dir.join(base_prompt);
        if !base_path.exists() {
            return Err(anyhow!(
                "base prompt not found: {} (run: gamedata-translator --init-config)",
                base_path.display()
            ));
        }
        let base: Arc<str> = read_prompt(&base_path)?.into();

        let mut named = HashMap::new();
        for name in names {
            if named.contains_key(name) {
                continue;
            }
            let p = config_dir.join(name);
            let text: Arc<str> = if p.exists() {
                read_prompt(&p)?.into()
            } else {
                tracing::warn!(prompt = name, "prompt file not found, using base prompt");
                Arc::clone(&base)
            };
            named.insert(name.to_string(), text);
        }
        Ok(Self { base, named })
    }

    #[must_use]
    pub fn from_texts<I, K, V>(base: &str, named: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        Self {
            base: base.into(),
            named: named
                .into_iter()
                .map(|(k, v)| (k.into(), Arc::from(v.as_ref())))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Arc<str> {
        self.named
            .get(name)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.base))
    }
}

fn read_prompt(path: &Path) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read prompt: {}", path.display()))?;
    Ok(text.trim_start_matches('\u{FEFF}').trim().to_string())
}

pub const DEFAULT_PROMPT_FILE: &str = "prompt.txt";

pub const DEFAULT_PROMPT_TEXT: &str = r#"You are a professional game localizer. Translate every numbered entry into Simplified Chinese.

Rules:
- Keep the numbering: answer entry N as "N. <translation>".
- End every entry with a line containing exactly ---SPLITTER---
- Do NOT merge, split, skip or reorder entries.
- Keep markup such as <color=...>, [tags], {placeholders} and \n unchanged.
- Terms that are already in Chinese are fixed translations; keep them.
- Output ONLY the numbered translations, no commentary."#;
