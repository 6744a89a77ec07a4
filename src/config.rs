use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::dom::select::{ExclusionPolicy, SiteRule};
use crate::pipeline::cache::JsonFileBackend;
use crate::pipeline::remote::{AnnotateOptions, ReadingScript};
use crate::pipeline::PipelineSettings;

pub const CONFIG_FILE_NAME: &str = "rubimark.toml";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub batching: BatchingSection,
    #[serde(default)]
    pub rate: RateSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub options: OptionsSection,
    #[serde(default)]
    pub exclusions: ExclusionsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ServiceSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct BatchingSection {
    /// Soft flush trigger, in characters. A batch never splits a fragment.
    #[serde(default)]
    pub char_ceiling: Option<usize>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct RateSection {
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub ceiling_chars: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct CacheSection {
    /// Directory for the durable page-annotation store. Unset means the
    /// cache lives in memory only.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub page_ttl_secs: Option<u64>,
    #[serde(default)]
    pub definition_ttl_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct SessionsSection {
    #[serde(default)]
    pub mutation_debounce_ms: Option<u64>,
    #[serde(default)]
    pub viewport_debounce_ms: Option<u64>,
    #[serde(default)]
    pub caption_debounce_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct OptionsSection {
    /// Reading script: "furigana" or "romaji".
    #[serde(default)]
    pub script: Option<ReadingScript>,
    #[serde(default)]
    pub first_occurrence_only: Option<bool>,
    #[serde(default)]
    pub display_min_level: Option<u8>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ExclusionsSection {
    /// Tags excluded in addition to the built-in denylist.
    #[serde(default)]
    pub extra_tags: Vec<String>,
    #[serde(default)]
    pub skip_editable: Option<bool>,
    #[serde(default)]
    pub require_visible: Option<bool>,
    #[serde(default)]
    pub site_rules: Vec<SiteRuleSection>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct SiteRuleSection {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub attr: Option<String>,
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

/// Search `start` and up to `max_up` parent directories for `filename`.
fn find_file_upwards(start: &Path, filename: &str, max_up: usize) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..=max_up {
        let cand = dir.join(filename);
        if cand.is_file() {
            return Some(cand);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

pub fn find_default_config(workdir: &Path) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, CONFIG_FILE_NAME, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, CONFIG_FILE_NAME, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, CONFIG_FILE_NAME, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn init_default_config(path: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(!path.exists(), "refusing to overwrite {}", path.display());
    std::fs::write(path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", path.display()))?;
    Ok(())
}

const DEFAULT_CONFIG_TOML: &str = r#"[service]
endpoint = "http://127.0.0.1:8040"
timeout_secs = 30

[batching]
char_ceiling = 4000
delay_ms = 500

[rate]
window_secs = 10
ceiling_chars = 50000

[cache]
# dir = "/var/cache/rubimark"
page_ttl_secs = 604800
definition_ttl_secs = 300

[sessions]
mutation_debounce_ms = 300
viewport_debounce_ms = 150
caption_debounce_ms = 700

[options]
script = "furigana"
first_occurrence_only = false
display_min_level = 0

[exclusions]
extra_tags = []
skip_editable = true
require_visible = true
# [[exclusions.site_rules]]
# class = "sidebar"
"#;

impl AppConfig {
    pub fn annotate_options(&self) -> AnnotateOptions {
        let mut opts = AnnotateOptions::default();
        if let Some(script) = self.options.script {
            opts.script = script;
        }
        if let Some(first) = self.options.first_occurrence_only {
            opts.first_occurrence_only = first;
        }
        if let Some(level) = self.options.display_min_level {
            opts.display_min_level = level;
        }
        opts
    }

    pub fn exclusion_policy(&self) -> ExclusionPolicy {
        let mut policy = ExclusionPolicy::default();
        for tag in &self.exclusions.extra_tags {
            policy.tag_denylist.insert(tag.to_ascii_lowercase());
        }
        if let Some(v) = self.exclusions.skip_editable {
            policy.skip_editable = v;
        }
        if let Some(v) = self.exclusions.require_visible {
            policy.require_visible = v;
        }
        for rule in &self.exclusions.site_rules {
            policy.site_rules.push(SiteRule {
                tag: rule.tag.clone(),
                class: rule.class.clone(),
                attr: rule.attr.clone(),
            });
        }
        policy
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings {
            policy: self.exclusion_policy(),
            opts: self.annotate_options(),
            ..Default::default()
        };
        if let Some(ceiling) = self.batching.char_ceiling {
            settings.char_ceiling = ceiling;
        }
        if let Some(ms) = self.batching.delay_ms {
            settings.batch_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.rate.window_secs {
            settings.rate_window = Duration::from_secs(secs);
        }
        if let Some(chars) = self.rate.ceiling_chars {
            settings.rate_ceiling = chars;
        }
        if let Some(secs) = self.cache.page_ttl_secs {
            settings.page_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cache.definition_ttl_secs {
            settings.definition_ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = &self.cache.dir {
            settings.cache_backend = Some(Box::new(JsonFileBackend::at_dir(dir)));
        }
        if let Some(ms) = self.sessions.mutation_debounce_ms {
            settings.session_debounce.mutation = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.sessions.viewport_debounce_ms {
            settings.session_debounce.viewport = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.sessions.caption_debounce_ms {
            settings.session_debounce.caption = Some(Duration::from_millis(ms));
        }
        settings
    }

    pub fn endpoint(&self) -> &str {
        self.service
            .endpoint
            .as_deref()
            .unwrap_or("http://127.0.0.1:8040")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs.unwrap_or(30))
    }
}
