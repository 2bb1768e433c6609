use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::brain::{BackendConfig, Provider};
use crate::error::{Result, ScoutError};
use crate::hands::ChromeSettings;
use crate::orchestrator::{SafetyNet, VisitSettings};
use crate::types::{DEFAULT_MAX_STEPS, FilterRule, TargetVehicle};

#[derive(Parser, Debug)]
#[command(name = "listing-scout", version, about = "Finds used-vehicle listings by driving a real browser")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Visit every source in turn and stream progress as JSON lines.
    Run(RunArgs),
    /// Check that the decision backend is reachable.
    Probe(BackendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// ollama, gemini or groq.
    #[arg(long, env = "SCOUT_PROVIDER", default_value = "ollama")]
    pub provider: String,

    #[arg(long = "model-name", env = "SCOUT_MODEL")]
    pub model_name: Option<String>,

    #[arg(long, env = "SCOUT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Override the backend base URL (self-hosted gateways, remote Ollama).
    #[arg(long, env = "SCOUT_LLM_URL")]
    pub llm_url: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub decision_timeout_secs: u64,
}

impl BackendArgs {
    pub fn to_config(&self) -> Result<BackendConfig> {
        let provider: Provider = self.provider.parse()?;
        let mut config = BackendConfig::new(provider);
        config.model = self.model_name.clone();
        config.timeout = Duration::from_secs(self.decision_timeout_secs);

        let key_var = match provider {
            Provider::Ollama => None,
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
        };
        config.api_key = self
            .api_key
            .clone()
            .or_else(|| key_var.and_then(|v| std::env::var(v).ok()));
        config.base_url = self.llm_url.clone().or_else(|| match provider {
            Provider::Ollama => std::env::var("OLLAMA_URL").ok(),
            _ => None,
        });

        if provider.needs_api_key() && config.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ScoutError::Config(format!("provider '{provider}' needs an API key")));
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// JSON file with sources, rules and the vehicle to look for.
    #[arg(long, env = "SCOUT_RULES")]
    pub rules: Option<PathBuf>,

    /// Source base URL; repeat for several. Replaces the sources in the rules file.
    #[arg(long = "source")]
    pub sources: Vec<String>,

    #[arg(long)]
    pub brand: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub year: Option<u16>,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    pub max_steps: usize,

    #[arg(long)]
    pub headless: bool,

    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// DevTools websocket URL of a running Chrome to attach to.
    #[arg(long, env = "SCOUT_CHROME_WS")]
    pub attach: Option<String>,

    /// Remote-debugging port checked for a running Chrome before launching one.
    #[arg(long, default_value_t = 9222)]
    pub debug_port: u16,

    /// Always launch a fresh Chrome.
    #[arg(long)]
    pub no_attach: bool,

    /// Price-like matches needed to accept an unverified marketplace page.
    #[arg(long, default_value_t = 3)]
    pub min_price_matches: usize,

    /// Write the final raw and normalized snapshots of each visit here.
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,
}

/// What a run will do once file and flags are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub sources: Vec<String>,
    pub rules: Vec<FilterRule>,
    pub vehicle: TargetVehicle,
}

impl RunArgs {
    pub fn plan(&self) -> Result<RunPlan> {
        let file = match &self.rules {
            Some(path) => RulesFile::load(path)?,
            None => match RulesFile::default_path().filter(|p| p.exists()) {
                Some(path) => RulesFile::load(&path)?,
                None => RulesFile::default(),
            },
        };

        let sources = if self.sources.is_empty() {
            file.sources.iter().filter_map(SourceEntry::url).collect()
        } else {
            self.sources.clone()
        };
        if sources.is_empty() {
            return Err(ScoutError::Config("no sources configured".into()));
        }

        let mut vehicle = file.vehicle;
        if let Some(brand) = &self.brand {
            vehicle.brand = brand.clone();
        }
        if let Some(model) = &self.model {
            vehicle.model = model.clone();
        }
        if self.year.is_some() {
            vehicle.year = self.year;
        }
        if vehicle.keywords().is_empty() {
            return Err(ScoutError::Config("no vehicle brand, model or year given".into()));
        }

        Ok(RunPlan {
            sources,
            rules: file.rules,
            vehicle,
        })
    }

    pub fn chrome_settings(&self) -> ChromeSettings {
        ChromeSettings {
            headless: self.headless,
            chrome_path: self.chrome_path.clone(),
            attach_ws_url: self.attach.clone().filter(|_| !self.no_attach),
            debug_port: (!self.no_attach).then_some(self.debug_port),
            ..ChromeSettings::default()
        }
    }

    pub fn visit_settings(&self) -> VisitSettings {
        VisitSettings {
            safety_net: SafetyNet {
                min_price_matches: self.min_price_matches,
                ..SafetyNet::default()
            },
            dump_dir: self.dump_dir.clone(),
            ..VisitSettings::default()
        }
    }
}

/// A source as the rules store exports it: a bare URL, `{url}` or a stored
/// rule with `parametros.url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Url(String),
    Object { url: String },
    Stored { parametros: StoredSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSource {
    #[serde(default)]
    pub url: Option<String>,
}

impl SourceEntry {
    pub fn url(&self) -> Option<String> {
        let url = match self {
            Self::Url(url) | Self::Object { url } => Some(url.as_str()),
            Self::Stored { parametros } => parametros.url.as_deref(),
        }?;
        let url = url.trim();
        (!url.is_empty()).then(|| url.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default, alias = "fuentes")]
    pub sources: Vec<SourceEntry>,
    #[serde(default, alias = "filtros_busqueda")]
    pub rules: Vec<FilterRule>,
    #[serde(default, alias = "vehiculo")]
    pub vehicle: TargetVehicle,
}

impl RulesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScoutError::Config(format!("cannot read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("listing-scout").join("rules.json"))
    }
}
