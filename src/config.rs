use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::classify::{self, ClassifierRules};
use crate::collector::CollectorSettings;
use crate::export::ExportFormat;
use crate::pagination::PaginationStrategy;
use crate::provider::ClientSettings;
use crate::state::PartialPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.icmobile.singlewire.com/api/v1";

/// Resources `export` audits when none are named.
pub const DEFAULT_EXPORT_RESOURCES: [&str; 5] =
    ["licenses", "system-health", "notifications", "devices", "users"];

/// Startup configuration problems. These stop the process before any fetch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API token is missing: pass --token or set FUSION_API_TOKEN")]
    MissingToken,
    #[error("--page-size must be at least 1")]
    ZeroPageSize,
    #[error("could not load classifier rules: {0:#}")]
    Rules(anyhow::Error),
}

/// fusion-sync-rs: background device census for a paginated device API with a tiny JSON dashboard.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fusion-sync-rs",
    version,
    about = "Background device census for a paginated device API with a tiny JSON dashboard.",
    long_about = None
)]
pub struct Cli {
    #[command(flatten)]
    pub api: ApiArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
pub struct ApiArgs {
    /// Bearer token for the device API.
    #[arg(long, env = "FUSION_API_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// API base URL.
    #[arg(long = "base-url", env = "FUSION_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    pub base_url: String,

    /// Items requested per page.
    #[arg(long = "page-size", default_value_t = 100, global = true)]
    pub page_size: usize,

    /// Ceiling on items received per run; reaching it marks the run truncated.
    #[arg(long = "max-items", default_value_t = 30_000, global = true)]
    pub max_items: u64,

    /// Delay between page fetches in milliseconds.
    #[arg(long = "page-delay-ms", default_value_t = 100, global = true)]
    pub page_delay_ms: u64,

    /// First wait after a rate-limit response, doubled on each repeat.
    #[arg(long = "initial-backoff-ms", default_value_t = 5_000, global = true)]
    pub initial_backoff_ms: u64,

    /// Upper bound on a single rate-limit wait.
    #[arg(long = "max-backoff-ms", default_value_t = 60_000, global = true)]
    pub max_backoff_ms: u64,

    /// Consecutive rate-limit responses tolerated before the run is aborted.
    #[arg(long = "max-rate-limit-retries", default_value_t = 20, global = true)]
    pub max_rate_limit_retries: u32,

    /// Per-request timeout in milliseconds.
    #[arg(long = "request-timeout-ms", default_value_t = 20_000, global = true)]
    pub request_timeout_ms: u64,

    /// How the next page is located.
    #[arg(long, value_enum, default_value_t = PaginationStrategy::Auto, global = true)]
    pub strategy: PaginationStrategy,

    /// Query parameter carrying an opaque next-page token.
    #[arg(long = "cursor-param", default_value = "offset", global = true)]
    pub cursor_param: String,

    /// Path to a TOML file with classifier keyword rules.
    #[arg(long, env = "FUSION_RULES", global = true)]
    pub rules: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the dashboard API and run syncs in the background (default).
    Serve(ServeArgs),
    /// Dump every record of one or more resources to JSON or CSV files.
    Export(ExportArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Directory with the static dashboard.
    #[arg(long = "ui-dir", default_value = "ui")]
    pub ui_dir: PathBuf,

    /// Device resource to census.
    #[arg(long, default_value = "devices")]
    pub resource: String,

    /// Re-sync every N seconds.
    #[arg(long = "refresh-secs")]
    pub refresh_secs: Option<u64>,

    /// Start a sync as soon as the server is up.
    #[arg(long = "sync-on-start", default_value_t = false)]
    pub sync_on_start: bool,

    /// What to do with the result of a run that ended early.
    #[arg(long = "partial-policy", value_enum, default_value_t = PartialPolicy::Publish)]
    pub partial_policy: PartialPolicy,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            ui_dir: PathBuf::from("ui"),
            resource: "devices".to_string(),
            refresh_secs: None,
            sync_on_start: false,
            partial_policy: PartialPolicy::Publish,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    /// Resource path to export; repeat for several.
    #[arg(long = "resource", default_values_t = DEFAULT_EXPORT_RESOURCES.map(String::from))]
    pub resources: Vec<String>,

    /// Directory the `fusion_<resource>.<ext>` files are written to.
    #[arg(long = "out-dir", default_value = ".")]
    pub out_dir: PathBuf,

    /// Output format: pretty JSON, or a flat CSV with `attr_<key>` columns.
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    pub format: ExportFormat,
}

impl ApiArgs {
    /// The API token, rejecting a missing or blank value.
    pub fn require_token(&self) -> Result<String, ConfigError> {
        match self.token.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(ConfigError::MissingToken),
        }
    }

    pub fn client_settings(&self, resource: &str) -> Result<ClientSettings, ConfigError> {
        let mut settings = ClientSettings::new(self.base_url.clone(), self.require_token()?);
        settings.resource = resource.to_string();
        settings.cursor_param = self.cursor_param.clone();
        settings.request_timeout = Duration::from_millis(self.request_timeout_ms);
        Ok(settings)
    }

    pub fn collector_settings(&self) -> Result<CollectorSettings, ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(CollectorSettings {
            page_size: self.page_size,
            max_items: self.max_items,
            page_delay: Duration::from_millis(self.page_delay_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            max_rate_limit_retries: self.max_rate_limit_retries,
            strategy: self.strategy,
        })
    }

    /// Rules from `--rules`, or the built-in defaults. An explicit file must load.
    pub fn initial_rules(&self) -> Result<ClassifierRules, ConfigError> {
        match &self.rules {
            Some(path) => classify::load_rules_from_path(path).map_err(ConfigError::Rules),
            None => Ok(ClassifierRules::default()),
        }
    }
}
