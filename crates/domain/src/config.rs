//! The Overseer configuration document.
//!
//! Loaded from `.config/overseer/overseer.json` under the workspace root.
//! Every section is optional; a missing file yields the full default
//! document. Unknown fields are ignored so older daemons can read newer
//! configs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub context_budget: ContextBudgetConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load the config document from `<root>/.config/overseer/overseer.json`.
    ///
    /// A missing file yields `Config::default()`. A present but malformed
    /// file is an error — silently falling back would mask typos in limits.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root
            .join(".config")
            .join("overseer")
            .join("overseer.json");
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Workspace root all relative paths resolve against.
    #[serde(default = "d_workspace_root")]
    pub workspace_root: PathBuf,
    /// Gateway daemon state (pid, token, log, children registry).
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    /// Per-session event streams.
    #[serde(default = "d_events_dir")]
    pub events_dir: PathBuf,
    /// Evidence ledger + rollback snapshots.
    #[serde(default = "d_orchestrator_dir")]
    pub orchestrator_dir: PathBuf,
    /// Semantic memory tier.
    #[serde(default = "d_memory_dir")]
    pub memory_dir: PathBuf,
    /// Skill contract catalog (one JSON document per skill).
    #[serde(default = "d_skills_dir")]
    pub skills_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_root: d_workspace_root(),
            state_dir: d_state_dir(),
            events_dir: d_events_dir(),
            orchestrator_dir: d_orchestrator_dir(),
            memory_dir: d_memory_dir(),
            skills_dir: d_skills_dir(),
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.workspace_root.join(rel)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn events_dir(&self) -> PathBuf {
        self.resolve(&self.events_dir)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.resolve(&self.orchestrator_dir)
            .join("ledger")
            .join("evidence.jsonl")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.resolve(&self.orchestrator_dir).join("snapshots")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.resolve(&self.memory_dir)
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.resolve(&self.skills_dir)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evidence ledger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Run checkpoint compaction every N turns (0 disables the cadence).
    #[serde(default = "d_checkpoint_every_turns")]
    pub checkpoint_every_turns: u64,
    /// How many most-recent rows survive a checkpoint.
    #[serde(default = "d_digest_window")]
    pub digest_window: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_turns: d_checkpoint_every_turns(),
            digest_window: d_digest_window(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationStrategy {
    /// Reject the whole entry when it exceeds the budget.
    DropEntry,
    /// Keep head and tail with an elision marker.
    Summarize,
    /// Keep the trailing slice.
    Tail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgetConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Model context window in tokens.
    #[serde(default = "d_context_window")]
    pub context_window: u64,
    /// Pressure ratio at which compaction is requested.
    #[serde(default = "d_compaction_threshold")]
    pub compaction_threshold: f64,
    /// Pressure ratio at which injections are dropped and the gate arms.
    #[serde(default = "d_hard_limit_ratio")]
    pub hard_limit_ratio: f64,
    /// Pressure ratio that bypasses the compaction cadence entirely.
    #[serde(default = "d_pressure_bypass_percent")]
    pub pressure_bypass_percent: f64,
    /// Upper bound on a single primary injection.
    #[serde(default = "d_max_injection_tokens")]
    pub max_injection_tokens: u64,
    /// Fixed token estimator: characters per token.
    #[serde(default = "d_chars_per_token")]
    pub chars_per_token: u64,
    #[serde(default = "d_truncation_strategy")]
    pub truncation_strategy: TruncationStrategy,
    /// Minimum turns between two compactions.
    #[serde(default = "d_min_turns_between_compaction")]
    pub min_turns_between_compaction: u64,
    /// Minimum wall-clock seconds between two compactions.
    #[serde(default = "d_min_seconds_between_compaction")]
    pub min_seconds_between_compaction: i64,
    /// A compaction within this many turns counts as "recent" for the gate.
    #[serde(default = "d_recent_compaction_window_turns")]
    pub recent_compaction_window_turns: u64,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window: d_context_window(),
            compaction_threshold: d_compaction_threshold(),
            hard_limit_ratio: d_hard_limit_ratio(),
            pressure_bypass_percent: d_pressure_bypass_percent(),
            max_injection_tokens: d_max_injection_tokens(),
            chars_per_token: d_chars_per_token(),
            truncation_strategy: TruncationStrategy::Tail,
            min_turns_between_compaction: d_min_turns_between_compaction(),
            min_seconds_between_compaction: d_min_seconds_between_compaction(),
            recent_compaction_window_turns: d_recent_compaction_window_turns(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Last N failed tool results included in `[RecentToolFailures]`.
    #[serde(default = "d_recent_failures")]
    pub recent_failures: usize,
    /// Per-source cap fractions of `max_injection_tokens`, keyed by source id.
    /// Sources absent from the map use `default_cap_fraction`.
    #[serde(default)]
    pub cap_fractions: HashMap<String, f64>,
    #[serde(default = "d_default_cap_fraction")]
    pub default_cap_fraction: f64,
    /// Per-source floors in tokens (mandatory minimum for critical sources).
    #[serde(default)]
    pub floors: HashMap<String, u64>,
    #[serde(default = "d_default_floor")]
    pub default_floor: u64,
    #[serde(default = "d_default_ceiling")]
    pub default_ceiling: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recent_failures: d_recent_failures(),
            cap_fractions: HashMap::new(),
            default_cap_fraction: d_default_cap_fraction(),
            floors: HashMap::new(),
            default_floor: d_default_floor(),
            default_ceiling: d_default_ceiling(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Off,
    Warn,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_enforce")]
    pub allowed_tools_mode: EnforcementMode,
    #[serde(default = "d_warn")]
    pub skill_max_tokens_mode: EnforcementMode,
    #[serde(default = "d_warn")]
    pub skill_max_parallel_mode: EnforcementMode,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            allowed_tools_mode: EnforcementMode::Enforce,
            skill_max_tokens_mode: EnforcementMode::Warn,
            skill_max_parallel_mode: EnforcementMode::Warn,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOnExceed {
    /// Emit the alert and keep going.
    AlertOnly,
    /// Emit the alert and deny further non-lifecycle tool calls.
    BlockTools,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Alert when session cost reaches this ratio of the session cap.
    #[serde(default = "d_session_alert_ratio")]
    pub session_alert_ratio: f64,
    /// Hard USD cap per session. `None` = uncapped.
    #[serde(default)]
    pub max_cost_usd_per_session: Option<f64>,
    /// Hard USD cap per skill within a session. `None` = uncapped.
    #[serde(default)]
    pub max_cost_usd_per_skill: Option<f64>,
    #[serde(default = "d_action_on_exceed")]
    pub action_on_exceed: ActionOnExceed,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            session_alert_ratio: d_session_alert_ratio(),
            max_cost_usd_per_session: None,
            max_cost_usd_per_skill: None,
            action_on_exceed: ActionOnExceed::AlertOnly,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMode {
    Off,
    /// Record what the ranker would have done, but keep the hybrid order.
    Shadow,
    /// Apply the ranker's order when it is available.
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalWeights {
    #[serde(default = "d_w_lex")]
    pub lexical: f64,
    #[serde(default = "d_w_recency")]
    pub recency: f64,
    #[serde(default = "d_w_confidence")]
    pub confidence: f64,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            lexical: d_w_lex(),
            recency: d_w_recency(),
            confidence: d_w_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Units sharing a topic before a crystal draft is compiled.
    #[serde(default = "d_crystal_min_units")]
    pub crystal_min_units: usize,
    /// Top-N units ranked into a crystal.
    #[serde(default = "d_crystal_top_n")]
    pub crystal_top_n: usize,
    /// Confidence floor for cross-session promotion.
    #[serde(default = "d_promotion_confidence_floor")]
    pub promotion_confidence_floor: f64,
    /// Distinct sessions a fingerprint must recur in before promotion.
    #[serde(default = "d_promotion_session_floor")]
    pub promotion_session_floor: usize,
    /// Exponential decay cadence for global units.
    #[serde(default = "d_decay_interval_days")]
    pub decay_interval_days: i64,
    #[serde(default = "d_decay_factor")]
    pub decay_factor: f64,
    /// Global units below this confidence are pruned after decay.
    #[serde(default = "d_prune_below_confidence")]
    pub prune_below_confidence: f64,
    /// Hour of day (UTC) after which the working snapshot goes stale.
    #[serde(default = "d_refresh_hour")]
    pub refresh_hour: u32,
    #[serde(default)]
    pub retrieval: RetrievalWeights,
    #[serde(default = "d_rerank_mode")]
    pub rerank_mode: RerankMode,
    /// Upper bound on candidates handed to the cognitive ranker.
    #[serde(default = "d_max_rank_candidates")]
    pub max_rank_candidates_per_search: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            crystal_min_units: d_crystal_min_units(),
            crystal_top_n: d_crystal_top_n(),
            promotion_confidence_floor: d_promotion_confidence_floor(),
            promotion_session_floor: d_promotion_session_floor(),
            decay_interval_days: d_decay_interval_days(),
            decay_factor: d_decay_factor(),
            prune_below_confidence: d_prune_below_confidence(),
            refresh_hour: d_refresh_hour(),
            retrieval: RetrievalWeights::default(),
            rerank_mode: RerankMode::Off,
            max_rank_candidates_per_search: d_max_rank_candidates(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    None,
    Basic,
    Standard,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    /// Shell command executed via `sh -c`.
    pub command: String,
    #[serde(default = "d_check_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_check_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Minimum level at which this check runs.
    #[serde(default = "d_check_level")]
    pub level: VerificationLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationConfig {
    #[serde(default)]
    pub checks: Vec<VerificationCheck>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway daemon
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerBackendKind {
    /// Spawn one child process per session (production).
    Process,
    /// Run sessions inside the daemon process (tests, `overseer run`).
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "d_host")]
    pub host: String,
    /// 0 = allocate an ephemeral loopback port.
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_max_workers")]
    pub max_workers: usize,
    /// Queue overflow sessions instead of failing with a capacity error.
    #[serde(default)]
    pub queue_enabled: bool,
    #[serde(default = "d_idle_ttl_ms")]
    pub session_idle_ttl_ms: u64,
    #[serde(default = "d_idle_sweep_interval_ms")]
    pub session_idle_sweep_interval_ms: u64,
    #[serde(default = "d_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
    #[serde(default = "d_backend")]
    pub backend: WorkerBackendKind,
    /// Heartbeat rule file (markdown), relative to the workspace root.
    #[serde(default = "d_heartbeat_path")]
    pub heartbeat_path: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            max_workers: d_max_workers(),
            queue_enabled: false,
            session_idle_ttl_ms: d_idle_ttl_ms(),
            session_idle_sweep_interval_ms: d_idle_sweep_interval_ms(),
            graceful_timeout_ms: d_graceful_timeout_ms(),
            backend: WorkerBackendKind::Process,
            heartbeat_path: d_heartbeat_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_true() -> bool {
    true
}
fn d_workspace_root() -> PathBuf {
    PathBuf::from(".")
}
fn d_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn d_events_dir() -> PathBuf {
    PathBuf::from("events")
}
fn d_orchestrator_dir() -> PathBuf {
    PathBuf::from(".orchestrator")
}
fn d_memory_dir() -> PathBuf {
    PathBuf::from("memory")
}
fn d_skills_dir() -> PathBuf {
    PathBuf::from("skills")
}
fn d_checkpoint_every_turns() -> u64 {
    25
}
fn d_digest_window() -> usize {
    40
}
fn d_context_window() -> u64 {
    200_000
}
fn d_compaction_threshold() -> f64 {
    0.80
}
fn d_hard_limit_ratio() -> f64 {
    0.90
}
fn d_pressure_bypass_percent() -> f64 {
    0.95
}
fn d_max_injection_tokens() -> u64 {
    2_000
}
fn d_chars_per_token() -> u64 {
    4
}
fn d_truncation_strategy() -> TruncationStrategy {
    TruncationStrategy::Tail
}
fn d_min_turns_between_compaction() -> u64 {
    3
}
fn d_min_seconds_between_compaction() -> i64 {
    120
}
fn d_recent_compaction_window_turns() -> u64 {
    2
}
fn d_recent_failures() -> usize {
    3
}
fn d_default_cap_fraction() -> f64 {
    0.25
}
fn d_default_floor() -> u64 {
    0
}
fn d_default_ceiling() -> u64 {
    1_000
}
fn d_enforce() -> EnforcementMode {
    EnforcementMode::Enforce
}
fn d_warn() -> EnforcementMode {
    EnforcementMode::Warn
}
fn d_session_alert_ratio() -> f64 {
    0.8
}
fn d_action_on_exceed() -> ActionOnExceed {
    ActionOnExceed::AlertOnly
}
fn d_crystal_min_units() -> usize {
    4
}
fn d_crystal_top_n() -> usize {
    8
}
fn d_promotion_confidence_floor() -> f64 {
    0.7
}
fn d_promotion_session_floor() -> usize {
    2
}
fn d_decay_interval_days() -> i64 {
    7
}
fn d_decay_factor() -> f64 {
    0.9
}
fn d_prune_below_confidence() -> f64 {
    0.2
}
fn d_refresh_hour() -> u32 {
    5
}
fn d_w_lex() -> f64 {
    0.5
}
fn d_w_recency() -> f64 {
    0.3
}
fn d_w_confidence() -> f64 {
    0.2
}
fn d_rerank_mode() -> RerankMode {
    RerankMode::Off
}
fn d_max_rank_candidates() -> usize {
    16
}
fn d_check_timeout_ms() -> u64 {
    120_000
}
fn d_check_max_output_bytes() -> usize {
    64 * 1024
}
fn d_check_level() -> VerificationLevel {
    VerificationLevel::Standard
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    4460
}
fn d_max_workers() -> usize {
    8
}
fn d_idle_ttl_ms() -> u64 {
    30 * 60 * 1000
}
fn d_idle_sweep_interval_ms() -> u64 {
    60 * 1000
}
fn d_graceful_timeout_ms() -> u64 {
    5_000
}
fn d_backend() -> WorkerBackendKind {
    WorkerBackendKind::Process
}
fn d_heartbeat_path() -> PathBuf {
    PathBuf::from("HEARTBEAT.md")
}
