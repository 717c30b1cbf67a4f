//! Environment-driven kernel configuration.
//!
//! Every knob has a default suitable for local development; `from_env` reads
//! the process environment once at boot (a `.env` file is honored when
//! present).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct NerveConfig {
    /// Persistent store path (`NERVE_DB_PATH`).
    pub db_path: PathBuf,
    /// Trace store path (`OBSERVABILITY_DB_PATH`); defaults to the main
    /// store so a single file holds everything.
    pub observability_db_path: PathBuf,
    pub observability_non_error_ttl_days: i64,
    pub observability_error_ttl_days: i64,
    pub observability_max_rows: i64,
    pub observability_maintenance: Duration,
    /// Gateway auth header value (`API_TOKEN`). Unset disables auth.
    pub api_token: Option<String>,
    /// How long `POST /message` waits for a correlated outbound.
    pub api_message_wait: Duration,
    pub scheduler_tick: Duration,
    pub scheduler_lease: Duration,
    pub slice_default_cycles: i64,
    pub slice_max_runtime: Duration,
    pub slice_lease: Duration,
    pub slice_workers: usize,
    /// Boot state key (`FSM_INITIAL_STATE`).
    pub fsm_initial_state: String,
    pub bus_capacity: usize,
    /// Per-signal handler deadline.
    pub signal_deadline: Duration,
    pub gateway_bind: String,
    pub llm_provider: String,
}

impl Default for NerveConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("nerve.db"),
            observability_db_path: PathBuf::from("nerve.db"),
            observability_non_error_ttl_days: 14,
            observability_error_ttl_days: 30,
            observability_max_rows: 1_000_000,
            observability_maintenance: Duration::from_secs(6 * 60 * 60),
            api_token: None,
            api_message_wait: Duration::from_secs(10),
            scheduler_tick: Duration::from_secs(1),
            scheduler_lease: Duration::from_secs(300),
            slice_default_cycles: 3,
            slice_max_runtime: Duration::from_secs(120),
            slice_lease: Duration::from_secs(30),
            slice_workers: 2,
            fsm_initial_state: "idle".to_string(),
            bus_capacity: 1024,
            signal_deadline: Duration::from_secs(60),
            gateway_bind: "127.0.0.1:8686".to_string(),
            llm_provider: "echo".to_string(),
        }
    }
}

impl NerveConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let db_path = env_path("NERVE_DB_PATH").unwrap_or(defaults.db_path);
        Self {
            observability_db_path: env_path("OBSERVABILITY_DB_PATH")
                .unwrap_or_else(|| db_path.clone()),
            db_path,
            observability_non_error_ttl_days: env_i64(
                "OBSERVABILITY_NON_ERROR_TTL_DAYS",
                defaults.observability_non_error_ttl_days,
            ),
            observability_error_ttl_days: env_i64(
                "OBSERVABILITY_ERROR_TTL_DAYS",
                defaults.observability_error_ttl_days,
            ),
            observability_max_rows: env_i64(
                "OBSERVABILITY_MAX_ROWS",
                defaults.observability_max_rows,
            ),
            observability_maintenance: env_secs(
                "OBSERVABILITY_MAINTENANCE_SECONDS",
                defaults.observability_maintenance,
            ),
            api_token: std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            api_message_wait: env_secs("API_MESSAGE_WAIT_SECONDS", defaults.api_message_wait),
            scheduler_tick: env_secs("SCHEDULER_TICK_SECONDS", defaults.scheduler_tick),
            scheduler_lease: env_secs("SCHEDULER_LEASE_SECONDS", defaults.scheduler_lease),
            slice_default_cycles: env_i64("SLICE_DEFAULT_CYCLES", defaults.slice_default_cycles)
                .max(1),
            slice_max_runtime: env_secs("SLICE_MAX_RUNTIME_SECONDS", defaults.slice_max_runtime),
            slice_lease: env_secs("SLICE_LEASE_SECONDS", defaults.slice_lease),
            slice_workers: env_i64("SLICE_WORKERS", defaults.slice_workers as i64).max(1)
                as usize,
            fsm_initial_state: std::env::var("FSM_INITIAL_STATE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.fsm_initial_state),
            bus_capacity: env_i64("NERVE_BUS_CAPACITY", defaults.bus_capacity as i64).max(1)
                as usize,
            signal_deadline: env_secs("NERVE_SIGNAL_DEADLINE_SECONDS", defaults.signal_deadline),
            gateway_bind: std::env::var("GATEWAY_BIND")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.gateway_bind),
            llm_provider: std::env::var("LLM_PROVIDER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.llm_provider),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
