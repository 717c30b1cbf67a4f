//! Catalog repository: load, author, and seed FSM states, signals, and
//! transitions.

use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{Result, StoreError};
use crate::actions::keys as action_keys;
use crate::catalog::{states, Catalog, SignalDef, StateDef, TransitionDef};
use crate::signal::types as signal_types;

/// Authoring shape for a transition row.
#[derive(Clone, Debug)]
pub struct TransitionSpec {
    pub state_key: Option<String>,
    pub signal_key: String,
    pub next_state_key: String,
    pub priority: i64,
    pub guard_key: Option<String>,
    pub action_key: Option<String>,
    pub match_any_state: bool,
}

impl TransitionSpec {
    #[must_use]
    pub fn new(
        state_key: Option<&str>,
        signal_key: &str,
        next_state_key: &str,
        priority: i64,
    ) -> Self {
        Self {
            state_key: state_key.map(Into::into),
            signal_key: signal_key.into(),
            next_state_key: next_state_key.into(),
            priority,
            guard_key: None,
            action_key: None,
            match_any_state: state_key.is_none(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action_key: &str) -> Self {
        self.action_key = Some(action_key.into());
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard_key: &str) -> Self {
        self.guard_key = Some(guard_key.into());
        self
    }
}

pub struct CatalogRepo {
    pool: SqlitePool,
}

impl CatalogRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_state(
        &self,
        key: &str,
        name: &str,
        is_terminal: bool,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO fsm_states (key, name, is_terminal, is_enabled)
            VALUES (?1, ?2, ?3, 1)
            "#,
        )
        .bind(key)
        .bind(name)
        .bind(is_terminal as i64)
        .execute(&self.pool)
        .await?;
        self.state_id(key)
            .await?
            .ok_or(StoreError::Missing("fsm_states.id"))
    }

    pub async fn insert_signal(&self, key: &str, description: Option<&str>) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO fsm_signals (key, description)
            VALUES (?1, ?2)
            "#,
        )
        .bind(key)
        .bind(description)
        .execute(&self.pool)
        .await?;
        self.signal_id(key)
            .await?
            .ok_or(StoreError::Missing("fsm_signals.id"))
    }

    pub async fn state_id(&self, key: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM fsm_states WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn signal_id(&self, key: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM fsm_signals WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn set_state_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE fsm_states SET is_enabled = ?2 WHERE key = ?1")
            .bind(key)
            .bind(enabled as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_transition_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE fsm_transitions SET is_enabled = ?2 WHERE id = ?1")
            .bind(id)
            .bind(enabled as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a transition if an identical binding does not already exist.
    /// Returns the row id either way, so seeding is idempotent.
    pub async fn ensure_transition(&self, spec: &TransitionSpec) -> Result<i64> {
        let state_id = match &spec.state_key {
            Some(key) => Some(
                self.state_id(key)
                    .await?
                    .ok_or(StoreError::Missing("fsm_transitions.state_id"))?,
            ),
            None => None,
        };
        let signal_id = self
            .signal_id(&spec.signal_key)
            .await?
            .ok_or(StoreError::Missing("fsm_transitions.signal_id"))?;
        let next_state_id = self
            .state_id(&spec.next_state_key)
            .await?
            .ok_or(StoreError::Missing("fsm_transitions.next_state_id"))?;

        let existing = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM fsm_transitions
            WHERE signal_id = ?1
              AND next_state_id = ?2
              AND match_any_state = ?3
              AND (state_id IS ?4)
              AND (action_key IS ?5)
            "#,
        )
        .bind(signal_id)
        .bind(next_state_id)
        .bind(spec.match_any_state as i64)
        .bind(state_id)
        .bind(spec.action_key.as_deref())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO fsm_transitions
              (state_id, signal_id, next_state_id, priority, is_enabled,
               guard_key, action_key, match_any_state)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)
            "#,
        )
        .bind(state_id)
        .bind(signal_id)
        .bind(next_state_id)
        .bind(spec.priority)
        .bind(spec.guard_key.as_deref())
        .bind(spec.action_key.as_deref())
        .bind(spec.match_any_state as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Load the full catalog snapshot. The engine treats it as immutable for
    /// the rest of the run.
    #[instrument(skip(self), err)]
    pub async fn load(&self) -> Result<Catalog> {
        let state_rows =
            sqlx::query("SELECT id, key, name, is_terminal, is_enabled FROM fsm_states")
                .fetch_all(&self.pool)
                .await?;
        let states = state_rows
            .into_iter()
            .map(|row| StateDef {
                id: row.get("id"),
                key: row.get("key"),
                name: row.get("name"),
                is_terminal: row.get::<i64, _>("is_terminal") != 0,
                is_enabled: row.get::<i64, _>("is_enabled") != 0,
            })
            .collect();

        let signal_rows = sqlx::query("SELECT id, key, description FROM fsm_signals")
            .fetch_all(&self.pool)
            .await?;
        let signals = signal_rows
            .into_iter()
            .map(|row| SignalDef {
                id: row.get("id"),
                key: row.get("key"),
                description: row.get("description"),
            })
            .collect();

        let transition_rows = sqlx::query(
            r#"
            SELECT id, state_id, signal_id, next_state_id, priority, is_enabled,
                   guard_key, action_key, match_any_state
            FROM fsm_transitions
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let transitions = transition_rows
            .into_iter()
            .map(|row| TransitionDef {
                id: row.get("id"),
                state_id: row.get("state_id"),
                signal_id: row.get("signal_id"),
                next_state_id: row.get("next_state_id"),
                priority: row.get("priority"),
                is_enabled: row.get::<i64, _>("is_enabled") != 0,
                guard_key: row.get("guard_key"),
                action_key: row.get("action_key"),
                match_any_state: row.get::<i64, _>("match_any_state") != 0,
            })
            .collect();

        Ok(Catalog::from_parts(states, signals, transitions))
    }

    /// Install the baseline catalog: idle/error/shutting_down states, the
    /// default signal set, message routing, and the two wildcard bindings
    /// (shutdown from any state, action.failed into error). Idempotent.
    #[instrument(skip(self), err)]
    pub async fn seed_defaults(&self) -> Result<()> {
        self.insert_state(states::IDLE, "Idle", false).await?;
        self.insert_state(states::ERROR, "Error", false).await?;
        self.insert_state(states::SHUTTING_DOWN, "Shutting down", true)
            .await?;

        for key in [
            signal_types::TELEGRAM_MESSAGE_RECEIVED,
            signal_types::CLI_MESSAGE_RECEIVED,
            signal_types::API_MESSAGE_RECEIVED,
            signal_types::API_STATUS_REQUESTED,
            signal_types::API_TIMED_SIGNALS_REQUESTED,
            signal_types::TIMER_FIRED,
            signal_types::TIMED_SIGNAL_FIRED,
            signal_types::TERMINAL_COMMAND_UPDATED,
            signal_types::TERMINAL_COMMAND_EXECUTED,
            signal_types::TELEGRAM_INVITE_REQUESTED,
            signal_types::ACTION_SUCCEEDED,
            signal_types::ACTION_FAILED,
            signal_types::SHUTDOWN_REQUESTED,
            signal_types::PLAN_RUN,
            signal_types::PDCA_SLICE_REQUESTED,
            signal_types::PDCA_RESUME_REQUESTED,
        ] {
            self.insert_signal(key, None).await?;
        }

        // Shutdown binds from any state at the least-preferred priority so an
        // explicit state-specific override stays possible.
        self.ensure_transition(
            &TransitionSpec::new(None, signal_types::SHUTDOWN_REQUESTED, states::SHUTTING_DOWN, 1000)
                .with_action(action_keys::SHUTDOWN),
        )
        .await?;
        self.ensure_transition(
            &TransitionSpec::new(None, signal_types::ACTION_FAILED, states::ERROR, 900)
                .with_action(action_keys::HANDLE_ACTION_FAILURE),
        )
        .await?;

        for message_signal in [
            signal_types::CLI_MESSAGE_RECEIVED,
            signal_types::API_MESSAGE_RECEIVED,
            signal_types::TELEGRAM_MESSAGE_RECEIVED,
        ] {
            self.ensure_transition(
                &TransitionSpec::new(Some(states::IDLE), message_signal, states::IDLE, 100)
                    .with_action(action_keys::HANDLE_INCOMING_MESSAGE),
            )
            .await?;
            // A user message recovers the FSM from the error state.
            self.ensure_transition(
                &TransitionSpec::new(Some(states::ERROR), message_signal, states::IDLE, 100)
                    .with_action(action_keys::HANDLE_INCOMING_MESSAGE),
            )
            .await?;
        }

        self.ensure_transition(
            &TransitionSpec::new(Some(states::IDLE), signal_types::TIMED_SIGNAL_FIRED, states::IDLE, 100)
                .with_action(action_keys::HANDLE_TIMER_FIRED),
        )
        .await?;

        for state in [states::IDLE, states::ERROR] {
            self.ensure_transition(
                &TransitionSpec::new(Some(state), signal_types::API_STATUS_REQUESTED, state, 100)
                    .with_action(action_keys::HANDLE_STATUS),
            )
            .await?;
            self.ensure_transition(
                &TransitionSpec::new(
                    Some(state),
                    signal_types::API_TIMED_SIGNALS_REQUESTED,
                    state,
                    100,
                )
                .with_action(action_keys::HANDLE_TIMED_SIGNALS),
            )
            .await?;
        }

        // Pure state no-ops: these signals are consumed by dedicated workers
        // listening on bus taps; the catalog rows keep the trace complete.
        for passthrough in [
            signal_types::TIMER_FIRED,
            signal_types::PLAN_RUN,
            signal_types::PDCA_SLICE_REQUESTED,
            signal_types::PDCA_RESUME_REQUESTED,
            signal_types::ACTION_SUCCEEDED,
        ] {
            self.ensure_transition(&TransitionSpec::new(
                Some(states::IDLE),
                passthrough,
                states::IDLE,
                500,
            ))
            .await?;
        }

        Ok(())
    }
}
