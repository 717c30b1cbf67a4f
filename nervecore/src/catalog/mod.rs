/*!
Data-defined FSM catalog.

States, signal definitions, and transitions live in the store, not in code:
operational changes (add a transition, disable a sense's signal) need no
redeploy. Guards and actions remain in-code registries referenced by key;
a catalog row naming an unknown key is a boot-time validation error.

Transition resolution, for a `(state, signal)` pair:
take enabled transitions whose source matches the state exactly or via
`match_any_state`, whose target state is enabled, ordered by
`(priority ASC, match_any_state ASC, id ASC)`: lowest priority wins and an
explicit source beats the wildcard at equal priority. Guards filter the
ordered candidates; the first transition whose guard passes (or that has no
guard) is selected.
*/

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("catalog is empty: no enabled states or transitions")]
    #[diagnostic(
        code(nervecore::catalog::empty),
        help("Seed the default catalog or restore the store from backup.")
    )]
    Empty,

    #[error("initial state `{key}` not found in catalog")]
    #[diagnostic(code(nervecore::catalog::unknown_initial_state))]
    UnknownInitialState { key: String },

    #[error("catalog references unknown handler keys: {keys:?}")]
    #[diagnostic(
        code(nervecore::catalog::unknown_handlers),
        help("Register the named guards/actions or remove the transitions that reference them.")
    )]
    UnknownHandlers { keys: Vec<String> },
}

/// FSM node, immutable within a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateDef {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub is_terminal: bool,
    pub is_enabled: bool,
}

/// A signal type known to the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalDef {
    pub id: i64,
    pub key: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionDef {
    pub id: i64,
    /// Source state. `None` only for wildcard transitions.
    pub state_id: Option<i64>,
    pub signal_id: i64,
    pub next_state_id: i64,
    pub priority: i64,
    pub is_enabled: bool,
    pub guard_key: Option<String>,
    pub action_key: Option<String>,
    pub match_any_state: bool,
}

/// In-memory snapshot of the persistent catalog, loaded once at boot.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    states_by_id: FxHashMap<i64, StateDef>,
    state_ids_by_key: FxHashMap<String, i64>,
    signal_ids_by_key: FxHashMap<String, i64>,
    transitions: Vec<TransitionDef>,
}

impl Catalog {
    pub fn from_parts(
        states: Vec<StateDef>,
        signals: Vec<SignalDef>,
        mut transitions: Vec<TransitionDef>,
    ) -> Self {
        let states_by_id: FxHashMap<i64, StateDef> =
            states.into_iter().map(|s| (s.id, s)).collect();
        let state_ids_by_key = states_by_id
            .values()
            .map(|s| (s.key.clone(), s.id))
            .collect();
        let signal_ids_by_key = signals.into_iter().map(|s| (s.key, s.id)).collect();
        transitions.sort_by_key(|t| (t.priority, t.match_any_state, t.id));
        Self {
            states_by_id,
            state_ids_by_key,
            signal_ids_by_key,
            transitions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states_by_id.is_empty() || self.transitions.is_empty()
    }

    pub fn state(&self, id: i64) -> Option<&StateDef> {
        self.states_by_id.get(&id)
    }

    pub fn state_by_key(&self, key: &str) -> Option<&StateDef> {
        self.state_ids_by_key
            .get(key)
            .and_then(|id| self.states_by_id.get(id))
    }

    pub fn signal_id(&self, key: &str) -> Option<i64> {
        self.signal_ids_by_key.get(key).copied()
    }

    /// Ordered candidate transitions for `(state, signal)`. Disabled
    /// transitions and transitions into disabled target states are invisible.
    pub fn candidates(&self, state_id: i64, signal_key: &str) -> Vec<&TransitionDef> {
        let Some(signal_id) = self.signal_id(signal_key) else {
            return Vec::new();
        };
        self.transitions
            .iter()
            .filter(|t| t.is_enabled && t.signal_id == signal_id)
            .filter(|t| t.match_any_state || t.state_id == Some(state_id))
            .filter(|t| {
                self.states_by_id
                    .get(&t.next_state_id)
                    .is_some_and(|s| s.is_enabled)
            })
            .collect()
    }

    /// Validate that every handler key referenced by an enabled transition
    /// exists in the in-code registries.
    pub fn validate_handlers(
        &self,
        known_guards: &FxHashSet<String>,
        known_actions: &FxHashSet<String>,
    ) -> Result<(), CatalogError> {
        let mut unknown: Vec<String> = Vec::new();
        for transition in self.transitions.iter().filter(|t| t.is_enabled) {
            if let Some(guard) = &transition.guard_key {
                if !known_guards.contains(guard) {
                    unknown.push(format!("guard:{guard}"));
                }
            }
            if let Some(action) = &transition.action_key {
                if !known_actions.contains(action) {
                    unknown.push(format!("action:{action}"));
                }
            }
        }
        if unknown.is_empty() {
            Ok(())
        } else {
            unknown.sort();
            unknown.dedup();
            Err(CatalogError::UnknownHandlers { keys: unknown })
        }
    }
}

/// Well-known state keys installed by the default catalog.
pub mod states {
    pub const IDLE: &str = "idle";
    pub const ERROR: &str = "error";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: i64, key: &str, enabled: bool) -> StateDef {
        StateDef {
            id,
            key: key.into(),
            name: key.into(),
            is_terminal: false,
            is_enabled: enabled,
        }
    }

    fn transition(id: i64, state_id: Option<i64>, priority: i64, wildcard: bool) -> TransitionDef {
        TransitionDef {
            id,
            state_id,
            signal_id: 1,
            next_state_id: 1,
            priority,
            is_enabled: true,
            guard_key: None,
            action_key: None,
            match_any_state: wildcard,
        }
    }

    fn catalog(transitions: Vec<TransitionDef>) -> Catalog {
        Catalog::from_parts(
            vec![state(1, "idle", true), state(2, "error", true)],
            vec![SignalDef {
                id: 1,
                key: "cli.message_received".into(),
                description: None,
            }],
            transitions,
        )
    }

    #[test]
    fn lowest_priority_wins() {
        let cat = catalog(vec![
            transition(1, Some(1), 50, false),
            transition(2, Some(1), 10, false),
        ]);
        let candidates = cat.candidates(1, "cli.message_received");
        assert_eq!(candidates[0].id, 2);
    }

    #[test]
    fn explicit_source_beats_wildcard_at_equal_priority() {
        let cat = catalog(vec![
            transition(1, None, 10, true),
            transition(2, Some(1), 10, false),
        ]);
        let candidates = cat.candidates(1, "cli.message_received");
        assert_eq!(candidates[0].id, 2);
    }

    #[test]
    fn wildcard_with_lower_priority_wins_over_explicit() {
        let cat = catalog(vec![
            transition(1, None, 5, true),
            transition(2, Some(1), 10, false),
        ]);
        let candidates = cat.candidates(1, "cli.message_received");
        assert_eq!(candidates[0].id, 1);
    }

    #[test]
    fn disabled_target_state_hides_transition() {
        let mut t = transition(1, Some(1), 10, false);
        t.next_state_id = 3;
        let cat = Catalog::from_parts(
            vec![
                state(1, "idle", true),
                state(3, "maintenance", false),
            ],
            vec![SignalDef {
                id: 1,
                key: "cli.message_received".into(),
                description: None,
            }],
            vec![t],
        );
        assert!(cat.candidates(1, "cli.message_received").is_empty());
    }

    #[test]
    fn unknown_handler_keys_fail_validation() {
        let mut t = transition(1, Some(1), 10, false);
        t.action_key = Some("ghost".into());
        let cat = catalog(vec![t]);
        let err = cat
            .validate_handlers(&FxHashSet::default(), &FxHashSet::default())
            .unwrap_err();
        match err {
            CatalogError::UnknownHandlers { keys } => {
                assert_eq!(keys, vec!["action:ghost".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
