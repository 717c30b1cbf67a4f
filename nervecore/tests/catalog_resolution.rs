mod common;

use proptest::prelude::*;

use nervecore::catalog::{Catalog, SignalDef, StateDef, TransitionDef};

use common::test_kernel;

fn state(id: i64, key: &str) -> StateDef {
    StateDef {
        id,
        key: key.to_string(),
        name: key.to_string(),
        is_terminal: false,
        is_enabled: true,
    }
}

fn arb_transition() -> impl Strategy<Value = TransitionDef> {
    (
        1i64..1000,
        any::<bool>(),
        0i64..10,
        any::<bool>(),
    )
        .prop_map(|(id, wildcard, priority, enabled)| TransitionDef {
            id,
            state_id: if wildcard { None } else { Some(1) },
            signal_id: 1,
            next_state_id: 1,
            priority,
            is_enabled: enabled,
            guard_key: None,
            action_key: None,
            match_any_state: wildcard,
        })
}

proptest! {
    /// The resolved transition is always the minimal enabled candidate
    /// under (priority, wildcard, id) ordering.
    #[test]
    fn resolution_picks_minimal_candidate(
        transitions in prop::collection::vec(arb_transition(), 1..20)
    ) {
        let catalog = Catalog::from_parts(
            vec![state(1, "idle")],
            vec![SignalDef { id: 1, key: "sig".to_string(), description: None }],
            transitions.clone(),
        );
        let candidates = catalog.candidates(1, "sig");

        let mut enabled: Vec<&TransitionDef> =
            transitions.iter().filter(|t| t.is_enabled).collect();
        enabled.sort_by_key(|t| (t.priority, t.match_any_state, t.id));

        match (candidates.first(), enabled.first()) {
            (Some(resolved), Some(expected)) => {
                prop_assert_eq!(resolved.id, expected.id);
            }
            (None, None) => {}
            (resolved, expected) => {
                return Err(proptest::test_runner::TestCaseError::fail(format!(
                    "resolved {resolved:?} but expected {expected:?}"
                )));
            }
        }
    }

    /// Candidate ordering is total and stable: every candidate sorts
    /// no earlier than its predecessor.
    #[test]
    fn candidate_ordering_is_monotonic(
        transitions in prop::collection::vec(arb_transition(), 1..20)
    ) {
        let catalog = Catalog::from_parts(
            vec![state(1, "idle")],
            vec![SignalDef { id: 1, key: "sig".to_string(), description: None }],
            transitions,
        );
        let candidates = catalog.candidates(1, "sig");
        for pair in candidates.windows(2) {
            let a = (pair[0].priority, pair[0].match_any_state, pair[0].id);
            let b = (pair[1].priority, pair[1].match_any_state, pair[1].id);
            prop_assert!(a <= b);
        }
    }
}

#[tokio::test]
async fn empty_catalog_is_fatal_at_boot() {
    use nervecore::actions::default_registries;
    use nervecore::engine::FsmEngine;
    use std::sync::Arc;

    let kernel = test_kernel().await;
    let (actions, guards) = default_registries();
    let empty = Catalog::from_parts(Vec::new(), Vec::new(), Vec::new());
    let result = FsmEngine::new(
        kernel.ctx.clone(),
        empty,
        actions,
        guards,
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.hub),
        Arc::clone(&kernel.trace),
    )
    .await;
    assert!(result.is_err(), "an empty catalog must refuse to boot");
}

#[tokio::test]
async fn unknown_initial_state_is_fatal_at_boot() {
    use nervecore::actions::default_registries;
    use nervecore::engine::FsmEngine;
    use nervecore::runtime::{NerveConfig, RuntimeContext};
    use std::sync::Arc;

    let kernel = test_kernel().await;
    let catalog = kernel.store.catalog().load().await.unwrap();
    let (actions, guards) = default_registries();
    let ctx = RuntimeContext::with_defaults(
        NerveConfig {
            fsm_initial_state: "nonexistent".to_string(),
            ..NerveConfig::default()
        },
        kernel.store.clone(),
    );
    let result = FsmEngine::new(
        ctx,
        catalog,
        actions,
        guards,
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.hub),
        Arc::clone(&kernel.trace),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn seeded_catalog_loads_and_validates() {
    let kernel = test_kernel().await;
    let catalog = kernel.store.catalog().load().await.unwrap();

    assert!(!catalog.is_empty());
    assert!(catalog.state_by_key("idle").is_some());
    assert!(catalog.state_by_key("error").is_some());
    let shutting_down = catalog.state_by_key("shutting_down").unwrap();
    assert!(shutting_down.is_terminal);

    // Shutdown resolves from every seeded state.
    for key in ["idle", "error"] {
        let state_id = catalog.state_by_key(key).unwrap().id;
        let candidates = catalog.candidates(state_id, "shutdown_requested");
        assert!(!candidates.is_empty(), "no shutdown binding from {key}");
        assert!(candidates[0].match_any_state);
    }
}

#[tokio::test]
async fn seeding_twice_does_not_duplicate_transitions() {
    let kernel = test_kernel().await;
    kernel.store.catalog().seed_defaults().await.unwrap();

    let catalog = kernel.store.catalog().load().await.unwrap();
    let idle = catalog.state_by_key("idle").unwrap().id;
    let candidates = catalog.candidates(idle, "cli.message_received");
    assert_eq!(candidates.len(), 1);
}

#[tokio::test]
async fn disabling_a_state_hides_transitions_into_it() {
    let kernel = test_kernel().await;
    let repo = kernel.store.catalog();

    repo.set_state_enabled("error", false).await.unwrap();
    let catalog = repo.load().await.unwrap();
    let idle = catalog.state_by_key("idle").unwrap().id;
    assert!(catalog.candidates(idle, "action.failed").is_empty());
}
