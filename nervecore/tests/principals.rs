mod common;

use common::test_kernel;

#[tokio::test]
async fn channel_principal_is_created_once() {
    let kernel = test_kernel().await;
    let repo = kernel.store.principals();

    let first = repo
        .get_or_create_for_channel("telegram", "chat-42")
        .await
        .unwrap();
    let second = repo
        .get_or_create_for_channel("telegram", "chat-42")
        .await
        .unwrap();
    assert_eq!(first.principal_id, second.principal_id);
    assert_eq!(first.principal_type, "channel_chat");
}

#[tokio::test]
async fn preference_resolution_prefers_own_value_over_system_default() {
    let kernel = test_kernel().await;
    let repo = kernel.store.principals();

    let principal = repo
        .get_or_create_for_channel("cli", "local")
        .await
        .unwrap();

    // Only the system default exists.
    repo.set_preference("system", "dnd", "off").await.unwrap();
    assert_eq!(
        repo.resolve_preference(&principal.principal_id, "dnd")
            .await
            .unwrap()
            .as_deref(),
        Some("off")
    );

    // The principal's own value takes precedence.
    repo.set_preference(&principal.principal_id, "dnd", "on")
        .await
        .unwrap();
    assert_eq!(
        repo.resolve_preference(&principal.principal_id, "dnd")
            .await
            .unwrap()
            .as_deref(),
        Some("on")
    );

    // Unknown keys resolve to nothing.
    assert!(repo
        .resolve_preference(&principal.principal_id, "locale")
        .await
        .unwrap()
        .is_none());
}
