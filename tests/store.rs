mod common;

use common::{TestContext, userscript};
use futures::future::join_all;
use scriptdb::script::{ConfigPatch, CustomPatch};
use scriptdb::{
    Config, ErrorCode, ScriptEvent, ScriptInfoPatch, ScriptQuery, ScriptSource, StoreError,
};
use serde_json::{Value, json};

fn positions(store: &scriptdb::ScriptStore) -> Vec<(u64, u64)> {
    store
        .list(false)
        .unwrap()
        .iter()
        .map(|s| (s.id(), s.props.position))
        .collect()
}

#[tokio::test]
async fn test_install_assigns_id_position_and_code() {
    let ctx = TestContext::new().await;
    let first = ctx.install(&userscript("First", "ns", &[])).await;
    let second = ctx.install(&userscript("Second", "ns", &[])).await;

    assert!(first.is_new);
    assert_eq!(first.message, "Script installed.");
    assert_eq!((first.script.id(), first.script.props.position), (1, 1));
    assert_eq!((second.script.id(), second.script.props.position), (2, 2));
    assert_eq!(first.script.props.uri, "ns:First:");
    assert!(first.script.props.last_modified > 0);

    let code = ctx.store.script_code(1).await.unwrap().unwrap();
    assert!(code.contains("@name First"));
    assert!(ctx.backend.contains("script:2").await);
}

#[tokio::test]
async fn test_install_rejects_nameless_script() {
    let ctx = TestContext::new().await;
    let err = ctx
        .store
        .install(ScriptSource::new("// ==UserScript==\n// @version 1\n// ==/UserScript==\n"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidScript);

    let err = ctx
        .store
        .install(ScriptSource::new("alert(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidScript(_)));
    assert!(ctx.store.list(false).unwrap().is_empty());
    assert!(ctx.backend.keys().await.is_empty());
}

#[tokio::test]
async fn test_namespace_conflict_and_update_keep_identity() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("X", "N", &["version 1"])).await;

    let err = ctx
        .store
        .install(ScriptSource {
            code: userscript("X", "N", &["version 2"]),
            is_new: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NamespaceConflict);
    assert_eq!(ctx.store.list(false).unwrap().len(), 1);

    let updated = ctx.install(&userscript("X", "N", &["version 2"])).await;
    assert!(!updated.is_new);
    assert_eq!(updated.message, "Script updated.");
    assert_eq!(updated.script.id(), a.script.id());
    assert_eq!(updated.script.props.uuid, a.script.props.uuid);
    assert_eq!(updated.script.meta.version.as_deref(), Some("2"));
    let code = ctx.store.script_code(a.script.id()).await.unwrap().unwrap();
    assert!(code.contains("@version 2"));
}

#[tokio::test]
async fn test_update_by_id_cannot_take_another_identity() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("A", "ns", &[])).await;
    ctx.install(&userscript("B", "ns", &[])).await;

    let err = ctx
        .store
        .install(ScriptSource {
            code: userscript("B", "ns", &[]),
            id: Some(a.script.id()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NamespaceConflict { .. }));
    let a_now = ctx.store.get(a.script.id()).unwrap().unwrap();
    assert_eq!(a_now.meta.name, "A");
    assert_eq!(a_now.props.uri, "ns:A:");
}

#[tokio::test]
async fn test_update_by_id_renames_script() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("A", "ns", &[])).await;
    let renamed = ctx
        .store
        .install(ScriptSource {
            code: userscript("Renamed", "ns", &[]),
            id: Some(a.script.id()),
            message: Some(String::new()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(renamed.script.id(), a.script.id());
    assert_eq!(renamed.message, "");
    assert!(ctx.store.find(ScriptQuery::Uri("ns:A:")).unwrap().is_none());
    assert!(ctx.store.find(ScriptQuery::Uri("ns:Renamed:")).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_installs_keep_uri_unique() {
    let ctx = TestContext::new().await;
    let code = userscript("Race", "ns", &[]);
    let results = join_all((0..8).map(|_| {
        let store = ctx.store.clone();
        let code = code.clone();
        tokio::spawn(async move {
            store
                .install(ScriptSource {
                    code,
                    is_new: true,
                    ..Default::default()
                })
                .await
        })
    }))
    .await;

    let outcomes: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.code() == ErrorCode::NamespaceConflict)
    );
    assert_eq!(ctx.store.list(false).unwrap().len(), 1);
}

#[tokio::test]
async fn test_nameless_namespace_scripts_do_not_collide() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("Same", "", &[])).await;
    let b = ctx.install(&userscript("Same", "other", &[])).await;
    assert_ne!(a.script.id(), b.script.id());
    assert_eq!(a.script.props.uri, ":Same:");
}

#[tokio::test]
async fn test_move_keeps_positions_dense() {
    let ctx = TestContext::new().await;
    for name in ["a", "b", "c", "d"] {
        ctx.install(&userscript(name, "ns", &[])).await;
    }

    let changed = ctx.store.move_script(1, 2).await.unwrap();
    assert_eq!(changed, 3);
    assert_eq!(positions(&ctx.store), vec![(2, 1), (3, 2), (1, 3), (4, 4)]);

    ctx.store.move_script(4, -10).await.unwrap();
    assert_eq!(positions(&ctx.store), vec![(4, 1), (2, 2), (3, 3), (1, 4)]);

    let stored = ctx.backend.get("script:1").await.unwrap();
    assert_eq!(stored["props"]["position"], json!(4));

    let err = ctx.store.move_script(42, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(42)));
}

#[tokio::test]
async fn test_move_persists_only_changed_records() {
    let ctx = TestContext::new().await;
    for name in ["a", "b", "c"] {
        ctx.install(&userscript(name, "ns", &[])).await;
    }
    let before = ctx.backend.get("script:3").await.unwrap();
    assert_eq!(ctx.store.move_script(1, 1).await.unwrap(), 2);
    assert_eq!(ctx.backend.get("script:3").await.unwrap(), before);
    assert_eq!(ctx.store.move_script(3, 5).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sort_closes_gaps() {
    let ctx = TestContext::new().await;
    for (name, position) in [("a", 10), ("b", 3), ("c", 7)] {
        ctx.store
            .install(ScriptSource {
                code: userscript(name, "ns", &[]),
                position: Some(position),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    assert_eq!(ctx.store.sort().await.unwrap(), 3);
    assert_eq!(positions(&ctx.store), vec![(2, 1), (3, 2), (1, 3)]);
    assert_eq!(ctx.store.sort().await.unwrap(), 0);

    let next = ctx.install(&userscript("d", "ns", &[])).await;
    assert_eq!(next.script.props.position, 4);
}

#[tokio::test]
async fn test_update_info_merges_and_requires_known_id() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("A", "ns", &[])).await;

    let patch = ScriptInfoPatch {
        config: ConfigPatch {
            enabled: Some(false),
            ..Default::default()
        },
        custom: CustomPatch {
            name: Some(Some("Custom".to_string())),
            ..Default::default()
        },
        ..Default::default()
    };
    let script = ctx.store.update_info(a.script.id(), patch.clone()).await.unwrap();
    assert!(!script.config.enabled);
    assert!(script.config.should_update);
    assert_eq!(script.display_name(), "Custom");
    assert_eq!(
        ctx.backend.get("script:1").await.unwrap()["config"]["enabled"],
        Value::Bool(false)
    );

    let err = ctx.store.update_info(99, patch).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_remove_is_idempotent_and_reinstall_restores() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("A", "ns", &[])).await;

    assert!(ctx.store.remove(a.script.id()).await.unwrap());
    assert!(ctx.store.remove(a.script.id()).await.unwrap());
    assert!(!ctx.store.remove(77).await.unwrap());
    assert!(ctx.store.list(true).unwrap().is_empty());
    assert_eq!(ctx.store.list(false).unwrap().len(), 1);
    assert_eq!(ctx.store.script_version(ScriptQuery::Id(1)).unwrap(), None);

    let again = ctx.install(&userscript("A", "ns", &[])).await;
    assert_eq!(again.script.id(), a.script.id());
    assert!(!again.script.config.removed);
}

#[tokio::test]
async fn test_check_remove_respects_grace_period() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("A", "ns", &[])).await;
    ctx.install(&userscript("B", "ns", &[])).await;
    ctx.store
        .values()
        .update(a.script.id(), "k", Some(json!(1)))
        .await
        .unwrap();
    ctx.store.remove(a.script.id()).await.unwrap();

    assert_eq!(ctx.store.check_remove(false).await.unwrap(), 0);
    assert_eq!(ctx.store.list(false).unwrap().len(), 2);

    assert_eq!(ctx.store.check_remove(true).await.unwrap(), 1);
    assert_eq!(ctx.store.check_remove(true).await.unwrap(), 0);
    for key in ["script:1", "code:1", "value:1"] {
        assert!(!ctx.backend.contains(key).await, "{} should be purged", key);
    }
    assert!(ctx.backend.contains("script:2").await);
}

#[tokio::test]
async fn test_purge_cascades_to_unshared_dependencies() {
    let ctx = TestContext::new().await;
    let shared = "https://cdn.test/shared.js";
    let own = "https://cdn.test/own.js";
    ctx.fetcher.serve(shared, "var shared;");
    ctx.fetcher.serve(own, "var own;");
    let gone = ctx
        .install(&userscript(
            "Gone",
            "ns",
            &[&format!("require {}", shared), &format!("require {}", own)],
        ))
        .await;
    ctx.install(&userscript("Stays", "ns", &[&format!("require {}", shared)]))
        .await;
    ctx.store.remove(gone.script.id()).await.unwrap();

    assert_eq!(ctx.store.check_remove(true).await.unwrap(), 1);
    assert!(!ctx.backend.contains(&format!("require:{}", own)).await);
    assert!(!ctx.backend.contains(&format!("mod:{}", own)).await);
    assert!(ctx.backend.contains(&format!("require:{}", shared)).await);
    assert!(ctx.backend.contains(&format!("mod:{}", shared)).await);
}

#[tokio::test]
async fn test_purge_keeps_dependency_claimed_by_running_install() {
    let ctx = TestContext::new().await;
    let shared = "https://cdn.test/shared.js";
    let slow = "https://cdn.test/slow.js";
    ctx.fetcher.serve(shared, "var shared;");
    ctx.fetcher.serve(slow, "var slow;");
    let old = ctx
        .install(&userscript("Old", "ns", &[&format!("require {}", shared)]))
        .await;

    let gate = ctx.fetcher.gate(slow);
    let code = userscript(
        "New",
        "ns",
        &[&format!("require {}", shared), &format!("require {}", slow)],
    );
    let store = ctx.store.clone();
    let install = tokio::spawn(async move { store.install(ScriptSource::new(code)).await });
    while ctx.fetcher.requests(slow) == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert!(ctx.store.purge(old.script.id()).await.unwrap());
    assert!(ctx.backend.contains(&format!("require:{}", shared)).await);

    gate.notify_one();
    install.await.unwrap().unwrap();
    assert!(ctx.backend.contains(&format!("require:{}", shared)).await);
    assert_eq!(ctx.store.vacuum().await.fixes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_store_latest_record() {
    let ctx = TestContext::new().await;
    ctx.install(&userscript("Busy", "ns", &[])).await;

    let updates = (0..32).map(|i| {
        let store = ctx.store.clone();
        tokio::spawn(async move {
            let patch = ScriptInfoPatch {
                custom: CustomPatch {
                    name: Some(Some(format!("name {}", i))),
                    ..Default::default()
                },
                ..Default::default()
            };
            store.update_info(1, patch).await
        })
    });
    for update in join_all(updates).await {
        update.unwrap().unwrap();
    }

    let current = serde_json::to_value(ctx.store.get(1).unwrap().unwrap()).unwrap();
    assert_eq!(ctx.backend.get("script:1").await.unwrap(), current);
}

#[tokio::test]
async fn test_check_remove_after_grace_period() {
    let config = Config {
        removal_grace_secs: 0,
        ..Default::default()
    };
    let ctx = TestContext::with_config(config).await;
    ctx.install(&userscript("A", "ns", &[])).await;
    ctx.store.remove(1).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    assert_eq!(ctx.store.check_remove(false).await.unwrap(), 1);
    assert!(ctx.store.get(1).unwrap().is_none());
}

#[tokio::test]
async fn test_purge_deletes_immediately() {
    let ctx = TestContext::new().await;
    ctx.install(&userscript("A", "ns", &[])).await;
    assert!(ctx.store.purge(1).await.unwrap());
    assert!(!ctx.store.purge(1).await.unwrap());
    assert!(ctx.backend.keys().await.is_empty());
}

#[tokio::test]
async fn test_restart_round_trip() {
    let ctx = TestContext::new().await;
    for name in ["a", "b", "c"] {
        ctx.install(&userscript(name, "ns", &["grant GM_getValue"])).await;
    }
    ctx.store.move_script(3, -2).await.unwrap();
    ctx.store.remove(2).await.unwrap();
    ctx.store
        .update_info(
            1,
            ScriptInfoPatch {
                config: ConfigPatch {
                    notify_updates: Some(Some(false)),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let reopened = ctx.reopen().await;
    assert_eq!(reopened.list(false).unwrap(), ctx.store.list(false).unwrap());

    let next = reopened
        .install(ScriptSource::new(userscript("d", "ns", &[])))
        .await
        .unwrap();
    assert_eq!(next.script.id(), 4);
    assert_eq!(next.script.props.position, 4);
}

#[tokio::test]
async fn test_dependencies_resolve_against_install_url() {
    let ctx = TestContext::new().await;
    ctx.fetcher.serve("https://host.test/s/lib.js", "var lib;");
    ctx.fetcher.serve("https://host.test/style.css", "body{}");

    let outcome = ctx
        .install_from(
            &userscript("Deps", "ns", &["require lib.js", "resource css ../style.css"]),
            "https://host.test/s/deps.user.js",
        )
        .await;
    assert!(outcome.error.is_none());
    let script = outcome.script;
    assert_eq!(
        script.custom.last_install_url.as_deref(),
        Some("https://host.test/s/deps.user.js")
    );
    assert_eq!(script.resolve("lib.js"), "https://host.test/s/lib.js");
    assert_eq!(
        ctx.backend.get("require:https://host.test/s/lib.js").await,
        Some(json!("var lib;"))
    );
    assert_eq!(
        ctx.backend.get("cache:https://host.test/style.css").await,
        Some(json!("text/css,Ym9keXt9"))
    );
    assert!(ctx.backend.contains("mod:https://host.test/s/lib.js").await);
}

#[tokio::test]
async fn test_dependency_failure_is_recorded_on_script() {
    let mut ctx = TestContext::new().await;
    ctx.fetcher.fail("https://cdn.test/broken.js", 500);
    let mut events = ctx.store.subscribe();

    let outcome = ctx
        .install(&userscript("Broken", "ns", &["require https://cdn.test/broken.js"]))
        .await;
    assert_eq!(
        outcome.error.as_deref(),
        Some("HTTP500 https://cdn.test/broken.js")
    );
    assert_eq!(outcome.script.error, outcome.error);

    assert!(matches!(events.recv().await.unwrap(), ScriptEvent::Updated { is_new: true, .. }));
    match events.recv().await.unwrap() {
        ScriptEvent::Error { id, error, .. } => {
            assert_eq!(id, outcome.script.id());
            assert!(error.contains("HTTP500"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(ctx.next_sync().await);
}

#[tokio::test]
async fn test_refresh_dependencies_clears_recovered_error() {
    let ctx = TestContext::new().await;
    let url = "https://cdn.test/flaky.js";
    ctx.fetcher.fail(url, 502);
    let outcome = ctx
        .install(&userscript("Flaky", "ns", &[&format!("require {}", url)]))
        .await;
    assert!(outcome.error.is_some());

    ctx.fetcher.serve(url, "var flaky;");
    let error = ctx.store.refresh_dependencies(outcome.script.id()).await.unwrap();
    assert!(error.is_none());
    assert!(ctx.store.get(outcome.script.id()).unwrap().unwrap().error.is_none());
    assert_eq!(
        ctx.backend.get(&format!("require:{}", url)).await,
        Some(json!("var flaky;"))
    );

    let err = ctx.store.refresh_dependencies(99).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_dependency_failure_aborts_when_required() {
    let ctx = TestContext::new().await;
    let err = ctx
        .store
        .install(ScriptSource {
            code: userscript("Strict", "ns", &["require https://cdn.test/missing.js"]),
            require_deps: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FetchError);
    assert!(ctx.store.list(false).unwrap().is_empty());
    assert!(!ctx.backend.contains("script:1").await);
}

#[tokio::test]
async fn test_supplied_dependencies_are_not_fetched() {
    let ctx = TestContext::new().await;
    let url = "https://cdn.test/lib.js";
    let outcome = ctx
        .store
        .install(ScriptSource {
            code: userscript("Offline", "ns", &[&format!("require {}", url)]),
            require: [(url.to_string(), "var lib;".to_string())].into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(ctx.fetcher.total_requests(), 0);
    assert_eq!(
        ctx.backend.get(&format!("require:{}", url)).await,
        Some(json!("var lib;"))
    );
}

#[tokio::test]
async fn test_homepage_from_install_page() {
    let ctx = TestContext::new().await;
    let outcome = ctx
        .store
        .install(ScriptSource {
            code: userscript("Home", "ns", &[]),
            from: Some("https://scripts.test/home".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        outcome.script.custom.homepage_url.as_deref(),
        Some("https://scripts.test/home")
    );
}

#[tokio::test]
async fn test_export_and_icon_cache() {
    let ctx = TestContext::new().await;
    ctx.fetcher
        .serve_typed("https://cdn.test/icon.png", b"\x89PNG\r\n\x1a\nrest", "image/png");
    ctx.install(&userscript("Icon", "ns", &["icon https://cdn.test/icon.png"])).await;
    ctx.store.values().update(1, "k", Some(json!("v"))).await.unwrap();

    let export = ctx.store.export(None, true).await.unwrap();
    assert_eq!(export.items.len(), 1);
    assert!(export.items[0].code.as_deref().unwrap().contains("@name Icon"));
    assert_eq!(export.values.unwrap()[&1], json!({ "k": "v" }));

    let icons = ctx.store.icon_cache(None).await.unwrap();
    assert!(icons["https://cdn.test/icon.png"].starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_script_version_lookup_by_meta() {
    let ctx = TestContext::new().await;
    let a = ctx.install(&userscript("V", "ns", &["version 3.1"])).await;
    assert_eq!(
        ctx.store.script_version(ScriptQuery::Meta(&a.script.meta)).unwrap().as_deref(),
        Some("3.1")
    );
}
