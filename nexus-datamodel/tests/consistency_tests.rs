//! Convergence and cleanup guarantees: concurrent writers, link sweeping,
//! cascading deletes and the durable backend.

use std::time::Duration;

use nexus_core::{get_str, path_of, Properties, UpdateType};
use nexus_test_utils::fixtures::*;
use nexus_test_utils::recorders::NodeRecorder;
use nexus_test_utils::eventually;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reader_converges_on_last_write() {
    let kv = memory_store();
    let w1 = model_on("w1", kv.clone()).await;
    let w2 = model_on("w2", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let root = w1.upsert_root_node("A", "a1", &Properties::new()).await;
    reader.subscribe(&path_of([("A", "a1")]), 0).await;
    let cached = reader.get_root_node("A", "a1", false).await.expect("exists");
    let other = w2.get_root_node("A", "a1", false).await.expect("exists");

    let first = tokio::spawn({
        let root = root.clone();
        async move {
            for i in 0..20 {
                root.set_properties(&props(json!({ "v": format!("w1-{i}") })), true)
                    .await;
            }
        }
    });
    let second = tokio::spawn(async move {
        for i in 0..20 {
            other
                .set_properties(&props(json!({ "v": format!("w2-{i}") })), true)
                .await;
        }
    });
    first.await.expect("writer task");
    second.await.expect("writer task");

    let latest = w1.get_root_node("A", "a1", true).await.expect("exists");
    let want = get_str(&latest.cached_properties(), "v").map(str::to_string);
    assert!(want.is_some());
    assert!(
        eventually(WAIT, || {
            get_str(&cached.cached_properties(), "v").map(str::to_string) == want
        })
        .await,
        "reader settled on the store's last write"
    );
    assert_eq!(cached.revision(), latest.revision());
}

#[tokio::test]
async fn sync_sweeps_links_deleted_elsewhere() {
    let kv = memory_store();
    let writer = model_on("writer", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let a = writer.upsert_root_node("A", "a1", &Properties::new()).await;
    let b = writer.upsert_root_node("B", "b1", &Properties::new()).await;
    a.upsert_link(&b, &Properties::new(), false, false).await;

    let ra = reader.get_root_node("A", "a1", false).await.expect("exists");
    assert!(ra.links().has("B", "b1"));

    assert!(a.delete_link("b1", "B").await);
    ra.sync(false).await;
    assert!(!ra.links().has("B", "b1"));
}

#[tokio::test]
async fn cascading_delete_leaves_no_references() {
    let dm = connected_model("cascade").await;
    let (root, tenant) = config_with_tenant(&dm, "acme").await;

    let mut children = Vec::new();
    for i in 0..4 {
        let (vpc, _) = tenant
            .upsert_child("Vpc", "name", &props(json!({ "name": format!("v{i}") })), &Properties::new())
            .await
            .expect("created");
        children.push(vpc);
    }
    let mut sources = Vec::new();
    for i in 0..3 {
        let src = dm
            .upsert_root_node("Policy", &format!("p{i}"), &Properties::new())
            .await;
        src.upsert_link(&children[0], &Properties::new(), false, false)
            .await
            .expect("linked");
        sources.push(src);
    }
    let pattern = path_of([("Config", "default"), ("Tenant", "acme"), ("Vpc", "*")]);
    let rec = NodeRecorder::new();
    dm.register_cb(&pattern, rec.callback());

    tenant.delete().await;

    for vpc in &children {
        let id = vpc.id().to_string();
        assert!(eventually(WAIT, || rec.count(UpdateType::NodeDelete, &id) == 1).await);
        assert!(dm.get_cached_node(&id).is_none());
        assert!(dm.get_node(tenant.id(), "Vpc", &id, true, false).await.is_none());
    }
    for src in &sources {
        assert!(!src.links().has("Vpc", "v0"));
        assert!(src.get_child_link("v0", "Vpc").await.is_none());
    }
    assert!(!root.links().has("Tenant", "acme"));
    assert!(root.next_child_key_list("Tenant", "", 10).await.is_empty());
    assert!(!dm.delete(&tenant).await, "second delete is a no-op");
}

#[tokio::test]
async fn delete_without_rlinks_uses_cached_reverse_links() {
    let dm = model_with("plain", memory_store(), test_config_without_rlinks()).await;
    assert!(!dm.rlink_enabled());
    let a = dm.upsert_root_node("A", "a1", &Properties::new()).await;
    let b = dm.upsert_root_node("B", "b1", &Properties::new()).await;
    a.upsert_link(&b, &Properties::new(), false, false).await;

    assert!(dm.delete(&b).await);
    assert!(!a.links().has("B", "b1"));
    a.sync(true).await;
    assert!(!a.links().has("B", "b1"), "store link removed too");
}

#[tokio::test]
async fn lmdb_backend_shares_state_between_models() {
    let (_dir, kv) = lmdb_store();
    let writer = model_on("writer", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let (_root, tenant) = config_with_tenant(&writer, "acme").await;
    config_with_tenant(&writer, "globex").await;

    let rroot = reader
        .get_root_node("Config", "default", false)
        .await
        .expect("visible through lmdb");
    let keys = rroot.next_child_key_list("Tenant", "", 10).await;
    assert_eq!(keys, vec!["acme".to_string(), "globex".to_string()]);

    reader.subscribe(&path_of([("Config", "default"), ("Tenant", "*")]), 0).await;
    let (acme, _) = rroot
        .get_child("acme", "Tenant", false)
        .await
        .expect("child readable");
    assert_eq!(acme.key_value(), "acme");

    tenant.set_properties(&props(json!({"plan": "gold"})), true).await;
    assert!(
        eventually(WAIT, || get_str(&acme.cached_properties(), "plan") == Some("gold")).await,
        "watch delivers lmdb writes"
    );
    let revision = writer.latest_revision().await.expect("revision readable");
    assert_eq!(acme.revision(), revision);
}

#[tokio::test]
async fn remote_delete_clears_soft_link_back_references() {
    let kv = memory_store();
    let writer = model_on("writer", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let a = writer.upsert_root_node("A", "a1", &Properties::new()).await;
    let b = writer.upsert_root_node("B", "b1", &Properties::new()).await;
    a.upsert_link(&b, &Properties::new(), false, false).await;

    reader.subscribe(&path_of([("A", "*")]), 0).await;
    reader.subscribe(&path_of([("B", "*")]), 0).await;
    let rb = reader.get_root_node("B", "b1", false).await.expect("exists");
    let ra = reader.get_root_node("A", "a1", false).await.expect("exists");
    assert!(ra.links().has("B", "b1"));
    assert_eq!(rb.reverse_links().len(), 1);
    assert!(rb.links().get_rlink("A", "a1").is_some());

    assert!(writer.delete(&a).await);
    let a_id = a.id().to_string();
    assert!(
        eventually(WAIT, || {
            reader.get_cached_node(&a_id).is_none()
                && rb.reverse_links().is_empty()
                && rb.links().get_rlink("A", "a1").is_none()
        })
        .await,
        "reader's b1 still references deleted a1"
    );
    assert!(reader.get_cached_node(rb.id()).is_some());
}

#[tokio::test]
async fn remote_link_delete_clears_destination_state() {
    let kv = memory_store();
    let writer = model_on("writer", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let a = writer.upsert_root_node("A", "a1", &Properties::new()).await;
    let b = writer.upsert_root_node("B", "b1", &Properties::new()).await;
    a.upsert_link(&b, &Properties::new(), false, false).await;

    reader.subscribe(&path_of([("A", "*")]), 0).await;
    reader.subscribe(&path_of([("B", "*")]), 0).await;
    let rb = reader.get_root_node("B", "b1", false).await.expect("exists");
    let ra = reader.get_root_node("A", "a1", false).await.expect("exists");
    assert_eq!(rb.reverse_links().len(), 1);

    assert!(a.delete_link("b1", "B").await);
    assert!(
        eventually(WAIT, || {
            !ra.links().has("B", "b1")
                && rb.reverse_links().is_empty()
                && rb.links().get_rlink("A", "a1").is_none()
        })
        .await
    );
}

#[tokio::test]
async fn remote_cascading_delete_leaves_no_references() {
    let kv = memory_store();
    let writer = model_on("writer", kv.clone()).await;
    let reader = model_on("reader", kv).await;

    let (_root, tenant) = config_with_tenant(&writer, "acme").await;
    let mut vpcs = Vec::new();
    for i in 0..3 {
        let (vpc, _) = tenant
            .upsert_child("Vpc", "name", &props(json!({ "name": format!("v{i}") })), &Properties::new())
            .await
            .expect("created");
        vpcs.push(vpc);
    }
    for i in 0..2 {
        let src = writer
            .upsert_root_node("Policy", &format!("p{i}"), &Properties::new())
            .await;
        src.upsert_link(&vpcs[0], &Properties::new(), false, false)
            .await
            .expect("linked");
    }

    let vpc_pattern = path_of([("Config", "default"), ("Tenant", "*"), ("Vpc", "*")]);
    for pattern in [
        path_of([("Config", "default")]),
        path_of([("Config", "default"), ("Tenant", "*")]),
        vpc_pattern.clone(),
        path_of([("Policy", "*")]),
    ] {
        reader.subscribe(&pattern, 0).await;
    }
    let rroot = reader
        .get_root_node("Config", "default", false)
        .await
        .expect("root");
    let (rtenant, _) = rroot.get_child("acme", "Tenant", false).await.expect("tenant");
    for i in 0..3 {
        rtenant
            .get_child(&format!("v{i}"), "Vpc", false)
            .await
            .expect("vpc");
    }
    let mut sources = Vec::new();
    for i in 0..2 {
        let src = reader
            .get_root_node("Policy", &format!("p{i}"), false)
            .await
            .expect("policy");
        assert!(src.links().has("Vpc", "v0"));
        sources.push(src);
    }
    let rec = NodeRecorder::new();
    reader.register_cb(&vpc_pattern, rec.callback());

    tenant.delete().await;

    for vpc in &vpcs {
        let id = vpc.id().to_string();
        assert!(eventually(WAIT, || rec.count(UpdateType::NodeDelete, &id) == 1).await);
        assert!(reader.get_cached_node(&id).is_none());
    }
    let tid = tenant.id().to_string();
    assert!(eventually(WAIT, || reader.get_cached_node(&tid).is_none()).await);
    assert!(eventually(WAIT, || !rroot.links().has("Tenant", "acme")).await);
    for src in &sources {
        assert!(eventually(WAIT, || !src.links().has("Vpc", "v0")).await);
    }
}
