//! Offline queue and reconciliation integration tests.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{harness, harness_with, potion, profile_doc, user, RiggedRemote};
use serde_json::json;
use tavern_core::{document, quote, PendingOfflineTransaction, PurchaseTransaction};
use tavern_service::OfflineQueue;
use tavern_store::Provider;

/// Remote with alice seeded and writes rigged to fail, plus a harness
/// around it. The first purchase lands in the offline queue.
async fn offline_setup(
    auto_fallback: bool,
) -> (Arc<RiggedRemote>, common::TestHarness, tavern_core::UserId) {
    let remote = RiggedRemote::new();
    let alice = user("alice");
    remote
        .inner
        .save_user(&alice, &profile_doc(&alice, 10_000))
        .await
        .unwrap();
    remote.fail_writes(true);
    let h = harness_with(
        vec![potion()],
        Some(remote.clone() as Arc<dyn Provider>),
        |c| c.auto_fallback = auto_fallback,
    )
    .await;
    (remote, h, alice)
}

// ============================================================================
// Queueing
// ============================================================================

#[tokio::test]
async fn unreachable_commit_queues_and_still_succeeds() {
    let (remote, h, alice) = offline_setup(true).await;

    let result = h
        .service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        result.message,
        "Purchase recorded locally (offline). Will sync when the provider is available."
    );
    assert!(result.tx_id.is_some());
    assert_eq!(result.new_balances.unwrap()["gold"], 9_500);

    // the mutated state was forced durable locally
    let doc = h.local.get_user(&alice).await.unwrap().unwrap();
    assert_eq!(document::get_i64(&doc, "gold"), 9_500);
    assert!(h.local.data_dir().join("users/alice.json").exists());
    assert_eq!(h.local.read_ledger("purchases").await.unwrap().len(), 1);

    // queued and demoted
    assert_eq!(h.service.pending_count().await.unwrap(), 1);
    assert!(h.service.is_single_tenant());
    let raw = std::fs::read_to_string(&h.config.queue_file).unwrap();
    assert!(raw.contains("\"status\": \"PENDING_OFFLINE\""));

    // the remote never saw the purchase
    let remote_doc = remote.inner.get_user(&alice).await.unwrap().unwrap();
    assert_eq!(document::get_i64(&remote_doc, "gold"), 10_000);
}

#[tokio::test]
async fn demotion_is_permanent_for_the_process() {
    let (remote, h, alice) = offline_setup(true).await;
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();
    assert!(h.service.is_single_tenant());

    // the next purchase is local only: no remote calls, no new queue entry
    let gets_before = remote.get_count();
    let second = h
        .service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    assert!(second.success);
    assert_eq!(second.message, "Purchase successful");
    assert_eq!(remote.get_count(), gets_before);
    assert_eq!(h.service.pending_count().await.unwrap(), 1);

    let doc = h.local.get_user(&alice).await.unwrap().unwrap();
    assert_eq!(document::get_i64(&doc, "gold"), 9_000);
}

#[tokio::test]
async fn without_auto_fallback_every_commit_retries_the_remote() {
    let (remote, h, alice) = offline_setup(false).await;

    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();
    assert!(!h.service.is_single_tenant());

    let gets_before = remote.get_count();
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    // remote was consulted again and a second entry queued
    assert!(remote.get_count() > gets_before);
    assert_eq!(h.service.pending_count().await.unwrap(), 2);
    assert!(!h.service.is_single_tenant());
}

#[tokio::test]
async fn single_tenant_mode_never_touches_the_remote() {
    let remote = RiggedRemote::new();
    let h = harness_with(
        vec![potion()],
        Some(remote.clone() as Arc<dyn Provider>),
        |c| c.single_tenant = true,
    )
    .await;

    let result = h
        .service
        .purchase_item(&user("alice"), "health_potion", 1, "gold", None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(remote.get_count(), 0);
    assert_eq!(remote.save_count(), 0);
    assert_eq!(h.service.pending_count().await.unwrap(), 0);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn sync_replays_when_the_pre_balance_still_holds() {
    let (remote, h, alice) = offline_setup(true).await;
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    remote.fail_writes(false);
    let saves_before = remote.save_count();
    let report = h.service.sync_pending_transactions().await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 0);
    assert!(report.is_clean());
    assert!(report.errors.is_empty());
    assert_eq!(remote.save_count(), saves_before + 1);

    // the recorded mutation was replayed exactly
    let doc = remote.inner.get_user(&alice).await.unwrap().unwrap();
    assert_eq!(document::get_i64(&doc, "gold"), 9_500);
    assert_eq!(document::get_i64(&doc, "inventory.health_potion"), 1);
    assert_eq!(document::get_i64(&doc, "version"), 2);
    assert_eq!(remote.inner.read_ledger("purchases").await.unwrap().len(), 1);

    // resolved entries leave the queue; the empty file is deleted
    assert_eq!(h.service.pending_count().await.unwrap(), 0);
    assert!(!h.config.queue_file.exists());

    // a second pass has nothing to do
    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.applied, 0);
    assert!(report.is_clean());
}

#[tokio::test]
async fn sync_skips_the_write_when_already_applied() {
    let (remote, h, alice) = offline_setup(true).await;
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    // the remote independently holds the post balance already
    remote.fail_writes(false);
    remote
        .inner
        .save_user(&alice, &profile_doc(&alice, 9_500))
        .await
        .unwrap();

    let saves_before = remote.save_count();
    let report = h.service.sync_pending_transactions().await.unwrap();

    assert_eq!(report.applied, 1);
    assert!(report.is_clean());
    assert_eq!(remote.save_count(), saves_before);
    // the idempotent ledger append still closes any gap
    assert_eq!(remote.inner.read_ledger("purchases").await.unwrap().len(), 1);
    assert_eq!(h.service.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_keeps_a_conflicting_entry_for_manual_review() {
    let (remote, h, alice) = offline_setup(true).await;
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    // remote balance matches neither the recorded pre nor post
    remote.fail_writes(false);
    remote
        .inner
        .save_user(&alice, &profile_doc(&alice, 7_777))
        .await
        .unwrap();

    let saves_before = remote.save_count();
    let report = h.service.sync_pending_transactions().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.failed, 0);
    assert!(!report.is_clean());
    assert!(report.errors[0].contains("matches neither"));

    // nothing was overwritten
    assert_eq!(remote.save_count(), saves_before);
    let doc = remote.inner.get_user(&alice).await.unwrap().unwrap();
    assert_eq!(document::get_i64(&doc, "gold"), 7_777);

    // the entry stays, with the conflict recorded on it
    let raw = std::fs::read_to_string(&h.config.queue_file).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(entries[0]["retry_count"], 1);
    assert!(entries[0]["failure_reason"].is_string());
    assert_eq!(entries[0]["status"], "PENDING_OFFLINE");

    // every pass bumps the retry count
    h.service.sync_pending_transactions().await.unwrap();
    let raw = std::fs::read_to_string(&h.config.queue_file).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(entries[0]["retry_count"], 2);
}

#[tokio::test]
async fn sync_keeps_the_entry_while_the_remote_stays_down() {
    let (remote, h, alice) = offline_setup(true).await;
    h.service
        .purchase_item(&alice, "health_potion", 1, "gold", None)
        .await
        .unwrap();

    // now even reads fail
    remote.inner.set_offline(true);
    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].contains("still unavailable"));
    assert_eq!(h.service.pending_count().await.unwrap(), 1);

    // once the remote is back the entry drains
    remote.inner.set_offline(false);
    remote.fail_writes(false);
    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.service.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_without_a_remote_resolves_entries_locally() {
    let h = harness(vec![potion()]).await;

    // a queue left behind by an earlier process
    let queue = OfflineQueue::new(h.config.queue_file.clone());
    let snapshot = quote(&potion(), 1, None, "gold", 1.0);
    let tx = PurchaseTransaction::new(
        user("alice"),
        "health_potion",
        1,
        snapshot,
        BTreeMap::from([("gold".to_string(), 10_000)]),
        BTreeMap::from([("gold".to_string(), 9_500)]),
    );
    queue
        .append(&PendingOfflineTransaction::new(tx, queue.path().to_path_buf()))
        .await
        .unwrap();
    assert_eq!(h.service.pending_count().await.unwrap(), 1);

    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(report.is_clean());
    assert!(!h.config.queue_file.exists());
}

#[tokio::test]
async fn malformed_queue_entries_are_counted_and_preserved() {
    let h = harness(vec![potion()]).await;
    std::fs::write(
        &h.config.queue_file,
        serde_json::to_vec_pretty(&json!([{"garbage": true}])).unwrap(),
    )
    .unwrap();

    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.errors, vec!["unparseable queue entry retained"]);

    // the bytes survive for inspection, run after run
    let raw = std::fs::read_to_string(&h.config.queue_file).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(entries[0]["garbage"], json!(true));

    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn sync_on_a_missing_queue_is_a_noop() {
    let h = harness(vec![potion()]).await;

    let report = h.service.sync_pending_transactions().await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 0);
    assert!(report.errors.is_empty());
    assert!(!h.config.queue_file.exists());
}
