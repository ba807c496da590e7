mod common;

use common::{add_request, create_request, group_email, TestApp, TestOptions, PARTITION, REQUESTER};
use entitlements_service::models::{AuditAction, AuditStatus, DeleteGroupRequest, Role};
use entitlements_service::services::{EntitlementsError, GraphRepository};
use std::collections::{BTreeSet, HashMap};

#[tokio::test]
async fn test_failed_owner_edge_removes_created_group() {
    let app = TestApp::spawn().await;
    let before = app.graph.snapshot().unwrap();

    app.repository.fail_nth_write(2);
    let err = app
        .state
        .membership
        .create_group(create_request("users.seismic"))
        .await
        .unwrap_err();

    assert!(matches!(err, EntitlementsError::Conflict(_)));
    assert_eq!(app.graph.snapshot().unwrap(), before);
    assert!(app
        .graph
        .find_node(&group_email("users.seismic"), PARTITION)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_data_root_attach_unwinds_whole_creation() {
    let app = TestApp::spawn_with_data_root().await;
    app.provision().await;
    let before = app.graph.snapshot().unwrap();

    app.repository.fail_nth_write(3);
    let result = app
        .state
        .membership
        .create_group(create_request("data.wells.viewers"))
        .await;

    assert!(result.is_err());
    assert_eq!(app.graph.snapshot().unwrap(), before);

    app.repository.clear_faults();
    app.create_group("data.wells.viewers").await;
}

#[tokio::test]
async fn test_failed_delete_restores_every_edge() {
    let app = TestApp::spawn().await;
    app.create_group("users.middle").await;
    app.create_group("users.outer").await;
    app.add_member("users.outer", &group_email("users.middle"), Role::Member)
        .await;
    app.add_member("users.middle", "bob@corp.com", Role::Member)
        .await;
    let before = app.graph.snapshot().unwrap();

    // detach from outer, then two child edges, then the node itself
    app.repository.fail_nth_write(4);
    let result = app
        .state
        .membership
        .delete_group(DeleteGroupRequest {
            requester_id: REQUESTER.to_string(),
            partition_id: PARTITION.to_string(),
            group_email: group_email("users.middle"),
        })
        .await;

    assert!(result.is_err());
    assert_eq!(app.graph.snapshot().unwrap(), before);
}

#[tokio::test]
async fn test_failed_fan_out_reverts_earlier_partitions() {
    let mut associations = HashMap::new();
    associations.insert(PARTITION.to_string(), BTreeSet::from(["tenant2".to_string()]));
    let app = TestApp::spawn_with(TestOptions {
        associations,
        ..Default::default()
    })
    .await;
    app.create_group("data.wells.viewers").await;
    let before = app.graph.snapshot().unwrap();

    app.repository.fail_nth_write(2);
    let mut request = add_request(&group_email("data.wells.viewers"), "bob@corp.com", Role::Member);
    request.member_partition_ids = vec![PARTITION.to_string(), "tenant2".to_string()];
    let result = app.state.membership.add_member(request).await;

    assert!(result.is_err());
    assert_eq!(app.graph.snapshot().unwrap(), before);
}

#[tokio::test]
async fn test_failed_revert_reports_partial_rollback() {
    let app = TestApp::spawn().await;

    app.repository.fail_writes_from(2);
    let err = app
        .state
        .membership
        .create_group(create_request("users.seismic"))
        .await
        .unwrap_err();

    match err {
        EntitlementsError::PartialRollbackFailure { unreverted, .. } => {
            assert_eq!(unreverted.len(), 1);
            assert!(unreverted[0].starts_with("create_node"));
        }
        other => panic!("expected partial rollback failure, got {:?}", other),
    }

    // the created node is left behind for reconciliation
    assert!(app
        .graph
        .find_node(&group_email("users.seismic"), PARTITION)
        .await
        .unwrap()
        .is_some());

    let events = app.audit.events();
    let last = events.last().unwrap();
    assert_eq!(last.action, AuditAction::CreateGroup);
    assert_eq!(last.status, AuditStatus::Failure);
}

#[tokio::test]
async fn test_failure_leaves_cache_consistent() {
    let app = TestApp::spawn().await;
    app.create_group("users.g1").await;
    app.create_group("users.g2").await;
    app.add_member("users.g1", "bob@corp.com", Role::Member)
        .await;
    let cached = app.groups_of("bob@corp.com").await;

    app.repository.fail_nth_write(1);
    let result = app
        .state
        .membership
        .add_member(add_request(&group_email("users.g2"), "bob@corp.com", Role::Member))
        .await;

    assert!(result.is_err());
    assert_eq!(app.groups_of("bob@corp.com").await, cached);
}
