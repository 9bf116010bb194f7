//! Registry and report store persistence tests.
//!
//! These run against a real SQLite file in a temp directory to check identity
//! mapping, team membership, and that stored reports are replaced whole.

mod common;

use chrono::{TimeZone, Utc};
use common::Fixture;
use sprint_reports::error::AppError;
use sprint_reports::models::{
    Metrics, NewTracker, Report, ReportKey, ReportKind, Role, TimeRange,
};
use sprint_reports::services::registry::{Action, Decision, Resolution};

fn report(tracker_id: i64, subject: &str, points: f64) -> Report {
    Report {
        key: ReportKey {
            tracker_id,
            kind: ReportKind::Sprint,
            subject: subject.to_string(),
            time_range: None,
        },
        title: subject.to_string(),
        period: None,
        sprint_ids: vec![],
        rows: vec![],
        totals: Metrics {
            points,
            ..Metrics::default()
        },
        unmapped_identities: vec![],
        comparison: None,
        generated_at: Utc.with_ymd_and_hms(2024, 3, 18, 8, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_resolve_mapped_and_unmapped() {
    let fx = Fixture::new().await;
    let registry = fx.engine.registry();

    match registry.resolve(fx.tracker_id, "ext-a").await.unwrap() {
        Resolution::Mapped(user) => assert_eq!(user.id, fx.member.id),
        Resolution::Unmapped => panic!("ext-a should be mapped"),
    }
    assert!(matches!(
        registry.resolve(fx.tracker_id, "ext-z").await.unwrap(),
        Resolution::Unmapped
    ));

    let map = registry.identity_map(fx.tracker_id).await.unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("ext-a").map(|u| u.display_name.as_str()), Some("Alice"));
}

#[tokio::test]
async fn test_identity_is_scoped_per_tracker() {
    let fx = Fixture::new().await;
    let registry = fx.engine.registry();

    let other = registry
        .create_tracker(&NewTracker {
            name: "Other".to_string(),
            tracker_type: "yandex".to_string(),
            base_url: "https://other.example.com/".to_string(),
            org_id: None,
            token: "t".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(other.base_url, "https://other.example.com");

    assert!(matches!(
        registry.resolve(other.id, "ext-a").await.unwrap(),
        Resolution::Unmapped
    ));
}

#[tokio::test]
async fn test_relinking_moves_identity() {
    let fx = Fixture::new().await;
    let registry = fx.engine.registry();

    registry
        .link_identity(fx.lead.id, fx.tracker_id, "ext-a")
        .await
        .unwrap();

    match registry.resolve(fx.tracker_id, "ext-a").await.unwrap() {
        Resolution::Mapped(user) => assert_eq!(user.id, fx.lead.id),
        Resolution::Unmapped => panic!("ext-a should be mapped"),
    }
    let alice = registry.require_user(fx.member.id).await.unwrap();
    assert!(alice.identities.is_empty());

    registry.unlink_identity(fx.tracker_id, "ext-a").await.unwrap();
    assert!(matches!(
        registry.resolve(fx.tracker_id, "ext-a").await.unwrap(),
        Resolution::Unmapped
    ));
}

#[tokio::test]
async fn test_role_change_takes_effect() {
    let fx = Fixture::new().await;
    let registry = fx.engine.registry();
    let subject = sprint_reports::models::ReportSubject::Sprint {
        sprint_id: "s1".to_string(),
        for_user: None,
    };

    let before = registry
        .authorize(fx.member.id, Action::ViewReport(&subject))
        .await
        .unwrap();
    assert!(matches!(before, Decision::Deny(_)));

    let updated = registry.set_role(fx.member.id, Role::Lead).await.unwrap();
    assert_eq!(updated.role, Role::Lead);

    let after = registry
        .authorize(fx.member.id, Action::ViewReport(&subject))
        .await
        .unwrap();
    assert_eq!(after, Decision::Allow);

    let missing = registry.set_role(424242, Role::Admin).await;
    assert!(matches!(missing, Err(AppError::NotFound { .. })));
}

#[tokio::test]
async fn test_ensure_admin_is_idempotent() {
    let fx = Fixture::new().await;
    let again = fx.engine.registry().ensure_admin("Someone Else").await.unwrap();
    assert_eq!(again.id, fx.admin.id);
    assert_eq!(again.display_name, "Root");
}

#[tokio::test]
async fn test_team_membership() {
    let fx = Fixture::new().await;
    let registry = fx.engine.registry();

    let team = registry.create_team(fx.tracker_id, "Core").await.unwrap();
    registry.add_team_member(team.id, fx.member.id).await.unwrap();
    // Adding twice is harmless
    let team = registry.add_team_member(team.id, fx.member.id).await.unwrap();
    assert_eq!(team.member_ids, vec![fx.member.id]);

    let duplicate = registry.create_team(fx.tracker_id, "Core").await;
    assert!(matches!(duplicate, Err(AppError::Validation { .. })));

    let team = registry.remove_team_member(team.id, fx.member.id).await.unwrap();
    assert!(team.member_ids.is_empty());
    assert!(registry.team_members(team.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_put_replaces_stored_report() {
    let fx = Fixture::new().await;
    let store = fx.engine.store();

    store.put(&report(fx.tracker_id, "sprint:1", 3.0)).await.unwrap();
    store.put(&report(fx.tracker_id, "sprint:1", 8.0)).await.unwrap();

    let key = report(fx.tracker_id, "sprint:1", 0.0).key;
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.totals.points, 8.0);

    let listed = store.list_for_tracker(fx.tracker_id, None).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_time_range_is_part_of_key() {
    let fx = Fixture::new().await;
    let store = fx.engine.store();

    let mut ranged = report(fx.tracker_id, "team:1", 1.0);
    ranged.key.kind = ReportKind::Team;
    ranged.key.time_range = Some(TimeRange::new(common::day(3, 1), common::day(3, 31)));
    store.put(&ranged).await.unwrap();

    let mut other_range = ranged.key.clone();
    other_range.time_range = Some(TimeRange::new(common::day(4, 1), common::day(4, 30)));
    assert!(store.get(&other_range).await.unwrap().is_none());
    assert!(store.get(&ranged.key).await.unwrap().is_some());

    let teams = store
        .list_for_tracker(fx.tracker_id, Some(ReportKind::Team))
        .await
        .unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].time_range(), ranged.key.time_range);
}

#[tokio::test]
async fn test_invalidate_tracker_drops_all_reports() {
    let fx = Fixture::new().await;
    let store = fx.engine.store();

    store.put(&report(fx.tracker_id, "sprint:1", 1.0)).await.unwrap();
    store.put(&report(fx.tracker_id, "sprint:2", 1.0)).await.unwrap();

    assert_eq!(store.invalidate_tracker(fx.tracker_id).await.unwrap(), 2);
    assert!(store
        .list_for_tracker(fx.tracker_id, None)
        .await
        .unwrap()
        .is_empty());
}
