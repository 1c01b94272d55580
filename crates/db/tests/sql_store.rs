use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use embudo_core::domain::actor::UserId;
use embudo_core::domain::history::{HistoryEntry, HistoryKind};
use embudo_core::domain::mutation::{
    next_entered_at, ConditionalUpdate, OpportunityChange, OpportunityGuard, OpportunityMutation,
    StageMove,
};
use embudo_core::patch::Patch;
use embudo_db::repositories::{
    FieldRuleRepository, OpportunityRepository, StageRepository, TransitionRepository,
};
use embudo_db::{connect_with_settings, migrations, DefaultFunnel, OpportunityDraft, SqlFunnelStore};

async fn seeded_store() -> SqlFunnelStore {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    let store = SqlFunnelStore::new(pool);
    let seeded = DefaultFunnel::load(&store).await.expect("seed");
    assert!(!seeded.skipped);
    store
}

#[tokio::test]
async fn default_funnel_loads_into_sqlite() {
    let store = seeded_store().await;

    let stages = store.list_stages(false).await.expect("stages");
    let names: Vec<&str> = stages.iter().map(|stage| stage.name.as_str()).collect();
    assert_eq!(names, DefaultFunnel::stage_names().collect::<Vec<_>>());

    let first = &stages[0];
    let outgoing = store.list_transitions(Some(first.id), false).await.expect("transitions");
    assert_eq!(outgoing.iter().filter(|t| t.is_default).count(), 1);
    assert!(!store.list_field_rules(Some("IMSS")).await.expect("rules").is_empty());

    let again = DefaultFunnel::load(&store).await.expect("reseed");
    assert!(again.skipped);
}

#[tokio::test]
async fn claim_then_release_restores_pool_without_moving_stage() {
    let store = seeded_store().await;
    let stages = store.list_stages(false).await.expect("stages");
    let opp = store
        .insert_opportunity(OpportunityDraft {
            owner: None,
            stage: stages[0].id,
            entered_stage_at: Utc::now(),
            agreement_type: "IMSS".to_string(),
            fields: BTreeMap::new(),
        })
        .await
        .expect("insert");

    let claimed = store
        .conditional_update(OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::unowned(),
            change: OpportunityChange { owner: Patch::Value(UserId(4)), ..Default::default() },
            history: HistoryEntry::new(opp.id, Some(UserId(4)), HistoryKind::Claim, Utc::now()),
        })
        .await
        .expect("claim")
        .applied()
        .expect("claim applied");
    assert_eq!(claimed.owner, Some(UserId(4)));

    let released = store
        .conditional_update(OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::owner(claimed.owner),
            change: OpportunityChange { owner: Patch::Null, ..Default::default() },
            history: HistoryEntry::new(opp.id, Some(UserId(4)), HistoryKind::Release, Utc::now()),
        })
        .await
        .expect("release")
        .applied()
        .expect("release applied");

    assert_eq!(released.owner, None);
    assert_eq!(released.current_stage, opp.current_stage);
    assert_eq!(released.entered_stage_at, opp.entered_stage_at);

    let kinds: Vec<HistoryKind> =
        store.history_for(opp.id).await.expect("history").into_iter().map(|h| h.kind).collect();
    assert_eq!(kinds, vec![HistoryKind::Claim, HistoryKind::Release]);
}

#[tokio::test]
async fn closing_commit_hides_row_from_later_guards() {
    let store = seeded_store().await;
    let stages = store.list_stages(false).await.expect("stages");
    let exit = stages.iter().find(|stage| stage.name == "Venta").expect("sale stage");
    let opp = store
        .insert_opportunity(OpportunityDraft {
            owner: Some(UserId(2)),
            stage: stages[3].id,
            entered_stage_at: Utc::now() - Duration::hours(1),
            agreement_type: "IMSS".to_string(),
            fields: BTreeMap::new(),
        })
        .await
        .expect("insert");

    let entered_at = next_entered_at(opp.entered_stage_at, Utc::now());
    let closed = store
        .conditional_update(OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::snapshot(opp.snapshot()),
            change: OpportunityChange {
                owner: Patch::Absent,
                stage: Some(StageMove { stage: exit.id, entered_at }),
                active: Some(false),
            },
            history: HistoryEntry::new(opp.id, Some(UserId(2)), HistoryKind::StageChange, entered_at)
                .with_stages(opp.current_stage, exit.id),
        })
        .await
        .expect("close");
    let closed = closed.applied().expect("applied");
    assert!(!closed.active);
    assert_eq!(closed.owner, Some(UserId(2)));

    let late_claim = store
        .conditional_update(OpportunityMutation {
            opportunity_id: opp.id,
            guard: OpportunityGuard::owner(Some(UserId(2))),
            change: OpportunityChange { owner: Patch::Null, ..Default::default() },
            history: HistoryEntry::new(opp.id, Some(UserId(2)), HistoryKind::Release, Utc::now()),
        })
        .await
        .expect("late release");
    assert_eq!(late_claim, ConditionalUpdate::Stale);
}
