//! Applying constitution changes to a community's policies.

use polity_core::{lint_with, LintOptions, Stage};
use polity_storage::{
    CommunityId, ConstitutionChange, PolicyDraft, PolicyId, PolicyStore, StorageError,
};
use time::OffsetDateTime;
use tracing::info;

use crate::error::EngineError;

/// Lint every stage of a draft, prefixing each diagnostic with its stage.
pub fn lint_draft(draft: &PolicyDraft, platforms: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for stage in Stage::ALL {
        let code = draft.stages.get(stage);
        if code.trim().is_empty() {
            continue;
        }
        let opts = LintOptions::new(stage).with_platforms(platforms.iter().cloned());
        out.extend(
            lint_with(code, &opts)
                .into_iter()
                .map(|d| format!("{}: {}", stage, d)),
        );
    }
    out
}

fn checked(draft: &PolicyDraft, platforms: &[String]) -> Result<(), EngineError> {
    let diagnostics = lint_draft(draft, platforms);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidPolicyCode {
            name: draft.name.clone(),
            diagnostics,
        })
    }
}

/// Apply `change` to `community`. Every write stamps `modified_at` with the
/// current time, so the changed policy sorts first during selection.
pub fn apply(
    store: &dyn PolicyStore,
    community: CommunityId,
    change: &ConstitutionChange,
    platforms: &[String],
) -> Result<(), EngineError> {
    let now = OffsetDateTime::now_utc();
    match change {
        ConstitutionChange::AddPolicy { draft } => {
            checked(draft, platforms)?;
            let policy = store.insert_policy(community, draft.clone(), now)?;
            info!(community = %community, policy = %policy.id, name = %policy.name, "added policy");
        }
        ConstitutionChange::ChangePolicy { policy, draft } => {
            checked(draft, platforms)?;
            let draft = draft.clone();
            update(store, *policy, now, move |p| p.apply_draft(draft.clone()))?;
            info!(community = %community, policy = %policy, "changed policy");
        }
        ConstitutionChange::RemovePolicy { policy } => {
            update(store, *policy, now, |p| p.is_active = false)?;
            info!(community = %community, policy = %policy, "removed policy");
        }
        ConstitutionChange::RecoverPolicy { policy } => {
            update(store, *policy, now, |p| p.is_active = true)?;
            info!(community = %community, policy = %policy, "recovered policy");
        }
    }
    Ok(())
}

fn update(
    store: &dyn PolicyStore,
    id: PolicyId,
    now: OffsetDateTime,
    change: impl Fn(&mut polity_storage::PolicyRecord),
) -> Result<(), EngineError> {
    let mut policy = store.get_policy(id)?.ok_or(StorageError::NotFound {
        entity: "policy",
        id: id.0,
    })?;
    change(&mut policy);
    policy.modified_at = now;
    store.update_policy(&policy)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polity_storage::{InMemoryStore, PolicyFilter, PolicyKind};
    use time::macros::datetime;

    fn platforms() -> Vec<String> {
        vec!["slack".to_string()]
    }

    #[test]
    fn added_policies_are_linted_first() {
        let store = InMemoryStore::new();
        let draft = PolicyDraft::new(PolicyKind::Platform, "sneaky")
            .stage(Stage::Check, "import os\nreturn PASSED");
        let err = apply(
            &store,
            CommunityId(1),
            &ConstitutionChange::AddPolicy { draft },
            &platforms(),
        )
        .unwrap_err();
        match err {
            EngineError::InvalidPolicyCode { name, diagnostics } => {
                assert_eq!(name, "sneaky");
                assert!(diagnostics[0].starts_with("check: "), "{:?}", diagnostics);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.list_policies(&PolicyFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn remove_and_recover_toggle_activity_and_touch_timestamps() {
        let store = InMemoryStore::new();
        let old = datetime!(2024-01-01 00:00 UTC);
        let policy = store
            .insert_policy(
                CommunityId(1),
                PolicyDraft::new(PolicyKind::Platform, "base"),
                old,
            )
            .unwrap();
        let remove = ConstitutionChange::RemovePolicy { policy: policy.id };
        apply(&store, CommunityId(1), &remove, &platforms()).unwrap();
        let removed = store.get_policy(policy.id).unwrap().unwrap();
        assert!(!removed.is_active);
        assert!(removed.modified_at > old);

        let recover = ConstitutionChange::RecoverPolicy { policy: policy.id };
        apply(&store, CommunityId(1), &recover, &platforms()).unwrap();
        assert!(store.get_policy(policy.id).unwrap().unwrap().is_active);
    }

    #[test]
    fn change_rewrites_stage_code() {
        let store = InMemoryStore::new();
        let policy = store
            .insert_policy(
                CommunityId(1),
                PolicyDraft::new(PolicyKind::Platform, "base"),
                OffsetDateTime::now_utc(),
            )
            .unwrap();
        let draft = PolicyDraft::new(PolicyKind::Platform, "strict")
            .stage(Stage::Check, "return FAILED")
            .action_type("slackpostmessage");
        apply(
            &store,
            CommunityId(1),
            &ConstitutionChange::ChangePolicy {
                policy: policy.id,
                draft,
            },
            &platforms(),
        )
        .unwrap();
        let changed = store.get_policy(policy.id).unwrap().unwrap();
        assert_eq!(changed.name, "strict");
        assert_eq!(changed.stages.check, "return FAILED");
        assert!(changed.applies_to("slackpostmessage"));
        assert_eq!(changed.version, 1);
    }

    #[test]
    fn changing_a_missing_policy_fails() {
        let store = InMemoryStore::new();
        let err = apply(
            &store,
            CommunityId(1),
            &ConstitutionChange::RemovePolicy { policy: PolicyId(99) },
            &platforms(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::NotFound { entity: "policy", id: 99 })
        ));
    }
}
