//! Conflict detection and resolution
//!
//! Decides between two competing change records for the same entity. The
//! decision is a pure function of the two records and the role lookup, so
//! every device that compares the same pair reaches the same answer.

use std::cmp::Ordering;

use super::roles::RolePriorityOracle;
use super::types::{
    ChangeAction, ChangeRecord, ConflictEntry, ConflictOutcome, ResolutionStrategy,
};

/// Outcome of comparing the local and incoming record
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Concurrent creations; both stand
    KeepBoth,
    /// The incoming record wins
    AcceptIncoming(ResolutionStrategy),
    /// The local record wins; the incoming one is stale
    KeepLocal(ResolutionStrategy),
    /// Not decidable automatically
    Conflict(ConflictEntry),
}

/// Which side won the comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Incoming,
}

/// Role-weighted resolver
pub struct ConflictResolver<'o> {
    oracle: &'o dyn RolePriorityOracle,
}

impl<'o> ConflictResolver<'o> {
    pub fn new(oracle: &'o dyn RolePriorityOracle) -> Self {
        Self { oracle }
    }

    /// Weight used for a record: the warehouse role map when it knows the
    /// actor, otherwise the weight stamped on the record at creation
    pub fn effective_weight(&self, record: &ChangeRecord) -> i64 {
        self.oracle
            .priority(&record.actor_id, &record.warehouse_id)
            .unwrap_or(record.actor_role_weight)
    }

    /// Resolve two concurrent records targeting the same entity
    pub fn resolve(&self, local: &ChangeRecord, incoming: &ChangeRecord) -> Resolution {
        match (local.action, incoming.action) {
            (ChangeAction::Create, ChangeAction::Create) => Resolution::KeepBoth,

            // Deletions are never applied over a concurrent edit
            (ChangeAction::Delete, _) | (_, ChangeAction::Delete) => {
                Resolution::Conflict(conflict_entry(local, incoming, ResolutionStrategy::Manual))
            }

            _ => match self.pick_winner(local, incoming) {
                Some((ConflictWinner::Incoming, strategy)) => Resolution::AcceptIncoming(strategy),
                Some((ConflictWinner::Local, strategy)) => Resolution::KeepLocal(strategy),
                None => Resolution::Conflict(conflict_entry(
                    local,
                    incoming,
                    ResolutionStrategy::Manual,
                )),
            },
        }
    }

    /// Higher weight wins, then later timestamp; `None` on a full tie
    fn pick_winner(
        &self,
        local: &ChangeRecord,
        incoming: &ChangeRecord,
    ) -> Option<(ConflictWinner, ResolutionStrategy)> {
        let by_weight = self
            .effective_weight(incoming)
            .cmp(&self.effective_weight(local));

        match by_weight {
            Ordering::Greater => return Some((ConflictWinner::Incoming, ResolutionStrategy::RoleWeight)),
            Ordering::Less => return Some((ConflictWinner::Local, ResolutionStrategy::RoleWeight)),
            Ordering::Equal => {}
        }

        match incoming.timestamp.cmp(&local.timestamp) {
            Ordering::Greater => Some((ConflictWinner::Incoming, ResolutionStrategy::LatestTimestamp)),
            Ordering::Less => Some((ConflictWinner::Local, ResolutionStrategy::LatestTimestamp)),
            Ordering::Equal => None,
        }
    }
}

/// Conflict id shared by every device that sees this pair
pub fn conflict_id(a: &ChangeRecord, b: &ChangeRecord) -> String {
    if a.id <= b.id {
        format!("{}~{}", a.id, b.id)
    } else {
        format!("{}~{}", b.id, a.id)
    }
}

fn conflict_entry(
    local: &ChangeRecord,
    incoming: &ChangeRecord,
    strategy: ResolutionStrategy,
) -> ConflictEntry {
    ConflictEntry {
        id: conflict_id(local, incoming),
        entity_type: incoming.entity_type,
        entity_id: incoming.entity_id.clone(),
        local: local.clone(),
        remote: incoming.clone(),
        resolution_strategy: strategy,
        outcome: ConflictOutcome::Pending,
        requires_manual_review: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::EntityType;
    use crate::sync::roles::{Role, WarehouseRoles};
    use chrono::DateTime;

    fn make_record(
        id: &str,
        action: ChangeAction,
        actor: &str,
        weight: i64,
        ts: i64,
        value: &str,
    ) -> ChangeRecord {
        ChangeRecord {
            id: id.to_string(),
            entity_type: EntityType::Item,
            entity_id: "item-x".to_string(),
            action,
            payload: serde_json::json!({ "description": value }),
            actor_id: actor.to_string(),
            actor_role_weight: weight,
            origin_device_id: format!("device-{}", actor),
            warehouse_id: "wh-1".to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            local_seq: 1,
            base_change_id: Some("base".to_string()),
        }
    }

    /// Winning record id, whichever side it sits on
    fn winner_id(resolution: &Resolution, local: &ChangeRecord, incoming: &ChangeRecord) -> Option<String> {
        match resolution {
            Resolution::AcceptIncoming(_) => Some(incoming.id.clone()),
            Resolution::KeepLocal(_) => Some(local.id.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_weight_dominates_timestamp() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let a = make_record("a", ChangeAction::Update, "a", 1000, 100, "A");
        let b = make_record("b", ChangeAction::Update, "b", 700, 101, "B");

        assert_eq!(
            resolver.resolve(&b, &a),
            Resolution::AcceptIncoming(ResolutionStrategy::RoleWeight)
        );
        assert_eq!(
            resolver.resolve(&a, &b),
            Resolution::KeepLocal(ResolutionStrategy::RoleWeight)
        );
    }

    #[test]
    fn test_same_winner_on_both_devices() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let pairs = [
            (
                make_record("a", ChangeAction::Update, "a", 700, 100, "A"),
                make_record("b", ChangeAction::Update, "b", 700, 105, "B"),
            ),
            (
                make_record("c", ChangeAction::Update, "c", 1000, 100, "C"),
                make_record("d", ChangeAction::Create, "d", 400, 300, "D"),
            ),
        ];

        for (x, y) in pairs {
            let on_device_x = winner_id(&resolver.resolve(&x, &y), &x, &y);
            let on_device_y = winner_id(&resolver.resolve(&y, &x), &y, &x);
            assert!(on_device_x.is_some());
            assert_eq!(on_device_x, on_device_y);
        }
    }

    #[test]
    fn test_equal_weight_later_timestamp_wins() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let older = make_record("old", ChangeAction::Update, "a", 700, 100, "old");
        let newer = make_record("new", ChangeAction::Update, "b", 700, 200, "new");

        assert_eq!(
            resolver.resolve(&older, &newer),
            Resolution::AcceptIncoming(ResolutionStrategy::LatestTimestamp)
        );
    }

    #[test]
    fn test_full_tie_requires_manual_review() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let a = make_record("a", ChangeAction::Update, "a", 700, 100, "A");
        let b = make_record("b", ChangeAction::Update, "b", 700, 100, "B");

        match resolver.resolve(&a, &b) {
            Resolution::Conflict(entry) => {
                assert!(entry.requires_manual_review);
                assert_eq!(entry.outcome, ConflictOutcome::Pending);
                assert_eq!(entry.id, conflict_id(&b, &a));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_against_update_always_conflicts() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let delete = make_record("del", ChangeAction::Delete, "a", 1000, 500, "");
        let update = make_record("upd", ChangeAction::Update, "b", 100, 100, "B");

        assert!(matches!(resolver.resolve(&update, &delete), Resolution::Conflict(_)));
        assert!(matches!(resolver.resolve(&delete, &update), Resolution::Conflict(_)));
    }

    #[test]
    fn test_concurrent_creates_coexist() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let a = make_record("a", ChangeAction::Create, "a", 700, 100, "A");
        let b = make_record("b", ChangeAction::Create, "b", 700, 100, "B");

        assert_eq!(resolver.resolve(&a, &b), Resolution::KeepBoth);
    }

    #[test]
    fn test_role_map_overrides_stamped_weight() {
        let roles = WarehouseRoles::new();
        roles.assign("wh-1", "a", Role::Viewer);
        roles.assign("wh-1", "b", Role::Owner);
        let resolver = ConflictResolver::new(&roles);

        // "a" stamped itself 1000 but the warehouse map says viewer
        let a = make_record("a", ChangeAction::Update, "a", 1000, 200, "A");
        let b = make_record("b", ChangeAction::Update, "b", 100, 100, "B");

        assert_eq!(resolver.effective_weight(&a), 400);
        assert_eq!(resolver.effective_weight(&b), 1000);
        assert_eq!(
            resolver.resolve(&a, &b),
            Resolution::AcceptIncoming(ResolutionStrategy::RoleWeight)
        );
    }

    #[test]
    fn test_stamped_weight_used_without_assignment() {
        let roles = WarehouseRoles::new();
        let resolver = ConflictResolver::new(&roles);

        let a = make_record("a", ChangeAction::Update, "a", 850, 100, "A");
        assert_eq!(resolver.effective_weight(&a), 850);
    }
}
