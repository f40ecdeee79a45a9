use std::collections::BTreeMap;

use dsync_core::{AccountId, NormalizedMatch, TeammateEncounter, UserId};

/// Turns a resolved match into per-account encounter deltas. Each match's
/// deltas travel with its outcome, so they are committed only alongside the
/// match row itself.
#[derive(Debug, Clone, Copy)]
pub struct TeammateAggregator {
    user_id: UserId,
}

impl TeammateAggregator {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    /// One shared game with every known teammate of the user, one delta per
    /// account.
    pub fn deltas(&self, normalized: &NormalizedMatch) -> Vec<TeammateEncounter> {
        let won = normalized.user_won();
        let at = normalized.start_time;
        let mut pending: BTreeMap<AccountId, TeammateEncounter> = BTreeMap::new();
        for teammate in normalized.teammates() {
            let Some(account_id) = teammate.known_account() else {
                continue;
            };
            pending
                .entry(account_id)
                .and_modify(|encounter| encounter.record(won, at))
                .or_insert_with(|| TeammateEncounter::first(self.user_id, account_id, won, at));
        }
        pending.into_values().collect()
    }
}
