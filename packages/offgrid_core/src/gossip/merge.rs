//! Merge rules for gossiped balances and reputation

use serde::{Deserialize, Serialize};

use crate::ledger::{Account, Balances};
use crate::reputation::ReputationTable;

/// An account both sides hold with different amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceConflict {
    pub account: Account,
    pub local: f64,
    pub remote: f64,
    pub chosen: f64,
}

/// Fold `remote` into `local` by per-account maximum.
///
/// Accounts only the remote knows are adopted as-is. Non-finite remote
/// amounts are dropped. Merging the same remote twice changes nothing.
pub fn merge_balances(local: &mut Balances, remote: &Balances) -> Vec<BalanceConflict> {
    let mut conflicts = Vec::new();
    for (account, &theirs) in remote {
        if !theirs.is_finite() {
            log::warn!("gossip: ignoring non-finite balance {} for {}", theirs, account);
            continue;
        }
        match local.get_mut(account) {
            None => {
                local.insert(account.clone(), theirs);
            }
            Some(ours) if *ours != theirs => {
                let chosen = ours.max(theirs);
                conflicts.push(BalanceConflict {
                    account: account.clone(),
                    local: *ours,
                    remote: theirs,
                    chosen,
                });
                *ours = chosen;
            }
            Some(_) => {}
        }
    }
    conflicts
}

/// Fold `remote` into `local` taking the max of each counter. Returns the
/// number of endpoints whose entry changed.
pub fn merge_reputation(local: &mut ReputationTable, remote: &ReputationTable) -> usize {
    let mut changed = 0;
    for (endpoint, theirs) in remote {
        let ours = local.entry(endpoint.clone()).or_default();
        let merged = crate::reputation::Reputation {
            hits: ours.hits.max(theirs.hits),
            misses: ours.misses.max(theirs.misses),
        };
        if merged != *ours {
            *ours = merged;
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::Reputation;

    fn balances(entries: &[(&str, f64)]) -> Balances {
        entries
            .iter()
            .map(|(name, amount)| (Account::from(*name), *amount))
            .collect()
    }

    #[test]
    fn test_max_merge_is_monotone_and_idempotent() {
        let mut local = balances(&[("A", 5.0)]);
        let remote = balances(&[("A", 7.0), ("B", 2.0)]);

        let conflicts = merge_balances(&mut local, &remote);
        assert_eq!(local, balances(&[("A", 7.0), ("B", 2.0)]));
        assert_eq!(
            conflicts,
            vec![BalanceConflict {
                account: Account::named("A"),
                local: 5.0,
                remote: 7.0,
                chosen: 7.0,
            }]
        );

        let again = merge_balances(&mut local, &remote);
        assert!(again.is_empty());
        assert_eq!(local, balances(&[("A", 7.0), ("B", 2.0)]));
    }

    #[test]
    fn test_lower_remote_keeps_local() {
        let mut local = balances(&[("system", 3.0)]);
        let conflicts = merge_balances(&mut local, &balances(&[("system", 1.0), ("x", f64::NAN)]));
        assert_eq!(local[&Account::System], 3.0);
        assert_eq!(conflicts[0].chosen, 3.0);
        assert!(!local.contains_key(&Account::named("x")));
    }

    #[test]
    fn test_reputation_counters_take_max() {
        let mut local = ReputationTable::new();
        local.insert("http://a".into(), Reputation { hits: 4, misses: 0 });
        let mut remote = ReputationTable::new();
        remote.insert("http://a".into(), Reputation { hits: 1, misses: 2 });
        remote.insert("http://b".into(), Reputation { hits: 1, misses: 0 });

        assert_eq!(merge_reputation(&mut local, &remote), 2);
        assert_eq!(local["http://a"], Reputation { hits: 4, misses: 2 });
        assert_eq!(merge_reputation(&mut local, &remote), 0);
    }
}
