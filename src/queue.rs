use crate::catalog::{AccountStatus, Catalog};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueuedProduct {
    pub id: String,
    pub title: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueEntry {
    pub account_id: String,
    pub account_name: String,
    pub remaining: u32,
    pub products: Vec<QueuedProduct>,
}

/// Derives the publish plan for `owner`: every active account with spare
/// quota, paired with its own pending products oldest first, truncated to the
/// remaining capacity. Reads only.
pub async fn build_queue(catalog: &dyn Catalog, owner: &str) -> Vec<QueueEntry> {
    let accounts = catalog.accounts(owner).await;
    let pending = catalog.pending_products(owner).await;

    accounts
        .into_iter()
        .filter(|account| account.status == AccountStatus::Active)
        .filter_map(|account| {
            let remaining = account.quota.remaining();
            if remaining == 0 {
                return None;
            }
            let products = pending
                .iter()
                .filter(|p| p.account_id.as_deref() == Some(account.id.as_str()))
                .take(remaining as usize)
                .map(|p| QueuedProduct {
                    id: p.id.clone(),
                    title: p.title.clone(),
                    price: p.price,
                    created_at: p.created_at,
                })
                .collect();
            Some(QueueEntry {
                account_id: account.id,
                account_name: account.name,
                remaining,
                products,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{account, product};
    use crate::catalog::{CatalogSeed, MemoryCatalog};

    fn catalog() -> MemoryCatalog {
        let mut near_full = account("a2", "alice", 18, 18);
        near_full.daily_limit = Some(20);
        let mut inactive = account("a4", "alice", 0, 0);
        inactive.status = AccountStatus::Inactive;
        MemoryCatalog::from_seed(
            CatalogSeed {
                accounts: vec![
                    account("a1", "alice", 20, 20),
                    near_full,
                    account("a3", "alice", 0, 0),
                    inactive,
                ],
                products: vec![
                    product("p-a1", "alice", "a1", 1),
                    product("p3", "alice", "a2", 30),
                    product("p1", "alice", "a2", 10),
                    product("p2", "alice", "a2", 20),
                    product("p-a4", "alice", "a4", 1),
                    product("bob-p", "bob", "a3", 1),
                ],
                orders: vec![],
            },
            20,
        )
    }

    #[tokio::test]
    async fn exhausted_accounts_are_excluded() {
        let queue = build_queue(&catalog(), "alice").await;
        let ids: Vec<&str> = queue.iter().map(|e| e.account_id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a3"]);
        assert!(queue.iter().all(|e| e.remaining > 0));
    }

    #[tokio::test]
    async fn assignment_respects_capacity_and_creation_order() {
        let queue = build_queue(&catalog(), "alice").await;
        let a2 = &queue[0];
        assert_eq!(a2.remaining, 2);
        let ids: Vec<&str> = a2.products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert!(queue[1].products.is_empty());
        for entry in &queue {
            assert!(entry.products.len() <= entry.remaining as usize);
        }
    }

    #[tokio::test]
    async fn rebuilding_without_changes_is_idempotent() {
        let catalog = catalog();
        let first = build_queue(&catalog, "alice").await;
        let second = build_queue(&catalog, "alice").await;
        assert_eq!(first, second);
    }
}
