use crate::catalog::{Catalog, CatalogError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Per-account publish counters, embedded in the account record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaState {
    pub daily_limit: u32,
    pub today_published: u32,
    pub total_published: u64,
}

impl QuotaState {
    pub fn remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.today_published)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub account_id: String,
    pub account_name: String,
    pub daily_limit: u32,
    pub today_published: u32,
    pub total_published: u64,
    pub remaining: u32,
}

#[derive(Clone)]
pub struct QuotaTracker {
    catalog: Arc<dyn Catalog>,
}

impl QuotaTracker {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn remaining(&self, owner: &str, account_id: &str) -> Result<u32, CatalogError> {
        let account = self.catalog.account(owner, account_id).await?;
        Ok(account.quota.remaining())
    }

    pub async fn increment(
        &self,
        owner: &str,
        account_id: &str,
        count: u32,
    ) -> Result<QuotaSnapshot, CatalogError> {
        let account = self.catalog.account(owner, account_id).await?;
        let quota = self.catalog.add_published(owner, account_id, count).await?;
        Ok(QuotaSnapshot {
            account_id: account.id,
            account_name: account.name,
            daily_limit: quota.daily_limit,
            today_published: quota.today_published,
            total_published: quota.total_published,
            remaining: quota.remaining(),
        })
    }

    pub async fn reset_all(&self, owner: &str) -> usize {
        let reset = self.catalog.reset_today_published(owner).await;
        info!(target = "fleet.quota", owner = %owner, reset, "daily publish counters reset");
        reset
    }

    pub async fn snapshots(&self, owner: &str) -> Vec<QuotaSnapshot> {
        self.catalog
            .accounts(owner)
            .await
            .into_iter()
            .map(|account| QuotaSnapshot {
                remaining: account.quota.remaining(),
                daily_limit: account.quota.daily_limit,
                today_published: account.quota.today_published,
                total_published: account.quota.total_published,
                account_id: account.id,
                account_name: account.name,
            })
            .collect()
    }
}
