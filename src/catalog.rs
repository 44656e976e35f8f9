//! Business records the job core reads and updates: marketplace accounts,
//! products awaiting publication, and buyer orders. Every lookup and write is
//! conditioned on the owner; another owner's record reads as missing.

use crate::automation::Credentials;
use crate::models::{Logistics, Region};
use crate::quota::QuotaState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
}

impl CatalogError {
    fn account(id: &str) -> Self {
        CatalogError::NotFound {
            kind: "account",
            id: id.to_string(),
        }
    }

    fn product(id: &str) -> Self {
        CatalogError::NotFound {
            kind: "product",
            id: id.to_string(),
        }
    }

    fn order(id: &str) -> Self {
        CatalogError::NotFound {
            kind: "order",
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
    pub status: AccountStatus,
    pub region: Region,
    #[serde(flatten)]
    pub quota: QuotaState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Active,
    Published,
    Failed,
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: String,
    pub owner: String,
    pub account_id: Option<String>,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub category: Option<String>,
    pub status: ProductStatus,
    pub listing_id: Option<String>,
    pub last_polished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn is_pending(&self) -> bool {
        self.status == ProductStatus::Active
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub owner: String,
    pub account_id: String,
    pub platform_order_id: String,
    pub shipped: bool,
    pub logistics: Option<Logistics>,
    pub shipped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum PublishRecord {
    Published { listing_id: String },
    Failed,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn account(&self, owner: &str, id: &str) -> Result<Account, CatalogError>;
    async fn accounts(&self, owner: &str) -> Vec<Account>;
    async fn product(&self, owner: &str, id: &str) -> Result<Product, CatalogError>;
    /// Pending products, oldest first.
    async fn pending_products(&self, owner: &str) -> Vec<Product>;
    async fn record_publish(
        &self,
        owner: &str,
        product_id: &str,
        record: PublishRecord,
    ) -> Result<(), CatalogError>;
    async fn mark_polished(&self, owner: &str, product_id: &str) -> Result<(), CatalogError>;
    async fn order(&self, owner: &str, id: &str) -> Result<Order, CatalogError>;
    async fn mark_shipped(
        &self,
        owner: &str,
        order_id: &str,
        logistics: Logistics,
    ) -> Result<(), CatalogError>;
    /// Adds `count` to both publish counters in one write.
    async fn add_published(
        &self,
        owner: &str,
        account_id: &str,
        count: u32,
    ) -> Result<QuotaState, CatalogError>;
    /// Zeroes today's counter on every account of `owner`; returns how many.
    async fn reset_today_published(&self, owner: &str) -> usize;
}

#[derive(Default)]
struct CatalogData {
    accounts: Vec<Account>,
    products: Vec<Product>,
    orders: Vec<Order>,
}

/// In-memory catalog seeded from YAML. Insertion order is preserved.
#[derive(Default)]
pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
}

impl MemoryCatalog {
    pub fn from_seed(seed: CatalogSeed, default_daily_limit: u32) -> Self {
        let now = Utc::now();
        let accounts = seed
            .accounts
            .into_iter()
            .map(|a| Account {
                id: a.id,
                owner: a.owner,
                name: a.name.unwrap_or_else(|| "unnamed account".into()),
                credentials: Credentials {
                    username: a.username,
                    password: a.password,
                },
                status: a.status,
                region: a.region,
                quota: QuotaState {
                    daily_limit: a.daily_limit.unwrap_or(default_daily_limit),
                    today_published: a.today_published,
                    total_published: a.total_published,
                },
            })
            .collect();
        let products = seed
            .products
            .into_iter()
            .map(|p| Product {
                id: p.id,
                owner: p.owner,
                account_id: p.account_id,
                title: p.title,
                description: p.description,
                price: p.price,
                category: p.category,
                status: p.status,
                listing_id: p.listing_id,
                last_polished_at: None,
                created_at: p.created_at.unwrap_or(now),
            })
            .collect();
        let orders = seed
            .orders
            .into_iter()
            .map(|o| Order {
                id: o.id,
                owner: o.owner,
                account_id: o.account_id,
                platform_order_id: o.platform_order_id,
                shipped: o.shipped,
                logistics: None,
                shipped_at: None,
            })
            .collect();
        Self {
            data: RwLock::new(CatalogData {
                accounts,
                products,
                orders,
            }),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn account(&self, owner: &str, id: &str) -> Result<Account, CatalogError> {
        let data = self.data.read().await;
        data.accounts
            .iter()
            .find(|a| a.id == id && a.owner == owner)
            .cloned()
            .ok_or_else(|| CatalogError::account(id))
    }

    async fn accounts(&self, owner: &str) -> Vec<Account> {
        let data = self.data.read().await;
        data.accounts
            .iter()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect()
    }

    async fn product(&self, owner: &str, id: &str) -> Result<Product, CatalogError> {
        let data = self.data.read().await;
        data.products
            .iter()
            .find(|p| p.id == id && p.owner == owner)
            .cloned()
            .ok_or_else(|| CatalogError::product(id))
    }

    async fn pending_products(&self, owner: &str) -> Vec<Product> {
        let data = self.data.read().await;
        let mut pending: Vec<Product> = data
            .products
            .iter()
            .filter(|p| p.owner == owner && p.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    async fn record_publish(
        &self,
        owner: &str,
        product_id: &str,
        record: PublishRecord,
    ) -> Result<(), CatalogError> {
        let mut data = self.data.write().await;
        let product = data
            .products
            .iter_mut()
            .find(|p| p.id == product_id && p.owner == owner)
            .ok_or_else(|| CatalogError::product(product_id))?;
        match record {
            PublishRecord::Published { listing_id } => {
                product.status = ProductStatus::Published;
                product.listing_id = Some(listing_id);
            }
            PublishRecord::Failed => product.status = ProductStatus::Failed,
        }
        Ok(())
    }

    async fn mark_polished(&self, owner: &str, product_id: &str) -> Result<(), CatalogError> {
        let mut data = self.data.write().await;
        let product = data
            .products
            .iter_mut()
            .find(|p| p.id == product_id && p.owner == owner)
            .ok_or_else(|| CatalogError::product(product_id))?;
        product.last_polished_at = Some(Utc::now());
        Ok(())
    }

    async fn order(&self, owner: &str, id: &str) -> Result<Order, CatalogError> {
        let data = self.data.read().await;
        data.orders
            .iter()
            .find(|o| o.id == id && o.owner == owner)
            .cloned()
            .ok_or_else(|| CatalogError::order(id))
    }

    async fn mark_shipped(
        &self,
        owner: &str,
        order_id: &str,
        logistics: Logistics,
    ) -> Result<(), CatalogError> {
        let mut data = self.data.write().await;
        let order = data
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.owner == owner)
            .ok_or_else(|| CatalogError::order(order_id))?;
        order.shipped = true;
        order.logistics = Some(logistics);
        order.shipped_at = Some(Utc::now());
        Ok(())
    }

    async fn add_published(
        &self,
        owner: &str,
        account_id: &str,
        count: u32,
    ) -> Result<QuotaState, CatalogError> {
        let mut data = self.data.write().await;
        let account = data
            .accounts
            .iter_mut()
            .find(|a| a.id == account_id && a.owner == owner)
            .ok_or_else(|| CatalogError::account(account_id))?;
        account.quota.today_published = account.quota.today_published.saturating_add(count);
        account.quota.total_published = account
            .quota
            .total_published
            .saturating_add(u64::from(count));
        Ok(account.quota)
    }

    async fn reset_today_published(&self, owner: &str) -> usize {
        let mut data = self.data.write().await;
        let mut reset = 0;
        for account in data.accounts.iter_mut().filter(|a| a.owner == owner) {
            account.quota.today_published = 0;
            reset += 1;
        }
        reset
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    #[serde(default)]
    pub products: Vec<ProductSeed>,
    #[serde(default)]
    pub orders: Vec<OrderSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSeed {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub name: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default)]
    pub today_published: u32,
    #[serde(default)]
    pub total_published: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductSeed {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: ProductStatus,
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSeed {
    pub id: String,
    pub owner: String,
    pub account_id: String,
    pub platform_order_id: String,
    #[serde(default)]
    pub shipped: bool,
}

impl CatalogSeed {
    pub fn from_yaml_str(raw: &str) -> eyre::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| eyre::eyre!("reading seed {}: {err}", path.display()))?;
        Self::from_yaml_str(&raw)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{account, product};
    use super::*;

    #[tokio::test]
    async fn foreign_records_read_as_missing() {
        let catalog = MemoryCatalog::from_seed(
            CatalogSeed {
                accounts: vec![account("a1", "alice", 0, 0)],
                products: vec![product("p1", "alice", "a1", 0)],
                orders: vec![],
            },
            20,
        );
        assert!(catalog.account("alice", "a1").await.is_ok());
        assert_eq!(
            catalog.account("bob", "a1").await.unwrap_err(),
            CatalogError::NotFound {
                kind: "account",
                id: "a1".into()
            }
        );
        assert!(catalog.product("bob", "p1").await.is_err());
        assert!(catalog.mark_polished("bob", "p1").await.is_err());
    }

    #[tokio::test]
    async fn pending_products_are_oldest_first() {
        let catalog = MemoryCatalog::from_seed(
            CatalogSeed {
                accounts: vec![account("a1", "alice", 0, 0)],
                products: vec![
                    product("late", "alice", "a1", 30),
                    product("early", "alice", "a1", 5),
                    product("middle", "alice", "a1", 10),
                ],
                orders: vec![],
            },
            20,
        );
        catalog
            .record_publish(
                "alice",
                "middle",
                PublishRecord::Published {
                    listing_id: "L1".into(),
                },
            )
            .await
            .expect("publish");
        let ids: Vec<String> = catalog
            .pending_products("alice")
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn seed_parses_from_yaml() {
        let raw = r#"
accounts:
  - id: a1
    owner: alice
    username: shop-a
    password: secret
    daily_limit: 15
products:
  - id: p1
    owner: alice
    account_id: a1
    title: Desk lamp
    price: 35.5
orders:
  - id: o1
    owner: alice
    account_id: a1
    platform_order_id: "2931"
"#;
        let seed = CatalogSeed::from_yaml_str(raw).expect("seed");
        assert_eq!(seed.accounts[0].daily_limit, Some(15));
        assert_eq!(seed.products[0].status, ProductStatus::Active);
        assert_eq!(seed.orders[0].platform_order_id, "2931");
        let catalog = MemoryCatalog::from_seed(seed, 20);
        let data = catalog.data.try_read().expect("uncontended");
        assert_eq!(data.accounts[0].quota.daily_limit, 15);
    }
}
