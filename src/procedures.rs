//! Per-item automation procedures. Each one resolves the business records it
//! needs, drives one leased session through a fixed step sequence and writes
//! the outcome back to the catalog. Failures are returned as tagged item
//! results; nothing here aborts a batch.

use crate::automation::{AutomationError, Control, Field, Marker, Page, Step};
use crate::catalog::{
    Account, Catalog, CatalogError, Order, Product, ProductStatus, PublishRecord,
};
use crate::models::{FailureReason, ItemResult, Logistics, Region, StepReport};
use crate::quota::QuotaTracker;
use crate::session::{SessionLease, SessionPool};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{debug, warn};

const PUBLISH_REGIONS: [Region; 5] = [
    Region::Beijing,
    Region::Shanghai,
    Region::Guangzhou,
    Region::Shenzhen,
    Region::Hangzhou,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl ItemFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<AutomationError> for ItemFailure {
    fn from(err: AutomationError) -> Self {
        Self::new(err.reason(), err.to_string())
    }
}

impl From<CatalogError> for ItemFailure {
    fn from(err: CatalogError) -> Self {
        Self::new(FailureReason::NotFound, err.to_string())
    }
}

struct Done {
    message: &'static str,
    derived_id: Option<String>,
}

impl Done {
    fn new(message: &'static str) -> Self {
        Self {
            message,
            derived_id: None,
        }
    }
}

fn finish(item_id: &str, outcome: Result<Done, ItemFailure>) -> ItemResult {
    match outcome {
        Ok(done) => ItemResult::succeeded(item_id, done.message, done.derived_id),
        Err(failure) => {
            debug!(target = "fleet.jobs", item = %item_id, reason = %failure.reason, "item_failed");
            ItemResult::failed(item_id, failure.reason, failure.message)
        }
    }
}

#[derive(Clone)]
pub struct Procedures {
    catalog: Arc<dyn Catalog>,
    quota: QuotaTracker,
    sessions: SessionPool,
}

impl Procedures {
    pub fn new(catalog: Arc<dyn Catalog>, quota: QuotaTracker, sessions: SessionPool) -> Self {
        Self {
            catalog,
            quota,
            sessions,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Sign-in, red packets and activities for one account. Every routine is
    /// attempted and reported; the item succeeds only if all of them do.
    pub async fn daily_tasks(&self, account: &Account) -> ItemResult {
        let mut lease = match self.login(account).await {
            Ok(lease) => lease,
            Err(failure) => return finish(&account.id, Err(failure)),
        };

        let mut reports = Vec::with_capacity(3);
        let mut first_failure: Option<ItemFailure> = None;
        for (name, steps) in daily_routines() {
            match lease.interact(&steps).await {
                Ok(_) => reports.push(StepReport::new(name, true, "done")),
                Err(err) => {
                    reports.push(StepReport::new(name, false, err.to_string()));
                    first_failure.get_or_insert_with(|| err.into());
                    if lease.is_poisoned() {
                        break;
                    }
                }
            }
        }

        let outcome = match first_failure {
            None => Ok(Done::new("daily tasks finished")),
            Some(failure) => Err(failure),
        };
        finish(&account.id, outcome).with_steps(reports)
    }

    pub async fn polish(&self, owner: &str, product_id: &str) -> ItemResult {
        finish(product_id, self.try_polish(owner, product_id).await)
    }

    async fn try_polish(&self, owner: &str, product_id: &str) -> Result<Done, ItemFailure> {
        let product = self.catalog.product(owner, product_id).await?;
        let account = self.product_account(owner, &product, None).await?;
        let mut lease = self.login(&account).await?;
        lease.interact(&polish_steps(&product)).await?;
        self.catalog.mark_polished(owner, product_id).await?;
        Ok(Done::new("polished"))
    }

    pub async fn publish(
        &self,
        owner: &str,
        product_id: &str,
        account_id: Option<&str>,
        region: Region,
    ) -> ItemResult {
        finish(
            product_id,
            self.try_publish(owner, product_id, account_id, region).await,
        )
    }

    async fn try_publish(
        &self,
        owner: &str,
        product_id: &str,
        account_id: Option<&str>,
        region: Region,
    ) -> Result<Done, ItemFailure> {
        let product = self.catalog.product(owner, product_id).await?;
        if product.status == ProductStatus::Published {
            return Err(ItemFailure::new(
                FailureReason::AlreadyPublished,
                format!(
                    "product `{product_id}` is already listed as `{}`",
                    product.listing_id.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        let account = self.product_account(owner, &product, account_id).await?;
        if self.quota.remaining(owner, &account.id).await? == 0 {
            return Err(ItemFailure::new(
                FailureReason::QuotaExhausted,
                format!(
                    "account `{}` reached its daily limit of {}",
                    account.id, account.quota.daily_limit
                ),
            ));
        }

        let listing_id = match self.submit_listing(&account, &product, region).await {
            Ok(listing_id) => listing_id,
            Err(failure) => {
                if let Err(err) = self
                    .catalog
                    .record_publish(owner, product_id, PublishRecord::Failed)
                    .await
                {
                    warn!(target = "fleet.jobs", product = %product_id, error = %err, "mark_failed_skipped");
                }
                return Err(failure);
            }
        };

        self.catalog
            .record_publish(
                owner,
                product_id,
                PublishRecord::Published {
                    listing_id: listing_id.clone(),
                },
            )
            .await?;
        self.quota.increment(owner, &account.id, 1).await?;
        Ok(Done {
            message: "published",
            derived_id: Some(listing_id),
        })
    }

    async fn submit_listing(
        &self,
        account: &Account,
        product: &Product,
        region: Region,
    ) -> Result<String, ItemFailure> {
        let mut lease = self.login(account).await?;
        let captures = lease
            .interact(&publish_steps(product, pick_region(region)))
            .await?;
        captures.into_iter().next().ok_or_else(|| {
            ItemFailure::new(
                FailureReason::UnexpectedPage,
                "publish confirmed without a listing id",
            )
        })
    }

    pub async fn ship(&self, owner: &str, order_id: &str, logistics: &Logistics) -> ItemResult {
        finish(order_id, self.try_ship(owner, order_id, logistics).await)
    }

    async fn try_ship(
        &self,
        owner: &str,
        order_id: &str,
        logistics: &Logistics,
    ) -> Result<Done, ItemFailure> {
        let order = self.catalog.order(owner, order_id).await?;
        let account = self.catalog.account(owner, &order.account_id).await?;
        let mut lease = self.login(&account).await?;
        lease.interact(&ship_steps(&order, logistics)).await?;
        self.catalog
            .mark_shipped(owner, order_id, logistics.clone())
            .await?;
        Ok(Done::new("shipped"))
    }

    async fn product_account(
        &self,
        owner: &str,
        product: &Product,
        preferred: Option<&str>,
    ) -> Result<Account, ItemFailure> {
        let account_id = preferred
            .or(product.account_id.as_deref())
            .ok_or_else(|| {
                ItemFailure::new(
                    FailureReason::NotFound,
                    format!("product `{}` has no account", product.id),
                )
            })?;
        Ok(self.catalog.account(owner, account_id).await?)
    }

    async fn login(&self, account: &Account) -> Result<SessionLease, ItemFailure> {
        let mut lease = self.sessions.acquire().await?;
        lease.login(&account.credentials).await?;
        Ok(lease)
    }
}

fn pick_region(region: Region) -> Region {
    match region {
        Region::Random => PUBLISH_REGIONS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(Region::Beijing),
        fixed => fixed,
    }
}

fn daily_routines() -> [(&'static str, Vec<Step>); 3] {
    [
        (
            "sign_in",
            vec![
                Step::navigate(Page::CheckIn),
                Step::click(Control::CheckIn),
                Step::wait_for(Marker::CheckedIn),
            ],
        ),
        (
            "red_packets",
            vec![
                Step::navigate(Page::RedPackets),
                Step::click(Control::ClaimRedPacket),
                Step::wait_for(Marker::RedPacketClaimed),
            ],
        ),
        (
            "activities",
            vec![
                Step::navigate(Page::Activities),
                Step::click(Control::JoinActivity),
                Step::wait_for(Marker::ActivityJoined),
            ],
        ),
    ]
}

fn publish_steps(product: &Product, region: Region) -> Vec<Step> {
    let mut steps = vec![
        Step::navigate(Page::PublishForm),
        Step::fill(Field::Title, &product.title),
        Step::fill(Field::Description, &product.description),
        Step::fill(Field::Price, format!("{:.2}", product.price)),
    ];
    if let Some(category) = &product.category {
        steps.push(Step::fill(Field::Category, category));
    }
    steps.extend([
        Step::fill(Field::Region, region.label()),
        Step::click(Control::Submit),
        Step::wait_for(Marker::PublishSuccess),
        Step::capture(Marker::ListingId),
    ]);
    steps
}

fn polish_steps(product: &Product) -> Vec<Step> {
    let target = product.listing_id.as_deref().unwrap_or(&product.id);
    vec![
        Step::navigate_to(Page::ListingDetail, target),
        Step::click(Control::Polish),
        Step::wait_for(Marker::Polished),
    ]
}

fn ship_steps(order: &Order, logistics: &Logistics) -> Vec<Step> {
    vec![
        Step::navigate_to(Page::OrderDetail, &order.platform_order_id),
        Step::click(Control::Ship),
        Step::fill(Field::LogisticsCompany, &logistics.company),
        Step::fill(Field::LogisticsNumber, &logistics.number),
        Step::click(Control::ConfirmShip),
        Step::wait_for(Marker::Shipped),
    ]
}


#[cfg(test)]
mod tests {
    use super::testing::procedures;
    use super::*;
    use crate::automation::testing::ScriptedDriver;
    use crate::catalog::fixtures::{account, order, product};
    use crate::catalog::CatalogSeed;

    fn seed() -> CatalogSeed {
        let mut locked = account("a2", "alice", 0, 0);
        locked.password = "wrong".into();
        CatalogSeed {
            accounts: vec![
                account("a1", "alice", 3, 30),
                locked,
                account("full", "alice", 20, 20),
            ],
            products: vec![
                product("p1", "alice", "a1", 1),
                product("p2", "alice", "full", 2),
                product("p3", "alice", "a2", 3),
            ],
            orders: vec![order("o1", "alice", "a1")],
        }
    }

    #[tokio::test]
    async fn publish_captures_listing_and_bumps_quota() {
        let (procedures, catalog) = procedures(ScriptedDriver::new(), seed());
        let result = procedures
            .publish("alice", "p1", None, Region::Hangzhou)
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.message(), "published");

        let product = catalog.product("alice", "p1").await.expect("product");
        assert_eq!(product.status, ProductStatus::Published);
        assert_eq!(product.listing_id.as_deref(), Some("listing-1"));
        let quota = catalog.account("alice", "a1").await.expect("account").quota;
        assert_eq!((quota.today_published, quota.total_published), (4, 31));
    }

    #[tokio::test]
    async fn publish_on_exhausted_account_never_opens_a_session() {
        let driver = ScriptedDriver::new();
        let (procedures, catalog) = procedures(driver.clone(), seed());
        let result = procedures.publish("alice", "p2", None, Region::Random).await;
        assert_eq!(result.failure_reason(), Some(FailureReason::QuotaExhausted));
        assert_eq!(driver.opened(), 0);
        let product = catalog.product("alice", "p2").await.expect("product");
        assert!(product.is_pending());
    }

    #[tokio::test]
    async fn published_product_is_not_listed_twice() {
        let driver = ScriptedDriver::new();
        let (procedures, catalog) = procedures(driver.clone(), seed());
        let first = procedures.publish("alice", "p1", None, Region::Random).await;
        assert!(first.success, "{first:?}");
        let opened = driver.opened();

        let second = procedures.publish("alice", "p1", None, Region::Random).await;
        assert_eq!(second.failure_reason(), Some(FailureReason::AlreadyPublished));
        assert!(!second.failure_reason().is_some_and(FailureReason::is_retryable));
        assert_eq!(driver.opened(), opened);

        let product = catalog.product("alice", "p1").await.expect("product");
        assert_eq!(product.status, ProductStatus::Published);
        assert_eq!(product.listing_id.as_deref(), Some("listing-1"));
        let quota = catalog.account("alice", "a1").await.expect("account").quota;
        assert_eq!((quota.today_published, quota.total_published), (4, 31));
    }

    #[tokio::test]
    async fn failed_product_can_be_published_again() {
        let driver = ScriptedDriver::new().fail_times(
            "p1",
            AutomationError::ElementNotFound("submit".into()),
            1,
        );
        let (procedures, catalog) = procedures(driver, seed());
        let first = procedures.publish("alice", "p1", None, Region::Random).await;
        assert_eq!(first.failure_reason(), Some(FailureReason::ElementNotFound));

        let second = procedures.publish("alice", "p1", None, Region::Random).await;
        assert!(second.success, "{second:?}");
        let product = catalog.product("alice", "p1").await.expect("product");
        assert_eq!(product.status, ProductStatus::Published);
    }

    #[tokio::test]
    async fn failed_publish_marks_product_failed() {
        let driver = ScriptedDriver::new()
            .fail_on("p1", AutomationError::ElementNotFound("submit".into()));
        let (procedures, catalog) = procedures(driver, seed());
        let result = procedures.publish("alice", "p1", None, Region::Random).await;
        assert_eq!(result.failure_reason(), Some(FailureReason::ElementNotFound));
        let product = catalog.product("alice", "p1").await.expect("product");
        assert_eq!(product.status, ProductStatus::Failed);
        let quota = catalog.account("alice", "a1").await.expect("account").quota;
        assert_eq!(quota.today_published, 3);
    }

    #[tokio::test]
    async fn publish_account_override_must_belong_to_owner() {
        let (procedures, _) = procedures(ScriptedDriver::new(), seed());
        let result = procedures
            .publish("alice", "p1", Some("elsewhere"), Region::Random)
            .await;
        assert_eq!(result.failure_reason(), Some(FailureReason::NotFound));
    }

    #[tokio::test]
    async fn daily_tasks_reports_each_routine() {
        let (procedures, catalog) = procedures(ScriptedDriver::new(), seed());
        let account = catalog.account("alice", "a1").await.expect("account");
        let result = procedures.daily_tasks(&account).await;
        assert!(result.success);
        let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sign_in", "red_packets", "activities"]);
        assert!(result.steps.iter().all(|s| s.success));
    }

    #[tokio::test]
    async fn bad_credentials_fail_the_item_only() {
        let (procedures, catalog) = procedures(ScriptedDriver::new(), seed());
        let account = catalog.account("alice", "a2").await.expect("account");
        let result = procedures.daily_tasks(&account).await;
        assert_eq!(result.failure_reason(), Some(FailureReason::LoginFailed));
        assert!(result.steps.is_empty());

        let polished = procedures.polish("alice", "p3").await;
        assert_eq!(polished.failure_reason(), Some(FailureReason::LoginFailed));
    }

    #[tokio::test]
    async fn polish_stamps_product_and_rejects_foreign_ids() {
        let (procedures, catalog) = procedures(ScriptedDriver::new(), seed());
        assert!(procedures.polish("alice", "p1").await.success);
        let product = catalog.product("alice", "p1").await.expect("product");
        assert!(product.last_polished_at.is_some());

        let foreign = procedures.polish("bob", "p1").await;
        assert_eq!(foreign.failure_reason(), Some(FailureReason::NotFound));
    }

    #[tokio::test]
    async fn ship_records_logistics() {
        let (procedures, catalog) = procedures(ScriptedDriver::new(), seed());
        let logistics = Logistics {
            company: "SF Express".into(),
            number: "SF100200".into(),
        };
        let result = procedures.ship("alice", "o1", &logistics).await;
        assert!(result.success);
        let order = catalog.order("alice", "o1").await.expect("order");
        assert!(order.shipped);
        assert_eq!(order.logistics, Some(logistics));
        assert!(order.shipped_at.is_some());
    }

    #[test]
    fn publish_steps_end_with_listing_capture() {
        let product = Product {
            id: "p9".into(),
            owner: "alice".into(),
            account_id: None,
            title: "Desk lamp".into(),
            description: "Warm light".into(),
            price: 35.5,
            category: Some("home".into()),
            status: ProductStatus::Active,
            listing_id: None,
            last_polished_at: None,
            created_at: chrono::Utc::now(),
        };
        let steps = publish_steps(&product, Region::Shanghai);
        assert_eq!(steps.first(), Some(&Step::navigate(Page::PublishForm)));
        assert!(steps.contains(&Step::fill(Field::Price, "35.50")));
        assert!(steps.contains(&Step::fill(Field::Region, "上海")));
        assert_eq!(steps.last(), Some(&Step::capture(Marker::ListingId)));
        assert_ne!(pick_region(Region::Random), Region::Random);
    }
}
