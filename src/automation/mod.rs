pub mod remote;
pub mod simulated;

use crate::models::FailureReason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use remote::RemoteDriver;
pub use simulated::SimulatedDriver;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutomationError {
    #[error("timeout")]
    Timeout,
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("unexpected page: {0}")]
    UnexpectedPage(String),
}

impl AutomationError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AutomationError::Timeout => FailureReason::Timeout,
            AutomationError::ElementNotFound(_) => FailureReason::ElementNotFound,
            AutomationError::Network(_) => FailureReason::Network,
            AutomationError::LoginFailed(_) => FailureReason::LoginFailed,
            AutomationError::UnexpectedPage(_) => FailureReason::UnexpectedPage,
        }
    }

    /// A session that timed out mid-call or lost its transport is left in an
    /// unknown page state and must not go back to the pool.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            AutomationError::Timeout | AutomationError::Network(_)
        )
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    CheckIn,
    RedPackets,
    Activities,
    PublishForm,
    ListingDetail,
    OrderDetail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    Price,
    Category,
    Region,
    LogisticsCompany,
    LogisticsNumber,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    CheckIn,
    ClaimRedPacket,
    JoinActivity,
    Submit,
    Polish,
    Ship,
    ConfirmShip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    CheckedIn,
    RedPacketClaimed,
    ActivityJoined,
    PublishSuccess,
    ListingId,
    Polished,
    Shipped,
}

/// One page interaction. Steps name what to touch, never how to find it on
/// the page; selector knowledge lives behind the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        page: Page,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Fill {
        field: Field,
        value: String,
    },
    Click {
        control: Control,
    },
    WaitFor {
        marker: Marker,
    },
    Capture {
        marker: Marker,
    },
}

impl Step {
    pub fn navigate(page: Page) -> Self {
        Step::Navigate { page, target: None }
    }

    pub fn navigate_to(page: Page, target: impl Into<String>) -> Self {
        Step::Navigate {
            page,
            target: Some(target.into()),
        }
    }

    pub fn fill(field: Field, value: impl Into<String>) -> Self {
        Step::Fill {
            field,
            value: value.into(),
        }
    }

    pub fn click(control: Control) -> Self {
        Step::Click { control }
    }

    pub fn wait_for(marker: Marker) -> Self {
        Step::WaitFor { marker }
    }

    pub fn capture(marker: Marker) -> Self {
        Step::Capture { marker }
    }
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError>;
}

#[async_trait]
pub trait AutomationSession: Send {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), AutomationError>;

    /// Runs the steps in order and returns the text of every `Capture` step.
    async fn interact(&mut self, steps: &[Step]) -> Result<Vec<String>, AutomationError>;

    async fn close(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn steps_serialize_as_semantic_ops() {
        let steps = vec![
            Step::navigate_to(Page::OrderDetail, "XY-1"),
            Step::fill(Field::LogisticsNumber, "SF123"),
            Step::click(Control::ConfirmShip),
            Step::capture(Marker::ListingId),
        ];
        let value = serde_json::to_value(&steps).expect("serialize");
        assert_eq!(
            value,
            json!([
                {"op": "navigate", "page": "order_detail", "target": "XY-1"},
                {"op": "fill", "field": "logistics_number", "value": "SF123"},
                {"op": "click", "control": "confirm_ship"},
                {"op": "capture", "marker": "listing_id"},
            ])
        );
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "seller".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("seller"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn errors_map_to_reasons() {
        assert_eq!(AutomationError::Timeout.to_string(), "timeout");
        assert_eq!(
            AutomationError::ElementNotFound("submit".into()).reason(),
            FailureReason::ElementNotFound
        );
        assert!(AutomationError::Network("reset".into()).poisons_session());
        assert!(!AutomationError::LoginFailed("nope".into()).poisons_session());
    }
}
