use super::{
    AutomationDriver, AutomationError, AutomationSession, Control, Credentials, Marker, Step,
};
use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::time::Duration;
use tracing::debug;

/// In-process stand-in for a browser, used when no automation service is
/// configured. Each click or wait succeeds with `success_rate`.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    success_rate: f64,
    latency: Duration,
}

impl SimulatedDriver {
    pub fn new(success_rate: f64, latency: Duration) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            latency,
        }
    }
}

#[async_trait]
impl AutomationDriver for SimulatedDriver {
    async fn open_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError> {
        debug!(target = "fleet.sessions", "opening simulated session");
        Ok(Box::new(SimulatedSession {
            rng: SmallRng::from_rng(&mut rand::rng()),
            success_rate: self.success_rate,
            latency: self.latency,
            user: None,
        }))
    }
}

struct SimulatedSession {
    rng: SmallRng,
    success_rate: f64,
    latency: Duration,
    user: Option<String>,
}

impl SimulatedSession {
    async fn pause(&mut self) {
        if self.latency.is_zero() {
            return;
        }
        let jitter = self.rng.random_range(0..=self.latency.as_millis() as u64);
        tokio::time::sleep(self.latency / 2 + Duration::from_millis(jitter / 2)).await;
    }

    fn roll(&mut self) -> bool {
        self.rng.random_bool(self.success_rate)
    }
}

#[async_trait]
impl AutomationSession for SimulatedSession {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), AutomationError> {
        self.pause().await;
        if credentials.username.trim().is_empty() || credentials.password.is_empty() {
            self.user = None;
            return Err(AutomationError::LoginFailed(
                "account name or password missing".into(),
            ));
        }
        self.user = Some(credentials.username.clone());
        Ok(())
    }

    async fn interact(&mut self, steps: &[Step]) -> Result<Vec<String>, AutomationError> {
        if self.user.is_none() {
            return Err(AutomationError::UnexpectedPage("login page shown".into()));
        }
        let mut captures = Vec::new();
        for step in steps {
            self.pause().await;
            match step {
                Step::Click { control } => {
                    if !self.roll() {
                        return Err(AutomationError::ElementNotFound(
                            control_name(*control).into(),
                        ));
                    }
                }
                Step::WaitFor { .. } => {
                    if !self.roll() {
                        return Err(AutomationError::Timeout);
                    }
                }
                Step::Capture { marker } => {
                    let value = match marker {
                        Marker::ListingId => {
                            self.rng.random_range(600_000_000_000u64..700_000_000_000).to_string()
                        }
                        _ => String::new(),
                    };
                    captures.push(value);
                }
                Step::Navigate { .. } | Step::Fill { .. } => {}
            }
        }
        Ok(captures)
    }
}

fn control_name(control: Control) -> &'static str {
    match control {
        Control::CheckIn => "check-in button",
        Control::ClaimRedPacket => "red packet button",
        Control::JoinActivity => "activity button",
        Control::Submit => "submit button",
        Control::Polish => "polish button",
        Control::Ship => "ship button",
        Control::ConfirmShip => "confirm ship button",
    }
}
