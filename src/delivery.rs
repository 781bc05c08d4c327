//! Delivery transport: sign, send and validate one notification exchange, with
//! bounded retries. A subscriber that never answers correctly is removed.

use crate::config;
use crate::model::{ChangeAction, ChangeRecord, Subscription};
use crate::payload::build_notification_body;
use crate::registry::{signature_matches, Registry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client, Url};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Request header carrying the origin site's canonical URL.
pub const ORIGIN_HEADER: &str = "X-Content-Notification";
/// Response header the subscriber echoes its signature in.
pub const SIGNATURE_HEADER: &str = "X-Subscription-Signature";

/// One outbound notification, open to customization before it is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub signature: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<TransportResponse>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(redirect_limit: usize, timeout: Duration) -> Result<Self> {
        let http = Self::client_builder(redirect_limit, timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::from_client(http))
    }

    /// Client settings shared by every transport: user agent, redirect cap
    /// and overall timeout.
    pub fn client_builder(redirect_limit: usize, timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .user_agent(concat!("content-hooks/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::limited(redirect_limit))
            .timeout(timeout)
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }

    pub fn from_config(cfg: &config::Delivery) -> Result<Self> {
        Self::new(cfg.redirect_limit, cfg.request_timeout())
    }

    pub fn build_request(&self, request: &NotificationRequest) -> Result<reqwest::Request> {
        let url = Url::parse(&request.url)
            .with_context(|| format!("invalid notification target {}", request.url))?;
        let mut builder = self
            .http
            .post(url)
            .timeout(request.timeout)
            .header("Content-Type", "application/json")
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.build().context("failed to build notification request")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &NotificationRequest) -> Result<TransportResponse> {
        let req = self.build_request(request)?;
        let res = self
            .http
            .execute(req)
            .await
            .with_context(|| format!("failed to reach {}", request.url))?;
        let signature = res
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(TransportResponse {
            status: res.status().as_u16(),
            signature,
        })
    }
}

/// What a policy decision is about.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext<'a> {
    pub subscription: &'a Subscription,
    pub record: &'a ChangeRecord,
    pub action: ChangeAction,
}

/// Overridable delivery behavior.
pub trait DeliveryPolicy: Send + Sync {
    fn max_tries(&self, ctx: &DeliveryContext<'_>) -> u32;

    fn valid_response_codes(&self, ctx: &DeliveryContext<'_>) -> Vec<u16>;

    /// Last chance to alter the request before it goes out.
    fn prepare_request(&self, _ctx: &DeliveryContext<'_>, _request: &mut NotificationRequest) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredPolicy {
    pub max_tries: u32,
    pub valid_response_codes: Vec<u16>,
}

impl ConfiguredPolicy {
    pub fn from_config(cfg: &config::Delivery) -> Self {
        Self {
            max_tries: cfg.max_tries,
            valid_response_codes: cfg.valid_response_codes.clone(),
        }
    }
}

impl Default for ConfiguredPolicy {
    fn default() -> Self {
        Self::from_config(&config::Delivery::default())
    }
}

impl DeliveryPolicy for ConfiguredPolicy {
    fn max_tries(&self, _ctx: &DeliveryContext<'_>) -> u32 {
        self.max_tries
    }

    fn valid_response_codes(&self, _ctx: &DeliveryContext<'_>) -> Vec<u16> {
        self.valid_response_codes.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub subscription_id: i64,
    pub target: String,
    pub content_id: i64,
    pub action: ChangeAction,
    pub attempts: u32,
}

/// Notified after each individual delivery settles.
pub trait DeliveryObserver: Send + Sync {
    fn delivered(&self, _event: &DeliveryEvent) {}

    fn failed(&self, _event: &DeliveryEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success { attempts: u32 },
    Failure { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

pub struct Notifier {
    transport: Arc<dyn Transport>,
    policy: Arc<dyn DeliveryPolicy>,
    observers: Vec<Arc<dyn DeliveryObserver>>,
    registry: Registry,
    origin: String,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: Arc<dyn DeliveryPolicy>,
        registry: Registry,
        origin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            observers: Vec::new(),
            registry,
            origin: origin.into(),
            timeout,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    fn base_request(
        &self,
        subscription: &Subscription,
        record: &ChangeRecord,
        action: ChangeAction,
    ) -> NotificationRequest {
        NotificationRequest {
            url: subscription.target.clone(),
            headers: vec![(ORIGIN_HEADER.to_string(), self.origin.clone())],
            body: build_notification_body(action, record),
            timeout: self.timeout,
        }
    }

    /// Deliver one change to one subscriber. On exhausting every attempt the
    /// subscription is deleted before observers hear about the failure.
    #[instrument(
        skip_all,
        fields(
            subscription_id = subscription.id,
            content_id = record.content_id(),
            action = %action
        )
    )]
    pub async fn deliver(
        &self,
        subscription: &Subscription,
        record: &ChangeRecord,
        action: ChangeAction,
    ) -> Result<DeliveryOutcome> {
        let ctx = DeliveryContext {
            subscription,
            record,
            action,
        };
        let max_tries = self.policy.max_tries(&ctx).max(1);
        let valid_codes = self.policy.valid_response_codes(&ctx);
        let mut request = self.base_request(subscription, record, action);
        self.policy.prepare_request(&ctx, &mut request);

        let mut attempts = 0;
        let mut accepted = false;
        while attempts < max_tries {
            attempts += 1;
            match self.transport.send(&request).await {
                Ok(res) => {
                    let code_ok = valid_codes.contains(&res.status);
                    let signature_ok = res
                        .signature
                        .as_deref()
                        .filter(|s| !s.is_empty())
                        .is_some_and(|s| signature_matches(&subscription.signature_digest, s));
                    if code_ok && signature_ok {
                        accepted = true;
                        break;
                    }
                    warn!(
                        attempt = attempts,
                        status = res.status,
                        code_ok,
                        signature_ok,
                        "notification rejected"
                    );
                }
                Err(err) => {
                    warn!(?err, attempt = attempts, "notification request failed");
                }
            }
        }

        let event = DeliveryEvent {
            subscription_id: subscription.id,
            target: subscription.target.clone(),
            content_id: record.content_id(),
            action,
            attempts,
        };

        if accepted {
            info!(attempts, target = %subscription.target, "notification delivered");
            for observer in &self.observers {
                observer.delivered(&event);
            }
            return Ok(DeliveryOutcome::Success { attempts });
        }

        self.registry
            .delete(subscription.id)
            .await
            .context("failed to remove unreachable subscription")?;
        warn!(attempts, target = %subscription.target, "notification failed; subscription removed");
        for observer in &self.observers {
            observer.failed(&event);
        }
        Ok(DeliveryOutcome::Failure { attempts })
    }
}
