// src/notification.rs
//! Notification delivery: drains the alarms topic, resolves the alarm's
//! action ids to notification-method documents, and dispatches each one
//! through the deliverer registered for its type.
//!
//! Deliverers are a plugin point: the registry maps a method-type string
//! to a boxed implementation, so deployments can register their own
//! channels next to the built-in EMAIL, WEBHOOK and PAGEDUTY ones.

use crate::bus::BusConsumer;
use crate::config::SmtpConfig;
use crate::error::{Result, VigilError};
use crate::store::{self, StoreClient};
use crate::types::{AlarmEvent, NotificationMethod};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const PAGERDUTY_ENDPOINT: &str =
    "https://events.pagerduty.com/generic/2010-04-15/create_event.json";

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, method: &NotificationMethod, event: &AlarmEvent) -> Result<()>;
}

/// SMTP delivery. The alarm event is sent verbatim as the mail body.
pub struct EmailDeliverer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailDeliverer {
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let builder = if cfg.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.smtp_host)
        };
        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();
        let from = cfg
            .username
            .parse()
            .map_err(|e| VigilError::Config(format!("bad smtp sender address: {}", e)))?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Deliverer for EmailDeliverer {
    async fn deliver(&self, method: &NotificationMethod, event: &AlarmEvent) -> Result<()> {
        let to: Mailbox = method
            .address
            .parse()
            .map_err(|e| VigilError::InvalidInput(format!("bad email address: {}", e)))?;
        let subject = format!(
            "Alarm from vigil: {} - {}",
            method.name, event.alarm_definition.description
        );
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(serde_json::to_string(event)?)
            .map_err(|e| VigilError::InvalidInput(format!("cannot build email: {}", e)))?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// POSTs the alarm event as JSON to the method address.
pub struct WebhookDeliverer {
    client: reqwest::Client,
}

impl WebhookDeliverer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookDeliverer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, method: &NotificationMethod, event: &AlarmEvent) -> Result<()> {
        self.client
            .post(&method.address)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Triggers a PagerDuty incident; the method address is the service key.
pub struct PagerDutyDeliverer {
    client: reqwest::Client,
    endpoint: String,
}

impl PagerDutyDeliverer {
    pub fn new() -> Self {
        Self::with_endpoint(PAGERDUTY_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for PagerDutyDeliverer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Deliverer for PagerDutyDeliverer {
    async fn deliver(&self, method: &NotificationMethod, event: &AlarmEvent) -> Result<()> {
        let body = serde_json::json!({
            "service_key": method.address,
            "event_type": "trigger",
            "description": format!(
                "{}: {}",
                event.alarm_definition.name, event.reason
            ),
            "details": event,
        });
        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Deliverers keyed by notification-method type string.
pub struct DelivererRegistry {
    deliverers: HashMap<String, Arc<dyn Deliverer>>,
}

impl DelivererRegistry {
    pub fn empty() -> Self {
        Self {
            deliverers: HashMap::new(),
        }
    }

    /// The built-in set: EMAIL, WEBHOOK and PAGEDUTY.
    pub fn standard(smtp: &SmtpConfig) -> Result<Self> {
        let mut registry = Self::empty();
        registry.register("EMAIL", Arc::new(EmailDeliverer::new(smtp)?));
        registry.register("WEBHOOK", Arc::new(WebhookDeliverer::new()));
        registry.register("PAGEDUTY", Arc::new(PagerDutyDeliverer::new()));
        Ok(registry)
    }

    pub fn register(&mut self, method_type: &str, deliverer: Arc<dyn Deliverer>) {
        self.deliverers.insert(method_type.to_string(), deliverer);
    }

    pub fn get(&self, method_type: &str) -> Option<&Arc<dyn Deliverer>> {
        self.deliverers.get(method_type)
    }
}

/// The alarms-topic consumer that turns alarm events into notifications.
pub struct NotificationEngine {
    bus: BusConsumer,
    store: StoreClient,
    registry: DelivererRegistry,
}

impl NotificationEngine {
    pub fn new(bus: BusConsumer, store: StoreClient, registry: DelivererRegistry) -> Self {
        Self {
            bus,
            store,
            registry,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("notification engine started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.bus.recv() => match received {
                    Ok(payload) => {
                        if let Err(e) = self.handle_alarm(&payload).await {
                            error!("alarm action failed: {}", e);
                        }
                        if let Err(e) = self.bus.commit().await {
                            warn!("offset commit failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("alarms receive failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        self.bus.close().await;
        info!("notification engine stopped");
    }

    async fn handle_alarm(&mut self, payload: &[u8]) -> Result<()> {
        let event: AlarmEvent = serde_json::from_slice(payload)
            .map_err(|e| VigilError::InvalidInput(format!("undecodable alarm event: {}", e)))?;
        debug!(
            "alarm event {} for definition '{}' state {}",
            event.id, event.alarm_definition.name, event.state
        );

        for action_id in event.alarm_definition.actions_for(event.state) {
            match self.fetch_method(action_id).await {
                Ok(method) => {
                    let type_name = match method.method_type {
                        crate::types::NotificationType::Email => "EMAIL",
                        crate::types::NotificationType::Pageduty => "PAGEDUTY",
                        crate::types::NotificationType::Webhook => "WEBHOOK",
                    };
                    match self.registry.get(type_name) {
                        Some(deliverer) => {
                            if let Err(e) = deliverer.deliver(&method, &event).await {
                                error!(
                                    "delivery via {} to '{}' failed: {}",
                                    type_name, method.address, e
                                );
                            }
                        }
                        None => warn!("no deliverer registered for {}", type_name),
                    }
                }
                Err(e) => error!("cannot resolve action {}: {}", action_id, e),
            }
        }
        Ok(())
    }

    async fn fetch_method(&mut self, action_id: &str) -> Result<NotificationMethod> {
        let (status, body) = self.store.get_by_id(action_id).await?;
        if !status.is_success() {
            return Err(VigilError::Store(format!(
                "notification method lookup returned {}",
                status
            )));
        }
        let source = store::first_source(&body)
            .ok_or_else(|| VigilError::NotFound(format!("notification method {}", action_id)))?;
        serde_json::from_value(source.clone())
            .map_err(|e| VigilError::InvalidInput(format!("bad notification method: {}", e)))
    }
}
