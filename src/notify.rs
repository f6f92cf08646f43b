//! Admin notifications.
//!
//! Registration requests and forgotten-password reports go to a staffed
//! chat channel over an incoming webhook carrying an Adaptive Card.
//! Delivery is synchronous with a short timeout: the user flows that send
//! these need to tell the user whether anyone was actually notified.

use std::time::Duration;

use serde_json::json;
use tracing::{error, info};

use crate::auth::directory::StaffRecord;
use crate::auth::error::AuthError;
use crate::auth::BoxFuture;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Notifier: Send + Sync {
    /// Announce that `staff` asked to register for `app_name`.
    fn registration_request<'a>(
        &'a self,
        staff: &'a StaffRecord,
        app_name: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>>;

    /// Announce that `staff` cannot log in and needs a password reset.
    fn forgot_password<'a>(&'a self, staff: &'a StaffRecord)
        -> BoxFuture<'a, Result<bool, AuthError>>;
}

/// Posts Adaptive Cards to an incoming-webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| AuthError::UpstreamUnavailable(format!("webhook client: {err}")))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    async fn post_card(&self, card: serde_json::Value) -> Result<bool, AuthError> {
        let body = json!({
            "type": "message",
            "attachments": [{
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": card,
            }],
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!("Webhook delivery failed: {err}");
                AuthError::UpstreamUnavailable(format!("webhook delivery: {err}"))
            })?;
        let delivered = response.status().is_success();
        if delivered {
            info!("Admin notification delivered");
        } else {
            error!(status = %response.status(), "Webhook rejected the notification");
        }
        Ok(delivered)
    }
}

/// Card body shared by both notification kinds.
pub(crate) fn adaptive_card(title: &str, facts: &[(&str, &str)]) -> serde_json::Value {
    json!({
        "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
        "type": "AdaptiveCard",
        "version": "1.4",
        "body": [
            {
                "type": "TextBlock",
                "size": "Medium",
                "weight": "Bolder",
                "text": title,
            },
            {
                "type": "FactSet",
                "facts": facts
                    .iter()
                    .map(|(name, value)| json!({"title": name, "value": value}))
                    .collect::<Vec<_>>(),
            },
        ],
    })
}

impl Notifier for WebhookNotifier {
    fn registration_request<'a>(
        &'a self,
        staff: &'a StaffRecord,
        app_name: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            let ext = staff.ext.clone().unwrap_or_default();
            let card = adaptive_card(
                "New registration request",
                &[
                    ("Staff", staff.name.as_str()),
                    ("ID", staff.employee_name.as_str()),
                    ("Department", staff.dept_code.as_str()),
                    ("Extension", ext.as_str()),
                    ("Application", app_name),
                ],
            );
            self.post_card(card).await
        })
    }

    fn forgot_password<'a>(
        &'a self,
        staff: &'a StaffRecord,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            let card = adaptive_card(
                "Password reset requested",
                &[
                    ("Staff", staff.name.as_str()),
                    ("ID", staff.employee_name.as_str()),
                    ("Department", staff.dept_code.as_str()),
                ],
            );
            self.post_card(card).await
        })
    }
}

/// Records calls instead of delivering. Test double.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub calls: std::sync::Mutex<Vec<String>>,
    /// When set, every call reports failed delivery.
    pub fail: bool,
}

impl Notifier for RecordingNotifier {
    fn registration_request<'a>(
        &'a self,
        staff: &'a StaffRecord,
        app_name: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("registration:{}:{app_name}", staff.employee_name));
            }
            Ok(!self.fail)
        })
    }

    fn forgot_password<'a>(
        &'a self,
        staff: &'a StaffRecord,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("forgot:{}", staff.employee_name));
            }
            Ok(!self.fail)
        })
    }
}
