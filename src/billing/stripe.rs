use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, ExternalCustomer, ExternalPage,
    ExternalSubscription, ProviderError, METADATA_USER_ID,
};
use super::retry::{with_retry, RetryConfig};

/// Pinned so period fields stay on the subscription object.
pub const STRIPE_API_VERSION: &str = "2024-06-20";

/// key: billing-stripe-client -> processor REST adapter
#[derive(Clone)]
pub struct StripeClient {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl StripeClient {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build billing provider client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = request
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .header("Stripe-Version", STRIPE_API_VERSION)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, code) = match serde_json::from_str::<StripeErrorEnvelope>(&body) {
                Ok(envelope) => (
                    envelope
                        .error
                        .message
                        .unwrap_or_else(|| status.to_string()),
                    envelope.error.code,
                ),
                Err(_) => (status.to_string(), None),
            };
            error!(status = status.as_u16(), %message, "billing provider rejected request");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
                code,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
        limit: u32,
    ) -> Result<ExternalPage<ExternalSubscription>, ProviderError> {
        let url = self.endpoint("subscriptions");
        let url = url.as_str();
        let mut query = vec![
            ("limit", limit.to_string()),
            ("status", "all".to_string()),
            ("expand[]", "data.customer".to_string()),
        ];
        if let Some(cursor) = starting_after {
            query.push(("starting_after", cursor.to_string()));
        }
        let query = &query;
        debug!(?starting_after, limit, "listing billing subscriptions");
        with_retry(self.retry, "list_subscriptions", move || {
            self.send(self.client.get(url).query(query))
        })
        .await
    }

    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<ExternalCustomer>, ProviderError> {
        let page: ExternalPage<ExternalCustomer> = self
            .send(
                self.client
                    .get(self.endpoint("customers"))
                    .query(&[("email", email), ("limit", "1")]),
            )
            .await?;
        Ok(page.data.into_iter().find(|customer| !customer.deleted))
    }

    async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError> {
        let metadata_key = format!("metadata[{METADATA_USER_ID}]");
        let form = [("email", email), (metadata_key.as_str(), user_id)];
        self.send(self.client.post(self.endpoint("customers")).form(&form))
            .await
    }

    async fn tag_customer_user(
        &self,
        customer_id: &str,
        user_id: &str,
    ) -> Result<ExternalCustomer, ProviderError> {
        let metadata_key = format!("metadata[{METADATA_USER_ID}]");
        let form = [(metadata_key.as_str(), user_id)];
        self.send(
            self.client
                .post(self.endpoint(&format!("customers/{customer_id}")))
                .form(&form),
        )
        .await
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "subscription".into()),
            ("customer".into(), request.customer_id.clone()),
            ("client_reference_id".into(), request.user_id.clone()),
            ("line_items[0][price]".into(), request.price_id.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
            form.push((format!("subscription_data[metadata][{key}]"), value.clone()));
        }
        self.send(
            self.client
                .post(self.endpoint("checkout/sessions"))
                .form(&form),
        )
        .await
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<ExternalSubscription, ProviderError> {
        let flag = if cancel_at_period_end { "true" } else { "false" };
        self.send(
            self.client
                .post(self.endpoint(&format!("subscriptions/{subscription_id}")))
                .form(&[("cancel_at_period_end", flag)]),
        )
        .await
    }
}
