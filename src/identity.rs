// Identity/subscription API client.
//
// The gateway consumes exactly two operations from the upstream identity
// service: check one access token (returns subscription state or an error)
// and list all subscriptions with their tokens (used by background sync).
// The wire protocol is a GraphQL-style JSON POST; the trait seam keeps the
// actor source testable against in-process fakes.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Rate limit as reported by the identity service.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub limit: i64,
    pub interval_seconds: u64,
}

/// Gateway entitlement attached to a subscription.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAccess {
    #[serde(default)]
    pub enabled: bool,
    /// Null when access was never granted.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
}

/// Subscription state for one access token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    pub id: String,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub gateway_access: GatewayAccess,
}

/// One subscription plus every token that maps to it (bulk listing).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    #[serde(flatten)]
    pub state: SubscriptionState,
    #[serde(default)]
    pub access_tokens: Vec<String>,
}

/// The two identity-service operations the gateway depends on.
#[async_trait]
pub trait SubscriptionsClient: Send + Sync {
    /// Validate one token and return its subscription state.
    async fn check_access_token(&self, token: &str) -> Result<SubscriptionState>;

    /// List every subscription with its access tokens.
    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>>;
}

const CHECK_ACCESS_TOKEN_QUERY: &str = r#"
query CheckAccessToken($token: String!) {
    subscriptionByAccessToken(accessToken: $token) {
        id
        isArchived
        gatewayAccess {
            enabled
            rateLimit {
                limit
                intervalSeconds
            }
        }
    }
}"#;

const LIST_SUBSCRIPTIONS_QUERY: &str = r#"
query ListSubscriptions {
    subscriptions {
        nodes {
            id
            isArchived
            accessTokens
            gatewayAccess {
                enabled
                rateLimit {
                    limit
                    intervalSeconds
                }
            }
        }
    }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckAccessTokenData {
    subscription_by_access_token: Option<SubscriptionState>,
}

#[derive(Debug, Deserialize)]
struct ListSubscriptionsData {
    subscriptions: SubscriptionConnection,
}

#[derive(Debug, Deserialize)]
struct SubscriptionConnection {
    #[serde(default)]
    nodes: Vec<SubscriptionRecord>,
}

/// HTTP implementation against the identity service's GraphQL endpoint.
pub struct HttpSubscriptionsClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl HttpSubscriptionsClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            auth_token: auth_token.into(),
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("token {}", self.auth_token))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("sending identity service request")?;

        let status = response.status();
        if !status.is_success() {
            bail!("identity service returned {status}");
        }

        let envelope: GraphQlResponse<T> = response
            .json()
            .await
            .context("decoding identity service response")?;

        if let Some(err) = envelope.errors.first() {
            bail!("identity service error: {}", err.message);
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("identity service response had no data"))
    }
}

#[async_trait]
impl SubscriptionsClient for HttpSubscriptionsClient {
    async fn check_access_token(&self, token: &str) -> Result<SubscriptionState> {
        let data: CheckAccessTokenData = self
            .query(CHECK_ACCESS_TOKEN_QUERY, json!({ "token": token }))
            .await?;
        data.subscription_by_access_token
            .ok_or_else(|| anyhow!("access token denied"))
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>> {
        let data: ListSubscriptionsData = self
            .query(LIST_SUBSCRIPTIONS_QUERY, json!({}))
            .await?;
        Ok(data.subscriptions.nodes)
    }
}
