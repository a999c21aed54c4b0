use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::CorrelationId;

/// Provider authorization parameters for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthParams {
    /// Authorization by a token obtained out of band.
    Token(String),
    /// Authorization by user and originating IP address.
    UserAndIp { user: String, ip: String },
}

/// Upstream market data request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub securities: Vec<String>,
    pub fields: Vec<String>,
}

/// Asynchronous interface to the provider session.
///
/// Every call is fire-and-forget: completions, failures, and revocations are
/// delivered later on the event stream, keyed by the correlation token passed
/// here.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn request_authorization(
        &self,
        user_id: &str,
        params: &AuthParams,
        token: CorrelationId,
    ) -> Result<()>;

    async fn send_data_request(&self, request: &DataRequest, token: CorrelationId) -> Result<()>;

    async fn open_service(&self, service: &str) -> Result<()>;

    async fn cancel(&self, tokens: &[CorrelationId]) -> Result<()>;
}
