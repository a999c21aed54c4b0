use anyhow::Context;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::event::CorrelationId;
use crate::transport::{DataRequest, ProviderTransport};


#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The logical operation already has its request out (or queued); serve
    /// late identities from the cache instead.
    #[error("data request already issued with token {0}")]
    AlreadyIssued(CorrelationId),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Issues the upstream data request exactly once, after the required
/// services are open.
///
/// How many identities are authorized — and when — is irrelevant here:
/// identities that authorize after the request went out are served purely
/// from the response cache.
pub struct RequestOrchestrator {
    transport: Arc<dyn ProviderTransport>,
    required: Vec<String>,
    opened: HashSet<String>,
    queued: Option<(DataRequest, CorrelationId)>,
    issued: Option<CorrelationId>,
}

impl RequestOrchestrator {
    pub fn new(transport: Arc<dyn ProviderTransport>, required_services: Vec<String>) -> Self {
        Self {
            transport,
            required: required_services,
            opened: HashSet::new(),
            queued: None,
            issued: None,
        }
    }

    /// Ask the transport to open every required service. Completions arrive
    /// as service status events.
    pub async fn open_required_services(&self) -> anyhow::Result<()> {
        for service in &self.required {
            self.transport
                .open_service(service)
                .await
                .with_context(|| format!("failed to open service '{}'", service))?;
            info!(service, "Service open requested");
        }
        Ok(())
    }

    pub fn all_open(&self) -> bool {
        self.required.iter().all(|s| self.opened.contains(s))
    }

    /// The token of the issued or queued request, if any.
    pub fn current_token(&self) -> Option<CorrelationId> {
        self.issued.or(self.queued.as_ref().map(|(_, token)| *token))
    }

    /// Record a service as open; issues the queued request once the last
    /// required service opens. Returns the token when that happens.
    pub async fn service_opened(&mut self, service: &str) -> anyhow::Result<Option<CorrelationId>> {
        self.opened.insert(service.to_string());
        if !self.all_open() {
            return Ok(None);
        }

        match self.queued.take() {
            Some((request, token)) => {
                self.transport
                    .send_data_request(&request, token)
                    .await
                    .context("failed to issue queued data request")?;
                self.issued = Some(token);
                info!(%token, securities = request.securities.len(), "Queued data request issued");
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub fn service_failed(&mut self, service: &str, reason: &str) {
        warn!(service, reason, "Service failed to open");
        self.opened.remove(service);
    }

    /// Issue the logical data request. Sent immediately when every required
    /// service is open, otherwise queued until the last one opens. Exactly
    /// once: a second call is rejected with the original token.
    pub async fn send_data_request(
        &mut self,
        request: DataRequest,
    ) -> Result<CorrelationId, OrchestratorError> {
        if let Some(token) = self.current_token() {
            return Err(OrchestratorError::AlreadyIssued(token));
        }

        let token = CorrelationId::new();
        if self.all_open() {
            self.transport
                .send_data_request(&request, token)
                .await
                .context("failed to send data request")?;
            self.issued = Some(token);
            info!(%token, securities = request.securities.len(), "Data request sent");
        } else {
            info!(%token, "Data request queued until required services open");
            self.queued = Some((request, token));
        }
        Ok(token)
    }
}
