use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::cache::{CachedItem, ResponseCache};
use crate::config::FeedgateConfig;
use crate::entitlement::{self, DenialNotice, EntitlementGate, FilteredUpdate, Verdict};
use crate::event::{
    extract_grants, extract_reason, extract_securities, extract_service, CorrelationId, FeedEvent,
    MessageKind, SecurityData,
};
use crate::identity::{AuthBarrier, AuthNotice, IdentityHandle, IdentityManager, IdentityState};
use crate::orchestrator::RequestOrchestrator;
use crate::router::{DispatchFault, DispatchStats, EventRouter};
use crate::transport::{AuthParams, DataRequest, ProviderTransport};


pub use crate::orchestrator::OrchestratorError;
pub use crate::router::RouterError;

/// Typed result of a routed message, queued back to the dispatch task.
///
/// Handlers never touch shared state directly; they parse and forward one of
/// these, and the run loop applies it after the dispatch call returns.
#[derive(Debug)]
enum CoreAction {
    AuthSucceeded {
        token: CorrelationId,
        grants: Vec<entitlement::EntitlementId>,
    },
    AuthFailed {
        token: CorrelationId,
        reason: Option<String>,
    },
    AuthRevoked {
        token: CorrelationId,
    },
    ResponseItems {
        token: CorrelationId,
        securities: Vec<SecurityData>,
        last: bool,
    },
    ServiceOpened {
        service: String,
    },
    ServiceOpenFailed {
        service: String,
        reason: Option<String>,
    },
    SessionTerminated {
        reason: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The provider session ended; every identity was forced terminal and
    /// outstanding operations were cancelled.
    #[error("provider session terminated: {reason}")]
    SessionTerminated { reason: String },

    #[error(transparent)]
    Identity(#[from] crate::identity::IdentityError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    #[error("user '{0}' has no pending authorization to cancel")]
    NothingToCancel(String),
}

/// Visibility query errors. Both fail closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("user '{0}' is not authorized")]
    NotAuthorized(String),

    #[error("security '{0}' is not present in any cached response")]
    UnknownSecurity(String),
}

/// Create the inbound feed channel at the configured capacity.
pub fn feed_channel(config: &FeedgateConfig) -> (mpsc::Sender<FeedEvent>, mpsc::Receiver<FeedEvent>) {
    mpsc::channel(config.session.event_queue_capacity)
}

/// The entitlement-gated distribution core for one provider session.
///
/// Owns the event router, identity lifecycle, response cache, entitlement
/// gate, and request orchestrator, and drives them from a single dispatch
/// loop over the inbound event stream. Construct one per session; there is
/// no ambient state.
pub struct Distributor {
    router: EventRouter,
    identities: Arc<IdentityManager>,
    cache: Arc<ResponseCache>,
    gate: Arc<EntitlementGate>,
    orchestrator: RequestOrchestrator,
    transport: Arc<dyn ProviderTransport>,
    events: mpsc::Receiver<FeedEvent>,
    actions_tx: mpsc::UnboundedSender<CoreAction>,
    actions_rx: mpsc::UnboundedReceiver<CoreAction>,
    faults_rx: Option<mpsc::UnboundedReceiver<DispatchFault>>,
    terminated: Option<String>,
}

impl Distributor {
    pub fn new(
        config: &FeedgateConfig,
        transport: Arc<dyn ProviderTransport>,
        events: mpsc::Receiver<FeedEvent>,
    ) -> Self {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let mut router = EventRouter::new();
        router.set_fault_sink(faults_tx);
        wire_kind_handlers(&mut router, &actions_tx);

        let orchestrator = RequestOrchestrator::new(
            Arc::clone(&transport),
            vec![
                config.services.auth_service.clone(),
                config.services.data_service.clone(),
            ],
        );

        Self {
            router,
            identities: Arc::new(IdentityManager::new(config.session.broadcast_capacity)),
            cache: Arc::new(ResponseCache::new()),
            gate: Arc::new(EntitlementGate::new(config.session.broadcast_capacity)),
            orchestrator,
            transport,
            events,
            actions_tx,
            actions_rx,
            faults_rx: Some(faults_rx),
            terminated: None,
        }
    }

    /// Request authorization for one user. The result arrives on the event
    /// stream and is applied by the run loop.
    pub async fn authorize_user(
        &mut self,
        user_id: &str,
        params: &AuthParams,
    ) -> Result<CorrelationId, CoreError> {
        self.ensure_live()?;

        let token = self.identities.begin_authorization(user_id)?;
        let tx = self.actions_tx.clone();
        self.router.register_by_token(
            token,
            Box::new(move |m| {
                let action = match m.kind {
                    MessageKind::AuthorizationSuccess => CoreAction::AuthSucceeded {
                        token,
                        grants: extract_grants(&m.payload)?,
                    },
                    MessageKind::AuthorizationFailure => CoreAction::AuthFailed {
                        token,
                        reason: extract_reason(&m.payload),
                    },
                    MessageKind::AuthorizationRevoked => CoreAction::AuthRevoked { token },
                    other => anyhow::bail!("unexpected {:?} message on authorization token", other),
                };
                tx.send(action).ok();
                Ok(())
            }),
        )?;

        if let Err(e) = self.transport.request_authorization(user_id, params, token).await {
            // Roll back: the request never reached the provider
            self.router.unregister(token);
            let _ = self
                .identities
                .apply_failure(token, Some(format!("transport: {}", e)));
            return Err(CoreError::Transport(e));
        }

        info!(user_id, %token, "Authorization requested");
        Ok(token)
    }

    /// Abandon a still-pending authorization.
    pub async fn cancel_authorization(&mut self, user_id: &str) -> Result<(), CoreError> {
        self.ensure_live()?;

        if self.identities.state_of(user_id) != Some(IdentityState::Pending) {
            return Err(CoreError::NothingToCancel(user_id.to_string()));
        }
        let token = self
            .identities
            .token_for(user_id)
            .ok_or_else(|| CoreError::NothingToCancel(user_id.to_string()))?;

        self.transport.cancel(&[token]).await?;
        self.router.unregister(token);
        let _ = self.identities.apply_failure(token, Some("cancelled".to_string()));
        info!(user_id, %token, "Authorization cancelled");
        Ok(())
    }

    /// Ask the transport to open the configured provider services.
    pub async fn open_required_services(&self) -> Result<(), CoreError> {
        self.orchestrator.open_required_services().await?;
        Ok(())
    }

    /// Issue the logical market data request (exactly once per session).
    ///
    /// Responses are cached as they arrive and replayed to each identity at
    /// the moment it authorizes — never pushed to identities that authorized
    /// earlier.
    pub async fn request_market_data(
        &mut self,
        securities: Vec<String>,
        fields: Vec<String>,
    ) -> Result<CorrelationId, CoreError> {
        self.ensure_live()?;

        let token = self
            .orchestrator
            .send_data_request(DataRequest { securities, fields })
            .await?;

        let tx = self.actions_tx.clone();
        self.router.register_by_token(
            token,
            Box::new(move |m| {
                let last = match m.kind {
                    MessageKind::DataResponse => true,
                    MessageKind::PartialDataResponse => false,
                    other => anyhow::bail!("unexpected {:?} message on data token", other),
                };
                tx.send(CoreAction::ResponseItems {
                    token,
                    securities: extract_securities(&m.payload)?,
                    last,
                })
                .ok();
                Ok(())
            }),
        )?;

        Ok(token)
    }

    /// Consume the feed until it closes or the session terminates.
    pub async fn run(&mut self) -> Result<(), CoreError> {
        info!("Distribution core running");
        while let Some(event) = self.events.recv().await {
            self.process(event).await?;
        }
        info!("Event stream closed, distribution core stopping");
        Ok(())
    }

    /// Drain every event already queued on the feed, then return.
    ///
    /// Embedders that interleave driving the loop with issuing requests use
    /// this instead of [`run`](Self::run).
    pub async fn pump(&mut self) -> Result<(), CoreError> {
        while let Ok(event) = self.events.try_recv() {
            self.process(event).await?;
        }
        Ok(())
    }

    async fn process(&mut self, event: FeedEvent) -> Result<(), CoreError> {
        let stats = self.router.dispatch(&event);
        trace!(category = ?event.category, ?stats, "Event dispatched");

        self.drain_actions().await;
        self.drain_faults();

        match &self.terminated {
            Some(reason) => Err(CoreError::SessionTerminated {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn drain_actions(&mut self) {
        while let Ok(action) = self.actions_rx.try_recv() {
            self.apply(action).await;
        }
    }

    async fn apply(&mut self, action: CoreAction) {
        match action {
            CoreAction::AuthSucceeded { token, grants } => {
                match self
                    .identities
                    .apply_success(token, IdentityHandle::from_grants(grants))
                {
                    Ok(change) => {
                        if let Some(handle) = &change.handle {
                            // Synchronize the new identity with cached history,
                            // whether or not the final response has arrived
                            self.cache.replay_for(&change.user_id, handle, &self.gate);
                        }
                    }
                    Err(e) => warn!(%token, error = %e, "Ignoring authorization success"),
                }
            }
            CoreAction::AuthFailed { token, reason } => {
                self.router.unregister(token);
                if let Err(e) = self.identities.apply_failure(token, reason) {
                    warn!(%token, error = %e, "Ignoring authorization failure");
                }
            }
            CoreAction::AuthRevoked { token } => {
                self.router.unregister(token);
                if let Err(e) = self.identities.apply_revocation(token) {
                    warn!(%token, error = %e, "Ignoring revocation");
                }
            }
            CoreAction::ResponseItems {
                token,
                securities,
                last,
            } => {
                debug!(items = securities.len(), last, "Response items received");
                for s in securities {
                    self.cache
                        .record(CachedItem::new(s.security, s.fields, s.entitlement_ids));
                }
                if last {
                    self.cache.mark_complete();
                    self.router.unregister(token);
                }
            }
            CoreAction::ServiceOpened { service } => {
                info!(service = %service, "Service opened");
                if let Err(e) = self.orchestrator.service_opened(&service).await {
                    error!(service = %service, error = %e, "Failed to issue queued data request");
                }
            }
            CoreAction::ServiceOpenFailed { service, reason } => {
                self.orchestrator
                    .service_failed(&service, reason.as_deref().unwrap_or("unknown"));
            }
            CoreAction::SessionTerminated { reason } => {
                let reason =
                    reason.unwrap_or_else(|| "session terminated by provider".to_string());
                warn!(reason = %reason, "Session terminated, forcing identities terminal");

                let changes = self.identities.force_terminate_all(&reason);
                for change in &changes {
                    debug!(user_id = %change.user_id, state = ?change.state, "Identity forced terminal");
                }
                self.router.clear_token_handlers();

                if !self.cache.is_complete() {
                    if let Some(token) = self.orchestrator.current_token() {
                        if let Err(e) = self.transport.cancel(&[token]).await {
                            warn!(error = %e, "Cancel failed during teardown");
                        }
                    }
                }

                self.terminated = Some(reason);
            }
        }
    }

    fn drain_faults(&mut self) {
        if let Some(rx) = &mut self.faults_rx {
            while let Ok(fault) = rx.try_recv() {
                error!(
                    kind = ?fault.kind,
                    correlation_id = ?fault.correlation_id,
                    error = %fault.error,
                    "Handler fault"
                );
            }
        }
    }

    fn ensure_live(&self) -> Result<(), CoreError> {
        match &self.terminated {
            Some(reason) => Err(CoreError::SessionTerminated {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Is `security` visible to `user_id` right now?
    ///
    /// Fails closed: a user that is not currently Authorized gets
    /// [`QueryError::NotAuthorized`] no matter what was replayed to them
    /// earlier. The newest cached item for the security decides, since later
    /// items supersede earlier partials.
    pub fn visibility(&self, user_id: &str, security: &str) -> Result<Verdict, QueryError> {
        let handle = self
            .identities
            .handle_for(user_id)
            .ok_or_else(|| QueryError::NotAuthorized(user_id.to_string()))?;

        let items = self.cache.items_for(security);
        match items.last() {
            Some(item) => Ok(entitlement::check(&item.entitlement_ids, &handle)),
            None => Err(QueryError::UnknownSecurity(security.to_string())),
        }
    }

    /// Counting barrier over a set of authorization tokens.
    pub fn barrier_for(&self, tokens: impl IntoIterator<Item = CorrelationId>) -> AuthBarrier {
        AuthBarrier::new(Arc::clone(&self.identities), tokens)
    }

    /// Per-user filtered results (replay output).
    pub fn subscribe_updates(&self) -> broadcast::Receiver<FilteredUpdate> {
        self.gate.subscribe_updates()
    }

    /// First-occurrence denial notices (audit hook).
    pub fn subscribe_denials(&self) -> broadcast::Receiver<DenialNotice> {
        self.gate.subscribe_denials()
    }

    /// Identity lifecycle notices.
    pub fn subscribe_auth(&self) -> broadcast::Receiver<AuthNotice> {
        self.identities.subscribe()
    }

    /// Take ownership of the handler fault stream. Once taken, the embedder
    /// is responsible for consuming it; until then faults are error-logged by
    /// the run loop.
    pub fn take_faults(&mut self) -> Option<mpsc::UnboundedReceiver<DispatchFault>> {
        self.faults_rx.take()
    }

    pub fn identity_state(&self, user_id: &str) -> Option<IdentityState> {
        self.identities.state_of(user_id)
    }

    pub fn cached_items(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_complete(&self) -> bool {
        self.cache.is_complete()
    }

    /// Lifetime dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        self.router.stats()
    }
}

/// Register the kind-level fallbacks: session and service status, plus
/// authorization messages whose token handler is already gone (stale or
/// unknown tokens end up warn-logged by the apply step instead of vanishing).
fn wire_kind_handlers(router: &mut EventRouter, actions: &mpsc::UnboundedSender<CoreAction>) {
    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::SessionTerminated,
        Box::new(move |m| {
            tx.send(CoreAction::SessionTerminated {
                reason: extract_reason(&m.payload),
            })
            .ok();
            Ok(())
        }),
    );

    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::ServiceOpened,
        Box::new(move |m| {
            tx.send(CoreAction::ServiceOpened {
                service: extract_service(&m.payload)?,
            })
            .ok();
            Ok(())
        }),
    );

    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::ServiceOpenFailed,
        Box::new(move |m| {
            tx.send(CoreAction::ServiceOpenFailed {
                service: extract_service(&m.payload)?,
                reason: extract_reason(&m.payload),
            })
            .ok();
            Ok(())
        }),
    );

    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::AuthorizationSuccess,
        Box::new(move |m| {
            let token = m
                .correlation_id
                .ok_or_else(|| anyhow::anyhow!("authorization message without correlation token"))?;
            tx.send(CoreAction::AuthSucceeded {
                token,
                grants: extract_grants(&m.payload)?,
            })
            .ok();
            Ok(())
        }),
    );

    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::AuthorizationFailure,
        Box::new(move |m| {
            let token = m
                .correlation_id
                .ok_or_else(|| anyhow::anyhow!("authorization message without correlation token"))?;
            tx.send(CoreAction::AuthFailed {
                token,
                reason: extract_reason(&m.payload),
            })
            .ok();
            Ok(())
        }),
    );

    let tx = actions.clone();
    router.register_by_kind(
        MessageKind::AuthorizationRevoked,
        Box::new(move |m| {
            let token = m
                .correlation_id
                .ok_or_else(|| anyhow::anyhow!("authorization message without correlation token"))?;
            tx.send(CoreAction::AuthRevoked { token }).ok();
            Ok(())
        }),
    );
}
