//! Shared integration test helpers: a transport double that journals every
//! provider call, and constructors for inbound feed events.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use feedgate::config::FeedgateConfig;
use feedgate::distributor::{feed_channel, Distributor};
use feedgate::event::{CorrelationId, EventCategory, FeedEvent, FeedMessage, MessageKind};
use feedgate::transport::{AuthParams, DataRequest, ProviderTransport};

/// One provider call observed by the [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Authorization {
        user_id: String,
        token: CorrelationId,
    },
    DataRequest {
        securities: Vec<String>,
        token: CorrelationId,
    },
    OpenService(String),
    Cancel(Vec<CorrelationId>),
}

/// Transport double: every call succeeds and lands in the journal.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderTransport for RecordingTransport {
    async fn request_authorization(
        &self,
        user_id: &str,
        _params: &AuthParams,
        token: CorrelationId,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(TransportCall::Authorization {
            user_id: user_id.to_string(),
            token,
        });
        Ok(())
    }

    async fn send_data_request(&self, request: &DataRequest, token: CorrelationId) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(TransportCall::DataRequest {
            securities: request.securities.clone(),
            token,
        });
        Ok(())
    }

    async fn open_service(&self, service: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::OpenService(service.to_string()));
        Ok(())
    }

    async fn cancel(&self, tokens: &[CorrelationId]) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::Cancel(tokens.to_vec()));
        Ok(())
    }
}

/// A distribution core wired to a recording transport, plus the feed sender.
pub fn core_with_recorder() -> (Distributor, mpsc::Sender<FeedEvent>, Arc<RecordingTransport>) {
    let config = FeedgateConfig::default();
    let (tx, rx) = feed_channel(&config);
    let transport = Arc::new(RecordingTransport::default());
    let core = Distributor::new(&config, Arc::clone(&transport) as Arc<dyn ProviderTransport>, rx);
    (core, tx, transport)
}

/// Open both default provider services and deliver their status events.
pub async fn open_services(core: &mut Distributor, tx: &mpsc::Sender<FeedEvent>) {
    core.open_required_services().await.unwrap();
    tx.send(service_opened("//provider/apiauth")).await.unwrap();
    tx.send(service_opened("//provider/refdata")).await.unwrap();
    core.pump().await.unwrap();
}

// ── event constructors ───────────────────────────────────────────────────────

pub fn auth_success(token: CorrelationId, grants: &[u32]) -> FeedEvent {
    FeedEvent::new(
        EventCategory::AuthorizationStatus,
        vec![FeedMessage::new(
            MessageKind::AuthorizationSuccess,
            Some(token),
            json!({"entitlements": grants}),
        )],
    )
}

pub fn auth_failure(token: CorrelationId, reason: &str) -> FeedEvent {
    FeedEvent::new(
        EventCategory::AuthorizationStatus,
        vec![FeedMessage::new(
            MessageKind::AuthorizationFailure,
            Some(token),
            json!({"reason": reason}),
        )],
    )
}

pub fn auth_revoked(token: CorrelationId) -> FeedEvent {
    FeedEvent::new(
        EventCategory::AuthorizationStatus,
        vec![FeedMessage::new(
            MessageKind::AuthorizationRevoked,
            Some(token),
            json!({}),
        )],
    )
}

pub fn session_terminated(reason: &str) -> FeedEvent {
    FeedEvent::new(
        EventCategory::SessionStatus,
        vec![FeedMessage::new(
            MessageKind::SessionTerminated,
            None,
            json!({"reason": reason}),
        )],
    )
}

pub fn service_opened(service: &str) -> FeedEvent {
    FeedEvent::new(
        EventCategory::ServiceStatus,
        vec![FeedMessage::new(
            MessageKind::ServiceOpened,
            None,
            json!({"service": service}),
        )],
    )
}

/// A partial or final data response carrying one entry per (security,
/// required entitlement ids) pair.
pub fn response(token: CorrelationId, entries: &[(&str, &[u32])], last: bool) -> FeedEvent {
    let securities: Vec<_> = entries
        .iter()
        .map(|(security, ids)| {
            json!({
                "security": security,
                "entitlement_ids": ids,
                "fields": {"LAST_PRICE": 101.25, "BID": 101.0},
            })
        })
        .collect();

    let (category, kind) = if last {
        (EventCategory::Response, MessageKind::DataResponse)
    } else {
        (EventCategory::PartialResponse, MessageKind::PartialDataResponse)
    };

    FeedEvent::new(
        category,
        vec![FeedMessage::new(kind, Some(token), json!({"securities": securities}))],
    )
}
