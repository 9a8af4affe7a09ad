//! Deterministic in-process gateway.
//!
//! Hands out sequenced handles and tracks which resources are open, so
//! tests can assert that teardown released everything. Descriptors are
//! shaped like real ICE/DTLS/RTP parameter objects but carry placeholder
//! values; the media plane itself is out of scope.

use super::{
    ConsumerDescriptor, GatewayError, ProducerDescriptor, SfuGateway, TransportDescriptor,
};
use crate::protocol::{MediaKind, TransportDirection};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// In-process gateway implementation.
#[derive(Debug, Default)]
pub struct LocalGateway {
    seq: AtomicU64,
    open: Mutex<HashSet<String>>,
    /// When set, every call fails. Lets tests exercise the abort-on-
    /// gateway-failure paths.
    fail: AtomicBool,
}

impl LocalGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    fn track(&self, id: &str) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    fn is_open(&self, id: &str) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.fail.load(Ordering::Relaxed) {
            Err(GatewayError("media worker unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Make all subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::Relaxed);
    }

    /// Ids of resources created but not yet closed.
    #[must_use]
    pub fn open_resources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SfuGateway for LocalGateway {
    async fn router_capabilities(&self, _room_id: &str) -> Result<Value, GatewayError> {
        self.check_available()?;
        Ok(json!({
            "codecs": [
                {
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "clockRate": 48_000,
                    "channels": 2
                },
                {
                    "kind": "video",
                    "mimeType": "video/VP8",
                    "clockRate": 90_000
                }
            ],
            "headerExtensions": []
        }))
    }

    async fn create_transport(
        &self,
        _room_id: &str,
        _peer_id: &str,
        _direction: TransportDirection,
    ) -> Result<TransportDescriptor, GatewayError> {
        self.check_available()?;
        let id = self.next("transport");
        self.track(&id);
        Ok(TransportDescriptor {
            id,
            ice_parameters: json!({
                "usernameFragment": uuid::Uuid::new_v4().to_string(),
                "password": uuid::Uuid::new_v4().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [
                    {"algorithm": "sha-256", "value": "00:00:00:00"}
                ]
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: &Value,
    ) -> Result<(), GatewayError> {
        self.check_available()?;
        if self.is_open(transport_id) {
            Ok(())
        } else {
            Err(GatewayError(format!("unknown transport {transport_id}")))
        }
    }

    async fn produce(
        &self,
        transport_id: &str,
        _kind: MediaKind,
        _rtp_parameters: &Value,
    ) -> Result<ProducerDescriptor, GatewayError> {
        self.check_available()?;
        if !self.is_open(transport_id) {
            return Err(GatewayError(format!("unknown transport {transport_id}")));
        }
        let id = self.next("producer");
        self.track(&id);
        Ok(ProducerDescriptor { id })
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        kind: MediaKind,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, GatewayError> {
        self.check_available()?;
        if !self.is_open(transport_id) {
            return Err(GatewayError(format!("unknown transport {transport_id}")));
        }
        let id = self.next("consumer");
        self.track(&id);
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.to_string(),
            kind,
            // Echo the relevant capability subset back as the negotiated
            // receive parameters.
            rtp_parameters: rtp_capabilities.clone(),
        })
    }

    async fn close_resource(&self, resource_id: &str) -> Result<(), GatewayError> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id);
        Ok(())
    }
}
