//! Service-registry consumption and self-registration.
//!
//! The registry itself is an external collaborator; this module owns the
//! seam. [`ServiceRegistry`] is the interface the daemon consumes: a stream
//! of [`ServiceStatusUpdate`] events plus keep-alive self-registration. The
//! status payload is a dynamic attribute bag, so [`UpstreamSpec`] validates
//! it into typed values at the boundary; incomplete events are rejected here
//! and never propagate.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::template::{Algo, TemplateKey, TemplateType};

/// Errors from registry event validation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("event missing label {0}")]
    MissingLabel(&'static str),

    #[error("label {label} is invalid: {reason}")]
    BadLabel { label: &'static str, reason: String },
}

/// Lifecycle action of a registry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Added,
    Updated,
    Removed,
}

/// A watched service's advertised state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub labels: HashMap<String, Value>,
}

/// One event from the service watcher.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceStatusUpdate {
    pub action: Action,
    pub service_id: String,
    pub status: ServiceStatus,
}

/// A coinserver advertisement, validated from registry labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    pub key: TemplateKey,
    pub endpoint: String,
}

impl UpstreamSpec {
    /// Unpack `{currency, algo, template_type, endpoint}` labels strictly.
    pub fn from_status(status: &ServiceStatus) -> Result<Self, RegistryError> {
        let get = |label: &'static str| -> Result<&str, RegistryError> {
            status
                .labels
                .get(label)
                .ok_or(RegistryError::MissingLabel(label))?
                .as_str()
                .ok_or(RegistryError::BadLabel {
                    label,
                    reason: "not a string".into(),
                })
        };
        let algo = Algo::parse(get("algo")?).map_err(|e| RegistryError::BadLabel {
            label: "algo",
            reason: e.to_string(),
        })?;
        let template_type =
            TemplateType::parse(get("template_type")?).map_err(|e| RegistryError::BadLabel {
                label: "template_type",
                reason: e.to_string(),
            })?;
        Ok(Self {
            key: TemplateKey {
                algo,
                currency: get("currency")?.to_string(),
                template_type,
            },
            endpoint: get("endpoint")?.to_string(),
        })
    }
}

/// The registry seam the daemon consumes.
///
/// Production deployments plug a real registry client in here; the crate
/// ships [`StaticRegistry`] for pinned-upstream setups and tests drive the
/// daemon through a channel-backed implementation.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Watch the `coinserver` service for lifecycle events.
    async fn watch(&self) -> mpsc::Receiver<ServiceStatusUpdate>;

    /// Register this stratum under its advertised endpoint and keep the
    /// registration alive until cancelled.
    async fn keep_alive(&self, shutdown: CancellationToken);
}

/// Upstream pinned in the config file, bypassing service discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticUpstream {
    pub currency: String,
    pub algo: Algo,
    pub template_type: TemplateType,
    pub endpoint: String,
}

/// Config-driven registry: emits one `added` event per pinned upstream and
/// keeps nothing alive.
pub struct StaticRegistry {
    upstreams: Vec<StaticUpstream>,
}

impl StaticRegistry {
    pub fn new(upstreams: Vec<StaticUpstream>) -> Self {
        Self { upstreams }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn watch(&self) -> mpsc::Receiver<ServiceStatusUpdate> {
        let (tx, rx) = mpsc::channel(self.upstreams.len().max(1));
        for (i, upstream) in self.upstreams.iter().enumerate() {
            let mut labels = HashMap::new();
            labels.insert("currency".into(), Value::String(upstream.currency.clone()));
            labels.insert(
                "algo".into(),
                Value::String(upstream.algo.as_str().to_string()),
            );
            labels.insert(
                "template_type".into(),
                Value::String(upstream.template_type.as_str().to_string()),
            );
            labels.insert("endpoint".into(), Value::String(upstream.endpoint.clone()));
            let update = ServiceStatusUpdate {
                action: Action::Added,
                service_id: format!("static-{i}-{}", upstream.currency),
                status: ServiceStatus { labels },
            };
            // Capacity covers every pinned upstream.
            let _ = tx.send(update).await;
        }
        rx
    }

    async fn keep_alive(&self, shutdown: CancellationToken) {
        debug!("static registry: no registration to keep alive");
        shutdown.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(labels: &[(&str, &str)]) -> ServiceStatus {
        ServiceStatus {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        }
    }

    #[test]
    fn test_unpack_complete_labels() {
        let spec = UpstreamSpec::from_status(&status(&[
            ("currency", "BTC"),
            ("algo", "sha256d"),
            ("template_type", "base"),
            ("endpoint", "http://127.0.0.1:9090/"),
        ]))
        .unwrap();
        assert_eq!(spec.key.currency, "BTC");
        assert_eq!(spec.key.algo, Algo::Sha256d);
        assert_eq!(spec.key.template_type, TemplateType::Base);
        assert_eq!(spec.endpoint, "http://127.0.0.1:9090/");
    }

    #[test]
    fn test_missing_label_rejected() {
        let err = UpstreamSpec::from_status(&status(&[
            ("currency", "BTC"),
            ("algo", "sha256d"),
            ("template_type", "base"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RegistryError::MissingLabel("endpoint")));
    }

    #[test]
    fn test_non_string_label_rejected() {
        let mut s = status(&[
            ("currency", "BTC"),
            ("algo", "sha256d"),
            ("template_type", "base"),
        ]);
        s.labels.insert("endpoint".into(), json!(42));
        assert!(matches!(
            UpstreamSpec::from_status(&s),
            Err(RegistryError::BadLabel { label: "endpoint", .. })
        ));
    }

    #[test]
    fn test_unknown_algo_rejected() {
        let err = UpstreamSpec::from_status(&status(&[
            ("currency", "XYZ"),
            ("algo", "x11"),
            ("template_type", "aux"),
            ("endpoint", "http://e/"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RegistryError::BadLabel { label: "algo", .. }));
    }

    #[test]
    fn test_action_deserializes_lowercase() {
        let update: ServiceStatusUpdate = serde_json::from_value(json!({
            "action": "added",
            "service_id": "abc",
            "status": {"labels": {}}
        }))
        .unwrap();
        assert_eq!(update.action, Action::Added);
    }

    #[tokio::test]
    async fn test_static_registry_emits_added_events() {
        let registry = StaticRegistry::new(vec![StaticUpstream {
            currency: "BTC".into(),
            algo: Algo::Sha256d,
            template_type: TemplateType::Base,
            endpoint: "http://127.0.0.1:9090/".into(),
        }]);
        let mut rx = registry.watch().await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.action, Action::Added);
        let spec = UpstreamSpec::from_status(&update.status).unwrap();
        assert_eq!(spec.key.currency, "BTC");
        assert!(rx.recv().await.is_none());
    }
}
