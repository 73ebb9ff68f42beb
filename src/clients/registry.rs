//! Backend type to adapter constructor mapping
//!
//! Adding a backend family means registering one constructor; nothing else
//! in the poller changes.

use super::{ClientAdapter, QbittorrentAdapter, SabnzbdAdapter};
use crate::config::ClientConfig;
use crate::error::ClientError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a constructor
pub type ConnectFuture = BoxFuture<'static, Result<Arc<dyn ClientAdapter>, ClientError>>;

/// Adapter constructor stored in the registry
pub type Constructor = Arc<dyn Fn(ClientConfig) -> ConnectFuture + Send + Sync>;

/// Registry of known backend types
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, Constructor>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in qBittorrent and SABnzbd adapters
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(QbittorrentAdapter::KIND, |config| async move {
            let adapter = QbittorrentAdapter::connect(config).await?;
            Ok(Arc::new(adapter) as Arc<dyn ClientAdapter>)
        });
        registry.insert(SabnzbdAdapter::KIND, |config| async move {
            let adapter = SabnzbdAdapter::connect(config).await?;
            Ok(Arc::new(adapter) as Arc<dyn ClientAdapter>)
        });
        registry
    }

    /// Register a constructor for a backend type
    ///
    /// Type identifiers are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateBackend`] if the type is already registered.
    pub fn register<F, Fut>(&mut self, kind: &str, constructor: F) -> Result<(), ClientError>
    where
        F: Fn(ClientConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn ClientAdapter>, ClientError>> + Send + 'static,
    {
        if self.contains(kind) {
            return Err(ClientError::DuplicateBackend(normalize_kind(kind)));
        }
        self.insert(kind, constructor);
        Ok(())
    }

    fn insert<F, Fut>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(ClientConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn ClientAdapter>, ClientError>> + Send + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |config| Box::pin(constructor(config)) as ConnectFuture);
        self.constructors.insert(normalize_kind(kind), constructor);
    }

    /// Whether a backend type is known
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(&normalize_kind(kind))
    }

    /// Registered backend types, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Construct and connect an adapter for one configured instance
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownBackend`] for an unregistered type, or
    /// whatever the constructor reports while connecting.
    pub async fn instantiate(
        &self,
        config: ClientConfig,
    ) -> Result<Arc<dyn ClientAdapter>, ClientError> {
        let constructor = self
            .constructors
            .get(&normalize_kind(&config.kind))
            .cloned()
            .ok_or_else(|| ClientError::UnknownBackend(config.kind.clone()))?;
        constructor(config).await
    }
}

fn normalize_kind(kind: &str) -> String {
    kind.trim().to_ascii_lowercase()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadRecord;
    use async_trait::async_trait;

    struct Fixed(String);

    #[async_trait]
    impl ClientAdapter for Fixed {
        fn source(&self) -> &str {
            &self.0
        }

        fn kind(&self) -> &'static str {
            "fixed"
        }

        async fn list_active(&self) -> Result<Vec<DownloadRecord>, ClientError> {
            Ok(vec![DownloadRecord::new(&self.0, "h1", "Title")])
        }

        async fn health_check(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn config(kind: &str) -> ClientConfig {
        serde_json::from_value(serde_json::json!({
            "name": "inst",
            "type": kind,
            "base_url": "http://localhost:1234"
        }))
        .unwrap()
    }

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = AdapterRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["qbittorrent", "sabnzbd"]);
        assert!(registry.contains("QBittorrent"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = AdapterRegistry::with_builtin();
        let result = registry.register("sabnzbd", |config| async move {
            Ok(Arc::new(Fixed(config.instance_name())) as Arc<dyn ClientAdapter>)
        });
        assert!(matches!(result, Err(ClientError::DuplicateBackend(kind)) if kind == "sabnzbd"));

        let result = registry.register(" QBittorrent ", |config| async move {
            Ok(Arc::new(Fixed(config.instance_name())) as Arc<dyn ClientAdapter>)
        });
        assert!(
            matches!(result, Err(ClientError::DuplicateBackend(kind)) if kind == "qbittorrent")
        );
        assert_eq!(registry.kinds(), vec!["qbittorrent", "sabnzbd"]);
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let registry = AdapterRegistry::with_builtin();
        let result = registry.instantiate(config("transmission")).await;
        assert!(matches!(result, Err(ClientError::UnknownBackend(kind)) if kind == "transmission"));
    }

    #[tokio::test]
    async fn custom_backend_is_constructed_through_registry() {
        let mut registry = AdapterRegistry::new();
        registry
            .register("fixed", |config| async move {
                Ok(Arc::new(Fixed(config.instance_name())) as Arc<dyn ClientAdapter>)
            })
            .unwrap();

        let adapter = registry.instantiate(config("Fixed")).await.unwrap();
        assert_eq!(adapter.source(), "inst");
        assert_eq!(adapter.kind(), "fixed");
        assert_eq!(adapter.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let registry = AdapterRegistry::with_builtin();
        let result = registry.instantiate(config("qbittorrent")).await;
        assert!(matches!(result, Err(ClientError::InvalidConfig { .. })));
    }
}
