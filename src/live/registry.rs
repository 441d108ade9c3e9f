//! Process-wide table of live apps

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::app::LiveApp;
use super::config::LiveConfig;
use super::error::LiveError;

/// Live apps keyed by room id
pub struct LiveRegistry {
    apps: RwLock<HashMap<String, Arc<LiveApp>>>,
    config: LiveConfig,
}

impl LiveRegistry {
    /// Create an empty registry with default channel settings
    pub fn new() -> Self {
        Self::with_config(LiveConfig::default())
    }

    /// Create an empty registry
    pub fn with_config(config: LiveConfig) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the channel configuration
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Create a fresh app for `name` and make it the registered one
    ///
    /// An app already registered under `name` stays open; its owner is
    /// expected to close it and release it with [`release_app`](Self::release_app).
    pub async fn new_app(&self, name: &str) -> Arc<LiveApp> {
        let app = Arc::new(LiveApp::new(name, self.config.clone()));
        let displaced = self
            .apps
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&app));

        match displaced {
            Some(old) if !old.is_closed() => {
                tracing::debug!(app = %name, "Live app created, displacing an open app")
            }
            _ => tracing::debug!(app = %name, "Live app created"),
        }
        app
    }

    /// Get the registered app for `name`
    pub async fn app(&self, name: &str) -> Result<Arc<LiveApp>, LiveError> {
        self.apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LiveError::AppNotFound(name.to_string()))
    }

    /// Close `app` and unregister it if it is still the app under `name`
    ///
    /// A newer app registered under the same name is left alone. Returns
    /// whether the entry was removed.
    pub async fn release_app(&self, name: &str, app: &Arc<LiveApp>) -> bool {
        let removed = {
            let mut apps = self.apps.write().await;
            match apps.get(name) {
                Some(current) if Arc::ptr_eq(current, app) => apps.remove(name).is_some(),
                _ => false,
            }
        };
        let _ = app.close().await;
        removed
    }

    /// Number of registered apps
    pub async fn app_count(&self) -> usize {
        self.apps.read().await.len()
    }
}

impl Default for LiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_app_becomes_registered() {
        let registry = LiveRegistry::new();

        let a = registry.new_app("r1").await;
        assert!(Arc::ptr_eq(&a, &registry.app("r1").await.unwrap()));

        let b = registry.new_app("r1").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!a.is_closed());
        assert!(Arc::ptr_eq(&b, &registry.app("r1").await.unwrap()));
        assert_eq!(registry.app_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_leaves_newer_app() {
        let registry = LiveRegistry::new();
        let old = registry.new_app("r1").await;
        let new = registry.new_app("r1").await;

        assert!(!registry.release_app("r1", &old).await);
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(Arc::ptr_eq(&new, &registry.app("r1").await.unwrap()));

        assert!(registry.release_app("r1", &new).await);
        assert!(new.is_closed());
        assert_eq!(registry.app_count().await, 0);
        assert_eq!(
            registry.app("r1").await.err(),
            Some(LiveError::AppNotFound("r1".into()))
        );
    }
}
