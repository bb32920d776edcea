use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::warn;

use crate::config::{DeviceConfig, WebhookMethod};

pub const KEY_SSID: &str = "ssid";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_WEBHOOK: &str = "webhook";
pub const KEY_WEBHOOK_METHOD: &str = "webhook_method";
pub const KEY_WEBHOOK_HEADERS: &str = "webhook_headers";
pub const KEY_WEBHOOK_PAYLOAD: &str = "webhook_payload";

/// Persistent string key/value storage that survives deep sleep and restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Typed access to the device configuration kept in a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct ConfigStore<S> {
    backend: S,
}

impl<S: KeyValueStore> ConfigStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Loads the saved configuration. Unset keys, and keys that fail to read,
    /// come back as empty values with the method defaulting to `GET`.
    pub fn load(&self) -> DeviceConfig {
        let method = self.read(KEY_WEBHOOK_METHOD);
        DeviceConfig {
            ssid: self.read(KEY_SSID),
            password: self.read(KEY_PASSWORD),
            webhook_url: self.read(KEY_WEBHOOK),
            webhook_method: if method.is_empty() {
                WebhookMethod::Get
            } else {
                WebhookMethod::parse(&method)
            },
            webhook_headers: self.read(KEY_WEBHOOK_HEADERS),
            webhook_payload: self.read(KEY_WEBHOOK_PAYLOAD),
        }
        .trimmed()
    }

    /// Writes every field. A failure part way through can leave a mix of old
    /// and new values behind.
    pub fn save(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let config = config.clone().trimmed();
        self.backend.put(KEY_SSID, &config.ssid)?;
        self.backend.put(KEY_PASSWORD, &config.password)?;
        self.backend.put(KEY_WEBHOOK, &config.webhook_url)?;
        self.backend
            .put(KEY_WEBHOOK_METHOD, config.webhook_method.as_str())?;
        self.backend
            .put(KEY_WEBHOOK_HEADERS, &config.webhook_headers)?;
        self.backend
            .put(KEY_WEBHOOK_PAYLOAD, &config.webhook_payload)?;
        Ok(())
    }

    fn read(&self, key: &str) -> String {
        match self.backend.get(key) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                warn!("failed to read `{key}` from config store: {err:#}");
                String::new()
            }
        }
    }
}

/// In-memory store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("flash read failed"))
        }

        fn put(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("flash write failed"))
        }
    }

    #[test]
    fn empty_store_loads_defaults() {
        let store = ConfigStore::new(MemoryStore::new());
        assert_eq!(store.load(), DeviceConfig::default());
        assert_eq!(store.load().webhook_method, WebhookMethod::Get);
    }

    #[test]
    fn save_then_load_is_idempotent() {
        let store = ConfigStore::new(MemoryStore::new());
        let config = DeviceConfig {
            ssid: " Home ".to_string(),
            password: "secret123 ".to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            webhook_method: WebhookMethod::Post,
            webhook_headers: "Content-Type: application/json\n".to_string(),
            webhook_payload: " {\"pressed\":true} ".to_string(),
        };

        store.save(&config).unwrap();
        let first = store.load();
        store.save(&first).unwrap();
        let second = store.load();

        assert_eq!(first, config.trimmed());
        assert_eq!(second, first);
    }

    #[test]
    fn save_writes_all_keys() {
        let backend = MemoryStore::new();
        let store = ConfigStore::new(backend.clone());
        store.save(&DeviceConfig::default()).unwrap();

        assert_eq!(backend.len(), 6);
        assert_eq!(
            backend.get(KEY_WEBHOOK_METHOD).unwrap().as_deref(),
            Some("GET")
        );
    }

    #[test]
    fn unknown_method_loads_as_get() {
        let backend = MemoryStore::new();
        backend.put(KEY_WEBHOOK_METHOD, "DELETE").unwrap();
        let store = ConfigStore::new(backend);
        assert_eq!(store.load().webhook_method, WebhookMethod::Get);
    }

    #[test]
    fn read_errors_fall_back_to_defaults() {
        let store = ConfigStore::new(BrokenStore);
        assert_eq!(store.load(), DeviceConfig::default());
        assert!(store.save(&DeviceConfig::default()).is_err());
    }
}
