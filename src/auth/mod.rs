// Credential store: persisted provider keys plus in-process request overrides

pub mod env_file;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::proxy::Provider;

/// Values supplied with a request; they eclipse the persisted ones until the
/// provider is explicitly saved again.
#[derive(Debug, Clone, Default)]
struct CredentialOverride {
    api_key: Option<String>,
    api_url: Option<String>,
}

/// Fields accepted by `set_credentials` (`/api/save-env`).
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub api_url: Option<String>,
}

pub struct CredentialStore {
    path: PathBuf,
    persisted: RwLock<HashMap<String, String>>,
    overrides: RwLock<HashMap<Provider, CredentialOverride>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    /// Load the credential file if it exists; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let persisted = match std::fs::read_to_string(&path) {
            Ok(content) => env_file::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!("Loaded {} credential entries from {:?}", persisted.len(), path);

        Ok(Self {
            path,
            persisted: RwLock::new(persisted),
            overrides: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lookup order: persisted file, then process environment.
    pub fn get_value(&self, key: &str) -> Option<String> {
        self.persisted
            .read()
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn get_credential(&self, provider: Provider) -> Option<String> {
        if let Some(key) = self
            .overrides
            .read()
            .get(&provider)
            .and_then(|o| o.api_key.clone())
        {
            return Some(key);
        }
        self.get_value(provider.descriptor().credential_key)
    }

    pub fn get_model(&self, provider: Provider) -> String {
        let descriptor = provider.descriptor();
        self.get_value(descriptor.model_key)
            .unwrap_or_else(|| descriptor.default_model.to_string())
    }

    pub fn get_target_url(&self, provider: Provider) -> String {
        let descriptor = provider.descriptor();
        if let Some(url) = self
            .overrides
            .read()
            .get(&provider)
            .and_then(|o| o.api_url.clone())
        {
            return url;
        }
        descriptor
            .url_key
            .and_then(|key| self.get_value(key))
            .unwrap_or_else(|| descriptor.target_url.to_string())
    }

    /// Remember credentials passed on a request for the rest of the process.
    pub fn apply_request_override(
        &self,
        provider: Provider,
        api_key: Option<&str>,
        api_url: Option<&str>,
    ) {
        let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());
        let api_url = api_url.map(str::trim).filter(|u| !u.is_empty());
        if api_key.is_none() && api_url.is_none() {
            return;
        }

        let mut overrides = self.overrides.write();
        let entry = overrides.entry(provider).or_default();
        if let Some(key) = api_key {
            if entry.api_key.as_deref() != Some(key) {
                tracing::debug!("Using request-supplied API key for {}", provider);
            }
            entry.api_key = Some(key.to_string());
        }
        if let Some(url) = api_url {
            entry.api_url = Some(url.to_string());
        }
    }

    /// Persist key/model/url for a provider and drop its in-process override.
    pub async fn set_credentials(
        &self,
        provider: Provider,
        update: CredentialUpdate,
    ) -> Result<Vec<String>> {
        let descriptor = provider.descriptor();
        let mut pairs = Vec::new();
        if let Some(key) = update.api_key.filter(|v| !v.trim().is_empty()) {
            pairs.push((descriptor.credential_key.to_string(), key.trim().to_string()));
        }
        if let Some(model) = update.model.filter(|v| !v.trim().is_empty()) {
            pairs.push((descriptor.model_key.to_string(), model.trim().to_string()));
        }
        if let (Some(url_key), Some(url)) = (descriptor.url_key, update.api_url) {
            pairs.push((url_key.to_string(), url.trim().to_string()));
        }

        let keys = self.set_values(&pairs).await?;
        self.overrides.write().remove(&provider);
        tracing::info!("Saved {} credential keys for {}", keys.len(), provider);
        Ok(keys)
    }

    /// Upsert raw keys into the credential file.
    pub async fn set_values(&self, pairs: &[(String, String)]) -> Result<Vec<String>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let mut content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for (key, value) in pairs {
            content = env_file::upsert(&content, key, value);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, content).await?;

        let mut persisted = self.persisted.write();
        for (key, value) in pairs {
            persisted.insert(key.clone(), value.clone());
        }
        Ok(pairs.iter().map(|(k, _)| k.clone()).collect())
    }
}
