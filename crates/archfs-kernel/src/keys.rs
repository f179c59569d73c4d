// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Key management for encrypted archives
//!
//! Drivers ask a [`KeyManager`] for the [`KeyProvider`] of a resource. The
//! prompting implementation asks a [`KeyView`] for keys, serializes prompts
//! behind one lock acquired with a timeout and throttles retries after a
//! failed verification.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::KeyConfig;
use crate::error::{FsError, FsResult};

/// Key retrieval errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("no key available for {0}")]
    Unknown(String),
    #[error("timed out after {timeout:?} waiting to prompt for the key of {resource}")]
    PromptingTimeout { resource: String, timeout: Duration },
}

/// Secret key material, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

/// Source of keys, usually an interactive prompt.
#[cfg_attr(test, mockall::automock)]
pub trait KeyView: Send + Sync {
    /// Asks for a key to encrypt `resource` with.
    fn prompt_write_key(&self, resource: &str) -> Result<SecretKey, KeyError>;

    /// Asks for the key of `resource`; `invalid` tells the user the last one was wrong.
    fn prompt_read_key(&self, resource: &str, invalid: bool) -> Result<SecretKey, KeyError>;
}

/// View that never provides keys, for non-interactive use.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledKeyView;

impl KeyView for DisabledKeyView {
    fn prompt_write_key(&self, resource: &str) -> Result<SecretKey, KeyError> {
        Err(KeyError::Unknown(resource.to_string()))
    }

    fn prompt_read_key(&self, resource: &str, _invalid: bool) -> Result<SecretKey, KeyError> {
        Err(KeyError::Unknown(resource.to_string()))
    }
}

pub trait KeyProvider: Send + Sync {
    fn retrieve_write_key(&self) -> Result<SecretKey, KeyError>;

    /// Key for decryption. Pass `invalid` after the previous key failed
    /// verification; such retries are throttled.
    fn retrieve_read_key(&self, invalid: bool) -> Result<SecretKey, KeyError>;
}

pub trait KeyManager: Send + Sync {
    fn provider(&self, resource: &str) -> Arc<dyn KeyProvider>;

    /// Forgets the provider of `resource`, e.g. after the archive was deleted.
    fn unlink(&self, resource: &str);
}

#[derive(Default)]
struct ProviderState {
    key: Option<SecretKey>,
    last_attempt: Option<Instant>,
}

pub struct PromptingKeyProvider {
    resource: String,
    view: Arc<dyn KeyView>,
    prompt_lock: Arc<Mutex<()>>,
    prompt_timeout: Duration,
    min_retry_delay: Duration,
    state: Mutex<ProviderState>,
}

impl PromptingKeyProvider {
    fn prompt<T>(&self, prompt: impl FnOnce(&dyn KeyView) -> Result<T, KeyError>) -> Result<T, KeyError> {
        let _prompting = self
            .prompt_lock
            .try_lock_for(self.prompt_timeout)
            .ok_or_else(|| KeyError::PromptingTimeout {
                resource: self.resource.clone(),
                timeout: self.prompt_timeout,
            })?;
        prompt(self.view.as_ref())
    }

    /// Sleeps until `min_retry_delay` has passed since the last attempt.
    fn throttle(&self, last_attempt: Option<Instant>) {
        let Some(last_attempt) = last_attempt else {
            return;
        };
        let deadline = last_attempt + self.min_retry_delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tracing::debug!(resource = %self.resource, wait = ?(deadline - now), "throttling key retry");
            thread::sleep(deadline - now);
        }
    }
}

impl KeyProvider for PromptingKeyProvider {
    fn retrieve_write_key(&self) -> Result<SecretKey, KeyError> {
        if let Some(key) = &self.state.lock().key {
            return Ok(key.clone());
        }
        let key = self.prompt(|view| view.prompt_write_key(&self.resource))?;
        self.state.lock().key = Some(key.clone());
        Ok(key)
    }

    fn retrieve_read_key(&self, invalid: bool) -> Result<SecretKey, KeyError> {
        let last_attempt = {
            let mut state = self.state.lock();
            if invalid {
                state.key = None;
            } else if let Some(key) = &state.key {
                return Ok(key.clone());
            }
            state.last_attempt
        };
        if invalid {
            self.throttle(last_attempt);
        }
        let result = self.prompt(|view| view.prompt_read_key(&self.resource, invalid));
        let mut state = self.state.lock();
        state.last_attempt = Some(Instant::now());
        let key = result?;
        state.key = Some(key.clone());
        Ok(key)
    }
}

/// Hands out one prompting provider per resource, sharing a single prompt lock.
pub struct PromptingKeyManager {
    view: Arc<dyn KeyView>,
    config: KeyConfig,
    prompt_lock: Arc<Mutex<()>>,
    providers: Mutex<HashMap<String, Arc<PromptingKeyProvider>>>,
}

impl PromptingKeyManager {
    pub fn new(view: Arc<dyn KeyView>, config: KeyConfig) -> Self {
        Self {
            view,
            config,
            prompt_lock: Arc::default(),
            providers: Mutex::default(),
        }
    }
}

impl KeyManager for PromptingKeyManager {
    fn provider(&self, resource: &str) -> Arc<dyn KeyProvider> {
        let mut providers = self.providers.lock();
        let provider = providers.entry(resource.to_string()).or_insert_with(|| {
            Arc::new(PromptingKeyProvider {
                resource: resource.to_string(),
                view: Arc::clone(&self.view),
                prompt_lock: Arc::clone(&self.prompt_lock),
                prompt_timeout: self.config.prompt_timeout(),
                min_retry_delay: self.config.min_retry_delay(),
                state: Mutex::default(),
            })
        });
        Arc::clone(provider) as Arc<dyn KeyProvider>
    }

    fn unlink(&self, resource: &str) {
        self.providers.lock().remove(resource);
    }
}

/// Key managers by key parameter type, e.g. `"aes-pbe"`.
#[derive(Clone, Default)]
pub struct KeyManagerRegistry {
    managers: HashMap<String, Arc<dyn KeyManager>>,
}

impl KeyManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key_type: &str, manager: Arc<dyn KeyManager>) {
        self.managers.insert(key_type.to_string(), manager);
    }

    pub fn manager(&self, key_type: &str) -> FsResult<Arc<dyn KeyManager>> {
        self.managers
            .get(key_type)
            .cloned()
            .ok_or_else(|| FsError::Unsupported(format!("no key manager for {}", key_type)))
    }
}

impl fmt::Debug for KeyManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.managers.keys().collect();
        types.sort();
        f.debug_struct("KeyManagerRegistry").field("types", &types).finish()
    }
}
