//! Encrypts request payloads with a vendor-supplied Go/WASM crypto module.
//!
//! [`CryptoBridge`] owns the module bytecode and a lazily started guest
//! runtime. Each payload is serialized to JSON, handed to the entrypoint the
//! guest registers during startup, and the ciphertext string is returned.
//! Every failure surfaces as a [`CryptoBridgeError`].

pub use crate::envelope::*;
use gojs_host::*;
use serde::*;
use thiserror::*;

mod envelope;

pub use gojs_host::{DefaultHost, GuestError, Host};

/// Runs the guest crypto module and keeps it alive between payloads.
pub struct CryptoBridge<H: Host = DefaultHost> {
    /// The guest module bytecode.
    bytecode: Vec<u8>,
    /// The started guest, if startup has happened and no fatal error has occurred since.
    runtime: Option<GuestRuntime<H>>
}

impl<H: Host> CryptoBridge<H> {
    /// Creates a bridge over the given guest bytecode. The guest is not started until the first payload.
    pub fn new(bytecode: impl Into<Vec<u8>>) -> Self {
        Self {
            bytecode: bytecode.into(),
            runtime: None
        }
    }

    /// Starts the guest now rather than on the first payload.
    pub fn start(&mut self) -> Result<(), CryptoBridgeError> {
        self.runtime().map(|_| ())
    }

    /// Whether a started guest is being kept for the next payload.
    pub fn is_started(&self) -> bool {
        self.runtime.is_some()
    }

    /// Encrypts a payload that is already JSON text.
    pub fn encrypt_json(&mut self, payload_json: &str) -> Result<String, CryptoBridgeError> {
        let result = self.runtime()?.invoke(payload_json);
        if let Err(error) = &result {
            if error.is_fatal() {
                tracing::warn!(%error, "Discarding guest runtime after fatal error");
                self.runtime = None;
            }
        }

        Ok(result?)
    }

    /// Serializes `payload` to JSON and encrypts it.
    pub fn encrypt<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<String, CryptoBridgeError> {
        let payload_json = serde_json::to_string(payload).map_err(CryptoBridgeError::Payload)?;
        self.encrypt_json(&payload_json)
    }

    /// Encrypts `payload` and wraps the ciphertext in the request envelope.
    pub fn encrypt_envelope<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<serde_json::Value, CryptoBridgeError> {
        let envelope = Envelope::new(self.encrypt(payload)?);
        serde_json::to_value(envelope).map_err(CryptoBridgeError::Payload)
    }

    /// The started guest runtime, starting a fresh one if needed.
    fn runtime(&mut self) -> Result<&mut GuestRuntime<H>, CryptoBridgeError> {
        if self.runtime.is_none() {
            let mut runtime = GuestRuntime::<H>::new();
            runtime.start(&self.bytecode)?;
            tracing::debug!(len = self.bytecode.len(), "Started crypto guest");
            self.runtime = Some(runtime);
        }

        self.runtime.as_mut().ok_or_else(|| CryptoBridgeError::Guest(GuestError::NotInitialized(H::ENTRYPOINT.to_string())))
    }
}

impl<H: Host> std::fmt::Debug for CryptoBridge<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBridge")
            .field("bytecode_len", &self.bytecode.len())
            .field("started", &self.is_started())
            .finish()
    }
}

/// The single error kind surfaced by [`CryptoBridge`].
#[derive(Debug, Error)]
pub enum CryptoBridgeError {
    /// The guest could not be started or failed while encrypting.
    #[error("{0}")]
    Guest(#[from] GuestError),
    /// The payload could not be converted to or from JSON.
    #[error("Could not serialize payload: {0}")]
    Payload(serde_json::Error)
}

impl CryptoBridgeError {
    /// The guest error behind this failure, if there is one.
    pub fn guest(&self) -> Option<&GuestError> {
        match self {
            Self::Guest(x) => Some(x),
            Self::Payload(_) => None
        }
    }

    /// Whether the guest itself rejected the payload, so that a different payload could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Guest(GuestError::GuestException(_)))
    }
}
