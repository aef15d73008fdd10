//! Error types for `tenant-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto and vault errors never include key material or
//! plaintext credentials — only identifiers and operation descriptions.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from the credential vault (C1).
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No key is registered under the requested key version.
    #[error("unknown key version: {version}")]
    UnknownKeyVersion { version: u8 },

    /// A cipher blob's serialized form is malformed (truncated header, bad
    /// version byte, non-base64 payload).
    #[error("malformed cipher blob: {reason}")]
    MalformedBlob { reason: String },

    /// The configured master key material is invalid (wrong length, empty).
    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    /// A cryptographic operation within the vault failed.
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from the durable job engine's pure state-machine logic (C8).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The requested state transition is not legal from the job's current
    /// status (e.g. completing a job that is not `running`).
    #[error("illegal transition for job {job_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        job_id: uuid::Uuid,
        from: JobStatusLabel,
        to: JobStatusLabel,
    },

    /// The job has already exhausted its retry budget.
    #[error("job {job_id} has exhausted its retry budget ({max_attempts} attempts)")]
    RetriesExhausted {
        job_id: uuid::Uuid,
        max_attempts: u32,
    },

    /// Invalid job definition (missing handler name, invalid payload, zero
    /// max_attempts).
    #[error("invalid job definition: {reason}")]
    InvalidDefinition { reason: String },
}

/// A display-only label for [`JobError::IllegalTransition`], avoiding a
/// circular dependency on the full `JobStatus` enum's non-`Copy` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusLabel {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

/// Errors from cron schedule computation (C9).
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The IANA timezone name is not recognized.
    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    /// The expression has no upcoming occurrence (practically unreachable
    /// for standard 5-field cron, but the `cron` crate's iterator is
    /// technically fallible).
    #[error("cron expression '{expression}' produced no upcoming occurrence")]
    NoUpcomingOccurrence { expression: String },
}

/// Errors from integration token lifecycle logic (C6/C7).
#[derive(Debug, thiserror::Error)]
pub enum TokenRegistryError {
    /// The token was not found in the registry.
    #[error("integration token not found: {token_id}")]
    NotFound { token_id: uuid::Uuid },

    /// The token has a sticky status (`revoked` or `refresh_failed`) that
    /// blocks the requested operation.
    #[error("token {token_id} is {status} and cannot be refreshed automatically")]
    Blocked { token_id: uuid::Uuid, status: String },

    /// No refresh provider is registered for the token's provider name.
    #[error("no refresh provider registered for '{provider}'")]
    NoProvider { provider: String },

    /// The vault failed to wrap or unwrap the token's credential material.
    #[error("token vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Top-level aggregate error for callers that cross subsystem boundaries
/// (e.g. a job handler that touches the vault and the token registry in
/// the same operation).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    TokenRegistry(#[from] TokenRegistryError),
}
