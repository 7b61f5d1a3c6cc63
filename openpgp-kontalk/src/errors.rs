//! Error types.
//!
//! Key management operations return [`Error`] wrapped in an
//! `anyhow::Error`, the same way `sequoia_openpgp` does.  The coder
//! uses the two-tier [`DecryptError`]/[`VerifyError`] types instead:
//! a value of these types is either returned (the operation was
//! aborted) or collected alongside a best-effort result.

use std::fmt;

use sequoia_openpgp::types::PublicKeyAlgorithm;

use crate::flags::SecurityFlags;

/// Errors raised by key management operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key material could not be parsed or is incomplete.
    #[error("Invalid key data: {0}")]
    InvalidKeyData(String),

    /// The crypto backend failed to generate a key.
    #[error("Unable to generate keypair: {0}")]
    KeyGeneration(String),

    /// The secret key material could not be unlocked.
    #[error("Bad passphrase")]
    BadPassphrase,

    /// The algorithm is not supported by this operation.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(PublicKeyAlgorithm),

    /// A freshly created bridge certificate did not verify.
    #[error("Bridge certificate verification failed")]
    BridgeVerification,

    /// Malformed input data.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The operation is not available in the current mode.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The key carries no usable user ID.
    #[error("No user ID found on key")]
    MissingUserId,
}

/// The reason a decryption failed, or a problem found while decrypting.
///
/// The discriminants are stable and may be persisted by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptErrorKind {
    /// The signature did not verify, or could not be checked.
    VerificationFailed = 1,
    /// The session key could not be recovered.
    DecryptFailed = 2,
    /// None of the message's recipients is our encryption key.
    PrivateKeyNotFound = 3,
    /// The envelope sender does not match the sender's key.
    InvalidSender = 4,
    /// We are not listed among the envelope recipients.
    InvalidRecipient = 5,
    /// The envelope timestamp is missing or drifted.
    InvalidTimestamp = 6,
    /// Unexpected or malformed data.
    InvalidData = 7,
    /// The symmetrically encrypted container was tampered with.
    IntegrityCheck = 8,
}

impl DecryptErrorKind {
    /// Returns the numeric code of this kind.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Returns the security flag corresponding to this kind.
    pub fn security_flag(self) -> SecurityFlags {
        use DecryptErrorKind::*;
        match self {
            VerificationFailed => SecurityFlags::INVALID_SIGNATURE,
            DecryptFailed => SecurityFlags::DECRYPT_FAILED,
            PrivateKeyNotFound => SecurityFlags::DECRYPT_FAILED,
            InvalidSender => SecurityFlags::INVALID_SENDER,
            InvalidRecipient => SecurityFlags::INVALID_RECIPIENT,
            InvalidTimestamp => SecurityFlags::INVALID_TIMESTAMP,
            InvalidData => SecurityFlags::INVALID_DATA,
            IntegrityCheck => SecurityFlags::INTEGRITY_CHECK,
        }
    }
}

impl fmt::Display for DecryptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DecryptErrorKind::*;
        f.write_str(match self {
            VerificationFailed => "Verification failed",
            DecryptFailed => "Decryption failed",
            PrivateKeyNotFound => "Private key not found",
            InvalidSender => "Invalid sender",
            InvalidRecipient => "Invalid recipient",
            InvalidTimestamp => "Invalid timestamp",
            InvalidData => "Invalid data",
            IntegrityCheck => "Integrity check failed",
        })
    }
}

/// A decryption error.
///
/// Carries a [`DecryptErrorKind`], an optional detail message, and
/// optionally the low-level error that caused it.
#[derive(Debug)]
pub struct DecryptError {
    kind: DecryptErrorKind,
    detail: Option<String>,
    source: Option<anyhow::Error>,
}

impl DecryptError {
    /// Creates an error with a detail message.
    pub fn new<S: Into<String>>(kind: DecryptErrorKind, detail: S) -> Self {
        DecryptError { kind, detail: Some(detail.into()), source: None }
    }

    /// Wraps a low-level error.
    pub fn wrap<E: Into<anyhow::Error>>(kind: DecryptErrorKind, cause: E)
        -> Self
    {
        DecryptError { kind, detail: None, source: Some(cause.into()) }
    }

    /// Wraps a low-level error, adding a detail message.
    pub fn with_cause<S, E>(kind: DecryptErrorKind, detail: S, cause: E)
        -> Self
        where S: Into<String>, E: Into<anyhow::Error>
    {
        DecryptError {
            kind,
            detail: Some(detail.into()),
            source: Some(cause.into()),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> DecryptErrorKind {
        self.kind
    }

    /// Returns the detail message, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the wrapped low-level error, if any.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.detail, &self.source) {
            (Some(d), _) => write!(f, "{}: {}", self.kind, d),
            (None, Some(e)) => write!(f, "{}: {}", self.kind, e),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for DecryptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| {
            let e: &(dyn std::error::Error + 'static) = e.as_ref();
            e
        })
    }
}

/// The reason a signature verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyErrorKind {
    /// The signature did not verify, or could not be checked.
    VerificationFailed = 1,
    /// Unexpected or malformed data.
    InvalidData = 2,
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            VerifyErrorKind::VerificationFailed => "Verification failed",
            VerifyErrorKind::InvalidData => "Invalid data",
        })
    }
}

/// A verification error.
#[derive(Debug)]
pub struct VerifyError {
    kind: VerifyErrorKind,
    detail: Option<String>,
    source: Option<anyhow::Error>,
}

impl VerifyError {
    /// Creates an error with a detail message.
    pub fn new<S: Into<String>>(kind: VerifyErrorKind, detail: S) -> Self {
        VerifyError { kind, detail: Some(detail.into()), source: None }
    }

    /// Wraps a low-level error.
    pub fn wrap<E: Into<anyhow::Error>>(kind: VerifyErrorKind, cause: E)
        -> Self
    {
        VerifyError { kind, detail: None, source: Some(cause.into()) }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> VerifyErrorKind {
        self.kind
    }

    /// Returns the detail message, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.detail, &self.source) {
            (Some(d), _) => write!(f, "{}: {}", self.kind, d),
            (None, Some(e)) => write!(f, "{}: {}", self.kind, e),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| {
            let e: &(dyn std::error::Error + 'static) = e.as_ref();
            e
        })
    }
}

// Signature problems found during text verification and during
// decryption are reported the same way.
impl From<VerifyError> for DecryptError {
    fn from(e: VerifyError) -> Self {
        let kind = match e.kind {
            VerifyErrorKind::VerificationFailed =>
                DecryptErrorKind::VerificationFailed,
            VerifyErrorKind::InvalidData => DecryptErrorKind::InvalidData,
        };
        DecryptError { kind, detail: e.detail, source: e.source }
    }
}

// Problems found in signed content are reported as verification
// errors when the content was not encrypted.
impl From<DecryptError> for VerifyError {
    fn from(e: DecryptError) -> Self {
        let kind = match e.kind {
            DecryptErrorKind::VerificationFailed =>
                VerifyErrorKind::VerificationFailed,
            _ => VerifyErrorKind::InvalidData,
        };
        VerifyError { kind, detail: e.detail, source: e.source }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(DecryptErrorKind::VerificationFailed.code(), 1);
        assert_eq!(DecryptErrorKind::PrivateKeyNotFound.code(), 3);
        assert_eq!(DecryptErrorKind::IntegrityCheck.code(), 8);
    }

    #[test]
    fn display() {
        let e = DecryptError::new(DecryptErrorKind::InvalidSender,
                                  "Sender does not match sender's key");
        assert_eq!(e.to_string(),
                   "Invalid sender: Sender does not match sender's key");

        let e = DecryptError::wrap(DecryptErrorKind::InvalidData,
                                   Error::InvalidData("truncated".into()));
        assert_eq!(e.to_string(), "Invalid data: Invalid data: truncated");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn verify_into_decrypt() {
        let e: DecryptError = VerifyError::new(
            VerifyErrorKind::VerificationFailed, "bad").into();
        assert_eq!(e.kind(), DecryptErrorKind::VerificationFailed);
        assert_eq!(e.detail(), Some("bad"));

        let e: VerifyError = DecryptError::new(
            DecryptErrorKind::IntegrityCheck, "tampered").into();
        assert_eq!(e.kind(), VerifyErrorKind::InvalidData);
    }
}
