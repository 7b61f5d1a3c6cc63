//! Message encoders.
//!
//! A [`Coder`] turns plain text, XMPP stanzas and files into the
//! encrypted wire encoding and back.  [`PgpCoder`] is the OpenPGP
//! implementation.
//!
//! Decryption distinguishes two kinds of problems.  Fatal problems
//! abort the operation and are returned as `Err`.  Other problems,
//! like a signature that does not verify or an unexpected sender,
//! are collected in the output next to the decrypted data, leaving
//! the decision to the caller.

use std::io::{Read, Write};
use std::time::SystemTime;

use crate::Result;
use crate::errors::{DecryptError, VerifyError};
use crate::flags::SecurityFlags;

mod pgp;
pub mod stanza;

pub use pgp::PgpCoder;

/// Encrypts and decrypts messages.
pub trait Coder {
    /// Returns the security features this coder provides.
    fn supported_flags(&self) -> SecurityFlags;

    /// Encrypts a plain text message.
    fn encrypt_text(&self, text: &str) -> Result<Vec<u8>>;

    /// Encrypts a serialized XMPP stanza.
    fn encrypt_stanza(&self, xml: &str) -> Result<Vec<u8>>;

    /// Decrypts a message created by [`Coder::encrypt_text`] or
    /// [`Coder::encrypt_stanza`].
    ///
    /// If `verify` is set, the signature and the envelope are checked
    /// against the sender's key.
    fn decrypt_text(&self, encrypted: &[u8], verify: bool)
                    -> std::result::Result<DecryptOutput, DecryptError>;

    /// Encrypts a file.
    fn encrypt_file(&self, input: &mut dyn Read,
                    output: &mut (dyn Write + Send + Sync)) -> Result<()>;

    /// Decrypts a file, streaming the plaintext to `output`.
    ///
    /// Non-fatal problems are appended to `errors`.
    fn decrypt_file(&self, input: &mut (dyn Read + Send + Sync), verify: bool,
                    output: &mut dyn Write, errors: &mut Vec<DecryptError>)
                    -> std::result::Result<(), DecryptError>;

    /// Verifies signed, unencrypted data.
    fn verify_text(&self, signed: &[u8], verify: bool)
                   -> std::result::Result<VerifyOutput, VerifyError>;
}

/// The result of decrypting a message.
#[derive(Debug)]
pub struct DecryptOutput {
    pub(crate) body: String,
    pub(crate) mime: Option<String>,
    pub(crate) timestamp: Option<SystemTime>,
    pub(crate) errors: Vec<DecryptError>,
    pub(crate) features: SecurityFlags,
}

impl DecryptOutput {
    /// Returns the message body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the content type of the body.
    ///
    /// This is `None` if the envelope could not be parsed.
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Returns the time of sending declared by the envelope.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Returns the problems found while decrypting.
    pub fn errors(&self) -> &[DecryptError] {
        &self.errors
    }

    /// Returns whether any problem was found.
    pub fn has_errors(&self) -> bool {
        ! self.errors.is_empty()
    }

    /// Returns the security flags describing this message.
    ///
    /// These are the features of the message with the error bits of
    /// every collected problem folded in.
    pub fn security_flags(&self) -> SecurityFlags {
        self.errors.iter()
            .fold(self.features, |flags, e| flags | e.kind().security_flag())
    }

    /// Returns the body, consuming the output.
    pub fn into_body(self) -> String {
        self.body
    }
}

/// The result of verifying signed data.
#[derive(Debug)]
pub struct VerifyOutput {
    pub(crate) body: String,
    pub(crate) timestamp: Option<SystemTime>,
    pub(crate) errors: Vec<VerifyError>,
}

impl VerifyOutput {
    /// Returns the signed text.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the date of the literal data packet.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Returns the problems found while verifying.
    pub fn errors(&self) -> &[VerifyError] {
        &self.errors
    }
}
