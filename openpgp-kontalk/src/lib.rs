//! OpenPGP key management and end-to-end encryption for Kontalk.
//!
//! A Kontalk identity is an OpenPGP certificate with three keys: the
//! primary key authenticates the user to the server, one subkey signs
//! messages and one subkey receives encrypted messages.  This crate
//! manages these keys ([`PersonalKey`]), derives the X.509 certificate
//! used to log in ([`bridge`]), moves keys between devices
//! ([`keypack`]), and encrypts and decrypts messages ([`coder`]).
//!
//! # Examples
//!
//! ```
//! use std::time::{Duration, SystemTime};
//! use kontalk_openpgp::{Coder, CryptoContext, PersonalKey, PgpCoder};
//!
//! # fn main() -> kontalk_openpgp::Result<()> {
//! let ctx = CryptoContext::new("kontalk.net");
//! let created = SystemTime::now() - Duration::from_secs(60);
//!
//! let alice = PersonalKey::create(created)?;
//! let alice_ring = alice.store_network("alice", "kontalk.net", "Alice", "pw")?;
//! let alice = PersonalKey::from_ring(&alice_ring, "pw", None)?;
//!
//! let bob = PersonalKey::create(created)?;
//! let bob_ring = bob.store_network("bob", "kontalk.net", "Bob", "pw")?;
//! let bob = PersonalKey::from_ring(&bob_ring, "pw", None)?;
//!
//! let recipients = [bob_ring.public().clone()];
//! let encrypted = PgpCoder::for_recipients(&ctx, &alice, &recipients)
//!     .encrypt_text("Hello Bob!")?;
//!
//! let out = PgpCoder::from_sender(&ctx, &bob, Some(alice_ring.public()))
//!     .decrypt_text(&encrypted, true)?;
//! assert_eq!(out.body(), "Hello Bob!");
//! assert!(out.errors().is_empty());
//! # Ok(()) }
//! ```

#![warn(missing_docs)]

use sequoia_openpgp as openpgp;

/// Crate result specialization.
pub use openpgp::Result;

pub mod bridge;
pub mod coder;
pub mod context;
pub mod cpim;
pub mod errors;
pub mod flags;
pub mod keypack;
pub mod keys;
pub mod personal;
pub mod userid;

pub use crate::bridge::BridgeCertificate;
pub use crate::coder::{Coder, DecryptOutput, PgpCoder, VerifyOutput};
pub use crate::context::CryptoContext;
pub use crate::errors::{
    DecryptError, DecryptErrorKind, Error, VerifyError, VerifyErrorKind,
};
pub use crate::flags::SecurityFlags;
pub use crate::keys::{DecryptedKeyRing, KeyPair, KeyPairRing, KeyRoleAssignment};
pub use crate::personal::PersonalKey;
pub use crate::userid::PgpUserId;
