//! Key material primitives.
//!
//! A Kontalk identity is an OpenPGP certificate carrying three keys:
//! the primary key is used for authentication, one subkey signs, one
//! subkey encrypts.  Older identities have no authentication flag on
//! the primary key; in that case the primary key also signs, and the
//! only subkey encrypts.  [`KeyRoleAssignment`] records which of the
//! two layouts a certificate uses.

use std::fmt;
use std::time::SystemTime;

use sequoia_openpgp as openpgp;
use openpgp::{Cert, Fingerprint, KeyID, Packet};
use openpgp::cert::CertParser;
use openpgp::crypto::{self, Password};
use openpgp::packet::Key;
use openpgp::packet::Signature;
use openpgp::packet::key::{
    self, PrimaryRole, PublicParts, SecretParts, UnspecifiedRole,
};
use openpgp::parse::Parse;
use openpgp::policy::Policy;
use openpgp::types::{KeyFlags, PublicKeyAlgorithm, RevocationStatus};

use crate::Result;
use crate::errors::Error;

/// The key may be used to certify other keys.
pub const CAN_CERTIFY: u8 = 0x01;
/// The key may be used to sign data.
pub const CAN_SIGN: u8 = 0x02;
/// The key may be used to encrypt communications.
pub const CAN_ENCRYPT_COMMS: u8 = 0x04;
/// The key may be used to encrypt storage.
pub const CAN_ENCRYPT_STORAGE: u8 = 0x08;
/// The key may be used for authentication.
pub const CAN_AUTHENTICATE: u8 = 0x20;

/// A public key with an unspecified role.
pub type PublicKey = Key<PublicParts, UnspecifiedRole>;

/// A secret key with an unspecified role.
pub type SecretKey = Key<SecretParts, UnspecifiedRole>;

/// An asymmetric key pair with unencrypted secret material.
#[derive(Clone)]
pub struct KeyPair {
    key: SecretKey,
    /// The same key without secret material.
    public: PublicKey,
}

impl KeyPair {
    /// Wraps a key whose secret material is not encrypted.
    pub fn new(key: SecretKey) -> Result<Self> {
        if ! key.has_unencrypted_secret() {
            return Err(Error::InvalidKeyData(
                "secret key material is encrypted".into()).into());
        }
        let (public, _) = key.clone().take_secret();
        Ok(KeyPair { key, public })
    }

    /// Returns the public component.
    ///
    /// The returned key carries no secret material.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the key with its secret component.
    pub fn secret(&self) -> &SecretKey {
        &self.key
    }

    /// Returns a signer and decryptor backed by this key.
    pub fn to_crypto(&self) -> Result<crypto::KeyPair> {
        self.key.clone().into_keypair()
    }

    /// Returns the fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.key.fingerprint()
    }

    /// Returns the key ID.
    pub fn keyid(&self) -> KeyID {
        self.key.keyid()
    }

    /// Returns the public key algorithm.
    pub fn pk_algo(&self) -> PublicKeyAlgorithm {
        self.key.pk_algo()
    }

    /// Returns the creation time.
    pub fn creation_time(&self) -> SystemTime {
        self.key.creation_time()
    }

    /// Replaces the public component, keeping the secret.
    ///
    /// Both components must belong to the same key.
    pub(crate) fn with_public(&self, public: PublicKey) -> Result<Self> {
        if public.fingerprint() != self.key.fingerprint() {
            return Err(Error::InvalidKeyData(
                "public key does not match secret key".into()).into());
        }
        let (key, _) = public.clone().add_secret(self.key.secret().clone());
        let (public, _) = public.take_secret();
        Ok(KeyPair { key, public })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.key.fingerprint())
            .field("pk_algo", &self.key.pk_algo())
            .finish()
    }
}

/// How key roles are derived from a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRoleAssignment {
    /// The primary key is flagged for authentication; subkeys are
    /// told apart by their signing flag.
    Flagged,
    /// The primary key authenticates and signs; the subkey encrypts.
    Legacy,
}

impl KeyRoleAssignment {
    /// Detects the layout of `cert`.
    pub fn of(cert: &Cert) -> Self {
        if key_flags(cert, cert.primary_key().key()) & CAN_AUTHENTICATE != 0 {
            KeyRoleAssignment::Flagged
        } else {
            KeyRoleAssignment::Legacy
        }
    }
}

/// The fingerprints of the three role keys of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleFingerprints {
    /// The authentication key.
    pub auth: Fingerprint,
    /// The signing key.
    pub sign: Fingerprint,
    /// The encryption key.
    pub encrypt: Fingerprint,
}

/// Assigns the three roles to the keys of `cert`.
///
/// Fails with [`Error::InvalidKeyData`] if a role stays vacant.
pub fn assign_roles(cert: &Cert)
                    -> Result<(KeyRoleAssignment, RoleFingerprints)>
{
    let assignment = KeyRoleAssignment::of(cert);
    let auth = cert.fingerprint();
    let mut sign = match assignment {
        KeyRoleAssignment::Legacy => Some(auth.clone()),
        KeyRoleAssignment::Flagged => None,
    };
    let mut encrypt = None;

    for ka in cert.keys().subkeys() {
        let fpr = ka.key().fingerprint();
        if key_flags(cert, ka.key()) & CAN_SIGN != 0 {
            sign = Some(fpr);
        } else {
            encrypt = Some(fpr);
        }
    }

    match (sign, encrypt) {
        (Some(sign), Some(encrypt)) =>
            Ok((assignment, RoleFingerprints { auth, sign, encrypt })),
        _ => Err(Error::InvalidKeyData("invalid key data".into()).into()),
    }
}

/// The three unlocked key pairs of an identity.
#[derive(Debug, Clone)]
pub struct DecryptedKeyRing {
    auth: KeyPair,
    sign: KeyPair,
    encrypt: KeyPair,
}

impl DecryptedKeyRing {
    /// Assembles a ring from its three key pairs.
    pub fn new(auth: KeyPair, sign: KeyPair, encrypt: KeyPair) -> Self {
        DecryptedKeyRing { auth, sign, encrypt }
    }

    /// Unlocks the role keys of `ring` with `passphrase`.
    ///
    /// Roles are assigned from the public certificate, secrets are
    /// looked up by fingerprint in the secret certificate.
    pub fn unlock(ring: &KeyPairRing, passphrase: &Password) -> Result<Self> {
        let (assignment, roles) = assign_roles(ring.public())?;
        log::debug!("unlocking {:?} key ring {}", assignment, roles.auth);

        let unlock = |fpr: &Fingerprint| -> Result<KeyPair> {
            let key = ring.secret().keys().secret()
                .find(|ka| &ka.key().fingerprint() == fpr)
                .map(|ka| ka.key().clone())
                .ok_or_else(|| Error::InvalidKeyData("invalid key data".into()))?;
            KeyPair::new(unlock_secret(key, passphrase)?)
        };

        let auth = unlock(&roles.auth)?;
        let sign = if roles.sign == roles.auth {
            auth.clone()
        } else {
            unlock(&roles.sign)?
        };
        let encrypt = unlock(&roles.encrypt)?;
        Ok(DecryptedKeyRing { auth, sign, encrypt })
    }

    /// Returns the authentication key pair.
    pub fn auth(&self) -> &KeyPair {
        &self.auth
    }

    /// Returns the signing key pair.
    pub fn sign(&self) -> &KeyPair {
        &self.sign
    }

    /// Returns the encryption key pair.
    pub fn encrypt(&self) -> &KeyPair {
        &self.encrypt
    }

    pub(crate) fn set_auth(&mut self, auth: KeyPair) {
        if self.sign.fingerprint() == self.auth.fingerprint() {
            self.sign = auth.clone();
        }
        self.auth = auth;
    }
}

/// Decrypts the secret material of `key`, if it is encrypted.
pub(crate) fn unlock_secret<R>(key: Key<SecretParts, R>, passphrase: &Password)
                               -> Result<Key<SecretParts, R>>
    where R: key::KeyRole
{
    if key.has_unencrypted_secret() {
        Ok(key)
    } else {
        key.decrypt_secret(passphrase)
            .map_err(|_| Error::BadPassphrase.into())
    }
}

/// A public certificate with its secret counterpart.
#[derive(Debug, Clone)]
pub struct KeyPairRing {
    public: Cert,
    secret: Cert,
}

impl KeyPairRing {
    /// Pairs a public certificate with a secret one.
    ///
    /// `public` must not carry secret key material.
    pub fn new(public: Cert, secret: Cert) -> Result<Self> {
        if public.is_tsk() {
            return Err(Error::InvalidKeyData(
                "public ring contains secret key material".into()).into());
        }
        if ! secret.is_tsk() {
            return Err(Error::InvalidKeyData(
                "no secret key material".into()).into());
        }
        if public.fingerprint() != secret.fingerprint() {
            return Err(Error::InvalidKeyData(
                "public and secret rings do not match".into()).into());
        }
        Ok(KeyPairRing { public, secret })
    }

    /// Loads rings in binary (or ASCII-armored) form.
    pub fn load(secret: &[u8], public: &[u8]) -> Result<Self> {
        Self::new(parse_public_ring(public)?, parse_public_ring(secret)?)
    }

    /// Loads ASCII-armored rings.
    pub fn load_armored(secret: &[u8], public: &[u8]) -> Result<Self> {
        for data in &[secret, public] {
            if ! is_armored(data) {
                return Err(Error::InvalidKeyData(
                    "armor header not found".into()).into());
            }
        }
        Self::load(secret, public)
    }

    /// Returns the public certificate.
    pub fn public(&self) -> &Cert {
        &self.public
    }

    /// Returns the secret certificate.
    pub fn secret(&self) -> &Cert {
        &self.secret
    }

    /// Returns the public and secret certificates.
    pub fn into_parts(self) -> (Cert, Cert) {
        (self.public, self.secret)
    }
}

fn is_armored(data: &[u8]) -> bool {
    let start = data.iter()
        .position(|b| ! b.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(b"-----BEGIN PGP")
}

/// Parses the first certificate in `data`.
///
/// `data` may be binary or ASCII-armored.
pub fn parse_public_ring(data: &[u8]) -> Result<Cert> {
    match CertParser::from_bytes(data)?.next() {
        Some(cert) => cert,
        None => Err(Error::InvalidKeyData("invalid keyring data".into()).into()),
    }
}

/// Reads a public key from a bare key packet or a key ring.
///
/// The first key packet is returned.
pub fn read_public_key(data: &[u8]) -> Result<PublicKey> {
    let pile = openpgp::PacketPile::from_bytes(data)?;
    read_public_key_packets(pile.children())
}

pub(crate) fn read_public_key_packets<'a, I>(packets: I) -> Result<PublicKey>
    where I: IntoIterator<Item = &'a Packet>
{
    packets.into_iter()
        .find_map(|p| match p {
            Packet::PublicKey(k) => Some(k.clone().role_into_unspecified()),
            Packet::PublicSubkey(k) => Some(k.clone().role_into_unspecified()),
            Packet::SecretKey(k) =>
                Some(k.clone().parts_into_public().role_into_unspecified()),
            Packet::SecretSubkey(k) =>
                Some(k.clone().parts_into_public().role_into_unspecified()),
            _ => None,
        })
        .ok_or_else(|| Error::InvalidKeyData("no public key found".into()).into())
}

/// Returns the primary key of `cert`.
pub fn master_key(cert: &Cert) -> Option<Key<PublicParts, PrimaryRole>> {
    Some(cert.primary_key().key().clone())
}

/// Returns the uppercase hexadecimal fingerprint of `key`.
pub fn fingerprint<P, R>(key: &Key<P, R>) -> String
    where P: key::KeyParts, R: key::KeyRole
{
    key.fingerprint().to_hex()
}

/// Groups a hexadecimal fingerprint for display.
///
/// ```
/// # use kontalk_openpgp::keys::format_fingerprint;
/// assert_eq!(format_fingerprint("0123456789ABCDEF"),
///            "0123 4567  89AB CDEF");
/// ```
pub fn format_fingerprint(fpr: &str) -> String {
    let len = fpr.len();
    let mut out = String::with_capacity(len + len / 4 + 1);
    for (i, c) in fpr.chars().enumerate() {
        if i > 0 && i % 4 == 0 {
            out.push(' ');
            if i == len / 2 {
                out.push(' ');
            }
        }
        out.push(c);
    }
    out
}

/// Returns the `openpgp4fpr:` URI for a fingerprint.
pub fn fingerprint_uri(fpr: &str) -> String {
    format!("openpgp4fpr:{}", fpr)
}

fn flag_bits(flags: &KeyFlags) -> u8 {
    let mut bits = 0;
    if flags.for_certification() {
        bits |= CAN_CERTIFY;
    }
    if flags.for_signing() {
        bits |= CAN_SIGN;
    }
    if flags.for_transport_encryption() {
        bits |= CAN_ENCRYPT_COMMS;
    }
    if flags.for_storage_encryption() {
        bits |= CAN_ENCRYPT_STORAGE;
    }
    if flags.for_authentication() {
        bits |= CAN_AUTHENTICATE;
    }
    bits
}

/// Returns the self-signatures made over `key`.
///
/// For the primary key these are the direct key signatures followed
/// by the user ID bindings.
pub(crate) fn self_signatures<'a, P, R>(cert: &'a Cert, key: &Key<P, R>)
                             -> Vec<&'a Signature>
    where P: key::KeyParts, R: key::KeyRole
{
    let fpr = key.fingerprint();
    if fpr == cert.fingerprint() {
        let mut sigs: Vec<&Signature> =
            cert.primary_key().bundle().self_signatures().into_iter().collect();
        for uid in cert.userids() {
            sigs.extend(uid.bundle().self_signatures());
        }
        sigs
    } else {
        cert.keys().subkeys()
            .find(|ka| ka.key().fingerprint() == fpr)
            .map(|ka| ka.bundle().self_signatures().into_iter().collect())
            .unwrap_or_default()
    }
}

/// Returns the capability flags of `key` as a bitmask.
///
/// The flags are read from the first self-signature carrying them.
/// Returns 0 if there is none.
pub fn key_flags<P, R>(cert: &Cert, key: &Key<P, R>) -> u8
    where P: key::KeyParts, R: key::KeyRole
{
    self_signatures(cert, key).into_iter()
        .find_map(|sig| sig.key_flags())
        .map(|flags| flag_bits(&flags))
        .unwrap_or(0)
}

/// Returns the key a peer signs with.
///
/// This is the first subkey flagged for signing, or the primary key.
pub fn signing_key(cert: &Cert) -> Option<PublicKey> {
    cert.keys().subkeys()
        .find(|ka| key_flags(cert, ka.key()) & CAN_SIGN != 0)
        .map(|ka| ka.key().clone().role_into_unspecified())
        .or_else(|| master_key(cert).map(|k| k.role_into_unspecified()))
}

/// Returns the key to encrypt to a peer.
///
/// This is the first subkey flagged for encrypting communications,
/// or the first subkey with an encryption-capable algorithm.
pub fn encryption_key(cert: &Cert) -> Option<PublicKey> {
    cert.keys().subkeys()
        .find(|ka| key_flags(cert, ka.key()) & CAN_ENCRYPT_COMMS != 0)
        .or_else(|| cert.keys().subkeys()
                 .find(|ka| ka.key().pk_algo().for_encryption()))
        .map(|ka| ka.key().clone().role_into_unspecified())
}

/// Returns whether `cert` carries a valid revocation at time `t`.
pub fn is_revoked(cert: &Cert, policy: &dyn Policy, t: SystemTime) -> bool {
    matches!(cert.revocation_status(policy, t), RevocationStatus::Revoked(_))
}

/// Returns the primary key if it is flagged for authentication.
pub fn authentication_key(cert: &Cert) -> Option<PublicKey> {
    let primary = cert.primary_key().key();
    if key_flags(cert, primary) & CAN_AUTHENTICATE != 0 {
        Some(primary.clone().role_into_unspecified())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    use openpgp::cert::prelude::*;

    #[test]
    fn format() {
        let fpr = "8B3D1C8C43E7D1A6C1A4A4A7D1E2F3A4B5C6D7E8";
        assert_eq!(format_fingerprint(fpr),
                   "8B3D 1C8C 43E7 D1A6 C1A4  A4A7 D1E2 F3A4 B5C6 D7E8");
        assert_eq!(fingerprint_uri(fpr),
                   "openpgp4fpr:8B3D1C8C43E7D1A6C1A4A4A7D1E2F3A4B5C6D7E8");
        assert_eq!(format_fingerprint(""), "");
    }

    #[derive(Clone, Debug)]
    struct Hex(String);

    impl Arbitrary for Hex {
        fn arbitrary(g: &mut Gen) -> Self {
            let digits = b"0123456789ABCDEF";
            let groups = usize::arbitrary(g) % 16 + 1;
            Hex((0..groups * 8)
                .map(|_| *g.choose(digits).unwrap_or(&b'0') as char)
                .collect())
        }
    }

    #[quickcheck]
    fn format_keeps_digits(fpr: Hex) -> bool {
        let formatted = format_fingerprint(&fpr.0);
        formatted.replace(' ', "") == fpr.0
            && formatted == format_fingerprint(&fpr.0)
            && formatted.matches("  ").count() == 1
    }

    #[test]
    fn flags_and_roles() -> Result<()> {
        let (cert, _) = CertBuilder::new()
            .set_primary_key_flags(KeyFlags::empty()
                                   .set_authentication()
                                   .set_certification())
            .add_userid("Alice <alice@kontalk.net>")
            .add_signing_subkey()
            .add_transport_encryption_subkey()
            .generate()?;

        let primary = cert.primary_key().key();
        assert_eq!(key_flags(&cert, primary), CAN_AUTHENTICATE | CAN_CERTIFY);
        assert_eq!(KeyRoleAssignment::of(&cert), KeyRoleAssignment::Flagged);

        let (assignment, roles) = assign_roles(&cert)?;
        assert_eq!(assignment, KeyRoleAssignment::Flagged);
        assert_eq!(roles.auth, cert.fingerprint());
        assert_ne!(roles.sign, roles.auth);
        assert_ne!(roles.encrypt, roles.sign);

        assert_eq!(signing_key(&cert).map(|k| k.fingerprint()),
                   Some(roles.sign.clone()));
        assert_eq!(encryption_key(&cert).map(|k| k.fingerprint()),
                   Some(roles.encrypt.clone()));
        assert_eq!(authentication_key(&cert).map(|k| k.fingerprint()),
                   Some(roles.auth));
        Ok(())
    }

    #[test]
    fn missing_role() -> Result<()> {
        let (cert, _) = CertBuilder::new()
            .add_userid("Bob <bob@kontalk.net>")
            .add_signing_subkey()
            .generate()?;
        assert!(assign_roles(&cert).is_err());
        assert!(authentication_key(&cert).is_none());
        Ok(())
    }

    #[test]
    fn parse_ring() -> Result<()> {
        use openpgp::serialize::SerializeInto;

        let (cert, _) = CertBuilder::general_purpose(
            None, Some("Carol <carol@kontalk.net>")).generate()?;

        let binary = cert.to_vec()?;
        let armored = cert.armored().to_vec()?;
        assert_eq!(parse_public_ring(&binary)?.fingerprint(),
                   cert.fingerprint());
        assert_eq!(parse_public_ring(&armored)?.fingerprint(),
                   cert.fingerprint());
        assert!(parse_public_ring(b"").is_err());

        assert_eq!(read_public_key(&binary)?.fingerprint(),
                   cert.fingerprint());
        let bare = Packet::from(cert.primary_key().key().clone()).to_vec()?;
        assert_eq!(read_public_key(&bare)?.fingerprint(),
                   cert.fingerprint());

        assert_eq!(fingerprint(cert.primary_key().key()),
                   cert.fingerprint().to_hex());
        Ok(())
    }

    #[test]
    fn unlock_secret_key() -> Result<()> {
        let (cert, _) = CertBuilder::new()
            .set_password(Some("secret".into()))
            .generate()?;
        let key = cert.primary_key().key().clone().parts_into_secret()?;

        assert!(unlock_secret(key.clone(), &"wrong".into()).is_err());
        let unlocked = unlock_secret(key, &"secret".into())?;
        assert!(unlocked.has_unencrypted_secret());
        assert!(KeyPair::new(unlocked.role_into_unspecified()).is_ok());
        Ok(())
    }
}
