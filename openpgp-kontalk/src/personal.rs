//! The user's personal key.
//!
//! A [`PersonalKey`] holds the three unlocked role keys of the user,
//! the public certificate when it is known, and optionally the X.509
//! bridge certificate.  It is obtained by generating fresh keys
//! ([`PersonalKey::create`]), by unlocking stored rings
//! ([`PersonalKey::load`]), or from the portable blob
//! ([`PersonalKey::from_base64`]).

use std::convert::TryFrom;
use std::io::{Cursor, Read};
use std::time::SystemTime;

use log::info;

use sequoia_openpgp as openpgp;
use openpgp::{Cert, Packet};
use openpgp::cert::CertRevocationBuilder;
use openpgp::cert::amalgamation::key::PrimaryKey;
use openpgp::crypto::Password;
use openpgp::packet::key::{Key4, SecretParts, UnspecifiedRole};
use openpgp::packet::signature::SignatureBuilder;
use openpgp::packet::UserID;
use openpgp::parse::Parse;
use openpgp::serialize::{Serialize, SerializeInto};
use openpgp::types::{
    Curve, HashAlgorithm, KeyFlags, ReasonForRevocation, SignatureType,
};

use crate::Result;
use crate::bridge::{self, BridgeCertificate};
use crate::errors::Error;
use crate::keys::{
    self, DecryptedKeyRing, KeyPair, KeyPairRing, PublicKey, SecretKey,
};
use crate::userid;

/// Minimum length of a passphrase.
pub const MIN_PASSPHRASE_LENGTH: usize = 4;

/// The user's key material.
#[derive(Debug, Clone)]
pub struct PersonalKey {
    ring: DecryptedKeyRing,
    public: Option<Cert>,
    bridge_cert: Option<BridgeCertificate>,
}

impl PersonalKey {
    /// Generates a new set of keys.
    ///
    /// The authentication key is RSA-2048, the signing and encryption
    /// keys are on NIST P-256.  All keys are created at `timestamp`.
    pub fn create(timestamp: SystemTime) -> Result<Self> {
        info!("create personal key");
        let generate = || -> Result<DecryptedKeyRing> {
            let mut auth: Key4<SecretParts, UnspecifiedRole> =
                Key4::generate_rsa(2048)?;
            auth.set_creation_time(timestamp)?;
            let mut sign: Key4<SecretParts, UnspecifiedRole> =
                Key4::generate_ecc(true, Curve::NistP256)?;
            sign.set_creation_time(timestamp)?;
            let mut encrypt: Key4<SecretParts, UnspecifiedRole> =
                Key4::generate_ecc(false, Curve::NistP256)?;
            encrypt.set_creation_time(timestamp)?;

            Ok(DecryptedKeyRing::new(KeyPair::new(auth.into())?,
                                     KeyPair::new(sign.into())?,
                                     KeyPair::new(encrypt.into())?))
        };

        let ring = generate()
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        Ok(PersonalKey { ring, public: None, bridge_cert: None })
    }

    /// Builds the certificate with the user ID `name <email@network>`.
    pub fn store_network(&self, user_id: &str, network: &str, name: &str,
                         passphrase: &str) -> Result<KeyPairRing> {
        self.store(name, &format!("{}@{}", user_id, network), None, passphrase)
    }

    /// Builds the certificate and protects the secrets with
    /// `passphrase`.
    ///
    /// The user ID is `name[ (comment)] <email>`.  The primary key is
    /// flagged for authentication and certification, the signing
    /// subkey carries a primary key binding back signature.
    pub fn store(&self, name: &str, email: &str, comment: Option<&str>,
                 passphrase: &str) -> Result<KeyPairRing> {
        info!("store personal key {}", self.fingerprint());

        let mut uid = name.to_string();
        if let Some(comment) = comment {
            uid.push_str(&format!(" ({})", comment));
        }
        uid.push_str(&format!(" <{}>", email));
        let uid = UserID::from(uid);

        let auth = self.ring.auth();
        let sign = self.ring.sign();
        let encrypt = self.ring.encrypt();
        let legacy = sign.fingerprint() == auth.fingerprint();
        let created = auth.creation_time();

        let mut cert = Cert::try_from(vec![
            Packet::from(auth.public().clone().role_into_primary()),
        ])?;
        let mut signer = auth.to_crypto()?;

        // Legacy rings keep the primary key as signing key.
        let primary_flags = if legacy {
            KeyFlags::empty().set_certification().set_signing()
        } else {
            KeyFlags::empty().set_authentication().set_certification()
        };
        let builder = SignatureBuilder::new(SignatureType::PositiveCertification)
            .set_hash_algo(HashAlgorithm::SHA256)
            .set_signature_creation_time(created)?
            .set_primary_userid(true)?
            .set_key_flags(primary_flags)?;
        let uid_sig = uid.bind(&mut signer, &cert, builder)?;
        cert = cert.insert_packets(vec![Packet::from(uid), uid_sig.into()])?;

        if ! legacy {
            let subkey = sign.public().clone().role_into_subordinate();
            let mut subkey_signer = sign.to_crypto()?;
            let backsig = SignatureBuilder::new(SignatureType::PrimaryKeyBinding)
                .set_hash_algo(HashAlgorithm::SHA256)
                .set_signature_creation_time(created)?
                .sign_primary_key_binding(&mut subkey_signer,
                                          cert.primary_key().key(), &subkey)?;
            let builder = SignatureBuilder::new(SignatureType::SubkeyBinding)
                .set_hash_algo(HashAlgorithm::SHA256)
                .set_signature_creation_time(created)?
                .set_key_flags(KeyFlags::empty().set_signing())?
                .set_embedded_signature(backsig)?;
            let sig = subkey.bind(&mut signer, &cert, builder)?;
            cert = cert.insert_packets(vec![Packet::from(subkey), sig.into()])?;
        }

        let subkey = encrypt.public().clone().role_into_subordinate();
        let builder = SignatureBuilder::new(SignatureType::SubkeyBinding)
            .set_hash_algo(HashAlgorithm::SHA256)
            .set_signature_creation_time(created)?
            .set_key_flags(KeyFlags::empty().set_transport_encryption())?;
        let sig = subkey.bind(&mut signer, &cert, builder)?;
        cert = cert.insert_packets(vec![Packet::from(subkey), sig.into()])?;

        let password = Password::from(passphrase);
        let mut secrets = vec![Packet::from(
            auth.secret().clone().role_into_primary()
                .encrypt_secret(&password)?)];
        if ! legacy {
            secrets.push(Packet::from(
                sign.secret().clone().role_into_subordinate()
                    .encrypt_secret(&password)?));
        }
        secrets.push(Packet::from(
            encrypt.secret().clone().role_into_subordinate()
                .encrypt_secret(&password)?));
        let secret = cert.clone().insert_packets(secrets)?;

        KeyPairRing::new(cert, secret)
    }

    /// Unlocks stored rings.
    ///
    /// `secret` and `public` may be binary or ASCII-armored.
    /// `bridge_cert` is a PEM or DER certificate.
    pub fn load(secret: &[u8], public: &[u8], passphrase: &str,
                bridge_cert: Option<&[u8]>) -> Result<Self> {
        let ring = KeyPairRing::load(secret, public)?;
        let bridge_cert = bridge_cert.map(BridgeCertificate::load).transpose()?;
        Self::from_ring(&ring, passphrase, bridge_cert)
    }

    /// Unlocks a parsed ring.
    pub fn from_ring(ring: &KeyPairRing, passphrase: &str,
                     bridge_cert: Option<BridgeCertificate>) -> Result<Self> {
        info!("load personal key {}", ring.public().fingerprint());
        let decrypted = DecryptedKeyRing::unlock(ring, &passphrase.into())?;
        Ok(PersonalKey {
            ring: decrypted,
            public: Some(ring.public().clone().strip_secret_key_material()),
            bridge_cert,
        })
    }

    /// Checks that the rings unlock with `passphrase`.
    pub fn test(secret: &[u8], public: &[u8], passphrase: &str,
                bridge_cert: Option<&[u8]>) -> Result<KeyPairRing> {
        let ring = KeyPairRing::load(secret, public)?;
        let bridge_cert = bridge_cert.map(BridgeCertificate::load).transpose()?;
        Self::from_ring(&ring, passphrase, bridge_cert)?;
        Ok(ring)
    }

    /// Re-protects an encoded secret ring with a new passphrase.
    pub fn change_passphrase(secret: &[u8], old: &str, new: &str)
                             -> Result<Vec<u8>> {
        let cert = keys::parse_public_ring(secret)?;
        copy_with_new_passphrase(cert, old, new)?.as_tsk().to_vec()
    }

    /// Returns a copy carrying `bridge_cert`.
    pub fn with_bridge_cert(&self, bridge_cert: Option<BridgeCertificate>)
                            -> Self {
        PersonalKey { bridge_cert, ..self.clone() }
    }

    /// Revokes the key.
    ///
    /// Creates a key revocation signature made by the primary key and
    /// returns the revoked certificate.  If `store` is set, the
    /// revoked certificate replaces the one held by this key.
    pub fn revoke(&mut self, store: bool) -> Result<Cert> {
        info!("revoke personal key {}", self.fingerprint());
        let cert = self.certificate()?;
        let mut signer = self.ring.auth().to_crypto()?;
        let sig = CertRevocationBuilder::new()
            .set_reason_for_revocation(ReasonForRevocation::KeyRetired, b"")?
            .build(&mut signer, &cert, HashAlgorithm::SHA256)?;
        let revoked = cert.insert_packets(vec![sig])?;

        if store {
            self.public = Some(revoked.clone());
        }
        Ok(revoked)
    }

    /// Replaces the public certificate.
    ///
    /// The primary key of `data` must be our authentication key.
    pub fn update(&mut self, data: &[u8]) -> Result<Cert> {
        let cert = keys::parse_public_ring(data)?;
        if cert.fingerprint() != self.ring.auth().fingerprint() {
            return Err(Error::InvalidKeyData(
                "master key does not match".into()).into());
        }
        info!("update public key {}", cert.fingerprint());

        let auth = self.ring.auth().with_public(
            cert.primary_key().key().clone().role_into_unspecified())?;
        self.ring.set_auth(auth);
        self.public = Some(cert.clone());
        Ok(cert)
    }

    /// Returns the unlocked role keys.
    pub fn ring(&self) -> &DecryptedKeyRing {
        &self.ring
    }

    /// Returns the user ID matching `network`.
    pub fn user_id(&self, network: Option<&str>) -> Option<String> {
        self.public.as_ref().and_then(|cert| userid::user_id(cert, network))
    }

    /// Returns the fingerprint of the authentication key.
    pub fn fingerprint(&self) -> String {
        self.ring.auth().fingerprint().to_hex()
    }

    /// Returns the public certificate, if known.
    pub fn public_ring(&self) -> Option<&Cert> {
        self.public.as_ref()
    }

    /// Returns the encoded public key ring.
    ///
    /// Without a certificate, the three bare public keys are written.
    pub fn encoded_public_ring(&self) -> Result<Vec<u8>> {
        match &self.public {
            Some(cert) => cert.to_vec(),
            None => {
                let mut out = Vec::new();
                for p in self.public_packets() {
                    p.serialize(&mut out)?;
                }
                Ok(out)
            }
        }
    }

    /// Returns the bridge certificate.
    pub fn bridge_certificate(&self) -> Option<&BridgeCertificate> {
        self.bridge_cert.as_ref()
    }

    /// Returns the PKCS#1 DER encoding of the authentication key.
    pub fn bridge_private_key(&self) -> Result<Vec<u8>> {
        bridge::private_key_der(self.ring.auth())
    }

    fn public_packets(&self) -> Vec<Packet> {
        let auth = self.ring.auth();
        let mut packets = vec![
            Packet::from(auth.public().clone().role_into_primary()),
        ];
        for kp in &[self.ring.sign(), self.ring.encrypt()] {
            if kp.fingerprint() != auth.fingerprint() {
                packets.push(Packet::from(
                    kp.public().clone().role_into_subordinate()));
            }
        }
        packets
    }

    fn certificate(&self) -> Result<Cert> {
        match &self.public {
            Some(cert) => Ok(cert.clone()),
            None => Cert::from_packets(self.public_packets().into_iter()),
        }
    }

    /// Serializes the unlocked keys into the portable blob.
    ///
    /// The blob holds six length-prefixed values: the secret and
    /// public form of the authentication, signing and encryption
    /// keys.  It carries unprotected secrets and has no integrity
    /// protection of its own.
    pub fn to_base64(&self) -> Result<String> {
        let auth_fpr = self.ring.auth().fingerprint();
        let mut blob = Vec::new();

        for kp in &[self.ring.auth(), self.ring.sign(), self.ring.encrypt()] {
            let primary = kp.fingerprint() == auth_fpr;
            let secret = if primary {
                Packet::from(kp.secret().clone().role_into_primary())
            } else {
                Packet::from(kp.secret().clone().role_into_subordinate())
            };
            write_value(&mut blob, &secret.to_vec()?);
            write_value(&mut blob, &self.public_value(kp, primary)?);
        }

        Ok(base64::encode(&blob))
    }

    fn public_value(&self, kp: &KeyPair, primary: bool) -> Result<Vec<u8>> {
        let fpr = kp.fingerprint();
        let mut packets: Vec<Packet> = Vec::new();

        match &self.public {
            Some(cert) if primary => {
                return cert.clone().retain_subkeys(|_| false).to_vec();
            }
            Some(cert) => {
                if let Some(ka) = cert.keys().subkeys()
                    .find(|ka| ka.key().fingerprint() == fpr)
                {
                    packets.push(ka.key().clone().into());
                    for sig in ka.bundle().self_signatures() {
                        packets.push(sig.clone().into());
                    }
                }
            }
            None => (),
        }

        if packets.is_empty() {
            packets.push(if primary {
                kp.public().clone().role_into_primary().into()
            } else {
                kp.public().clone().role_into_subordinate().into()
            });
        }

        let mut out = Vec::new();
        for p in packets {
            p.serialize(&mut out)?;
        }
        Ok(out)
    }

    /// Restores a key from the portable blob.
    pub fn from_base64(data: &str) -> Result<Self> {
        let blob = base64::decode(data.trim())?;
        let mut cursor = Cursor::new(&blob[..]);

        let mut pairs = Vec::with_capacity(3);
        let mut public_packets: Vec<Vec<Packet>> = Vec::with_capacity(3);
        for _ in 0..3 {
            let secret = read_secret_key(&read_value(&mut cursor)?)?;
            let packets = openpgp::PacketPile::from_bytes(
                &read_value(&mut cursor)?)?.into_children().collect::<Vec<_>>();
            let public: PublicKey = keys::read_public_key_packets(&packets)?;
            if public.fingerprint() != secret.fingerprint() {
                return Err(Error::InvalidKeyData(
                    "public and secret keys do not match".into()).into());
            }
            pairs.push(KeyPair::new(secret)?);
            public_packets.push(packets);
        }

        let encrypt = pairs.pop();
        let sign = pairs.pop();
        let auth = pairs.pop();
        let (auth, sign, encrypt) = match (auth, sign, encrypt) {
            (Some(a), Some(s), Some(e)) => (a, s, e),
            _ => return Err(Error::InvalidKeyData("invalid key data".into()).into()),
        };

        let mut public_packets = public_packets.into_iter();
        let mut cert = Cert::from_packets(
            public_packets.next().unwrap_or_default().into_iter())?;
        for (packets, kp) in public_packets.zip(&[&sign, &encrypt]) {
            if kp.fingerprint() != auth.fingerprint() {
                cert = cert.insert_packets(packets)?;
            }
        }

        Ok(PersonalKey {
            ring: DecryptedKeyRing::new(auth, sign, encrypt),
            public: Some(cert),
            bridge_cert: None,
        })
    }
}

/// Re-protects every secret key of `cert` with a new passphrase.
///
/// Fails with [`Error::BadPassphrase`] if a key does not unlock with
/// `old`.
pub fn copy_with_new_passphrase(cert: Cert, old: &str, new: &str)
                                -> Result<Cert> {
    let (old, new) = (Password::from(old), Password::from(new));
    let mut packets: Vec<Packet> = Vec::new();

    for ka in cert.keys().secret() {
        let key = keys::unlock_secret(ka.key().clone(), &old)?
            .encrypt_secret(&new)?;
        packets.push(if ka.primary() {
            key.role_into_primary().into()
        } else {
            key.role_into_subordinate().into()
        });
    }

    cert.insert_packets(packets)
}

fn write_value(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    cursor.read_exact(&mut len)
        .map_err(|_| Error::InvalidData("truncated key data".into()))?;
    let len = u32::from_be_bytes(len) as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::InvalidData("truncated key data".into()).into());
    }
    let mut value = vec![0u8; len];
    cursor.read_exact(&mut value)?;
    Ok(value)
}

fn read_secret_key(data: &[u8]) -> Result<SecretKey> {
    match Packet::from_bytes(data)? {
        Packet::SecretKey(k) => Ok(k.role_into_unspecified()),
        Packet::SecretSubkey(k) => Ok(k.role_into_unspecified()),
        p => Err(Error::InvalidKeyData(
            format!("expected a secret key, got {}", p.tag())).into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use openpgp::policy::StandardPolicy;

    fn generate() -> Result<(PersonalKey, KeyPairRing)> {
        let key = PersonalKey::create(
            SystemTime::now() - Duration::from_secs(3600))?;
        let ring = key.store_network("alice", "kontalk.net", "Alice", "secret")?;
        Ok((key, ring))
    }

    #[test]
    fn store_and_load() -> Result<()> {
        let (key, ring) = generate()?;
        let (public, secret) = ring.clone().into_parts();

        assert_eq!(public.fingerprint().to_hex(), key.fingerprint());
        assert!(! public.is_tsk());
        assert!(secret.keys().secret()
                .all(|ka| ! ka.key().has_unencrypted_secret()));
        assert!(! key.ring().auth().public().has_secret());
        assert!(! key.ring().encrypt().public().has_secret());
        assert!(KeyPairRing::new(secret.clone(), secret.clone()).is_err());

        let p = &StandardPolicy::new();
        let vc = public.with_policy(p, None)?;
        assert_eq!(vc.keys().count(), 3);
        assert_eq!(vc.primary_userid()?.userid().value(),
                   b"Alice <alice@kontalk.net>");

        let public_data = public.to_vec()?;
        let secret_data = secret.as_tsk().to_vec()?;
        let loaded = PersonalKey::load(&secret_data, &public_data, "secret",
                                       None)?;
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        assert_eq!(loaded.ring().sign().fingerprint(),
                   key.ring().sign().fingerprint());
        assert_eq!(loaded.ring().encrypt().fingerprint(),
                   key.ring().encrypt().fingerprint());
        assert_eq!(loaded.user_id(Some("kontalk.net")).as_deref(),
                   Some("Alice <alice@kontalk.net>"));

        let armored = secret.as_tsk().armored().to_vec()?;
        assert!(PersonalKey::test(&armored, &public_data, "secret", None).is_ok());
        Ok(())
    }

    #[test]
    fn wrong_passphrase() -> Result<()> {
        let (_, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let err = PersonalKey::load(&secret.as_tsk().to_vec()?,
                                    &public.to_vec()?, "wrong", None)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::BadPassphrase));
        Ok(())
    }

    #[test]
    fn change_passphrase() -> Result<()> {
        let (key, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let public = public.to_vec()?;

        let changed = PersonalKey::change_passphrase(
            &secret.as_tsk().to_vec()?, "secret", "other")?;
        assert!(PersonalKey::load(&changed, &public, "secret", None).is_err());
        let loaded = PersonalKey::load(&changed, &public, "other", None)?;
        assert_eq!(loaded.fingerprint(), key.fingerprint());

        assert!(PersonalKey::change_passphrase(&changed, "secret", "x")
                .is_err());
        Ok(())
    }

    #[test]
    fn revoke() -> Result<()> {
        let (_, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let mut key = PersonalKey::load(&secret.as_tsk().to_vec()?,
                                        &public.to_vec()?, "secret", None)?;

        let revoked = key.revoke(false)?;
        assert_eq!(revoked.fingerprint(), public.fingerprint());
        let p = &StandardPolicy::new();
        assert!(matches!(revoked.revocation_status(p, None),
                         openpgp::types::RevocationStatus::Revoked(_)));
        assert_eq!(key.public_ring(), Some(&public));

        key.revoke(true)?;
        assert_ne!(key.public_ring(), Some(&public));
        Ok(())
    }

    #[test]
    fn update() -> Result<()> {
        let (_, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let mut key = PersonalKey::load(&secret.as_tsk().to_vec()?,
                                        &public.to_vec()?, "secret", None)?;

        let revoked = key.clone().revoke(false)?;
        let updated = key.update(&revoked.to_vec()?)?;
        assert_eq!(key.public_ring(), Some(&updated));

        let (_, other) = generate()?;
        let err = key.update(&other.public().to_vec()?).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::InvalidKeyData(_))));
        Ok(())
    }

    #[test]
    fn portable_blob() -> Result<()> {
        let (_, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let key = PersonalKey::load(&secret.as_tsk().to_vec()?,
                                    &public.to_vec()?, "secret", None)?;

        let blob = key.to_base64()?;
        let restored = PersonalKey::from_base64(&blob)?;
        assert!(! restored.public_ring().map(|c| c.is_tsk()).unwrap_or(true));
        assert_eq!(restored.fingerprint(), key.fingerprint());
        assert_eq!(restored.ring().encrypt().fingerprint(),
                   key.ring().encrypt().fingerprint());
        assert_eq!(restored.user_id(None), key.user_id(None));
        assert_eq!(restored.public_ring().map(|c| c.keys().count()), Some(3));

        assert!(PersonalKey::from_base64(&blob[..blob.len() / 2]).is_err());
        Ok(())
    }

    #[test]
    fn bridge() -> Result<()> {
        let (_, ring) = generate()?;
        let (public, secret) = ring.into_parts();
        let key = PersonalKey::load(&secret.as_tsk().to_vec()?,
                                    &public.to_vec()?, "secret", None)?;
        assert!(key.bridge_certificate().is_none());

        let cert = bridge::from_personal_key(&key, &public.to_vec()?)?;
        let key = key.with_bridge_cert(Some(cert.clone()));
        assert_eq!(key.bridge_certificate(), Some(&cert));
        assert!(! key.bridge_private_key()?.is_empty());
        Ok(())
    }
}
