//! OpenPGP to X.509 bridge.
//!
//! The bridge certificate is a self-signed X.509 certificate over the
//! authentication key.  It lets legacy transports authenticate the
//! user with TLS client certificates.  The certificate carries the
//! whole OpenPGP public key ring in a vendor extension, and one
//! xmppAddr subject alternative name per user ID.

use std::time::Duration;

use sequoia_openpgp as openpgp;
use openpgp::Cert;
use openpgp::crypto::{mpi, Signer};
use openpgp::serialize::SerializeInto;
use openpgp::types::HashAlgorithm;

use crate::Result;
use crate::errors::Error;
use crate::keys::KeyPair;
use crate::personal::PersonalKey;
use crate::userid::PgpUserId;

pub mod der;

/// PEM label of a PKCS#1 private key.
pub const PEM_TYPE_PRIVATE_KEY: &str = "RSA PRIVATE KEY";
/// PEM label of a certificate.
pub const PEM_TYPE_CERTIFICATE: &str = "CERTIFICATE";
/// Friendly name of the key in PKCS#12 exports.
pub const PKCS12_ALIAS: &str = "Kontalk Personal Key";

const DN_ORGANIZATION: &str = "OpenPGP to X.509 Bridge";

/// A DER-encoded bridge certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCertificate {
    der: Vec<u8>,
}

impl BridgeCertificate {
    /// Wraps a DER-encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        der::parse::certificate(&der)?;
        Ok(BridgeCertificate { der })
    }

    /// Loads a certificate in PEM or DER form.
    pub fn load(data: &[u8]) -> Result<Self> {
        let start = data.iter()
            .position(|b| ! b.is_ascii_whitespace())
            .unwrap_or(data.len());
        if data[start..].starts_with(b"-----BEGIN") {
            Self::from_der(pem_decode(PEM_TYPE_CERTIFICATE, data)?)
        } else {
            Self::from_der(data.to_vec())
        }
    }

    /// Returns the DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM encoding.
    pub fn pem(&self) -> String {
        pem_encode(PEM_TYPE_CERTIFICATE, &self.der)
    }

    /// Returns the OpenPGP public key ring embedded in the certificate.
    pub fn public_ring(&self) -> Result<Vec<u8>> {
        parse_certificate(&self.der)
    }

    /// Returns the xmppAddr subject alternative names.
    pub fn xmpp_addrs(&self) -> Result<Vec<String>> {
        let cert = der::parse::certificate(&self.der)?;
        match cert.extension(&der::SUBJECT_ALT_NAME) {
            Some(value) => der::parse::xmpp_addrs(value),
            None => Ok(Vec::new()),
        }
    }

    /// Checks the self-signature.
    pub fn verify(&self) -> Result<()> {
        let cert = der::parse::certificate(&self.der)?;
        let key = der::parse::spki(&cert.spki)?;
        der::verify(&key, &cert.signature_algorithm, &cert.tbs, &cert.signature)
            .map_err(|e| e.context(Error::BridgeVerification))
    }
}

/// Returns the OpenPGP public key ring embedded in a DER certificate.
pub fn parse_certificate(der: &[u8]) -> Result<Vec<u8>> {
    let cert = der::parse::certificate(der)?;
    let value = cert.extension(&der::PGP_PUBLIC_KEY)
        .ok_or_else(|| Error::InvalidData(
            "no OpenPGP public key in certificate".into()))?;
    der::parse::bit_string(value)
}

/// Creates a bridge certificate for `public_ring`, signed with the
/// secret of its primary key.
///
/// The subject carries one CN per user ID.  `subject_alt_name` is
/// added to the xmppAddr names derived from the user IDs.
pub fn create_certificate(public_ring: &Cert, private_key: &KeyPair,
                          subject_alt_name: Option<&str>)
                          -> Result<BridgeCertificate>
{
    let primary = public_ring.primary_key().key();
    if primary.fingerprint() != private_key.fingerprint() {
        return Err(Error::InvalidKeyData(
            "private key does not match master key".into()).into());
    }
    let public = primary.clone().role_into_unspecified();
    let algorithm = der::signature_algorithm(&public)?;
    log::info!("create bridge certificate for {}", primary.fingerprint());

    let mut common_names = Vec::new();
    let mut xmpp_addrs = Vec::new();
    for uid in public_ring.userids() {
        let value = String::from_utf8_lossy(uid.userid().value()).into_owned();
        if let Some(email) = PgpUserId::parse(&value)
            .and_then(|p| p.email().map(str::to_string))
        {
            xmpp_addrs.push(email);
        }
        common_names.push(value);
    }
    if let Some(name) = subject_alt_name {
        xmpp_addrs.push(name.to_string());
    }

    // A key that does not expire gets an empty validity period.
    let not_before = primary.creation_time();
    let not_after = not_before + validity_period(public_ring)
        .unwrap_or_else(|| Duration::from_secs(0));

    let spki = der::serialize::spki(&public)?;
    let name = der::serialize::name(DN_ORGANIZATION, &common_names);
    let validity = der::serialize::validity(not_before, not_after);
    let extensions = der::serialize::bridge_extensions(
        &spki, &xmpp_addrs, &public_ring.to_vec()?)?;
    let tbs = der::serialize::tbs_certificate(
        1, algorithm, &name, &validity, &spki, &extensions);

    let signature = sign(private_key, &tbs)?;
    let cert = BridgeCertificate {
        der: der::serialize::certificate(&tbs, algorithm, &signature),
    };
    cert.verify()?;
    Ok(cert)
}

/// Creates a bridge certificate for a personal key.
///
/// `public_ring` is the encoded public key ring to embed.
pub fn from_personal_key(key: &PersonalKey, public_ring: &[u8])
                         -> Result<BridgeCertificate>
{
    let ring = crate::keys::parse_public_ring(public_ring)?;
    create_certificate(&ring, key.ring().auth(), None)
}

fn validity_period(cert: &Cert) -> Option<Duration> {
    crate::keys::self_signatures(cert, cert.primary_key().key())
        .into_iter()
        .find_map(|sig| sig.key_validity_period())
}

fn sign(key: &KeyPair, tbs: &[u8]) -> Result<Vec<u8>> {
    use sha1::{Digest, Sha1};

    let digest = Sha1::digest(tbs);
    let mut signer = key.to_crypto()?;
    match signer.sign(HashAlgorithm::SHA1, &digest)? {
        mpi::Signature::RSA { s } => {
            let k = match key.public().mpis() {
                mpi::PublicKey::RSA { n, .. } => n.value().len(),
                _ => return Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
            };
            let s = s.value();
            let mut value = vec![0u8; k.saturating_sub(s.len())];
            value.extend_from_slice(s);
            Ok(value)
        }
        mpi::Signature::DSA { r, s } =>
            Ok(der::serialize::dsa_signature(r.value(), s.value())),
        _ => Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
    }
}

/// Returns the PKCS#1 DER encoding of an RSA key.
pub fn private_key_der(key: &KeyPair) -> Result<Vec<u8>> {
    der::serialize::rsa_private_key(key)
}

/// Packs the certificate and its RSA key in a PKCS#12 store.
pub fn export_pkcs12(cert: &BridgeCertificate, key: &KeyPair, password: &str)
                     -> Result<Vec<u8>>
{
    let pkcs8 = der::serialize::private_key_info(&private_key_der(key)?);
    let pfx = p12::PFX::new(cert.der(), &pkcs8, None, password, PKCS12_ALIAS)
        .ok_or_else(|| Error::InvalidData("unable to create PKCS#12".into()))?;
    Ok(pfx.to_der())
}

/// Encodes DER data as PEM.
pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let b64 = base64::encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for line in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

/// Decodes the first PEM block labeled `label`.
pub fn pem_decode(label: &str, data: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(data);
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let start = text.find(&begin)
        .ok_or_else(|| Error::InvalidData(format!("no {} block", label)))?
        + begin.len();
    let stop = text[start..].find(&end)
        .ok_or_else(|| Error::InvalidData(format!("unterminated {} block",
                                                  label)))?
        + start;
    let b64: String = text[start..stop].chars()
        .filter(|c| ! c.is_whitespace())
        .collect();
    Ok(base64::decode(&b64)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;
    use std::time::{Duration, SystemTime};

    use openpgp::cert::prelude::*;
    use openpgp::packet::key::{Key4, SecretParts, UnspecifiedRole};

    fn rsa_cert() -> Result<(Cert, KeyPair)> {
        let (cert, _) = CertBuilder::new()
            .set_cipher_suite(CipherSuite::RSA2k)
            .set_creation_time(SystemTime::now() - Duration::from_secs(60))
            .set_validity_period(Duration::from_secs(3600))
            .add_userid("Alice <alice@kontalk.net>")
            .add_userid("Alice (test) <alice@beta.kontalk.net>")
            .generate()?;
        let key = cert.primary_key().key().clone()
            .parts_into_secret()?.role_into_unspecified();
        Ok((cert, KeyPair::new(key)?))
    }

    #[test]
    fn create_and_parse() -> Result<()> {
        let (cert, key) = rsa_cert()?;
        let bridge = create_certificate(&cert, &key, Some("alice@other.net"))?;
        bridge.verify()?;

        assert_eq!(bridge.public_ring()?, cert.to_vec()?);
        let mut addrs = bridge.xmpp_addrs()?;
        addrs.sort();
        assert_eq!(addrs, vec!["alice@beta.kontalk.net",
                               "alice@kontalk.net",
                               "alice@other.net"]);

        let pem = bridge.pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert_eq!(BridgeCertificate::load(pem.as_bytes())?, bridge);
        assert_eq!(BridgeCertificate::load(bridge.der())?, bridge);
        Ok(())
    }

    #[test]
    fn tampered() -> Result<()> {
        let (cert, key) = rsa_cert()?;
        let bridge = create_certificate(&cert, &key, None)?;

        // Flip a bit inside the embedded ring.
        let mut der = bridge.der().to_vec();
        let i = der.len() - 400;
        der[i] ^= 0x01;
        let tampered = BridgeCertificate::from_der(der)?;
        assert!(tampered.verify().is_err());
        Ok(())
    }

    #[test]
    fn unsupported() -> Result<()> {
        let key: Key4<SecretParts, UnspecifiedRole> =
            Key4::generate_ecc(true, openpgp::types::Curve::NistP256)?;
        let key = KeyPair::new(key.into())?;
        let cert = Cert::try_from(vec![openpgp::Packet::from(
            key.public().clone().role_into_primary())])?;

        let err = create_certificate(&cert, &key, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::UnsupportedAlgorithm(_))));
        Ok(())
    }

    #[test]
    fn pkcs12() -> Result<()> {
        let (cert, key) = rsa_cert()?;
        let bridge = create_certificate(&cert, &key, None)?;
        let der = export_pkcs12(&bridge, &key, "export")?;

        let pfx = p12::PFX::parse(&der)
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert!(pfx.verify_mac("export"));
        Ok(())
    }

    #[test]
    fn pem() -> Result<()> {
        let data: Vec<u8> = (0..200u8).collect();
        let pem = pem_encode(PEM_TYPE_PRIVATE_KEY, &data);
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));
        assert_eq!(pem_decode(PEM_TYPE_PRIVATE_KEY, pem.as_bytes())?, data);
        assert!(pem_decode(PEM_TYPE_CERTIFICATE, pem.as_bytes()).is_err());
        Ok(())
    }
}
