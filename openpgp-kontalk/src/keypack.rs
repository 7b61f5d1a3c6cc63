//! Key packs.
//!
//! A key pack is a ZIP archive holding everything needed to move an
//! account to another device: the armored key rings, the bridge
//! certificate and its private key, the list of trusted contact keys,
//! and account information.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::str::FromStr;

use log::{info, warn};

use sequoia_openpgp as openpgp;
use openpgp::serialize::SerializeInto;

use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use crate::Result;
use crate::bridge::{self, BridgeCertificate};
use crate::errors::Error;
use crate::keys::{self, KeyPair, KeyPairRing};
use crate::personal::PersonalKey;

/// The armored public key ring.
pub const PUBLIC_KEY_FILENAME: &str = "kontalk-public.asc";
/// The armored secret key ring.
pub const PRIVATE_KEY_FILENAME: &str = "kontalk-private.asc";
/// The PEM bridge certificate.
pub const BRIDGE_CERT_FILENAME: &str = "kontalk-login.crt";
/// The PEM private key of the bridge certificate.
pub const BRIDGE_KEY_FILENAME: &str = "kontalk-login.key";
/// The PKCS#12 bundle of the bridge certificate and its key.
pub const BRIDGE_CERTPACK_FILENAME: &str = "kontalk-login.p12";
/// The trusted contact keys.
pub const TRUSTED_KEYS_FILENAME: &str = "trusted.properties";
/// The account information.
pub const ACCOUNT_INFO_FILENAME: &str = "account-info.properties";

/// Entries larger than this are rejected on import.
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024;

/// The key was not verified.
pub const TRUST_UNKNOWN: i32 = 0;
/// The key was explicitly distrusted.
pub const TRUST_IGNORED: i32 = 1;
/// The key was verified.
pub const TRUST_VERIFIED: i32 = 2;

const ACCOUNT_PHONE_NUMBER: &str = "phoneNumber";

/// A contact's key fingerprint and the trust put in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedFingerprint {
    /// The hexadecimal fingerprint.
    pub fingerprint: String,
    /// One of `TRUST_UNKNOWN`, `TRUST_IGNORED` or `TRUST_VERIFIED`.
    pub trust_level: i32,
}

impl TrustedFingerprint {
    /// Creates a trusted fingerprint.
    pub fn new<S: Into<String>>(fingerprint: S, trust_level: i32) -> Self {
        TrustedFingerprint { fingerprint: fingerprint.into(), trust_level }
    }
}

impl fmt::Display for TrustedFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}", self.fingerprint, self.trust_level)
    }
}

impl FromStr for TrustedFingerprint {
    type Err = anyhow::Error;

    /// Parses `fingerprint|level`.
    ///
    /// A bare fingerprint is taken as verified.
    fn from_str(s: &str) -> Result<Self> {
        let (fingerprint, level) = match s.find('|') {
            Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
            None => (s, None),
        };
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty()
            || ! fingerprint.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidData(
                format!("invalid fingerprint: {:?}", fingerprint)).into());
        }

        let trust_level = match level {
            Some(level) => level.trim().parse().map_err(|_| Error::InvalidData(
                format!("invalid trust level: {:?}", level)))?,
            None => TRUST_VERIFIED,
        };
        Ok(TrustedFingerprint::new(fingerprint.to_uppercase(), trust_level))
    }
}

/// Writes key packs.
///
/// ```no_run
/// # use kontalk_openpgp::keypack::KeyPackExporter;
/// # fn main() -> kontalk_openpgp::Result<()> {
/// # let (secret, public) = (Vec::new(), Vec::new());
/// let file = std::fs::File::create("kontalk-keys.zip")?;
/// KeyPackExporter::new(&secret, &public, "passphrase", "+15555550123")
///     .export_passphrase("other passphrase")
///     .save(file)?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct KeyPackExporter<'a> {
    private_key: &'a [u8],
    public_key: &'a [u8],
    passphrase: &'a str,
    export_passphrase: Option<&'a str>,
    bridge_cert: Option<&'a BridgeCertificate>,
    trusted_keys: Option<&'a BTreeMap<String, TrustedFingerprint>>,
    phone_number: &'a str,
}

impl<'a> KeyPackExporter<'a> {
    /// Creates an exporter.
    ///
    /// `private_key` is the secret ring protected with `passphrase`.
    pub fn new(private_key: &'a [u8], public_key: &'a [u8],
               passphrase: &'a str, phone_number: &'a str) -> Self {
        KeyPackExporter {
            private_key,
            public_key,
            passphrase,
            export_passphrase: None,
            bridge_cert: None,
            trusted_keys: None,
            phone_number,
        }
    }

    /// Protects the exported secrets with a different passphrase.
    pub fn export_passphrase(mut self, passphrase: &'a str) -> Self {
        self.export_passphrase = Some(passphrase);
        self
    }

    /// Includes the bridge certificate and its private key.
    pub fn bridge_cert(mut self, cert: &'a BridgeCertificate) -> Self {
        self.bridge_cert = Some(cert);
        self
    }

    /// Includes the trusted contact keys, indexed by JID.
    pub fn trusted_keys(mut self,
                        keys: &'a BTreeMap<String, TrustedFingerprint>) -> Self {
        self.trusted_keys = Some(keys);
        self
    }

    /// Writes the key pack to `dest`.
    pub fn save<W: Write + Seek>(&self, dest: W) -> Result<W> {
        let export_passphrase = self.export_passphrase.unwrap_or(self.passphrase);
        let private_key = if export_passphrase != self.passphrase {
            PersonalKey::change_passphrase(
                self.private_key, self.passphrase, export_passphrase)?
        } else {
            self.private_key.to_vec()
        };

        let secret = keys::parse_public_ring(&private_key)?;
        let public = keys::parse_public_ring(self.public_key)?;
        info!("export key pack for {}", public.fingerprint());

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(dest);

        if let Some(cert) = self.bridge_cert {
            zip.start_file(BRIDGE_CERT_FILENAME, options)?;
            zip.write_all(cert.pem().as_bytes())?;

            let auth = secret.primary_key().key().clone()
                .parts_into_secret()?
                .role_into_unspecified();
            let auth = KeyPair::new(
                keys::unlock_secret(auth, &export_passphrase.into())?)?;

            zip.start_file(BRIDGE_KEY_FILENAME, options)?;
            zip.write_all(bridge::pem_encode(bridge::PEM_TYPE_PRIVATE_KEY,
                                             &bridge::private_key_der(&auth)?)
                          .as_bytes())?;

            zip.start_file(BRIDGE_CERTPACK_FILENAME, options)?;
            zip.write_all(&bridge::export_pkcs12(cert, &auth, export_passphrase)?)?;
        }

        zip.start_file(PUBLIC_KEY_FILENAME, options)?;
        zip.write_all(&public.armored().to_vec()?)?;

        zip.start_file(PRIVATE_KEY_FILENAME, options)?;
        zip.write_all(&secret.as_tsk().armored().to_vec()?)?;

        if let Some(trusted) = self.trusted_keys {
            let entries: Vec<(String, String)> = trusted.iter()
                .map(|(jid, fpr)| (jid.clone(), fpr.to_string()))
                .collect();
            zip.start_file(TRUSTED_KEYS_FILENAME, options)?;
            zip.write_all(properties::store(&entries).as_bytes())?;
        }

        zip.start_file(ACCOUNT_INFO_FILENAME, options)?;
        zip.write_all(properties::store(&[(ACCOUNT_PHONE_NUMBER.to_string(),
                                           self.phone_number.to_string())])
                      .as_bytes())?;

        Ok(zip.finish()?)
    }
}

/// Reads key packs.
#[derive(Debug, Clone)]
pub struct KeyPackImporter {
    passphrase: String,
    public_key: Vec<u8>,
    private_key: Vec<u8>,
    bridge_cert: Option<Vec<u8>>,
    trusted_keys: Option<Vec<u8>>,
    account_info: Option<Vec<u8>>,
}

impl KeyPackImporter {
    /// Scans a key pack.
    ///
    /// Entries may come in any order.  Fails with
    /// [`Error::InvalidData`] if the public or the private key ring is
    /// missing, or if an entry exceeds [`MAX_ENTRY_SIZE`].
    pub fn load<R: Read>(mut keypack: R, passphrase: &str) -> Result<Self> {
        let mut public_key = None;
        let mut private_key = None;
        let mut bridge_cert = None;
        let mut trusted_keys = None;
        let mut account_info = None;

        loop {
            let mut entry = match zip::read::read_zipfile_from_stream(&mut keypack) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    // Keep what was read so far, the check below
                    // decides whether it is enough.
                    warn!("truncated key pack: {}", e);
                    break;
                }
            };

            let slot = match entry.name() {
                PUBLIC_KEY_FILENAME => &mut public_key,
                PRIVATE_KEY_FILENAME => &mut private_key,
                BRIDGE_CERT_FILENAME => &mut bridge_cert,
                TRUSTED_KEYS_FILENAME => &mut trusted_keys,
                ACCOUNT_INFO_FILENAME => &mut account_info,
                _ => continue,
            };
            *slot = Some(read_entry(&mut entry)?);
        }

        match (public_key, private_key) {
            (Some(public_key), Some(private_key)) => Ok(KeyPackImporter {
                passphrase: passphrase.to_string(),
                public_key,
                private_key,
                bridge_cert,
                trusted_keys,
                account_info,
            }),
            _ => Err(Error::InvalidData("invalid data".into()).into()),
        }
    }

    /// Returns the public key ring.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Returns the secret key ring.
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Returns the PEM bridge certificate, if present.
    pub fn bridge_certificate(&self) -> Option<&[u8]> {
        self.bridge_cert.as_deref()
    }

    /// Returns the trusted contact keys, indexed by JID.
    pub fn trusted_keys(&self)
                        -> Result<Option<BTreeMap<String, TrustedFingerprint>>>
    {
        let data = match &self.trusted_keys {
            Some(data) => data,
            None => return Ok(None),
        };

        properties::load(&String::from_utf8_lossy(data)).into_iter()
            .map(|(jid, value)| Ok((jid, value.parse()?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Some)
    }

    /// Returns the account information.
    pub fn account_info(&self) -> Option<BTreeMap<String, String>> {
        self.account_info.as_ref().map(|data| {
            properties::load(&String::from_utf8_lossy(data)).into_iter().collect()
        })
    }

    /// Returns the phone number of the account, if present.
    pub fn phone_number(&self) -> Option<String> {
        self.account_info().and_then(|mut info| info.remove(ACCOUNT_PHONE_NUMBER))
    }

    fn ring(&self) -> Result<KeyPairRing> {
        KeyPairRing::load_armored(&self.private_key, &self.public_key)
            .or_else(|_| KeyPairRing::load(&self.private_key, &self.public_key))
    }

    /// Unlocks the personal key and creates a fresh bridge certificate
    /// for it.
    pub fn load_personal_key(&self) -> Result<PersonalKey> {
        let ring = self.ring()?;
        info!("import personal key {}", ring.public().fingerprint());
        let key = PersonalKey::from_ring(&ring, &self.passphrase, None)?;
        let cert = bridge::create_certificate(ring.public(),
                                              key.ring().auth(), None)?;
        Ok(key.with_bridge_cert(Some(cert)))
    }

    /// Checks that the key rings unlock and returns them.
    pub fn create_key_pair_ring(&self) -> Result<KeyPairRing> {
        let ring = self.ring()?;
        PersonalKey::from_ring(&ring, &self.passphrase, None)?;
        Ok(ring)
    }
}

fn read_entry(entry: &mut zip::read::ZipFile) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    (&mut *entry).take(MAX_ENTRY_SIZE + 1).read_to_end(&mut data)?;
    if data.len() as u64 > MAX_ENTRY_SIZE {
        return Err(Error::InvalidData(
            format!("{} exceeds maximum size", entry.name())).into());
    }
    Ok(data)
}

/// The `.properties` file format.
pub(crate) mod properties {
    use std::fmt::Write;

    /// Serializes key/value pairs.
    pub fn store(entries: &[(String, String)]) -> String {
        let mut out = String::new();
        for (key, value) in entries {
            escape(&mut out, key, true);
            out.push('=');
            escape(&mut out, value, false);
            out.push('\n');
        }
        out
    }

    fn escape(out: &mut String, s: &str, is_key: bool) {
        for (i, c) in s.chars().enumerate() {
            match c {
                ' ' if i == 0 || is_key => out.push_str("\\ "),
                '\t' => out.push_str("\\t"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x0c' => out.push_str("\\f"),
                '\\' | '=' | ':' | '#' | '!' => {
                    out.push('\\');
                    out.push(c);
                }
                c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                    let mut buf = [0u16; 2];
                    for unit in c.encode_utf16(&mut buf) {
                        let _ = write!(out, "\\u{:04X}", unit);
                    }
                }
                c => out.push(c),
            }
        }
    }

    /// Parses key/value pairs.
    pub fn load(data: &str) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        let mut logical = String::new();

        for line in data.lines() {
            let line = line.trim_start_matches(|c| c == ' ' || c == '\t'
                                               || c == '\x0c');
            if logical.is_empty() && (line.is_empty() || line.starts_with('#')
                                      || line.starts_with('!'))
            {
                continue;
            }

            let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
            if trailing % 2 == 1 {
                logical.push_str(&line[..line.len() - 1]);
                continue;
            }
            logical.push_str(line);
            entries.push(split(&logical));
            logical.clear();
        }
        if ! logical.is_empty() {
            entries.push(split(&logical));
        }
        entries
    }

    fn split(line: &str) -> (String, String) {
        let mut key_end = line.len();
        let mut escaped = false;
        for (i, c) in line.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '=' || c == ':' || c.is_whitespace() {
                key_end = i;
                break;
            }
        }

        let key = &line[..key_end];
        let mut rest = line[key_end..].trim_start();
        if rest.starts_with('=') || rest.starts_with(':') {
            rest = rest[1..].trim_start();
        }
        (unescape(key), unescape(rest))
    }

    fn unescape(s: &str) -> String {
        let mut units: Vec<u16> = Vec::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                let mut buf = [0u16; 2];
                units.extend_from_slice(c.encode_utf16(&mut buf));
                continue;
            }
            let c = match chars.next() {
                Some('t') => '\t',
                Some('n') => '\n',
                Some('r') => '\r',
                Some('f') => '\x0c',
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if let Ok(unit) = u16::from_str_radix(&hex, 16) {
                        units.push(unit);
                    }
                    continue;
                }
                Some(c) => c,
                None => break,
            };
            let mut buf = [0u16; 2];
            units.extend_from_slice(c.encode_utf16(&mut buf));
        }
        String::from_utf16_lossy(&units)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trusted_fingerprint() -> Result<()> {
        let fpr: TrustedFingerprint = "8b3d1c8c43e7d1a6|2".parse()?;
        assert_eq!(fpr, TrustedFingerprint::new("8B3D1C8C43E7D1A6",
                                                TRUST_VERIFIED));
        assert_eq!(fpr.to_string(), "8B3D1C8C43E7D1A6|2");

        let fpr: TrustedFingerprint = "8B3D1C8C43E7D1A6".parse()?;
        assert_eq!(fpr.trust_level, TRUST_VERIFIED);

        assert!("8B3D|x".parse::<TrustedFingerprint>().is_err());
        assert!("not hex|1".parse::<TrustedFingerprint>().is_err());
        assert!("|1".parse::<TrustedFingerprint>().is_err());
        Ok(())
    }

    #[test]
    fn properties_escaping() {
        let entries = vec![
            ("alice@kontalk.net".to_string(), "ABCD|2".to_string()),
            ("key with = and :".to_string(), " leading space".to_string()),
            ("phoneNumber".to_string(), "+39 333 1234567".to_string()),
            ("unicode".to_string(), "caf\u{e9}\n#".to_string()),
        ];
        let stored = properties::store(&entries);
        assert!(stored.contains("alice@kontalk.net=ABCD|2\n"));
        assert!(stored.contains("key\\ with\\ \\=\\ and\\ \\:=\\ leading space\n"));
        assert!(stored.contains("unicode=caf\\u00E9\\n\\#\n"));
        assert_eq!(properties::load(&stored), entries);
    }

    #[test]
    fn properties_syntax() {
        let data = "# comment\n\
                    ! other comment\n\
                    \n\
                    a = 1\n\
                    b: 2\n\
                    c 3\n\
                    d=multi\\\n    line\n\
                    e\n";
        let entries = properties::load(data);
        let get = |k: &str| entries.iter()
            .find(|(key, _)| key == k)
            .map(|(_, v)| v.as_str());
        assert_eq!(entries.len(), 5);
        assert_eq!(get("a"), Some("1"));
        assert_eq!(get("b"), Some("2"));
        assert_eq!(get("c"), Some("3"));
        assert_eq!(get("d"), Some("multiline"));
        assert_eq!(get("e"), Some(""));
    }
}
