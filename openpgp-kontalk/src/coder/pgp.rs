//! The OpenPGP coder.
//!
//! Messages are laid out as follows:
//!
//! ```text
//! PKESK (one per recipient)
//! SEIP
//!  └ Compressed Data (ZIP)
//!     ├ One-Pass Signature
//!     ├ Literal Data (the CPIM envelope, or the file)
//!     └ Signature
//! ```

use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use log::{debug, trace, warn};

use sequoia_openpgp as openpgp;
use openpgp::{Cert, Packet};
use openpgp::packet::{PKESK, Tag};
use openpgp::packet::signature::SignatureBuilder;
use openpgp::packet::signature::subpacket::{Subpacket, SubpacketValue};
use openpgp::parse::{PacketParser, PacketParserResult, Parse};
use openpgp::serialize::stream::{
    Compressor, Encryptor, LiteralWriter, Message, Recipient, Signer,
};
use openpgp::types::{
    CompressionAlgorithm, DataFormat, HashAlgorithm, SignatureType,
    SymmetricAlgorithm,
};

use crate::Result;
use crate::context::CryptoContext;
use crate::cpim::{self, CpimMessage};
use crate::errors::{
    DecryptError, DecryptErrorKind, Error, VerifyError, VerifyErrorKind,
};
use crate::flags::SecurityFlags;
use crate::keys::{self, PublicKey};
use crate::personal::PersonalKey;
use crate::userid;

use super::{stanza, Coder, DecryptOutput, VerifyOutput};

/// Size of the chunks written to the literal data packet.
const BUFFER_SIZE: usize = 1 << 8;
/// Size of the chunks copied out of the literal data packet.
const FILE_BUFFER_SIZE: usize = 8192;

enum Mode<'a> {
    Encrypt(&'a [Cert]),
    Decrypt(Option<&'a Cert>),
}

/// Encrypts to a set of recipients, or decrypts from a sender.
///
/// The mode is chosen at construction.  A coder created with
/// [`PgpCoder::for_recipients`] can encrypt and decrypt (without a
/// sender to verify against); one created with
/// [`PgpCoder::from_sender`] can only decrypt and verify.
pub struct PgpCoder<'a> {
    ctx: &'a CryptoContext,
    key: &'a PersonalKey,
    mode: Mode<'a>,
}

impl<'a> PgpCoder<'a> {
    /// Creates a coder encrypting to `recipients`.
    pub fn for_recipients(ctx: &'a CryptoContext, key: &'a PersonalKey,
                          recipients: &'a [Cert]) -> Self {
        PgpCoder { ctx, key, mode: Mode::Encrypt(recipients) }
    }

    /// Creates a coder decrypting messages from `sender`.
    ///
    /// Without a sender, signatures cannot be verified.
    pub fn from_sender(ctx: &'a CryptoContext, key: &'a PersonalKey,
                       sender: Option<&'a Cert>) -> Self {
        PgpCoder { ctx, key, mode: Mode::Decrypt(sender) }
    }

    fn recipients(&self) -> Result<&'a [Cert]> {
        match self.mode {
            Mode::Encrypt(recipients) => Ok(recipients),
            Mode::Decrypt(_) => Err(Error::InvalidOperation(
                "coder was created for decryption".into()).into()),
        }
    }

    fn sender(&self) -> Option<&'a Cert> {
        match self.mode {
            Mode::Decrypt(sender) => sender,
            Mode::Encrypt(_) => None,
        }
    }

    fn own_user_id(&self) -> Option<String> {
        self.key.user_id(Some(self.ctx.network()))
    }

    /// Returns the keys that may have made the sender's signature,
    /// in order of preference.
    fn verifier_candidates(&self, verify: bool) -> Vec<PublicKey> {
        let sender = match self.sender() {
            Some(sender) if verify => sender,
            _ => return Vec::new(),
        };

        let mut candidates: Vec<PublicKey> =
            keys::signing_key(sender).into_iter().collect();
        let master = sender.primary_key().key().clone().role_into_unspecified();
        if candidates.iter().all(|k| k.fingerprint() != master.fingerprint()) {
            candidates.push(master);
        }
        candidates
    }

    fn encrypt_data(&self, mime: &str, data: &str) -> Result<Vec<u8>> {
        let network = Some(self.ctx.network());
        let from = self.own_user_id().ok_or(Error::MissingUserId)?;
        let to = self.recipients()?.iter()
            .map(|cert| userid::user_id(cert, network).ok_or(Error::MissingUserId))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let envelope = CpimMessage::new(from, to, self.ctx.now(), mime, data)
            .to_string();
        let mut out = Vec::new();
        self.encrypt_stream(&mut envelope.as_bytes(), &mut out)?;
        Ok(out)
    }

    fn encrypt_stream(&self, input: &mut dyn Read,
                      output: &mut (dyn Write + Send + Sync)) -> Result<()> {
        let recipients = self.recipients()?;
        let now = self.ctx.now();
        if let Some(cert) = recipients.iter()
            .find(|cert| keys::is_revoked(cert, self.ctx.policy(), now))
        {
            return Err(Error::InvalidKeyData(
                format!("{} is revoked", cert.fingerprint())).into());
        }
        let encryption_keys = recipients.iter()
            .map(|cert| keys::encryption_key(cert).ok_or_else(|| {
                Error::InvalidKeyData(
                    format!("{} has no encryption key", cert.fingerprint()))
            }))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let uid = self.own_user_id().ok_or(Error::MissingUserId)?;
        debug!("encrypting for {} recipients", encryption_keys.len());

        let message = Message::new(output);
        let message = Encryptor::for_recipients(
            message,
            encryption_keys.iter().map(|k| Recipient::new(k.keyid(), k)))
            .symmetric_algo(SymmetricAlgorithm::AES192)
            .build()?;
        let message = Compressor::new(message)
            .algo(CompressionAlgorithm::Zip)
            .build()?;

        let template = SignatureBuilder::new(SignatureType::Binary)
            .modify_unhashed_area(|mut a| {
                a.add(Subpacket::new(
                    SubpacketValue::SignersUserID(uid.into_bytes()), false)?)?;
                Ok(a)
            })?;
        let message = Signer::with_template(
            message, self.key.ring().sign().to_crypto()?, template)
            .hash_algo(HashAlgorithm::SHA256)?
            .creation_time(now)
            .build()?;

        let mut literal = LiteralWriter::new(message)
            .format(DataFormat::Binary)
            .date(now)?
            .build()?;

        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            literal.write_all(&buf[..n])?;
        }

        literal.finalize()?;
        Ok(())
    }

    fn decrypt_stream(&self, mut ppr: PacketParserResult, verify: bool,
                      output: &mut dyn Write)
                      -> std::result::Result<Content, DecryptError>
    {
        use DecryptErrorKind::*;

        let mut pkesks: Vec<PKESK> = Vec::new();
        let mut pp = loop {
            let pp = match ppr {
                PacketParserResult::Some(pp) => pp,
                PacketParserResult::EOF(_) => return Err(DecryptError::new(
                    InvalidData, "Encrypted data packet expected")),
            };

            match pp.packet.tag() {
                Tag::Marker | Tag::PKESK => {
                    let (packet, next) = pp.next()
                        .map_err(|e| DecryptError::wrap(InvalidData, e))?;
                    if let Packet::PKESK(pkesk) = packet {
                        pkesks.push(pkesk);
                    }
                    ppr = next;
                }
                Tag::SEIP => break pp,
                tag => return Err(DecryptError::new(
                    InvalidData, format!("Unexpected {} packet", tag))),
            }
        };

        let encrypt = self.key.ring().encrypt();
        let ours = encrypt.keyid();
        let pkesk = pkesks.iter()
            .find(|pkesk| pkesk.recipient() == &ours)
            .ok_or_else(|| DecryptError::new(
                PrivateKeyNotFound, "Secret key for message not found"))?;
        debug!("decrypting message for {}", ours);

        let mut keypair = encrypt.to_crypto()
            .map_err(|e| DecryptError::wrap(DecryptFailed, e))?;
        let (algo, session_key) = pkesk.decrypt(&mut keypair, None)
            .ok_or_else(|| DecryptError::new(
                DecryptFailed, "Unable to decrypt session key"))?;
        // The session key is ours, so a bad prefix means the encrypted
        // data was modified.
        pp.decrypt(algo, &session_key)
            .map_err(|e| DecryptError::with_cause(
                IntegrityCheck, "Message integrity check failed", e))?;

        let mut walk = ContentWalk::new(self.verifier_candidates(verify),
                                        verify, output, IntegrityCheck);
        let (_, mut ppr) = pp.recurse()
            .map_err(|e| DecryptError::wrap(IntegrityCheck, e))?;
        while let PacketParserResult::Some(pp) = ppr {
            ppr = walk.step(pp)?;
        }
        walk.finish(true)
    }

    /// Checks the envelope of a decrypted text message.
    ///
    /// Returns the content type, the payload and the declared time of
    /// sending.
    fn open_envelope(&self, msg: CpimMessage, verify: bool,
                     errors: &mut Vec<DecryptError>)
                     -> std::result::Result<(String, String, Option<SystemTime>),
                                            DecryptError>
    {
        use DecryptErrorKind::*;

        let mime = msg.mime().to_string();
        let timestamp = msg.date();
        let is_text = mime.eq_ignore_ascii_case(cpim::MIME_TEXT_PLAIN);
        let is_stanza = mime.eq_ignore_ascii_case(cpim::MIME_XMPP_STANZA);

        if verify {
            if ! is_text && ! is_stanza {
                return Err(DecryptError::new(IntegrityCheck,
                                             "MIME type mismatch"));
            }

            let network = Some(self.ctx.network());
            let to_us = self.own_user_id()
                .map(|uid| msg.to().iter().any(|to| to == &uid))
                .unwrap_or(false);
            if ! to_us {
                collect(errors, DecryptError::new(
                    InvalidRecipient, "Destination does not match personal key"));
            }

            match self.sender() {
                Some(sender) => {
                    if userid::user_id(sender, network).as_deref()
                        != Some(msg.from())
                    {
                        collect(errors, DecryptError::new(
                            InvalidSender, "Sender does not match sender's key"));
                    }
                }
                None => collect(errors, DecryptError::new(
                    VerificationFailed, "Sender key not available")),
            }

            match timestamp {
                None => collect(errors, DecryptError::new(
                    InvalidTimestamp, "Missing or invalid timestamp")),
                Some(date) if is_text
                    && self.ctx.is_drifted(date, self.ctx.now()) =>
                    collect(errors, DecryptError::new(
                        InvalidTimestamp, "Drifted timestamp")),
                Some(_) => (),
            }
        }

        let mut body = msg.into_body();
        if is_stanza {
            body = stanza::unwrap(&body)
                .ok_or_else(|| DecryptError::new(
                    InvalidData, "Invalid XMPP wrapper"))?
                .to_string();

            if verify {
                if let (Some(delay), Some(date)) =
                    (stanza::delay_stamp(&body), timestamp)
                {
                    if time_diff(delay, date) >= self.ctx.drift_threshold() {
                        collect(errors, DecryptError::new(
                            InvalidTimestamp, "Drifted timestamp"));
                    }
                }
            }
        }

        Ok((mime, body, timestamp))
    }
}

impl<'a> Coder for PgpCoder<'a> {
    fn supported_flags(&self) -> SecurityFlags {
        SecurityFlags::BASIC
    }

    fn encrypt_text(&self, text: &str) -> Result<Vec<u8>> {
        self.encrypt_data(cpim::MIME_TEXT_PLAIN, text)
    }

    fn encrypt_stanza(&self, xml: &str) -> Result<Vec<u8>> {
        self.encrypt_data(cpim::MIME_XMPP_STANZA, &stanza::wrap(xml))
    }

    fn decrypt_text(&self, encrypted: &[u8], verify: bool)
                    -> std::result::Result<DecryptOutput, DecryptError>
    {
        let ppr = PacketParser::from_bytes(encrypted)
            .map_err(|e| DecryptError::wrap(DecryptErrorKind::InvalidData, e))?;
        let mut plain = Vec::new();
        let content = self.decrypt_stream(ppr, verify, &mut plain)?;
        let data = String::from_utf8_lossy(&plain).into_owned();

        let mut features = SecurityFlags::BASIC_ENCRYPTED;
        if content.signed {
            features |= SecurityFlags::BASIC_SIGNED;
        }
        let mut errors = content.errors;

        let (mime, body, timestamp) = match CpimMessage::parse(&data) {
            Ok(msg) => {
                let (mime, body, timestamp) =
                    self.open_envelope(msg, verify, &mut errors)?;
                (Some(mime), body, timestamp)
            }
            Err(e) => {
                if verify {
                    collect(&mut errors, DecryptError::with_cause(
                        DecryptErrorKind::InvalidData,
                        "Verification was requested but no CPIM valid data \
                         was found", e));
                }
                (None, data, None)
            }
        };

        Ok(DecryptOutput { body, mime, timestamp, errors, features })
    }

    fn encrypt_file(&self, input: &mut dyn Read,
                    output: &mut (dyn Write + Send + Sync)) -> Result<()> {
        self.encrypt_stream(input, output)
    }

    fn decrypt_file(&self, input: &mut (dyn Read + Send + Sync), verify: bool,
                    output: &mut dyn Write, errors: &mut Vec<DecryptError>)
                    -> std::result::Result<(), DecryptError>
    {
        let ppr = PacketParser::from_reader(input)
            .map_err(|e| DecryptError::wrap(DecryptErrorKind::InvalidData, e))?;
        let content = self.decrypt_stream(ppr, verify, output)?;
        errors.extend(content.errors);
        Ok(())
    }

    fn verify_text(&self, signed: &[u8], verify: bool)
                   -> std::result::Result<VerifyOutput, VerifyError>
    {
        let mut ppr = PacketParser::from_bytes(signed)
            .map_err(|e| VerifyError::wrap(VerifyErrorKind::InvalidData, e))?;

        let mut plain = Vec::new();
        let mut walk = ContentWalk::new(self.verifier_candidates(verify),
                                        verify, &mut plain,
                                        DecryptErrorKind::InvalidData);
        while let PacketParserResult::Some(pp) = ppr {
            ppr = walk.step(pp)?;
        }
        let content = walk.finish(false)?;

        Ok(VerifyOutput {
            body: String::from_utf8_lossy(&plain).into_owned(),
            timestamp: content.timestamp,
            errors: content.errors.into_iter().map(Into::into).collect(),
        })
    }
}

fn collect(errors: &mut Vec<DecryptError>, e: DecryptError) {
    warn!("{}", e);
    errors.push(e);
}

fn time_diff(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or_default()
}

/// What was found in the signed content.
struct Content {
    timestamp: Option<SystemTime>,
    signed: bool,
    errors: Vec<DecryptError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Compressed,
    Literal,
    Signature,
    Done,
}

/// Walks compressed data holding an optional one-pass signature,
/// literal data and the trailing signature.
///
/// Structural problems are recorded and the rest of the stream is
/// drained, so that the integrity protection of an enclosing
/// container is checked before they are reported.
struct ContentWalk<'o> {
    candidates: Vec<PublicKey>,
    verify: bool,
    output: &'o mut dyn Write,
    /// The kind reported for parse errors.
    malformed: DecryptErrorKind,
    state: State,
    verifier: Option<PublicKey>,
    signed: bool,
    timestamp: Option<SystemTime>,
    mdc: Option<bool>,
    failure: Option<DecryptError>,
    errors: Vec<DecryptError>,
}

impl<'o> ContentWalk<'o> {
    fn new(candidates: Vec<PublicKey>, verify: bool,
           output: &'o mut dyn Write, malformed: DecryptErrorKind) -> Self {
        ContentWalk {
            candidates,
            verify,
            output,
            malformed,
            state: State::Compressed,
            verifier: None,
            signed: false,
            timestamp: None,
            mdc: None,
            failure: None,
            errors: Vec::new(),
        }
    }

    fn advance<'a>(&self, r: Result<(Packet, PacketParserResult<'a>)>)
                   -> std::result::Result<PacketParserResult<'a>, DecryptError>
    {
        r.map(|(_, next)| next)
            .map_err(|e| DecryptError::wrap(self.malformed, e))
    }

    fn fail(&mut self, e: DecryptError) {
        debug!("content walk failed: {}", e);
        if self.failure.is_none() {
            self.failure = Some(e);
        }
    }

    fn step<'a>(&mut self, mut pp: PacketParser<'a>)
                -> std::result::Result<PacketParserResult<'a>, DecryptError>
    {
        use DecryptErrorKind::*;

        let tag = pp.packet.tag();
        trace!("{:?}: {} at depth {}", self.state, tag, pp.recursion_depth());

        if let Packet::MDC(ref mdc) = pp.packet {
            self.mdc = Some(mdc.valid());
            if self.state == State::Signature {
                self.missing_signature();
                self.state = State::Done;
            }
            return self.advance(pp.next());
        }

        if self.failure.is_some() || self.state == State::Done {
            return self.advance(pp.next());
        }

        match (self.state, tag) {
            (State::Compressed, Tag::CompressedData) => {
                self.state = State::Literal;
                self.advance(pp.recurse())
            }
            (State::Compressed, _) => {
                self.fail(DecryptError::new(
                    InvalidData, "Compressed data packet expected"));
                self.advance(pp.next())
            }
            (State::Literal, Tag::OnePassSig) => {
                if let Packet::OnePassSig(ref ops) = pp.packet {
                    if ! self.signed {
                        self.signed = true;
                        let algo = ops.pk_algo();
                        self.verifier = self.candidates.iter()
                            .find(|k| k.pk_algo() == algo)
                            .cloned();
                        debug!("one-pass signature by {}, verifier {:?}",
                               ops.issuer(),
                               self.verifier.as_ref().map(|k| k.fingerprint()));
                    }
                }
                self.advance(pp.recurse())
            }
            (State::Literal, Tag::Literal) => {
                if let Packet::Literal(ref l) = pp.packet {
                    self.timestamp = l.date();
                }
                self.copy_literal(&mut pp)?;
                if self.verify && self.verifier.is_none() {
                    collect(&mut self.errors, DecryptError::new(
                        VerificationFailed, "No signature list found"));
                }
                self.state = State::Signature;
                self.advance(pp.recurse())
            }
            (State::Literal, _) => {
                self.fail(DecryptError::new(
                    InvalidData, format!("Unknown packet type {}", tag)));
                self.advance(pp.next())
            }
            (State::Signature, Tag::Signature) => {
                self.state = State::Done;
                let (packet, next) = pp.recurse()
                    .map_err(|e| DecryptError::wrap(self.malformed, e))?;
                if let (true, Some(key), Packet::Signature(sig)) =
                    (self.verify, self.verifier.as_ref(), packet)
                {
                    if let Err(e) = sig.verify(key) {
                        collect(&mut self.errors, DecryptError::with_cause(
                            VerificationFailed,
                            "Signature verification failed", e));
                    }
                }
                Ok(next)
            }
            (State::Signature, _) => {
                self.missing_signature();
                self.state = State::Done;
                self.advance(pp.next())
            }
            (State::Done, _) => self.advance(pp.next()),
        }
    }

    fn missing_signature(&mut self) {
        if self.verify && self.verifier.is_some() {
            collect(&mut self.errors, DecryptError::new(
                DecryptErrorKind::InvalidData, "Invalid signature packet"));
        }
    }

    fn copy_literal(&mut self, pp: &mut PacketParser)
                    -> std::result::Result<(), DecryptError>
    {
        let mut buf = vec![0u8; FILE_BUFFER_SIZE];
        loop {
            let n = pp.read(&mut buf)
                .map_err(|e| DecryptError::with_cause(
                    self.malformed, "Unable to read literal data", e))?;
            if n == 0 {
                return Ok(());
            }
            self.output.write_all(&buf[..n])
                .map_err(|e| DecryptError::wrap(DecryptErrorKind::InvalidData, e))?;
        }
    }

    fn finish(mut self, encrypted: bool)
              -> std::result::Result<Content, DecryptError>
    {
        use DecryptErrorKind::*;

        if encrypted && self.mdc != Some(true) {
            return Err(DecryptError::new(IntegrityCheck,
                                         "Message integrity check failed"));
        }
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }

        match self.state {
            State::Compressed => return Err(DecryptError::new(
                InvalidData, "Compressed data packet expected")),
            State::Literal => return Err(DecryptError::new(
                InvalidData, "Literal data packet expected")),
            State::Signature => self.missing_signature(),
            State::Done => (),
        }

        Ok(Content {
            timestamp: self.timestamp,
            signed: self.signed,
            errors: self.errors,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::keys::KeyPairRing;

    struct Party {
        key: PersonalKey,
        cert: Cert,
    }

    fn party(name: &str) -> Result<Party> {
        let key = PersonalKey::create(
            SystemTime::now() - Duration::from_secs(3600))?;
        let ring: KeyPairRing =
            key.store_network(name, "kontalk.net", name, "secret")?;
        let cert = ring.public().clone();
        let key = PersonalKey::from_ring(&ring, "secret", None)?;
        Ok(Party { key, cert })
    }

    #[test]
    fn text_round_trip() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, bob) = (party("alice")?, party("bob")?);

        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        assert_eq!(coder.supported_flags(), SecurityFlags::BASIC);
        let encrypted = coder.encrypt_text("Hello Bob!")?;

        let coder = PgpCoder::from_sender(&ctx, &bob.key, Some(&alice.cert));
        let out = coder.decrypt_text(&encrypted, true)?;
        assert_eq!(out.body(), "Hello Bob!");
        assert_eq!(out.mime(), Some(cpim::MIME_TEXT_PLAIN));
        assert!(! out.has_errors(), "{:?}", out.errors());
        assert!(out.timestamp().is_some());
        assert_eq!(out.security_flags(), SecurityFlags::BASIC);
        Ok(())
    }

    #[test]
    fn stanza_round_trip() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, bob) = (party("alice")?, party("bob")?);

        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        let stanza = "<message><body>hi</body></message>";
        let encrypted = coder.encrypt_stanza(stanza)?;

        let coder = PgpCoder::from_sender(&ctx, &bob.key, Some(&alice.cert));
        let out = coder.decrypt_text(&encrypted, true)?;
        assert_eq!(out.body(), stanza);
        assert_eq!(out.mime(), Some(cpim::MIME_XMPP_STANZA));
        assert!(! out.has_errors(), "{:?}", out.errors());
        Ok(())
    }

    #[test]
    fn delayed_stanza() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, bob) = (party("alice")?, party("bob")?);

        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        let encrypted = coder.encrypt_stanza(
            "<message><delay xmlns='urn:xmpp:delay' \
             stamp='2014-01-02T10:20:30Z'/></message>")?;

        let coder = PgpCoder::from_sender(&ctx, &bob.key, Some(&alice.cert));
        let out = coder.decrypt_text(&encrypted, true)?;
        let kinds: Vec<_> = out.errors().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![DecryptErrorKind::InvalidTimestamp]);
        assert!(out.security_flags().contains(SecurityFlags::INVALID_TIMESTAMP));
        Ok(())
    }

    #[test]
    fn drifted_timestamp() -> Result<()> {
        let (alice, bob) = (party("alice")?, party("bob")?);

        let sent = CryptoContext::new("kontalk.net");
        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&sent, &alice.key, &recipients);
        let encrypted = coder.encrypt_text("late")?;

        let received = CryptoContext::configure("kontalk.net")
            .reference_time(SystemTime::now() + Duration::from_secs(2 * 86400))
            .build();
        let coder = PgpCoder::from_sender(&received, &bob.key, Some(&alice.cert));
        let out = coder.decrypt_text(&encrypted, true)?;
        let e = out.errors().iter()
            .find(|e| e.kind() == DecryptErrorKind::InvalidTimestamp)
            .expect("drift detected");
        assert_eq!(e.detail(), Some("Drifted timestamp"));
        Ok(())
    }

    #[test]
    fn decrypt_without_verification() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, bob) = (party("alice")?, party("bob")?);

        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        let encrypted = coder.encrypt_text("hi")?;

        let coder = PgpCoder::from_sender(&ctx, &bob.key, None);
        let out = coder.decrypt_text(&encrypted, false)?;
        assert_eq!(out.body(), "hi");
        assert!(! out.has_errors());

        let out = coder.decrypt_text(&encrypted, true)?;
        assert!(out.errors().iter()
                .any(|e| e.kind() == DecryptErrorKind::VerificationFailed));
        Ok(())
    }

    #[test]
    fn revoked_recipient() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, mut bob) = (party("alice")?, party("bob")?);

        let revoked = bob.key.revoke(true)?;
        assert!(keys::is_revoked(&revoked, ctx.policy(), ctx.now()));
        assert!(! keys::is_revoked(&alice.cert, ctx.policy(), ctx.now()));

        let recipients = [revoked];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        let err = coder.encrypt_text("hi").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::InvalidKeyData(_))));
        Ok(())
    }

    #[test]
    fn mode_mismatch() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let alice = party("alice")?;
        let coder = PgpCoder::from_sender(&ctx, &alice.key, None);
        let err = coder.encrypt_text("hi").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::InvalidOperation(_))));
        Ok(())
    }

    #[test]
    fn file_round_trip() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let (alice, bob) = (party("alice")?, party("bob")?);
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();

        let recipients = [bob.cert.clone()];
        let coder = PgpCoder::for_recipients(&ctx, &alice.key, &recipients);
        let mut encrypted = Vec::new();
        coder.encrypt_file(&mut &data[..], &mut encrypted)?;

        let coder = PgpCoder::from_sender(&ctx, &bob.key, Some(&alice.cert));
        let mut plain = Vec::new();
        let mut errors = Vec::new();
        coder.decrypt_file(&mut &encrypted[..], true, &mut plain, &mut errors)?;
        assert_eq!(plain, data);
        assert!(errors.is_empty(), "{:?}", errors);
        Ok(())
    }

    #[test]
    fn verify_signed_text() -> Result<()> {
        let ctx = CryptoContext::new("kontalk.net");
        let alice = party("alice")?;
        let mallory = party("mallory")?;

        let mut signed = Vec::new();
        {
            let message = Message::new(&mut signed);
            let message = Compressor::new(message)
                .algo(CompressionAlgorithm::Zip).build()?;
            let message = Signer::new(message,
                                      alice.key.ring().sign().to_crypto()?)
                .build()?;
            let mut literal = LiteralWriter::new(message).build()?;
            literal.write_all(b"signed text")?;
            literal.finalize()?;
        }

        let coder = PgpCoder::from_sender(&ctx, &mallory.key, Some(&alice.cert));
        let out = coder.verify_text(&signed, true)?;
        assert_eq!(out.body(), "signed text");
        assert!(out.errors().is_empty(), "{:?}", out.errors());

        let coder = PgpCoder::from_sender(&ctx, &alice.key, Some(&mallory.cert));
        let out = coder.verify_text(&signed, true)?;
        assert_eq!(out.body(), "signed text");
        assert_eq!(out.errors().len(), 1);
        assert_eq!(out.errors()[0].kind(), VerifyErrorKind::VerificationFailed);

        let err = coder.verify_text(b"not openpgp", true).unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::InvalidData);
        Ok(())
    }
}
