//! OpenPGP user ID parsing.
//!
//! Kontalk user IDs have one of the forms `Name (comment) <email>`,
//! `Name <email>` or a bare `email`, where the email is the user's
//! JID on the network.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use sequoia_openpgp as openpgp;
use openpgp::Cert;

lazy_static! {
    static ref UID_FULL: Regex =
        Regex::new(r"^(.*) \((.*)\) <(.*)>$").unwrap();
    static ref UID_NO_COMMENT: Regex =
        Regex::new(r"^(.*) <(.*)>$").unwrap();
    static ref UID_EMAIL_ONLY: Regex =
        Regex::new(r"^(.*@.*)$").unwrap();
}

/// A parsed user ID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PgpUserId {
    name: Option<String>,
    comment: Option<String>,
    email: Option<String>,
}

impl PgpUserId {
    /// Creates a user ID from its parts.
    pub fn new<N, C, E>(name: N, comment: C, email: E) -> Self
        where N: Into<Option<String>>,
              C: Into<Option<String>>,
              E: Into<Option<String>>,
    {
        PgpUserId {
            name: name.into(),
            comment: comment.into(),
            email: email.into(),
        }
    }

    /// Parses a user ID.
    ///
    /// The full form is tried first, then the form without a comment,
    /// then a bare email address.  Returns `None` if none matches.
    ///
    /// ```
    /// # use kontalk_openpgp::userid::PgpUserId;
    /// let uid = PgpUserId::parse("Alice <alice@kontalk.net>").unwrap();
    /// assert_eq!(uid.name(), Some("Alice"));
    /// assert_eq!(uid.comment(), None);
    /// assert_eq!(uid.email(), Some("alice@kontalk.net"));
    /// ```
    pub fn parse(uid: &str) -> Option<Self> {
        let s = |m: Option<regex::Match>| m.map(|m| m.as_str().to_string());

        if let Some(c) = UID_FULL.captures(uid) {
            return Some(PgpUserId::new(s(c.get(1)), s(c.get(2)), s(c.get(3))));
        }
        if let Some(c) = UID_NO_COMMENT.captures(uid) {
            return Some(PgpUserId::new(s(c.get(1)), None, s(c.get(2))));
        }
        if let Some(c) = UID_EMAIL_ONLY.captures(uid) {
            return Some(PgpUserId::new(None, None, s(c.get(1))));
        }
        None
    }

    /// Returns the name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the comment.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Returns the email address.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Returns the domain part of the email address, without any
    /// resource.
    pub fn domain(&self) -> Option<&str> {
        self.email.as_deref().map(jid_domain)
    }
}

impl fmt::Display for PgpUserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.name, &self.comment, &self.email) {
            (None, None, Some(email)) => f.write_str(email),
            (Some(name), comment, email) => {
                f.write_str(name)?;
                if let Some(comment) = comment {
                    write!(f, " ({})", comment)?;
                }
                if let Some(email) = email {
                    write!(f, " <{}>", email)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Returns the domain of a JID.
fn jid_domain(jid: &str) -> &str {
    let start = jid.find('@').map(|i| i + 1).unwrap_or(0);
    let rest = &jid[start..];
    match rest.find('/') {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// Returns the user ID of `cert` matching `host`.
///
/// Without a host, the first user ID is returned.  Otherwise the
/// first user ID whose email domain equals `host` (ignoring case) is
/// returned, falling back to the first user ID.
pub fn user_id(cert: &Cert, host: Option<&str>) -> Option<String> {
    let mut first = None;

    for uid in cert.userids() {
        let value = String::from_utf8_lossy(uid.userid().value()).into_owned();
        let host = match host {
            Some(host) => host,
            None => return Some(value),
        };

        let matches = PgpUserId::parse(&value)
            .and_then(|p| p.domain().map(|d| d.eq_ignore_ascii_case(host)))
            .unwrap_or(false);
        if matches {
            return Some(value);
        }
        if first.is_none() {
            first = Some(value);
        }
    }

    first
}

/// Returns the parsed user ID of `cert` matching `host`.
///
/// See [`user_id`].
pub fn parse_user_id(cert: &Cert, host: Option<&str>) -> Option<PgpUserId> {
    user_id(cert, host).and_then(|uid| PgpUserId::parse(&uid))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_format() {
        let table = [
            ("Alice (phone) <alice@kontalk.net>",
             Some("Alice"), Some("phone"), Some("alice@kontalk.net")),
            ("Alice <alice@kontalk.net>",
             Some("Alice"), None, Some("alice@kontalk.net")),
            ("alice@kontalk.net",
             None, None, Some("alice@kontalk.net")),
        ];

        for (uid, name, comment, email) in table.iter() {
            let parsed = PgpUserId::parse(uid).unwrap();
            assert_eq!(parsed.name(), *name);
            assert_eq!(parsed.comment(), *comment);
            assert_eq!(parsed.email(), *email);
            assert_eq!(&parsed.to_string(), uid);
        }

        assert_eq!(PgpUserId::parse("Alice"), None);
    }

    #[test]
    fn format_partial() {
        let uid = PgpUserId::new(Some("Bob".to_string()), None, None);
        assert_eq!(uid.to_string(), "Bob");

        let uid = PgpUserId::new(None, Some("c".to_string()), None);
        assert_eq!(uid.to_string(), "");
    }

    #[test]
    fn domain() {
        let uid = PgpUserId::parse("Bob <bob@Beta.Kontalk.net/phone>").unwrap();
        assert_eq!(uid.domain(), Some("Beta.Kontalk.net"));
        assert_eq!(jid_domain("kontalk.net"), "kontalk.net");
    }

    #[test]
    fn select_by_host() -> openpgp::Result<()> {
        use openpgp::cert::prelude::*;

        let (cert, _) = CertBuilder::new()
            .add_userid("Alice <alice@prime.kontalk.net>")
            .add_userid("Alice <alice@beta.kontalk.net>")
            .generate()?;

        let first = user_id(&cert, None).unwrap();
        assert!(first.contains("@"));

        assert_eq!(user_id(&cert, Some("BETA.kontalk.net")).as_deref(),
                   Some("Alice <alice@beta.kontalk.net>"));
        assert_eq!(user_id(&cert, Some("prime.kontalk.net")).as_deref(),
                   Some("Alice <alice@prime.kontalk.net>"));
        assert_eq!(user_id(&cert, Some("other.net")), Some(first));

        let parsed = parse_user_id(&cert, Some("beta.kontalk.net")).unwrap();
        assert_eq!(parsed.email(), Some("alice@beta.kontalk.net"));
        Ok(())
    }
}
