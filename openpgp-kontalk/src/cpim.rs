//! The `Message/CPIM` integrity envelope.
//!
//! Every encrypted text message wraps its payload in a small CPIM
//! document naming the sender, the recipients and the time of
//! sending.  The recipient compares these headers with the keys the
//! message was actually encrypted to and signed by.
//!
//! ```text
//! Content-type: Message/CPIM
//!
//! From: alice@kontalk.net
//! To: bob@kontalk.net
//! DateTime: 2014-01-02T10:20:30.000Z
//!
//! Content-type: text/plain; charset=utf-8
//!
//! Hello Bob!
//! ```

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::Result;
use crate::errors::Error;

/// The content type of the envelope.
pub const CPIM_TYPE: &str = "Message/CPIM";
/// The content type of a plain text payload.
pub const MIME_TEXT_PLAIN: &str = "text/plain";
/// The content type of an XMPP stanza payload.
pub const MIME_XMPP_STANZA: &str = "application/xmpp+xml";

const CHARSET: &str = "utf-8";

/// A CPIM message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpimMessage {
    from: String,
    to: Vec<String>,
    date: Option<DateTime<Utc>>,
    mime: String,
    body: String,
}

impl CpimMessage {
    /// Creates a message.
    pub fn new<F, M, B>(from: F, to: Vec<String>, date: SystemTime,
                        mime: M, body: B) -> Self
        where F: Into<String>, M: Into<String>, B: Into<String>
    {
        CpimMessage {
            from: from.into(),
            to,
            date: Some(date.into()),
            mime: mime.into(),
            body: body.into(),
        }
    }

    /// Creates a plain text message.
    pub fn text<F, B>(from: F, to: Vec<String>, date: SystemTime, body: B)
                      -> Self
        where F: Into<String>, B: Into<String>
    {
        Self::new(from, to, date, MIME_TEXT_PLAIN, body)
    }

    /// Parses an envelope.
    ///
    /// Header names are matched ignoring case.  Parameters after `;`
    /// are dropped from `To` and `Content-type`.  A `DateTime` header
    /// that is missing or cannot be parsed yields a message without
    /// date.
    pub fn parse(data: &str) -> Result<Self> {
        let (outer, rest) = header_block(data)
            .ok_or_else(|| invalid("envelope header block not found"))?;
        let type_ok = outer.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("Content-type")
                && strip_params(value).eq_ignore_ascii_case(CPIM_TYPE)
        });
        if ! type_ok {
            return Err(invalid("invalid content type"));
        }

        let (headers, rest) = header_block(rest)
            .ok_or_else(|| invalid("message header block not found"))?;
        let mut from = String::new();
        let mut to = Vec::new();
        let mut date = None;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("From") {
                from = value.to_string();
            } else if name.eq_ignore_ascii_case("To") {
                to.push(strip_params(value).to_string());
            } else if name.eq_ignore_ascii_case("DateTime") {
                date = parse_date(value);
            }
        }

        let (content, body) = header_block(rest)
            .ok_or_else(|| invalid("content header block not found"))?;
        let mime = content.iter()
            .rev()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-type"))
            .map(|(_, value)| strip_params(value).to_string())
            .unwrap_or_default();

        Ok(CpimMessage { from, to, date, mime, body: body.to_string() })
    }

    /// Returns the sender.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Returns the recipients.
    pub fn to(&self) -> &[String] {
        &self.to
    }

    /// Returns the time of sending.
    pub fn date(&self) -> Option<SystemTime> {
        self.date.map(SystemTime::from)
    }

    /// Returns the content type of the payload.
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// Returns the payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the payload, consuming the message.
    pub fn into_body(self) -> String {
        self.body
    }
}

impl fmt::Display for CpimMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Content-type: {}\n\n", CPIM_TYPE)?;
        writeln!(f, "From: {}", self.from)?;
        for to in &self.to {
            writeln!(f, "To: {}", to)?;
        }
        if let Some(date) = &self.date {
            writeln!(f, "DateTime: {}", format_date(date))?;
        }
        write!(f, "\nContent-type: {}; charset={}\n\n", self.mime, CHARSET)?;
        f.write_str(&self.body)
    }
}

fn invalid(msg: &str) -> anyhow::Error {
    Error::InvalidData(msg.into()).into()
}

/// Formats a date as an XEP-0082 UTC timestamp with milliseconds.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an XEP-0082 timestamp.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Legacy XEP-0091 form.
            NaiveDateTime::parse_from_str(value, "%Y%m%dT%H:%M:%S")
                .ok()
                .map(|d| DateTime::<Utc>::from_utc(d, Utc))
        })
}

fn strip_params(value: &str) -> &str {
    match value.find(';') {
        Some(pos) => value[..pos].trim(),
        None => value,
    }
}

/// Splits off a header block terminated by an empty line.
///
/// Returns the headers and the remaining data, or `None` if the data
/// ends before the empty line.
fn header_block(data: &str) -> Option<(Vec<(&str, &str)>, &str)> {
    let mut headers = Vec::new();
    let mut rest = data;

    loop {
        let end = rest.find('\n')?;
        let line = rest[..end].trim_end_matches('\r');
        rest = &rest[end + 1..];

        if line.is_empty() {
            return Some((headers, rest));
        }
        if let Some(sep) = line.find(':') {
            headers.push((line[..sep].trim(), line[sep + 1..].trim()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const ENVELOPE: &str = "Content-type: Message/CPIM\n\
                            \n\
                            From: Alice <alice@kontalk.net>\n\
                            To: Bob <bob@kontalk.net>\n\
                            To: Carol <carol@kontalk.net>; role=cc\n\
                            DateTime: 2014-01-02T10:20:30.400Z\n\
                            \n\
                            Content-type: text/plain; charset=utf-8\n\
                            \n\
                            Hello\n\nBob!";

    #[test]
    fn parse() -> Result<()> {
        let msg = CpimMessage::parse(ENVELOPE)?;
        assert_eq!(msg.from(), "Alice <alice@kontalk.net>");
        assert_eq!(msg.to(), &["Bob <bob@kontalk.net>".to_string(),
                               "Carol <carol@kontalk.net>".to_string()]);
        assert_eq!(msg.mime(), MIME_TEXT_PLAIN);
        assert_eq!(msg.body(), "Hello\n\nBob!");
        assert_eq!(msg.date(),
                   Some(UNIX_EPOCH + Duration::from_millis(1388658030400)));
        Ok(())
    }

    #[test]
    fn format() -> Result<()> {
        let date = UNIX_EPOCH + Duration::from_millis(1388658030400);
        let msg = CpimMessage::text("alice@kontalk.net",
                                    vec!["bob@kontalk.net".into()],
                                    date, "hi");
        assert_eq!(msg.to_string(),
                   "Content-type: Message/CPIM\n\n\
                    From: alice@kontalk.net\n\
                    To: bob@kontalk.net\n\
                    DateTime: 2014-01-02T10:20:30.400Z\n\n\
                    Content-type: text/plain; charset=utf-8\n\n\
                    hi");
        assert_eq!(CpimMessage::parse(&msg.to_string())?, msg);
        Ok(())
    }

    #[test]
    fn case_and_line_endings() -> Result<()> {
        let data = "content-TYPE: message/cpim\r\n\r\n\
                    from: a\r\nto: b\r\ndatetime: 2014-01-02T10:20:30Z\r\n\r\n\
                    CONTENT-TYPE: application/xmpp+xml\r\n\r\n<x/>";
        let msg = CpimMessage::parse(data)?;
        assert_eq!(msg.from(), "a");
        assert_eq!(msg.to(), &["b".to_string()]);
        assert_eq!(msg.mime(), MIME_XMPP_STANZA);
        assert_eq!(msg.body(), "<x/>");
        assert!(msg.date().is_some());
        Ok(())
    }

    #[test]
    fn bad_date() -> Result<()> {
        let data = ENVELOPE.replace("2014-01-02T10:20:30.400Z", "yesterday");
        assert_eq!(CpimMessage::parse(&data)?.date(), None);
        assert!(parse_date("20140102T10:20:30").is_some());
        Ok(())
    }

    #[test]
    fn malformed() {
        assert!(CpimMessage::parse("").is_err());
        assert!(CpimMessage::parse("Hello Bob!").is_err());
        assert!(CpimMessage::parse(
            &ENVELOPE.replace("Message/CPIM", "text/plain")).is_err());

        let truncated = &ENVELOPE[..ENVELOPE.find("Content-type: text").unwrap()];
        assert!(CpimMessage::parse(truncated).is_err());
    }
}
