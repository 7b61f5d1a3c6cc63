//! XMPP stanza payloads.
//!
//! Stanzas travel inside an `<xmpp xmlns='jabber:client'>` element.
//! The wrapper is recognized with either quote style, whitespace
//! around `=` and further attributes in any order, as long as it is
//! the outermost element.  A delay is read from the first `<delay/>`
//! or `<x/>` element in the `urn:xmpp:delay` or `jabber:x:delay`
//! namespace that has a `stamp` attribute.  Namespace prefixes are not
//! resolved.

use std::time::SystemTime;

use lazy_static::lazy_static;
use regex::Regex;

use crate::cpim;

const XMPP_WRAPPER_START: &str = "<xmpp xmlns='jabber:client'>";
const XMPP_WRAPPER_END: &str = "</xmpp>";

lazy_static! {
    static ref WRAPPER: Regex = Regex::new(
        r#"(?s)^\s*<xmpp(?:\s[^>]*)?\sxmlns\s*=\s*(?:"jabber:client"|'jabber:client')[^>]*>(.*)</xmpp\s*>\s*$"#)
        .unwrap();
    static ref DELAY_TAG: Regex = Regex::new(r"<(?:delay|x)\s[^>]*>").unwrap();
    static ref DELAY_NS: Regex = Regex::new(
        r#"\sxmlns\s*=\s*(?:"(?:urn:xmpp:delay|jabber:x:delay)"|'(?:urn:xmpp:delay|jabber:x:delay)')"#)
        .unwrap();
    static ref STAMP: Regex = Regex::new(
        r#"\sstamp\s*=\s*(?:"([^"]+)"|'([^']+)')"#).unwrap();
}

/// Wraps stanzas in an `<xmpp/>` element.
pub fn wrap(xml: &str) -> String {
    let mut out = String::with_capacity(
        XMPP_WRAPPER_START.len() + xml.len() + XMPP_WRAPPER_END.len());
    out.push_str(XMPP_WRAPPER_START);
    out.push_str(xml);
    out.push_str(XMPP_WRAPPER_END);
    out
}

/// Returns the content of an `<xmpp/>` element.
pub fn unwrap(xml: &str) -> Option<&str> {
    WRAPPER.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Returns the delay stamp of a stanza.
///
/// Both `urn:xmpp:delay` and the legacy `jabber:x:delay` are
/// recognized.
pub fn delay_stamp(xml: &str) -> Option<SystemTime> {
    DELAY_TAG.find_iter(xml)
        .map(|m| m.as_str())
        .filter(|tag| DELAY_NS.is_match(tag))
        .find_map(|tag| STAMP.captures(tag))
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .and_then(|m| cpim::parse_date(m.as_str()))
        .map(SystemTime::from)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn wrap_unwrap() {
        let stanza = "<message to='bob@kontalk.net'><body>hi</body></message>";
        let wrapped = wrap(stanza);
        assert_eq!(wrapped,
                   "<xmpp xmlns='jabber:client'><message to='bob@kontalk.net'>\
                    <body>hi</body></message></xmpp>");
        assert_eq!(unwrap(&wrapped), Some(stanza));
        assert_eq!(unwrap("<xmpp xmlns=\"jabber:client\">\n<a/>\n</xmpp>\n"),
                   Some("\n<a/>\n"));
        assert_eq!(unwrap("<message/>"), None);
        assert_eq!(unwrap("<xmpp xmlns='jabber:server'><a/></xmpp>"), None);
    }

    #[test]
    fn wrapper_variants() {
        assert_eq!(unwrap("<xmpp xml:lang='en' xmlns = 'jabber:client'>\
                           <a/></xmpp >"),
                   Some("<a/>"));
        assert_eq!(unwrap("<xmpp\n  xmlns=\"jabber:client\"\n><a/></xmpp>"),
                   Some("<a/>"));
        assert_eq!(unwrap("<xmppx xmlns='jabber:client'><a/></xmpp>"), None);
        assert_eq!(unwrap("<xmpp data-xmlns='jabber:client'><a/></xmpp>"), None);
        assert_eq!(unwrap("<xmpp xmlns='jabber:client\"><a/></xmpp>"), None);
        assert_eq!(unwrap("<other/><xmpp xmlns='jabber:client'><a/></xmpp>"),
                   None);
    }

    #[test]
    fn delay() {
        let stamp = UNIX_EPOCH + Duration::from_secs(1388658030);

        let xml = "<message><delay xmlns='urn:xmpp:delay' \
                   stamp='2014-01-02T10:20:30Z'/></message>";
        assert_eq!(delay_stamp(xml), Some(stamp));

        let xml = "<message><x stamp=\"20140102T10:20:30\" \
                   xmlns=\"jabber:x:delay\"/></message>";
        assert_eq!(delay_stamp(xml), Some(stamp));

        let xml = "<message><x xmlns='jabber:x:event' \
                   stamp='2014-01-02T10:20:30Z'/></message>";
        assert_eq!(delay_stamp(xml), None);
        assert_eq!(delay_stamp("<message/>"), None);

        let xml = "<message><delay stamp = '2014-01-02T10:20:30Z'\n\
                   xmlns = \"urn:xmpp:delay\" from='kontalk.net'/></message>";
        assert_eq!(delay_stamp(xml), Some(stamp));

        let xml = "<message><delayed xmlns='urn:xmpp:delay' \
                   stamp='2014-01-02T10:20:30Z'/></message>";
        assert_eq!(delay_stamp(xml), None);

        let xml = "<message><delay xmlns='urn:xmpp:delay' \
                   timestamp='2014-01-02T10:20:30Z'/></message>";
        assert_eq!(delay_stamp(xml), None);
    }
}
