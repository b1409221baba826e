//! Line-oriented SSDP packet parser.
//!
//! Packets are ASCII, CR-LF terminated, closed by a blank line. The start
//! line is either a request (`METHOD URL PROTO/VER`) or a response
//! (`PROTO/VER STATUS PHRASE`); headers follow as `name: value` with
//! case-insensitive names and trailing whitespace trimmed from values.
//! Unknown headers are skipped. The parse fails unless the final blank
//! line is present.
//!
//! Fields borrow from the input buffer; the packet lives only as long as
//! the datagram it was parsed from.

use once_cell::sync::Lazy;
use regex::Regex;

// RFC 2616 2.2 token: anything but separators and controls.
const TOKEN: &str = r#"[^\]()<>@,;:\\"/\[?={} \t\r\n]+"#;

static REQUEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^({TOKEN})[ \t]+([^ \t\r\n]+)[ \t]+([A-Za-z]+)/([0-9]+\.[0-9]+)[ \t]*\r\n"
    ))
    .expect("request regex")
});

static RESPONSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^({TOKEN})/([0-9]\.[0-9])[ \t]+([0-9]+)[ \t]+([^\r\n]*)\r\n"
    ))
    .expect("response regex")
});

static HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"^({TOKEN}):[ \t]*([^\r\n]*)\r\n")).expect("header regex"));

/// A parsed SSDP request or response. All string fields point into the
/// buffer handed to [`SsdpPacket::parse`].
#[derive(Debug, Default)]
pub struct SsdpPacket<'a> {
    pub is_response: bool,
    // Start line.
    pub method: Option<&'a str>,
    pub url: Option<&'a str>,
    pub protocol: Option<&'a str>,
    pub version: Option<&'a str>,
    pub status: Option<&'a str>,
    // Recognized headers.
    pub cache_control: Option<&'a str>,
    pub date: Option<&'a str>,
    pub ext: bool,
    pub host: Option<&'a str>,
    pub location: Option<&'a str>,
    pub man: Option<&'a str>,
    pub mx: Option<&'a str>,
    pub nt: Option<&'a str>,
    pub nts: Option<&'a str>,
    pub server: Option<&'a str>,
    pub st: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub usn: Option<&'a str>,
}

impl<'a> SsdpPacket<'a> {
    /// Parse one datagram. Returns `None` on any syntax violation; the
    /// caller drops the packet silently (UDP contract).
    pub fn parse(text: &'a str) -> Option<SsdpPacket<'a>> {
        let mut packet = SsdpPacket::default();
        let mut rest: &'a str;

        if let Some(m) = REQUEST_RE.captures(text) {
            packet.method = Some(m.get(1).expect("group").as_str());
            packet.url = Some(m.get(2).expect("group").as_str());
            packet.protocol = Some(m.get(3).expect("group").as_str());
            packet.version = Some(m.get(4).expect("group").as_str());
            rest = &text[m.get(0).expect("match").end()..];
        } else if let Some(m) = RESPONSE_RE.captures(text) {
            packet.is_response = true;
            packet.protocol = Some(m.get(1).expect("group").as_str());
            packet.version = Some(m.get(2).expect("group").as_str());
            packet.status = Some(m.get(3).expect("group").as_str());
            rest = &text[m.get(0).expect("match").end()..];
        } else {
            return None;
        }

        while let Some(m) = HEADER_RE.captures(rest) {
            let name = m.get(1).expect("group").as_str();
            let value = m
                .get(2)
                .expect("group")
                .as_str()
                .trim_end_matches([' ', '\t']);
            packet.store_header(name, value);
            rest = &rest[m.get(0).expect("match").end()..];
        }

        // The terminating blank line must be all that remains.
        if rest == "\r\n" {
            Some(packet)
        } else {
            None
        }
    }

    fn store_header(&mut self, name: &str, value: &'a str) {
        // First-byte dispatch; names are case-insensitive.
        match name.as_bytes()[0].to_ascii_lowercase() {
            b'c' if name.eq_ignore_ascii_case("cache-control") => {
                self.cache_control = Some(value)
            }
            b'd' if name.eq_ignore_ascii_case("date") => self.date = Some(value),
            b'e' if name.eq_ignore_ascii_case("ext") => self.ext = true,
            b'h' if name.eq_ignore_ascii_case("host") => self.host = Some(value),
            b'l' if name.eq_ignore_ascii_case("location") => self.location = Some(value),
            b'm' if name.eq_ignore_ascii_case("man") => self.man = Some(value),
            b'm' if name.eq_ignore_ascii_case("mx") => self.mx = Some(value),
            b'n' if name.eq_ignore_ascii_case("nt") => self.nt = Some(value),
            b'n' if name.eq_ignore_ascii_case("nts") => self.nts = Some(value),
            b's' if name.eq_ignore_ascii_case("server") => self.server = Some(value),
            b's' if name.eq_ignore_ascii_case("st") => self.st = Some(value),
            b'u' if name.eq_ignore_ascii_case("user-agent") => self.user_agent = Some(value),
            b'u' if name.eq_ignore_ascii_case("usn") => self.usn = Some(value),
            _ => {}
        }
    }
}
