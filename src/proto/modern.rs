//! The modern, ADC-derived dialect: `<Type><CMD> [args...]\n` frames, 4-byte
//! packed session IDs, and `\s \n \\` parameter escaping.

use crate::error::CoreError;
use byteorder::{BigEndian, ByteOrder};

/// First byte of a frame: who it's addressed to / where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// `B` — broadcast to the hub
    Broadcast,
    /// `C` — direct, client-to-client
    Client,
    /// `D` — direct, with an explicit destination SID
    Direct,
    /// `E` — echo, direct with destination that also gets echoed to self
    Echo,
    /// `F` — feature broadcast, gated on supported feature flags
    Feature,
    /// `H` — hub-to-client / client-to-hub, no SID
    Hub,
    /// `I` — info, hub-to-client only, used before a SID is assigned
    Info,
    /// `U` — UDP, direct search responses
    Udp,
}

impl FrameType {
    fn from_byte(b: u8) -> Result<Self, CoreError> {
        Ok(match b {
            b'B' => FrameType::Broadcast,
            b'C' => FrameType::Client,
            b'D' => FrameType::Direct,
            b'E' => FrameType::Echo,
            b'F' => FrameType::Feature,
            b'H' => FrameType::Hub,
            b'I' => FrameType::Info,
            b'U' => FrameType::Udp,
            _ => return Err(CoreError::Protocol(format!("unknown ADC frame type {}", b as char))),
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            FrameType::Broadcast => b'B',
            FrameType::Client => b'C',
            FrameType::Direct => b'D',
            FrameType::Echo => b'E',
            FrameType::Feature => b'F',
            FrameType::Hub => b'H',
            FrameType::Info => b'I',
            FrameType::Udp => b'U',
        }
    }

    /// Whether this frame type carries a source SID before the command
    /// params begin.
    fn has_source(self) -> bool {
        !matches!(self, FrameType::Hub | FrameType::Info)
    }

    /// Whether this frame type carries an explicit destination SID.
    fn has_dest(self) -> bool {
        matches!(self, FrameType::Direct | FrameType::Echo)
    }
}

/// A 4-byte packed session identifier (base32 of 2 bytes, rendered as 4
/// uppercase alphanumerics on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid(pub [u8; 4]);

impl Sid {
    pub fn from_wire(s: &str) -> Result<Self, CoreError> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(CoreError::Protocol(format!("bad SID length: {s}")));
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        Ok(Sid(out))
    }

    pub fn to_wire(self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Derive a SID from a monotonically increasing counter, matching the
    /// hub-assignment scheme: base32-alphabet digits over a 16-bit value.
    pub fn from_counter(n: u16) -> Self {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, n);
        let encoded = base32::encode(base32::Alphabet::RFC4648 { padding: false }, &buf);
        let mut out = [b'A'; 4];
        for (i, b) in encoded.bytes().take(4).enumerate() {
            out[i] = b;
        }
        Sid(out)
    }
}

/// Escape `\`, space and newline the ADC way.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('s') => out.push(' '),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A parsed ADC frame: type, command name, optional source/dest SIDs, and
/// the raw (already-unescaped) parameter tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub cmd: String,
    pub source: Option<Sid>,
    pub dest: Option<Sid>,
    pub params: Vec<String>,
}

impl Frame {
    /// Parse a single line (trailing `\n` already stripped).
    pub fn parse(line: &str) -> Result<Self, CoreError> {
        if line.len() < 4 {
            return Err(CoreError::Protocol("ADC frame too short".into()));
        }
        let frame_type = FrameType::from_byte(line.as_bytes()[0])?;
        let cmd = line[1..4].to_string();
        let rest = line[4..].trim_start_matches(' ');
        let mut tokens = split_unescaped(rest);

        let source = if frame_type.has_source() && !tokens.is_empty() {
            Some(Sid::from_wire(&tokens.remove(0))?)
        } else {
            None
        };
        let dest = if frame_type.has_dest() && !tokens.is_empty() {
            Some(Sid::from_wire(&tokens.remove(0))?)
        } else {
            None
        };
        let params = tokens.into_iter().map(|t| unescape(&t)).collect();

        Ok(Frame { frame_type, cmd, source, dest, params })
    }

    /// Encode into a full wire line, including the trailing `\n`.
    pub fn generate(&self) -> String {
        let mut out = String::new();
        out.push(self.frame_type.to_byte());
        out.push_str(&self.cmd);
        if let Some(src) = self.source {
            out.push(' ');
            out.push_str(&src.to_wire());
        }
        if let Some(dst) = self.dest {
            out.push(' ');
            out.push_str(&dst.to_wire());
        }
        for p in &self.params {
            out.push(' ');
            out.push_str(&escape(p));
        }
        out.push('\n');
        out
    }

    /// Look up the first `<key><value>` parameter whose key matches the
    /// given two-letter prefix.
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.starts_with(key))
            .map(|p| &p[key.len()..])
    }

    /// All values for a repeated two-letter key.
    pub fn get_params(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| p.starts_with(key))
            .map(|p| &p[key.len()..])
            .collect()
    }

    /// All two-letter-keyed parameters as `(key, value)` pairs, for
    /// generic consumers like search parsing.
    pub fn keyed_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter(|p| p.len() >= 2)
            .map(|p| (p[..2].to_string(), p[2..].to_string()))
            .collect()
    }
}

/// Split on unescaped spaces (a space preceded by an odd number of
/// backslashes is escaped and not a separator).
fn split_unescaped(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            cur.push(c);
            escaped = false;
        } else if c == '\\' {
            cur.push(c);
            escaped = true;
        } else if c == ' ' {
            if !cur.is_empty() {
                tokens.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

/// Parse an `F`-type frame's feature selector: a single token of `N*5`
/// bytes, each run being a `+`/`-` sign followed by a 4-character FOURCC.
pub fn parse_feature_selector(token: &str) -> Result<Vec<(bool, String)>, CoreError> {
    let bytes = token.as_bytes();
    if bytes.is_empty() || bytes.len() % 5 != 0 || !token.is_ascii() {
        return Err(CoreError::Protocol(format!("malformed feature selector: {token}")));
    }
    let mut out = Vec::with_capacity(bytes.len() / 5);
    for chunk in bytes.chunks(5) {
        let sign = match chunk[0] {
            b'+' => true,
            b'-' => false,
            _ => return Err(CoreError::Protocol(format!("bad feature selector sign in {token}"))),
        };
        out.push((sign, String::from_utf8_lossy(&chunk[1..]).into_owned()));
    }
    Ok(out)
}

/// Does a set of negotiated features satisfy an `F`-type frame's
/// selector? A `+FOUR` entry requires the feature to be negotiated, a
/// `-FOUR` entry requires it not to be. A mismatch here is a routine
/// "this peer doesn't care about that broadcast", not a protocol error.
pub fn feature_selector_matches(selector: &[(bool, String)], negotiated: &[String]) -> bool {
    selector.iter().all(|(want, feat)| negotiated.iter().any(|n| n == feat) == *want)
}

/// Parse a `+`/`-`-prefixed feature list (as seen in `SUP`) against a set
/// of features we understand, yielding the ones both sides agree are on.
pub fn negotiate_features<'a>(tokens: &[String], known: &[&'a str]) -> Vec<&'a str> {
    let mut enabled: std::collections::HashSet<&str> = known.iter().copied().collect();
    for t in tokens {
        if let Some(feat) = t.strip_prefix('+') {
            if let Some(&k) = known.iter().find(|k| **k == feat) {
                enabled.insert(k);
            }
        } else if let Some(feat) = t.strip_prefix('-') {
            enabled.remove(feat);
        }
    }
    known.iter().copied().filter(|k| enabled.contains(k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_unescape_round_trips() {
        let s = "a value\\with stuff\nand newline";
        let escaped = escape(s);
        assert_eq!(unescape(&escaped), s);
        assert!(!escaped.contains(' '));
    }

    #[test]
    fn parse_broadcast_inf_round_trips() {
        let line = "BINF AAAA ID1234 NIbob\n";
        let frame = Frame::parse(line.trim_end_matches('\n')).unwrap();
        assert_eq!(frame.frame_type, FrameType::Broadcast);
        assert_eq!(frame.cmd, "INF");
        assert_eq!(frame.source.unwrap().to_wire(), "AAAA");
        assert_eq!(frame.get_param("NI"), Some("bob"));
        assert_eq!(frame.generate(), line);
    }

    #[test]
    fn direct_frame_carries_source_and_dest() {
        let line = "DMSG AAAA BBBB hello\\sthere";
        let frame = Frame::parse(line).unwrap();
        assert_eq!(frame.source.unwrap().to_wire(), "AAAA");
        assert_eq!(frame.dest.unwrap().to_wire(), "BBBB");
        assert_eq!(frame.params, vec!["hello there".to_string()]);
    }

    #[test]
    fn sid_from_counter_is_four_bytes() {
        let sid = Sid::from_counter(42);
        assert_eq!(sid.to_wire().len(), 4);
    }

    #[test]
    fn negotiate_features_applies_plus_and_minus() {
        let tokens = vec!["+TCP4".to_string(), "-UDP4".to_string()];
        let known = ["TCP4", "UDP4", "BASE"];
        let enabled = negotiate_features(&tokens, &known);
        assert!(enabled.contains(&"TCP4"));
        assert!(!enabled.contains(&"UDP4"));
        assert!(enabled.contains(&"BASE"));
    }

    #[test]
    fn feature_selector_parses_signed_fourcc_runs() {
        let selector = parse_feature_selector("+TCP4-UDP4").unwrap();
        assert_eq!(selector, vec![(true, "TCP4".to_string()), (false, "UDP4".to_string())]);
    }

    #[test]
    fn feature_selector_rejects_a_length_not_a_multiple_of_five() {
        assert!(parse_feature_selector("+TCP4x").is_err());
    }

    #[test]
    fn feature_selector_matches_requires_every_clause() {
        let selector = vec![(true, "TCP4".to_string()), (false, "UDP4".to_string())];
        let negotiated = vec!["TCP4".to_string(), "BASE".to_string()];
        assert!(feature_selector_matches(&selector, &negotiated));

        let negotiated_with_udp4 = vec!["TCP4".to_string(), "UDP4".to_string()];
        assert!(!feature_selector_matches(&selector, &negotiated_with_udp4));
    }
}
