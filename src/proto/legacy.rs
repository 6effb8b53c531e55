//! NMDC-style legacy dialect: `$Command args|` frames, `&#36;/&#124;/&amp;`
//! entity escaping, and the `$Lock` -> `$Key` challenge transform.

use crate::error::CoreError;

/// Escape `$`, `|` and `&` the way NMDC expects on the wire. Only these
/// three entities are recognised; any other `&` is passed through as-is.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '$' => out.push_str("&#36;"),
            '|' => out.push_str("&#124;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

/// Un-escape the three recognised entities. Any other `&...;`-shaped text
/// is left untouched.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if s[i..].starts_with("&#36;") {
            out.push('$');
            i += 5;
        } else if s[i..].starts_with("&#124;") {
            out.push('|');
            i += 6;
        } else if s[i..].starts_with("&amp;") {
            out.push('&');
            i += 5;
        } else {
            // advance by one full char, not one byte, to stay UTF-8 safe
            let ch = s[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

/// Byte values the `$Lock` -> `$Key` transform must never emit literally;
/// these are encoded as `"/%DCN<ddd>%/"` instead.
const KEY_ESCAPE_VALUES: [u8; 6] = [0, 5, 36, 96, 124, 126];

/// The `$Lock` -> `$Key` challenge transform (teamfair.info "Lock to key").
/// Operates byte-wise since the lock is defined over raw octets, not text.
pub fn lock_to_key(lock: &[u8]) -> String {
    let len = lock.len();
    if len < 3 {
        return "STUPIDKEY!".to_string();
    }
    let mut buf = lock.to_vec();
    let fst = buf[0] ^ buf[len - 1] ^ buf[len - 2] ^ 5;
    for i in (1..len).rev() {
        buf[i] ^= buf[i - 1];
    }
    buf[0] = fst;
    for b in buf.iter_mut() {
        *b = ((*b << 4) & 0xF0) | ((*b >> 4) & 0x0F);
    }

    let mut key = String::with_capacity(len + 16);
    for &b in &buf {
        if KEY_ESCAPE_VALUES.contains(&b) {
            key.push_str(&format!("/%DCN{:03}%/", b));
        } else {
            key.push(b as char);
        }
    }
    key
}

/// A parsed `$MyINFO $ALL <nick> <desc><tag?>$ $<conn><flag>$<mail>$<size>$` tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoTag {
    pub client: String,
    pub mode: char, // 'A' active, 'P' passive
    pub hubs: (u32, u32, u32),
    pub slots: u32,
    /// "auto-open under X B/s" slot field (Open Question 1: never folds
    /// into `slots`).
    pub auto_slot_bps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Lock { lock: String, pk: Option<String> },
    Key { key: String },
    Supports { tokens: Vec<String> },
    Direction { direction: String, level: i32 },
    MyNick { nick: String },
    Hello { nick: String },
    Quit { nick: String },
    NickList { names: Vec<String> },
    OpList { names: Vec<String> },
    MyInfo {
        nick: String,
        description: String,
        tag: Option<InfoTag>,
        connection: String,
        flag: u8,
        mail: String,
        share_size: u64,
    },
    HubName { name: String },
    To { to: String, from: String, msg: String },
    ForceMove { address: String },
    ConnectToMe { who: String, address: String },
    RevConnectToMe { other: String, me: String },
    Search {
        from: SearchFrom,
        is_active: bool,
        query: crate::proto::search::SearchQuery,
    },
    SearchResult {
        result: crate::proto::search::SearchResult,
        hub_or_addr: Option<String>,
    },
    AdcGet { kind: String, id: String, start: i64, bytes: i64 },
    AdcSnd { kind: String, id: String, start: i64, bytes: i64 },
    MaxedOut,
    Error { message: String },
    ValidateNick { nick: String },
    GetNickList,
    ValidateDenide { nick: String },
    BadPass,
    GetPass,
    MyPass { password: String },
    HubIsFull,
}

/// `$Search` is sent either directly on a TCP/UDP address, or via the hub
/// relay ("Hub:<nick>").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFrom {
    Active { host: String, port: u16 },
    Passive { nick: String },
}

/// Parse a single legacy frame's contents (terminator already stripped).
pub fn parse(frame: &str) -> Result<Command, CoreError> {
    if let Some(rest) = frame.strip_prefix("$Lock ") {
        let (lock, pk) = match rest.split_once(" Pk=") {
            Some((l, p)) => (l.to_string(), Some(p.to_string())),
            None => (rest.to_string(), None),
        };
        return Ok(Command::Lock { lock, pk });
    }
    if let Some(rest) = frame.strip_prefix("$Key ") {
        return Ok(Command::Key { key: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$Supports ") {
        return Ok(Command::Supports {
            tokens: rest.split(' ').map(str::to_string).collect(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$Direction ") {
        let mut it = rest.splitn(2, ' ');
        let direction = it.next().unwrap_or_default().to_string();
        let level = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        return Ok(Command::Direction { direction, level });
    }
    if let Some(rest) = frame.strip_prefix("$MyNick ") {
        return Ok(Command::MyNick { nick: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$Hello ") {
        return Ok(Command::Hello { nick: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$Quit ") {
        return Ok(Command::Quit { nick: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$NickList ") {
        return Ok(Command::NickList {
            names: rest.trim_end_matches("$$").split("$$").filter(|s| !s.is_empty()).map(str::to_string).collect(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$OpList ") {
        return Ok(Command::OpList {
            names: rest.trim_end_matches("$$").split("$$").filter(|s| !s.is_empty()).map(str::to_string).collect(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$MyINFO $ALL ") {
        return parse_myinfo(rest);
    }
    if let Some(rest) = frame.strip_prefix("$HubName ") {
        return Ok(Command::HubName { name: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$To: ") {
        let (to, rest) = rest
            .split_once(" From: ")
            .ok_or_else(|| CoreError::Protocol("malformed $To".into()))?;
        let (from, msg) = rest
            .split_once(" $")
            .ok_or_else(|| CoreError::Protocol("malformed $To".into()))?;
        return Ok(Command::To {
            to: to.to_string(),
            from: from.to_string(),
            msg: msg.to_string(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$ForceMove ") {
        return Ok(Command::ForceMove { address: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$ConnectToMe ") {
        let mut it = rest.splitn(2, ' ');
        let who = it.next().unwrap_or_default().to_string();
        let address = it.next().unwrap_or_default().to_string();
        return Ok(Command::ConnectToMe { who, address });
    }
    if let Some(rest) = frame.strip_prefix("$RevConnectToMe ") {
        let mut it = rest.splitn(2, ' ');
        let other = it.next().unwrap_or_default().to_string();
        let me = it.next().unwrap_or_default().to_string();
        return Ok(Command::RevConnectToMe { other, me });
    }
    if let Some(rest) = frame.strip_prefix("$Search ") {
        return parse_search(rest);
    }
    if let Some(rest) = frame.strip_prefix("$ADCGET ") {
        return parse_adcget_adcsnd(rest, true);
    }
    if let Some(rest) = frame.strip_prefix("$ADCSND ") {
        return parse_adcget_adcsnd(rest, false);
    }
    if frame == "$MaxedOut" {
        return Ok(Command::MaxedOut);
    }
    if let Some(rest) = frame.strip_prefix("$Error ") {
        return Ok(Command::Error { message: rest.to_string() });
    }
    if let Some(rest) = frame.strip_prefix("$ValidateNick ") {
        return Ok(Command::ValidateNick { nick: rest.to_string() });
    }
    if frame == "$GetNickList" {
        return Ok(Command::GetNickList);
    }
    if let Some(rest) = frame.strip_prefix("$ValidateDenide ") {
        return Ok(Command::ValidateDenide { nick: rest.to_string() });
    }
    if frame == "$BadPass" {
        return Ok(Command::BadPass);
    }
    if frame == "$GetPass" {
        return Ok(Command::GetPass);
    }
    if let Some(rest) = frame.strip_prefix("$MyPass ") {
        return Ok(Command::MyPass { password: rest.to_string() });
    }
    if frame == "$HubIsFull" {
        return Ok(Command::HubIsFull);
    }
    Err(CoreError::Protocol(format!("unrecognised frame: {frame}")))
}

fn parse_myinfo(rest: &str) -> Result<Command, CoreError> {
    // "<nick> <desc><tag?>$ $<conn><flag>$<mail>$<size>$"
    let (nick, rest) = rest
        .split_once(' ')
        .ok_or_else(|| CoreError::Protocol("malformed $MyINFO".into()))?;
    let (desc_and_tag, rest) = rest
        .split_once("$ $")
        .ok_or_else(|| CoreError::Protocol("malformed $MyINFO".into()))?;
    let (description, tag) = match desc_and_tag.rfind('<') {
        Some(idx) if desc_and_tag.ends_with('>') => {
            (desc_and_tag[..idx].to_string(), Some(parse_tag(&desc_and_tag[idx..])?))
        }
        _ => (desc_and_tag.to_string(), None),
    };
    let mut fields = rest.splitn(3, '$');
    let conn_and_flag = fields.next().unwrap_or_default();
    let mail = fields.next().unwrap_or_default().to_string();
    let size_str = fields.next().unwrap_or_default().trim_end_matches('$');
    let (connection, flag) = match conn_and_flag.char_indices().last() {
        Some((idx, c)) => (conn_and_flag[..idx].to_string(), c as u8),
        None => (String::new(), 0),
    };
    let share_size = size_str.parse().unwrap_or(0);
    Ok(Command::MyInfo {
        nick: nick.to_string(),
        description,
        tag,
        connection,
        flag,
        mail,
        share_size,
    })
}

fn parse_tag(tag: &str) -> Result<InfoTag, CoreError> {
    // "<client,M:A|P,H:a/b/c,S:s(,O:auto)?>"
    let inner = tag
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| CoreError::Protocol("malformed info tag".into()))?;
    let mut parts = inner.split(',');
    let client = parts.next().unwrap_or_default().to_string();
    let mut mode = 'P';
    let mut hubs = (0, 0, 0);
    let mut slots = 0;
    let mut auto_slot_bps = None;
    for p in parts {
        if let Some(m) = p.strip_prefix("M:") {
            mode = m.chars().next().unwrap_or('P');
        } else if let Some(h) = p.strip_prefix("H:") {
            let mut it = h.split('/').map(|n| n.parse().unwrap_or(0));
            hubs = (it.next().unwrap_or(0), it.next().unwrap_or(0), it.next().unwrap_or(0));
        } else if let Some(s) = p.strip_prefix("S:") {
            slots = s.parse().unwrap_or(0);
        } else if let Some(o) = p.strip_prefix("O:") {
            auto_slot_bps = o.parse().ok();
        }
    }
    Ok(InfoTag { client, mode, hubs, slots, auto_slot_bps })
}

fn parse_search(rest: &str) -> Result<Command, CoreError> {
    let (from_str, query_str) = rest
        .split_once(' ')
        .ok_or_else(|| CoreError::Protocol("malformed $Search".into()))?;
    let from = if from_str == "Hub:" {
        return Err(CoreError::Protocol("malformed $Search source".into()));
    } else if let Some(nick) = from_str.strip_prefix("Hub:") {
        SearchFrom::Passive { nick: nick.to_string() }
    } else {
        let (host, port) = from_str
            .split_once(':')
            .ok_or_else(|| CoreError::Protocol("malformed $Search source".into()))?;
        SearchFrom::Active {
            host: host.to_string(),
            port: port.parse().map_err(|_| CoreError::Protocol("bad port".into()))?,
        }
    };
    let query = crate::proto::search::SearchQuery::parse_nmdc(query_str)?;
    let is_active = matches!(from, SearchFrom::Active { .. });
    Ok(Command::Search { from, is_active, query })
}

fn parse_adcget_adcsnd(rest: &str, is_get: bool) -> Result<Command, CoreError> {
    let parts: Vec<&str> = rest.splitn(4, ' ').collect();
    if parts.len() != 4 {
        return Err(CoreError::Protocol("malformed ADCGET/ADCSND".into()));
    }
    let kind = parts[0].to_string();
    let id = unescape_adcget_arg(parts[1]);
    let start = parts[2].parse().map_err(|_| CoreError::Protocol("bad start".into()))?;
    let bytes = parts[3].parse().map_err(|_| CoreError::Protocol("bad length".into()))?;
    if is_get {
        Ok(Command::AdcGet { kind, id, start, bytes })
    } else {
        Ok(Command::AdcSnd { kind, id, start, bytes })
    }
}

/// ADCGET/ADCSND use `\ ` as their only escape (legacy dialect, not the
/// full ADC `\s \n \\` scheme).
fn unescape_adcget_arg(s: &str) -> String {
    s.replace("\\ ", " ")
}

fn escape_adcget_arg(s: &str) -> String {
    s.replace(' ', "\\ ")
}

impl Command {
    /// Encode the command body (without the trailing `|` terminator).
    pub fn encode(&self) -> String {
        match self {
            Command::Lock { lock, pk } => match pk {
                Some(pk) => format!("$Lock {lock} Pk={pk}"),
                None => format!("$Lock {lock}"),
            },
            Command::Key { key } => format!("$Key {key}"),
            Command::Supports { tokens } => format!("$Supports {}", tokens.join(" ")),
            Command::Direction { direction, level } => format!("$Direction {direction} {level}"),
            Command::MyNick { nick } => format!("$MyNick {nick}"),
            Command::Hello { nick } => format!("$Hello {nick}"),
            Command::Quit { nick } => format!("$Quit {nick}"),
            Command::NickList { names } => format!("$NickList {}$$", names.join("$$")),
            Command::OpList { names } => format!("$OpList {}$$", names.join("$$")),
            Command::MyInfo { nick, description, tag, connection, flag, mail, share_size } => {
                let tag_str = tag
                    .as_ref()
                    .map(|t| format_tag(t))
                    .unwrap_or_default();
                format!(
                    "$MyINFO $ALL {nick} {description}{tag_str}$ ${connection}{}${mail}${share_size}$",
                    *flag as char
                )
            }
            Command::HubName { name } => format!("$HubName {name}"),
            Command::To { to, from, msg } => format!("$To: {to} From: {from} ${msg}"),
            Command::ForceMove { address } => format!("$ForceMove {address}"),
            Command::ConnectToMe { who, address } => format!("$ConnectToMe {who} {address}"),
            Command::RevConnectToMe { other, me } => format!("$RevConnectToMe {other} {me}"),
            Command::Search { from, query, .. } => {
                let from_str = match from {
                    SearchFrom::Active { host, port } => format!("{host}:{port}"),
                    SearchFrom::Passive { nick } => format!("Hub:{nick}"),
                };
                format!("$Search {from_str} {}", query.encode_nmdc())
            }
            Command::SearchResult { result, hub_or_addr } => {
                format!("$SR {}", result.encode_nmdc(hub_or_addr.as_deref()))
            }
            Command::AdcGet { kind, id, start, bytes } => {
                format!("$ADCGET {kind} {} {start} {bytes}", escape_adcget_arg(id))
            }
            Command::AdcSnd { kind, id, start, bytes } => {
                format!("$ADCSND {kind} {} {start} {bytes}", escape_adcget_arg(id))
            }
            Command::MaxedOut => "$MaxedOut".to_string(),
            Command::Error { message } => format!("$Error {message}"),
            Command::ValidateNick { nick } => format!("$ValidateNick {nick}"),
            Command::GetNickList => "$GetNickList".to_string(),
            Command::ValidateDenide { nick } => format!("$ValidateDenide {nick}"),
            Command::BadPass => "$BadPass".to_string(),
            Command::GetPass => "$GetPass".to_string(),
            Command::MyPass { password } => format!("$MyPass {password}"),
            Command::HubIsFull => "$HubIsFull".to_string(),
        }
    }

    /// Encode including entity-escaping of free-form text fields and the
    /// frame terminator.
    pub fn to_frame(&self) -> String {
        format!("{}|", escape(&self.encode()))
    }
}

fn format_tag(t: &InfoTag) -> String {
    let mut s = format!("<{},M:{},H:{}/{}/{},S:{}", t.client, t.mode, t.hubs.0, t.hubs.1, t.hubs.2, t.slots);
    if let Some(auto) = t.auto_slot_bps {
        s.push_str(&format!(",O:{auto}"));
    }
    s.push('>');
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_unescape_round_trips_for_all_three_entities() {
        let s = "pay$load|with&stuff";
        let escaped = escape(s);
        assert_eq!(unescape(&escaped), s);
        assert!(!escaped.contains('$'));
        assert!(!escaped.contains('|'));
    }

    #[test]
    fn lock_to_key_never_emits_forbidden_bytes_literally() {
        let lock = b"EXTENDEDPROTOCOLABCDEFGH";
        let key = lock_to_key(lock);
        // every literal byte outside of an escape sequence must not be one
        // of the forbidden values
        let bytes = key.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i..].starts_with(b"/%DCN") {
                i += 11; // "/%DCN" + 3 digits + "%/"
                continue;
            }
            assert!(!KEY_ESCAPE_VALUES.contains(&bytes[i]));
            i += 1;
        }
    }

    #[test]
    fn myinfo_round_trips() {
        let cmd = Command::MyInfo {
            nick: "alice".into(),
            description: "hi".into(),
            tag: Some(InfoTag {
                client: "++".into(),
                mode: 'A',
                hubs: (1, 0, 0),
                slots: 5,
                auto_slot_bps: None,
            }),
            connection: "100".into(),
            flag: 0x01,
            mail: "a@b.c".into(),
            share_size: 12345,
        };
        let encoded = cmd.encode();
        let parsed = parse(&encoded).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn search_parses_active_source() {
        let cmd = parse("$Search 10.0.0.1:412 T?T?0?1?hello").unwrap();
        match cmd {
            Command::Search { from: SearchFrom::Active { host, port }, .. } => {
                assert_eq!(host, "10.0.0.1");
                assert_eq!(port, 412);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn adcget_unescapes_spaces() {
        let cmd = parse("$ADCGET file TTH/ABC 0 -1").unwrap();
        assert_eq!(cmd, Command::AdcGet {
            kind: "file".into(),
            id: "TTH/ABC".into(),
            start: 0,
            bytes: -1,
        });
    }
}
