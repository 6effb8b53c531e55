//! §4.3 Search queries and results, shared between the legacy and modern
//! dialects. NMDC `$Search`/`$SR` and ADC `SCH`/`RES` both parse into the
//! same `SearchQuery`/`SearchResult` so the hub and CC layers never need to
//! know which dialect produced them.

use crate::error::CoreError;
use crate::tth::Tth;

/// The nine NMDC search data types (§4.3, type 9 is the TTH-only fast
/// path resolved by Open Question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Any = 1,
    Audio = 2,
    Compressed = 3,
    Document = 4,
    Executable = 5,
    Picture = 6,
    Video = 7,
    Folder = 8,
    Tth = 9,
}

impl DataType {
    fn from_u8(n: u8) -> Result<Self, CoreError> {
        Ok(match n {
            1 => DataType::Any,
            2 => DataType::Audio,
            3 => DataType::Compressed,
            4 => DataType::Document,
            5 => DataType::Executable,
            6 => DataType::Picture,
            7 => DataType::Video,
            8 => DataType::Folder,
            9 => DataType::Tth,
            _ => return Err(CoreError::Protocol(format!("unknown search data type {n}"))),
        })
    }

    /// Extensions associated with this data type, for `search_match`.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            DataType::Any | DataType::Folder | DataType::Tth => &[],
            DataType::Audio => &["mp3", "flac", "wav", "ogg", "aac", "m4a"],
            DataType::Compressed => &["zip", "rar", "7z", "gz", "tar", "bz2"],
            DataType::Document => &["doc", "docx", "txt", "pdf", "nfo", "odt"],
            DataType::Executable => &["exe", "msi", "bat", "sh"],
            DataType::Picture => &["jpg", "jpeg", "png", "gif", "bmp", "webp"],
            DataType::Video => &["avi", "mkv", "mp4", "mov", "wmv", "webm"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeConstraint {
    AtLeast(u64),
    AtMost(u64),
}

/// A parsed search, independent of the dialect it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    Tth(Tth),
    Keywords {
        pattern: Vec<String>,
        data_type: DataType,
        size: Option<SizeConstraint>,
    },
}

impl SearchQuery {
    /// Parse the query portion of an NMDC `$Search`:
    /// `<sizerestricted>?<ismax>?<size>?<datatype>?<pattern>`, pattern
    /// words joined with `$`.
    pub fn parse_nmdc(s: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = s.splitn(5, '?').collect();
        if parts.len() != 5 {
            return Err(CoreError::Protocol("malformed search query".into()));
        }
        let size_restricted = parts[0] == "T";
        let is_max = parts[1] == "T";
        let size: u64 = parts[2].parse().unwrap_or(0);
        let data_type = DataType::from_u8(parts[3].parse().map_err(|_| CoreError::Protocol("bad data type".into()))?)?;
        let pattern_raw = parts[4];

        if data_type == DataType::Tth {
            let tth_str = pattern_raw.strip_prefix("TTH:").ok_or_else(|| {
                CoreError::Protocol("TTH search without TTH: prefix".into())
            })?;
            let tth = crate::tth::decode_base32(tth_str)
                .ok_or_else(|| CoreError::Protocol("bad TTH in search".into()))?;
            return Ok(SearchQuery::Tth(tth));
        }

        let pattern = pattern_raw.split('$').map(str::to_string).collect();
        let size_constraint = if size_restricted {
            Some(if is_max { SizeConstraint::AtMost(size) } else { SizeConstraint::AtLeast(size) })
        } else {
            None
        };
        Ok(SearchQuery::Keywords { pattern, data_type, size: size_constraint })
    }

    /// Encode back into the NMDC query-portion format.
    pub fn encode_nmdc(&self) -> String {
        match self {
            SearchQuery::Tth(tth) => format!("F?T?0?9?TTH:{}", crate::tth::encode_base32(tth)),
            SearchQuery::Keywords { pattern, data_type, size } => {
                let (restricted, is_max, size_val) = match size {
                    Some(SizeConstraint::AtLeast(n)) => ("T", "F", *n),
                    Some(SizeConstraint::AtMost(n)) => ("T", "T", *n),
                    None => ("F", "F", 0),
                };
                format!(
                    "{restricted}?{is_max}?{size_val}?{}?{}",
                    *data_type as u8,
                    pattern.join("$")
                )
            }
        }
    }

    /// Parse an ADC `SCH` command's two-letter parameters.
    pub fn parse_adc(params: &[(String, String)]) -> Result<Self, CoreError> {
        if let Some((_, v)) = params.iter().find(|(k, _)| k == "TR") {
            let tth = crate::tth::decode_base32(v)
                .ok_or_else(|| CoreError::Protocol("bad TR in SCH".into()))?;
            return Ok(SearchQuery::Tth(tth));
        }
        let pattern: Vec<String> = params
            .iter()
            .filter(|(k, _)| k == "AN")
            .map(|(_, v)| v.clone())
            .collect();
        let data_type = params
            .iter()
            .find(|(k, _)| k == "TY")
            .and_then(|(_, v)| v.parse::<u8>().ok())
            .map(DataType::from_u8)
            .transpose()?
            .unwrap_or(DataType::Any);
        let size = params
            .iter()
            .find(|(k, _)| k == "GE")
            .and_then(|(_, v)| v.parse().ok())
            .map(SizeConstraint::AtLeast)
            .or_else(|| {
                params
                    .iter()
                    .find(|(k, _)| k == "LE")
                    .and_then(|(_, v)| v.parse().ok())
                    .map(SizeConstraint::AtMost)
            });
        Ok(SearchQuery::Keywords { pattern, data_type, size })
    }

    /// Does `name`/`size`/`tth` satisfy this query? Type-9 (TTH) queries
    /// take the fast path and never touch name/extension matching.
    pub fn matches(&self, name: &str, size: u64, tth: Option<&Tth>) -> bool {
        match self {
            SearchQuery::Tth(want) => tth == Some(want),
            SearchQuery::Keywords { pattern, data_type, size: constraint } => {
                if let Some(c) = constraint {
                    match c {
                        SizeConstraint::AtLeast(min) if size < *min => return false,
                        SizeConstraint::AtMost(max) if size > *max => return false,
                        _ => {}
                    }
                }
                let lower = name.to_lowercase();
                if !pattern.iter().all(|word| lower.contains(&word.to_lowercase())) {
                    return false;
                }
                let exts = data_type.extensions();
                if exts.is_empty() {
                    return true;
                }
                exts.iter().any(|ext| lower.ends_with(&format!(".{ext}")))
            }
        }
    }
}

/// A single hit, independent of which dialect carried it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub nick_or_cid: String,
    pub path: String,
    pub size: u64,
    pub tth: Option<Tth>,
    pub free_slots: u32,
    pub total_slots: u32,
    pub hub_name: String,
}

impl SearchResult {
    /// Parse an NMDC `$SR` body (source "<nick> " prefix already stripped
    /// by the hub layer). Backward-parses from the end, per the wire
    /// format's use of `\x05` as an internal separator and a trailing
    /// `(hubaddr)` passive suffix.
    pub fn parse_nmdc(body: &str) -> Result<(Self, Option<String>), CoreError> {
        let (head, hub_or_addr) = match body.rsplit_once(0x05 as char) {
            Some((h, rest)) => (h, Some(rest.to_string())),
            None => (body, None),
        };
        let mut fields = head.rsplitn(4, ' ');
        let slots_field = fields.next().ok_or_else(|| CoreError::Protocol("malformed $SR".into()))?;
        let size_field = fields.next().ok_or_else(|| CoreError::Protocol("malformed $SR".into()))?;
        let path_and_nick = fields.next().ok_or_else(|| CoreError::Protocol("malformed $SR".into()))?;

        let (free, total) = slots_field
            .split_once('/')
            .ok_or_else(|| CoreError::Protocol("malformed slot field".into()))?;
        let free_slots = free.parse().map_err(|_| CoreError::Protocol("bad free slots".into()))?;
        let total_slots = total.parse().map_err(|_| CoreError::Protocol("bad total slots".into()))?;
        let size: u64 = size_field.parse().unwrap_or(0);

        let (nick, path) = path_and_nick
            .split_once(' ')
            .ok_or_else(|| CoreError::Protocol("malformed $SR nick/path".into()))?;

        let tth = path.rfind(" TTH:").map(|idx| &path[idx + 5..]).and_then(crate::tth::decode_base32);
        let path = match path.rfind(" TTH:") {
            Some(idx) => path[..idx].to_string(),
            None => path.to_string(),
        };

        let result = SearchResult {
            nick_or_cid: nick.to_string(),
            path,
            size,
            tth,
            free_slots,
            total_slots,
            hub_name: String::new(),
        };
        Ok((result, hub_or_addr))
    }

    /// Encode back into an NMDC `$SR` body (the source "<nick> " prefix
    /// `parse_nmdc` expects the hub layer to have already stripped is not
    /// re-added here). `hub_or_addr` is the trailing passive hub name or
    /// active `host:port` suffix, joined with the `\x05` separator.
    pub fn encode_nmdc(&self, hub_or_addr: Option<&str>) -> String {
        let mut s = format!("{} {}", self.nick_or_cid, self.path);
        if let Some(tth) = &self.tth {
            s.push_str(&format!(" TTH:{}", crate::tth::encode_base32(tth)));
        }
        s.push_str(&format!(" {} {}/{}", self.size, self.free_slots, self.total_slots));
        if let Some(suffix) = hub_or_addr {
            s.push('\u{5}');
            s.push_str(suffix);
        }
        s
    }

    /// Encode as an ADC `RES` frame's parameter list (the frame type,
    /// source and destination SIDs are the hub layer's concern, not this
    /// dialect-independent result).
    pub fn encode_adc(&self) -> Vec<String> {
        let mut params = vec![format!("FN{}", self.path), format!("SI{}", self.size), format!("SL{}", self.free_slots)];
        if let Some(tth) = &self.tth {
            params.push(format!("TR{}", crate::tth::encode_base32(tth)));
        }
        params
    }

    /// Compute an ADC active-search responder's synthetic identity: Tiger
    /// of `hub_id || cid`, used when replying to a UDP `SCH` that carries
    /// no associated hub session.
    pub fn compute_active_uid(hub_id: &[u8], cid: &[u8]) -> Tth {
        use digest::Digest;
        let mut hasher = tiger::Tiger::new();
        hasher.update(hub_id);
        hasher.update(cid);
        let out = hasher.finalize();
        let mut tth = [0u8; 24];
        tth.copy_from_slice(&out);
        tth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmdc_keyword_query_round_trips() {
        let q = SearchQuery::parse_nmdc("T?T?1000?1?foo$bar").unwrap();
        assert_eq!(
            q,
            SearchQuery::Keywords {
                pattern: vec!["foo".into(), "bar".into()],
                data_type: DataType::Any,
                size: Some(SizeConstraint::AtMost(1000)),
            }
        );
        assert_eq!(SearchQuery::parse_nmdc(&q.encode_nmdc()).unwrap(), q);
    }

    #[test]
    fn nmdc_tth_query_round_trips() {
        let (tth, _) = crate::tth::hash_bytes(b"hello world");
        let q = SearchQuery::Tth(tth);
        let encoded = q.encode_nmdc();
        assert_eq!(SearchQuery::parse_nmdc(&encoded).unwrap(), q);
    }

    #[test]
    fn tth_query_matches_only_on_hash() {
        let (tth, _) = crate::tth::hash_bytes(b"hello world");
        let q = SearchQuery::Tth(tth);
        assert!(q.matches("anything.txt", 999, Some(&tth)));
        assert!(!q.matches("anything.txt", 999, None));
    }

    #[test]
    fn keyword_query_matches_name_and_extension() {
        let q = SearchQuery::Keywords {
            pattern: vec!["movie".into()],
            data_type: DataType::Video,
            size: None,
        };
        assert!(q.matches("my.movie.night.mkv", 100, None));
        assert!(!q.matches("my.movie.night.txt", 100, None));
        assert!(!q.matches("other.mkv", 100, None));
    }

    #[test]
    fn sr_parses_nick_path_size_slots_and_hub_suffix() {
        let body = format!("Bob file.bin 1024 3/5\x05hub.example.com:411");
        let (res, hub) = SearchResult::parse_nmdc(&body).unwrap();
        assert_eq!(res.nick_or_cid, "Bob");
        assert_eq!(res.path, "file.bin");
        assert_eq!(res.size, 1024);
        assert_eq!(res.free_slots, 3);
        assert_eq!(res.total_slots, 5);
        assert_eq!(hub.unwrap(), "hub.example.com:411");
    }

    #[test]
    fn sr_round_trips_through_encode_nmdc() {
        let body = "Bob file.bin 1024 3/5\x05hub.example.com:411";
        let (res, hub) = SearchResult::parse_nmdc(body).unwrap();
        let encoded = res.encode_nmdc(hub.as_deref());
        assert_eq!(encoded, body);
    }

    #[test]
    fn sr_encode_adc_carries_path_size_slots_and_tth() {
        let (tth, _) = crate::tth::hash_bytes(b"data");
        let result = SearchResult {
            nick_or_cid: "BOBX".into(),
            path: "share/a.mkv".into(),
            size: 1024,
            tth: Some(tth),
            free_slots: 2,
            total_slots: 5,
            hub_name: String::new(),
        };
        let params = result.encode_adc();
        assert!(params.contains(&"FNshare/a.mkv".to_string()));
        assert!(params.contains(&"SI1024".to_string()));
        assert!(params.contains(&"SL2".to_string()));
        assert!(params.iter().any(|p| p.starts_with("TR")));
    }

    #[test]
    fn sr_extracts_trailing_tth() {
        let (tth, _) = crate::tth::hash_bytes(b"data");
        let body = format!(
            "Bob file.bin TTH:{} 1024 3/5\x05hub",
            crate::tth::encode_base32(&tth)
        );
        let (res, _) = SearchResult::parse_nmdc(&body).unwrap();
        assert_eq!(res.tth, Some(tth));
    }
}
