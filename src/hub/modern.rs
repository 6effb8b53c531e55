//! ADC hub session: `SUP`/`SID`/`INF` protocol-and-identify handshake,
//! optional `GPA`/`PAS` password verification, then steady-state traffic.

use super::{HubState, HubUser, HubUserTable};
use crate::error::{CoreError, CoreResult};
use crate::proto::modern::{feature_selector_matches, negotiate_features, parse_feature_selector, Frame, FrameType, Sid};
use crate::proto::search::{SearchQuery, SearchResult};
use crate::tth::Tth;

/// Feature tokens this client understands, negotiated via `SUP`.
pub const KNOWN_FEATURES: [&str; 3] = ["BASE", "TIGR", "BZIP"];

pub struct ModernHub {
    pub state: HubState,
    pub my_cid: String,
    pub my_sid: Option<Sid>,
    pub users: HubUserTable,
    pub sid_to_cid: std::collections::HashMap<Sid, String>,
    /// Features both sides agreed on during `SUP`, used to gate inbound
    /// `F`-type broadcasts. Empty until negotiation completes.
    pub negotiated_features: Vec<String>,
    /// A snapshot of the local share, refreshed by the caller as it
    /// changes, used to answer inbound `SCH` without a round trip.
    pub share_files: Vec<(String, u64, Tth)>,
    pub free_slots: u32,
    pub total_slots: u32,
}

impl ModernHub {
    pub fn new(my_cid: String) -> Self {
        Self {
            state: HubState::Connecting,
            my_cid,
            my_sid: None,
            users: HubUserTable::new(),
            sid_to_cid: std::collections::HashMap::new(),
            negotiated_features: Vec::new(),
            share_files: Vec::new(),
            free_slots: 0,
            total_slots: 0,
        }
    }

    pub fn handle(&mut self, mut frame: Frame) -> CoreResult<Vec<Frame>> {
        if frame.frame_type == FrameType::Feature {
            let selector_token = frame
                .params
                .first()
                .ok_or_else(|| CoreError::Protocol("feature frame missing selector".into()))?;
            let selector = parse_feature_selector(selector_token)?;
            if !feature_selector_matches(&selector, &self.negotiated_features) {
                return Ok(vec![]);
            }
            frame.params.remove(0);
        }

        match (&self.state, frame.cmd.as_str()) {
            (HubState::Connecting, "SUP") => {
                self.state = HubState::Negotiating;
                self.negotiated_features =
                    negotiate_features(&frame.params, &KNOWN_FEATURES).into_iter().map(String::from).collect();
                let reply = sup_frame();
                Ok(vec![reply])
            }
            (HubState::Negotiating, "SID") => {
                let sid = frame
                    .params
                    .first()
                    .map(|s| Sid::from_wire(s))
                    .transpose()?
                    .ok_or_else(|| CoreError::Protocol("SID frame missing session id".into()))?;
                self.my_sid = Some(sid);
                self.state = HubState::Identifying;
                Ok(vec![self.inf_frame(sid)])
            }
            (HubState::Identifying, "GPA") => {
                // the caller computes the password response out-of-band
                // (it needs the user's passphrase) and sends PAS itself.
                Ok(vec![])
            }
            (HubState::Identifying, "INF") if frame.frame_type == FrameType::Hub => {
                self.state = HubState::Normal;
                Ok(vec![])
            }
            (HubState::Identifying, "STA") => {
                self.state = HubState::Disconnected;
                let msg = frame.params.get(1).cloned().unwrap_or_default();
                Err(CoreError::Auth(msg))
            }
            (HubState::Normal, "INF") => {
                if let Some(sid) = frame.source {
                    let cid = frame.get_param("ID").unwrap_or_default().to_string();
                    self.sid_to_cid.insert(sid, cid.clone());
                    let user = user_from_frame(cid, &frame);
                    self.users.upsert(user);
                }
                Ok(vec![])
            }
            (HubState::Normal, "QUI") => {
                if let Some(sid) = frame.params.first().and_then(|s| Sid::from_wire(s).ok()) {
                    if let Some(cid) = self.sid_to_cid.remove(&sid) {
                        self.users.remove(&cid);
                    }
                }
                Ok(vec![])
            }
            (HubState::Normal, "STA") => {
                let msg = frame.params.get(1).cloned().unwrap_or_default();
                Err(CoreError::Protocol(msg))
            }
            (HubState::Normal, "SCH") => {
                let query = SearchQuery::parse_adc(&frame.keyed_params())?;
                let results = self.users.search_local_share(
                    &query,
                    self.share_files.iter(),
                    &self.my_cid,
                    self.free_slots,
                    self.total_slots,
                    "",
                );
                Ok(results
                    .into_iter()
                    .map(|result| res_frame(self.my_sid, frame.source, &result))
                    .collect())
            }
            (_, _) => Ok(vec![]),
        }
    }

    fn inf_frame(&self, sid: Sid) -> Frame {
        Frame {
            frame_type: FrameType::Broadcast,
            cmd: "INF".into(),
            source: Some(sid),
            dest: None,
            params: vec![format!("ID{}", self.my_cid)],
        }
    }

    pub fn password_response(&self, password_hash: &str) -> Frame {
        Frame {
            frame_type: FrameType::Hub,
            cmd: "PAS".into(),
            source: None,
            dest: None,
            params: vec![password_hash.to_string()],
        }
    }

    pub fn search(&self, sid: Sid, query: &SearchQuery) -> Frame {
        let param = match query {
            SearchQuery::Tth(tth) => format!("TR{}", crate::tth::encode_base32(tth)),
            SearchQuery::Keywords { pattern, .. } => format!("AN{}", pattern.join(" ")),
        };
        Frame { frame_type: FrameType::Broadcast, cmd: "SCH".into(), source: Some(sid), dest: None, params: vec![param] }
    }

    pub fn parse_search_result(&self, frame: &Frame) -> CoreResult<SearchResult> {
        let params = frame.keyed_params();
        let path = params.iter().find(|(k, _)| k == "FN").map(|(_, v)| v.clone()).unwrap_or_default();
        let size = params
            .iter()
            .find(|(k, _)| k == "SI")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        let tth = params
            .iter()
            .find(|(k, _)| k == "TR")
            .and_then(|(_, v)| crate::tth::decode_base32(v));
        let nick_or_cid = frame.source.map(|s| s.to_wire()).unwrap_or_default();
        Ok(SearchResult { nick_or_cid, path, size, tth, free_slots: 0, total_slots: 0, hub_name: String::new() })
    }
}

/// Build a direct `RES` reply to a searcher's SID.
fn res_frame(my_sid: Option<Sid>, to: Option<Sid>, result: &SearchResult) -> Frame {
    Frame { frame_type: FrameType::Direct, cmd: "RES".into(), source: my_sid, dest: to, params: result.encode_adc() }
}

fn sup_frame() -> Frame {
    Frame {
        frame_type: FrameType::Hub,
        cmd: "SUP".into(),
        source: None,
        dest: None,
        params: KNOWN_FEATURES.iter().map(|f| format!("+{f}")).collect(),
    }
}

fn user_from_frame(cid: String, frame: &Frame) -> HubUser {
    HubUser {
        nick_or_cid: cid,
        share_size: frame.get_param("SS").and_then(|v| v.parse().ok()).unwrap_or(0),
        slots_free: frame.get_param("FS").and_then(|v| v.parse().ok()).unwrap_or(0),
        slots_total: frame.get_param("SL").and_then(|v| v.parse().ok()).unwrap_or(0),
        auto_slot_bps: frame.get_param("AS").and_then(|v| v.parse().ok()),
        is_active: frame.get_param("U4").is_some() || frame.get_param("U6").is_some(),
        is_op: frame.get_param("CT").map(|v| v == "4").unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sup_moves_to_negotiating() {
        let mut hub = ModernHub::new("MYCID".into());
        let frame = Frame { frame_type: FrameType::Hub, cmd: "SUP".into(), source: None, dest: None, params: vec!["+BASE".into()] };
        hub.handle(frame).unwrap();
        assert_eq!(hub.state, HubState::Negotiating);
        assert!(hub.negotiated_features.iter().any(|f| f == "BASE"));
    }

    #[test]
    fn sup_drops_a_minus_prefixed_feature_from_negotiation() {
        let mut hub = ModernHub::new("MYCID".into());
        let frame = Frame { frame_type: FrameType::Hub, cmd: "SUP".into(), source: None, dest: None, params: vec!["-BZIP".into()] };
        hub.handle(frame).unwrap();
        assert!(!hub.negotiated_features.iter().any(|f| f == "BZIP"));
    }

    #[test]
    fn search_matching_a_shared_file_answers_with_res() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Normal;
        hub.my_sid = Some(Sid::from_wire("AAAA").unwrap());
        hub.free_slots = 2;
        hub.total_slots = 5;
        hub.share_files = vec![("share/a.mkv".to_string(), 100, [1u8; 24])];

        let searcher = Sid::from_wire("BBBB").unwrap();
        let frame = Frame {
            frame_type: FrameType::Broadcast,
            cmd: "SCH".into(),
            source: Some(searcher),
            dest: None,
            params: vec!["ANa".into()],
        };
        let replies = hub.handle(frame).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].cmd, "RES");
        assert_eq!(replies[0].frame_type, FrameType::Direct);
        assert_eq!(replies[0].source.unwrap().to_wire(), "AAAA");
        assert_eq!(replies[0].dest.unwrap().to_wire(), "BBBB");
        assert!(replies[0].params.contains(&"FNshare/a.mkv".to_string()));
    }

    #[test]
    fn feature_frame_with_unmet_selector_is_silently_filtered() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Normal;
        hub.negotiated_features = vec!["BASE".to_string()];
        let frame = Frame {
            frame_type: FrameType::Feature,
            cmd: "SCH".into(),
            source: Some(Sid::from_wire("BBBB").unwrap()),
            dest: None,
            params: vec!["+TIGR".into(), "ANa".into()],
        };
        let replies = hub.handle(frame).unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn feature_frame_with_a_malformed_selector_is_a_hard_error() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Normal;
        let frame = Frame {
            frame_type: FrameType::Feature,
            cmd: "SCH".into(),
            source: Some(Sid::from_wire("BBBB").unwrap()),
            dest: None,
            params: vec!["+BAD".into()],
        };
        assert!(hub.handle(frame).is_err());
    }

    #[test]
    fn sid_assigns_and_sends_inf() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Negotiating;
        let frame = Frame { frame_type: FrameType::Info, cmd: "SID".into(), source: None, dest: None, params: vec!["AAAA".into()] };
        let replies = hub.handle(frame).unwrap();
        assert_eq!(hub.my_sid.unwrap().to_wire(), "AAAA");
        assert_eq!(replies[0].cmd, "INF");
        assert_eq!(hub.state, HubState::Identifying);
    }

    #[test]
    fn hub_inf_in_identifying_completes_login() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Identifying;
        let frame = Frame { frame_type: FrameType::Hub, cmd: "INF".into(), source: None, dest: None, params: vec![] };
        hub.handle(frame).unwrap();
        assert_eq!(hub.state, HubState::Normal);
    }

    #[test]
    fn user_inf_in_normal_state_populates_table() {
        let mut hub = ModernHub::new("MYCID".into());
        hub.state = HubState::Normal;
        let sid = Sid::from_wire("BBBB").unwrap();
        let frame = Frame {
            frame_type: FrameType::Broadcast,
            cmd: "INF".into(),
            source: Some(sid),
            dest: None,
            params: vec!["IDCID123".into(), "SS1000".into(), "SL5".into()],
        };
        hub.handle(frame).unwrap();
        assert_eq!(hub.users.get("CID123").unwrap().share_size, 1000);
    }
}
