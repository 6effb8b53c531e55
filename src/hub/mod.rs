//! §4.4/4.5 Hub session: per-dialect state machines sharing one user table
//! and one search-dispatch surface, so the CC and queue layers never need
//! to know which wire dialect a given hub speaks.

pub mod legacy;
pub mod modern;

use crate::proto::search::{SearchQuery, SearchResult};
use std::collections::HashMap;
use std::time::Duration;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// One user on a hub, as known from their `$MyINFO`/`INF` broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubUser {
    pub nick_or_cid: String,
    pub share_size: u64,
    pub slots_free: u32,
    pub slots_total: u32,
    /// Open Question 1: the advertised auto-open-under-rate threshold is
    /// its own field, never folded into `slots_total`.
    pub auto_slot_bps: Option<u64>,
    pub is_active: bool,
    pub is_op: bool,
}

/// A diff between two `HubUser` snapshots, for deciding whether an
/// `INF`/`MyINFO` update is worth re-broadcasting to interested watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoDiff {
    pub share_size_changed: bool,
    pub slots_changed: bool,
    pub mode_changed: bool,
}

pub fn diff_info(old: &HubUser, new: &HubUser) -> InfoDiff {
    InfoDiff {
        share_size_changed: old.share_size != new.share_size,
        slots_changed: old.slots_free != new.slots_free || old.slots_total != new.slots_total,
        mode_changed: old.is_active != new.is_active,
    }
}

impl InfoDiff {
    pub fn is_notable(self) -> bool {
        self.share_size_changed || self.slots_changed || self.mode_changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    /// Protocol/capability negotiation (lock/key, or `SUP`).
    Negotiating,
    /// Nick registration / identify (passphrase challenge if required).
    Identifying,
    Normal,
}

/// Shared user-table and search-dispatch behaviour both dialects plug
/// into; `legacy::LegacyHub` and `modern::ModernHub` each drive their own
/// wire state machine but store users the same way.
pub struct HubUserTable {
    users: HashMap<String, HubUser>,
}

impl HubUserTable {
    pub fn new() -> Self {
        Self { users: HashMap::new() }
    }

    pub fn upsert(&mut self, user: HubUser) -> Option<InfoDiff> {
        let key = user.nick_or_cid.clone();
        match self.users.insert(key, user.clone()) {
            Some(old) => Some(diff_info(&old, &user)),
            None => None,
        }
    }

    pub fn remove(&mut self, nick_or_cid: &str) -> Option<HubUser> {
        self.users.remove(nick_or_cid)
    }

    pub fn get(&self, nick_or_cid: &str) -> Option<&HubUser> {
        self.users.get(nick_or_cid)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Every local file matching `query`, as a search result ready to send
    /// back. `identity`, `free_slots`/`total_slots` and `hub_name` describe
    /// the answering client itself (taken from the local `SlotManager` and
    /// hub session by the caller), not a remote hub user.
    pub fn search_local_share<'a>(
        &self,
        query: &SearchQuery,
        files: impl Iterator<Item = &'a (String, u64, crate::tth::Tth)>,
        identity: &str,
        free_slots: u32,
        total_slots: u32,
        hub_name: &str,
    ) -> Vec<SearchResult> {
        files
            .filter(|(path, size, tth)| query.matches(path, *size, Some(tth)))
            .map(|(path, size, tth)| SearchResult {
                nick_or_cid: identity.to_string(),
                path: path.clone(),
                size: *size,
                tth: Some(*tth),
                free_slots,
                total_slots,
                hub_name: hub_name.to_string(),
            })
            .collect()
    }
}

impl Default for HubUserTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_reports_slot_change() {
        let mut table = HubUserTable::new();
        table.upsert(HubUser { nick_or_cid: "bob".into(), slots_free: 3, slots_total: 5, ..Default::default() });
        let diff = table
            .upsert(HubUser { nick_or_cid: "bob".into(), slots_free: 1, slots_total: 5, ..Default::default() })
            .unwrap();
        assert!(diff.slots_changed);
        assert!(!diff.share_size_changed);
    }

    #[test]
    fn search_local_share_filters_by_query() {
        let table = HubUserTable::new();
        let files = vec![
            ("share/a.mkv".to_string(), 10u64, [1u8; 24]),
            ("share/b.txt".to_string(), 10u64, [2u8; 24]),
        ];
        let query = SearchQuery::Keywords {
            pattern: vec!["a".into()],
            data_type: crate::proto::search::DataType::Video,
            size: None,
        };
        let results = table.search_local_share(&query, files.iter(), "bob", 2, 5, "hub");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "share/a.mkv");
    }
}
