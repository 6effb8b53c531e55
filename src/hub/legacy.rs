//! NMDC hub session: lock/key handshake, nick validation, user-list
//! bootstrap, then steady-state `$MyINFO`/`$To:`/`$Search`/`$SR` traffic.

use super::{HubState, HubUser, HubUserTable};
use crate::error::{CoreError, CoreResult};
use crate::proto::legacy::{Command, InfoTag};
use crate::proto::search::{SearchQuery, SearchResult};
use crate::tth::Tth;

pub struct LegacyHub {
    pub state: HubState,
    pub nick: String,
    pub users: HubUserTable,
    pub hub_name: String,
    /// A snapshot of the local share, refreshed by the caller as it
    /// changes, used to answer inbound `$Search` without a round trip.
    pub share_files: Vec<(String, u64, Tth)>,
    pub free_slots: u32,
    pub total_slots: u32,
}

impl LegacyHub {
    pub fn new(nick: String) -> Self {
        Self {
            state: HubState::Connecting,
            nick,
            users: HubUserTable::new(),
            hub_name: String::new(),
            share_files: Vec::new(),
            free_slots: 0,
            total_slots: 0,
        }
    }

    /// Drive the state machine one incoming command at a time, returning
    /// whatever reply commands should be sent back (possibly none).
    pub fn handle(&mut self, cmd: Command) -> CoreResult<Vec<Command>> {
        match (&self.state, cmd) {
            (HubState::Connecting, Command::Lock { lock, .. }) => {
                self.state = HubState::Negotiating;
                let key = crate::proto::legacy::lock_to_key(lock.as_bytes());
                Ok(vec![
                    Command::Key { key },
                    Command::ValidateNick { nick: self.nick.clone() },
                ])
            }
            (HubState::Negotiating, Command::HubName { name }) => {
                self.hub_name = name;
                Ok(vec![])
            }
            (HubState::Negotiating, Command::Hello { nick }) if nick == self.nick => {
                self.state = HubState::Normal;
                Ok(vec![Command::GetNickList])
            }
            (HubState::Negotiating, Command::ValidateDenide { .. }) => {
                self.state = HubState::Disconnected;
                Err(CoreError::Auth("nick already in use".into()))
            }
            (HubState::Negotiating, Command::GetPass) => {
                Ok(vec![]) // caller supplies the password via a separate API once prompted
            }
            (HubState::Normal, Command::MyInfo { nick, share_size, tag, .. }) => {
                let user = user_from_info(nick, share_size, tag);
                self.users.upsert(user);
                Ok(vec![])
            }
            (HubState::Normal, Command::Quit { nick }) => {
                self.users.remove(&nick);
                Ok(vec![])
            }
            (HubState::Normal, Command::NickList { names }) => {
                for name in names {
                    self.users.upsert(HubUser { nick_or_cid: name, ..Default::default() });
                }
                Ok(vec![])
            }
            (HubState::Normal, Command::HubIsFull) => {
                self.state = HubState::Disconnected;
                Err(CoreError::Resource(crate::error::ResourceKind::NoSlots))
            }
            (HubState::Normal, Command::Error { message }) => Err(CoreError::Protocol(message)),
            (HubState::Normal, Command::Search { from, query, .. }) => {
                let hub_or_addr = match &from {
                    crate::proto::legacy::SearchFrom::Passive { .. } => Some(self.hub_name.clone()),
                    crate::proto::legacy::SearchFrom::Active { host, port } => Some(format!("{host}:{port}")),
                };
                let results = self.users.search_local_share(
                    &query,
                    self.share_files.iter(),
                    &self.nick,
                    self.free_slots,
                    self.total_slots,
                    &self.hub_name,
                );
                Ok(results
                    .into_iter()
                    .map(|result| Command::SearchResult { result, hub_or_addr: hub_or_addr.clone() })
                    .collect())
            }
            // anything else in Normal state (ConnectToMe, To, ...) is handed
            // to the CC/queue layers by the caller and doesn't change hub
            // state, so it's a no-op here.
            (_, _) => Ok(vec![]),
        }
    }

    pub fn supply_password(&self, password: String) -> Command {
        Command::MyPass { password }
    }

    pub fn broadcast_myinfo(&self, info: &HubUser) -> Command {
        Command::MyInfo {
            nick: self.nick.clone(),
            description: String::new(),
            tag: Some(InfoTag {
                client: "dctransfer".into(),
                mode: if info.is_active { 'A' } else { 'P' },
                hubs: (1, 0, 0),
                slots: info.slots_total,
                auto_slot_bps: info.auto_slot_bps,
            }),
            connection: "100".into(),
            flag: 0x01,
            mail: String::new(),
            share_size: info.share_size,
        }
    }

    pub fn search(&self, query: &SearchQuery, passive_nick: Option<&str>) -> Command {
        let from = match passive_nick {
            Some(nick) => crate::proto::legacy::SearchFrom::Passive { nick: nick.to_string() },
            None => crate::proto::legacy::SearchFrom::Active { host: String::new(), port: 0 },
        };
        Command::Search { from, is_active: passive_nick.is_none(), query: query.clone() }
    }

    pub fn parse_search_result(&self, body: &str) -> CoreResult<(SearchResult, Option<String>)> {
        SearchResult::parse_nmdc(body)
    }
}

fn user_from_info(nick: String, share_size: u64, tag: Option<InfoTag>) -> HubUser {
    match tag {
        Some(t) => HubUser {
            nick_or_cid: nick,
            share_size,
            slots_total: t.slots,
            slots_free: t.slots,
            auto_slot_bps: t.auto_slot_bps,
            is_active: t.mode == 'A',
            is_op: false,
        },
        None => HubUser { nick_or_cid: nick, share_size, ..Default::default() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_triggers_key_and_validate_nick() {
        let mut hub = LegacyHub::new("bob".into());
        let replies = hub.handle(Command::Lock { lock: "EXTENDEDPROTOCOLABC".into(), pk: None }).unwrap();
        assert!(matches!(replies[0], Command::Key { .. }));
        assert!(matches!(&replies[1], Command::ValidateNick { nick } if nick == "bob"));
        assert_eq!(hub.state, HubState::Negotiating);
    }

    #[test]
    fn hello_for_own_nick_enters_normal_state() {
        let mut hub = LegacyHub::new("bob".into());
        hub.state = HubState::Negotiating;
        let replies = hub.handle(Command::Hello { nick: "bob".into() }).unwrap();
        assert_eq!(hub.state, HubState::Normal);
        assert!(matches!(replies[0], Command::GetNickList));
    }

    #[test]
    fn validate_denide_surfaces_auth_error() {
        let mut hub = LegacyHub::new("bob".into());
        hub.state = HubState::Negotiating;
        let err = hub.handle(Command::ValidateDenide { nick: "bob".into() }).unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[test]
    fn search_matching_a_shared_file_answers_with_sr() {
        let mut hub = LegacyHub::new("bob".into());
        hub.state = HubState::Normal;
        hub.hub_name = "hub.example.com".into();
        hub.free_slots = 2;
        hub.total_slots = 5;
        hub.share_files = vec![("share/a.mkv".to_string(), 100, [1u8; 24])];

        let query = crate::proto::search::SearchQuery::Keywords {
            pattern: vec!["a".into()],
            data_type: crate::proto::search::DataType::Video,
            size: None,
        };
        let replies = hub
            .handle(Command::Search {
                from: crate::proto::legacy::SearchFrom::Passive { nick: "carol".into() },
                is_active: false,
                query,
            })
            .unwrap();
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            Command::SearchResult { result, hub_or_addr } => {
                assert_eq!(result.nick_or_cid, "bob");
                assert_eq!(result.path, "share/a.mkv");
                assert_eq!(result.free_slots, 2);
                assert_eq!(hub_or_addr.as_deref(), Some("hub.example.com"));
            }
            _ => panic!("expected SearchResult"),
        }
    }

    #[test]
    fn myinfo_in_normal_state_updates_user_table() {
        let mut hub = LegacyHub::new("bob".into());
        hub.state = HubState::Normal;
        hub.handle(Command::MyInfo {
            nick: "carol".into(),
            description: String::new(),
            tag: Some(InfoTag { client: "++".into(), mode: 'A', hubs: (1, 0, 0), slots: 4, auto_slot_bps: None }),
            connection: "100".into(),
            flag: 1,
            mail: String::new(),
            share_size: 500,
        }).unwrap();
        assert_eq!(hub.users.get("carol").unwrap().share_size, 500);
    }
}
