//! §4.8 Expectation table: short-lived records pairing an expected inbound
//! CC connection (from a `$ConnectToMe`/`CTM` we sent, or a passive search
//! reply) to the hub+nick/token that should claim it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const EXPECTATION_TTL: Duration = Duration::from_secs(5 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Which hub a peer claims to be connecting on behalf of, and how to
/// recognise them once they show up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectKey {
    pub hub_id: String,
    pub nick_or_cid: String,
}

#[derive(Debug, Clone)]
pub struct Expectation {
    pub key: ExpectKey,
    /// ADC token, if the expectation came from a modern-dialect `RCM`/`CTM`.
    pub token: Option<String>,
    pub inserted_at: Instant,
}

#[derive(Default)]
pub struct ExpectationTable {
    by_addr: HashMap<IpAddr, Vec<Expectation>>,
}

impl ExpectationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: IpAddr, key: ExpectKey, token: Option<String>) {
        self.by_addr.entry(addr).or_default().push(Expectation {
            key,
            token,
            inserted_at: Instant::now(),
        });
    }

    /// Claim and remove the first unexpired expectation from this address,
    /// optionally filtered to a matching ADC token.
    pub fn match_and_remove(&mut self, addr: IpAddr, token: Option<&str>) -> Option<Expectation> {
        let list = self.by_addr.get_mut(&addr)?;
        let now = Instant::now();
        let idx = list.iter().position(|e| {
            now.duration_since(e.inserted_at) < EXPECTATION_TTL
                && token.map_or(true, |t| e.token.as_deref() == Some(t))
        })?;
        let expectation = list.remove(idx);
        if list.is_empty() {
            self.by_addr.remove(&addr);
        }
        Some(expectation)
    }

    /// Drop every expired record; called on the 120-second sweep tick.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.by_addr.retain(|addr, list| {
            list.retain(|e| {
                let alive = now.duration_since(e.inserted_at) < EXPECTATION_TTL;
                if !alive {
                    log::warn!(
                        "expectation for {} on hub {} expired unclaimed from {addr}",
                        e.key.nick_or_cid, e.key.hub_id
                    );
                }
                alive
            });
            !list.is_empty()
        });
    }

    /// Drop every expectation tied to a hub, e.g. on hub disconnect.
    pub fn clear_hub(&mut self, hub_id: &str) {
        self.by_addr.retain(|_, list| {
            list.retain(|e| e.key.hub_id != hub_id);
            !list.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_addr.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn insert_then_match_removes_the_record() {
        let mut t = ExpectationTable::new();
        let key = ExpectKey { hub_id: "hub1".into(), nick_or_cid: "bob".into() };
        t.insert(addr(), key.clone(), None);
        let got = t.match_and_remove(addr(), None).unwrap();
        assert_eq!(got.key, key);
        assert!(t.is_empty());
    }

    #[test]
    fn match_respects_token_filter() {
        let mut t = ExpectationTable::new();
        let key = ExpectKey { hub_id: "hub1".into(), nick_or_cid: "bob".into() };
        t.insert(addr(), key, Some("tok-a".into()));
        assert!(t.match_and_remove(addr(), Some("tok-b")).is_none());
        assert!(t.match_and_remove(addr(), Some("tok-a")).is_some());
    }

    #[test]
    fn clear_hub_drops_only_that_hubs_expectations() {
        let mut t = ExpectationTable::new();
        t.insert(addr(), ExpectKey { hub_id: "hub1".into(), nick_or_cid: "a".into() }, None);
        t.insert(addr(), ExpectKey { hub_id: "hub2".into(), nick_or_cid: "b".into() }, None);
        t.clear_hub("hub1");
        assert_eq!(t.len(), 1);
    }
}
