//! §4.7 CC (client-to-client) session: the state machine a transfer
//! connection walks through, and the slot policy that gates uploads.
//! Generalised from the teacher's `peer::Connection` handshake-then-stream
//! shape to cover both directions and both dialects.

pub mod download;
pub mod upload;

use crate::proto::Dialect;
use crate::utils::defaults;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DISCONNECT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcState {
    Connecting,
    Handshaking,
    Idle,
    Uploading,
    Downloading,
    /// Either side asked to close; still drained for `DISCONNECT_GRACE`
    /// before the socket is torn down, to let a final ack land.
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We connected out to them (`$ConnectToMe`/`CTM` we sent).
    Download,
    /// They connected to us.
    Upload,
}

pub struct CcSession {
    pub dialect: Dialect,
    pub state: CcState,
    pub direction: Direction,
    pub remote_nick_or_cid: String,
    pub hub_id: String,
    pub state_entered_at: Instant,
}

impl CcSession {
    pub fn new(dialect: Dialect, direction: Direction, remote_nick_or_cid: String, hub_id: String) -> Self {
        Self {
            dialect,
            state: CcState::Connecting,
            direction,
            remote_nick_or_cid,
            hub_id,
            state_entered_at: Instant::now(),
        }
    }

    pub fn transition(&mut self, next: CcState) {
        self.state = next;
        self.state_entered_at = Instant::now();
    }

    pub fn disconnect_deadline_passed(&self, now: Instant) -> bool {
        self.state == CcState::Disconnecting && now.duration_since(self.state_entered_at) >= DISCONNECT_GRACE
    }
}

/// Whether an upload slot is available, distinguishing full slots from the
/// always-available "minislot" reserved for small/low-priority requests,
/// and the uncounted "overflow" grant ops get past a maxed-out queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGrant {
    Full,
    Mini,
    Overflow,
    Denied,
}

/// Tracks how many full and mini upload slots are in use right now, plus
/// which peers already hold a granted slot. Grants are process-lifetime
/// and keyed by the peer's hub-specific name (legacy) or CID (modern), so
/// a reconnecting peer gets the same slot back without re-competing for
/// one.
#[derive(Debug, Default)]
pub struct SlotManager {
    full_in_use: u32,
    mini_in_use: u32,
    granted: HashMap<String, SlotGrant>,
}

impl SlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `user_id` gets a slot, per the reference policy:
    /// a slot already granted to this peer is always honoured; otherwise
    /// a full slot is tried first, then (if `need_full` is false) a
    /// minislot, then (if the peer is an op) an uncounted overflow grant.
    pub fn request_slot(&mut self, user_id: &str, need_full: bool, is_op: bool) -> SlotGrant {
        if let Some(&grant) = self.granted.get(user_id) {
            return grant;
        }
        let grant = if self.full_in_use < defaults::SLOTS {
            self.full_in_use += 1;
            SlotGrant::Full
        } else if !need_full && self.mini_in_use < defaults::MINISLOTS {
            self.mini_in_use += 1;
            SlotGrant::Mini
        } else if !need_full && is_op {
            SlotGrant::Overflow
        } else {
            return SlotGrant::Denied;
        };
        self.granted.insert(user_id.to_string(), grant);
        grant
    }

    pub fn release(&mut self, user_id: &str) {
        match self.granted.remove(user_id) {
            Some(SlotGrant::Full) => self.full_in_use = self.full_in_use.saturating_sub(1),
            Some(SlotGrant::Mini) => self.mini_in_use = self.mini_in_use.saturating_sub(1),
            Some(SlotGrant::Overflow) | None => {}
        }
    }

    pub fn free_slots(&self) -> u32 {
        defaults::SLOTS.saturating_sub(self.full_in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_slots_are_tried_before_minislots() {
        let mut sm = SlotManager::new();
        let grant = sm.request_slot("alice", false, false);
        assert_eq!(grant, SlotGrant::Full);
    }

    #[test]
    fn full_slots_exhaust_then_fall_through_to_minislots() {
        let mut sm = SlotManager::new();
        for i in 0..defaults::SLOTS {
            assert_eq!(sm.request_slot(&format!("user{i}"), false, false), SlotGrant::Full);
        }
        assert_eq!(sm.request_slot("mini-user", false, false), SlotGrant::Mini);
    }

    #[test]
    fn full_and_mini_slots_exhaust_to_denied() {
        let mut sm = SlotManager::new();
        for i in 0..defaults::SLOTS {
            sm.request_slot(&format!("full{i}"), false, false);
        }
        for i in 0..defaults::MINISLOTS {
            sm.request_slot(&format!("mini{i}"), false, false);
        }
        assert_eq!(sm.request_slot("late-user", false, false), SlotGrant::Denied);
    }

    #[test]
    fn need_full_skips_minislots_and_overflow() {
        let mut sm = SlotManager::new();
        for i in 0..defaults::SLOTS {
            sm.request_slot(&format!("full{i}"), false, false);
        }
        assert_eq!(sm.request_slot("op-user", true, true), SlotGrant::Denied);
    }

    #[test]
    fn op_overflow_bypasses_a_maxed_out_queue() {
        let mut sm = SlotManager::new();
        for i in 0..defaults::SLOTS {
            sm.request_slot(&format!("full{i}"), false, false);
        }
        for i in 0..defaults::MINISLOTS {
            sm.request_slot(&format!("mini{i}"), false, false);
        }
        assert_eq!(sm.request_slot("op-user", false, true), SlotGrant::Overflow);
    }

    #[test]
    fn a_granted_slot_is_honoured_again_on_reconnect() {
        let mut sm = SlotManager::new();
        let first = sm.request_slot("alice", false, false);
        for i in 0..defaults::SLOTS {
            sm.request_slot(&format!("other{i}"), false, false);
        }
        // alice's slot was granted before the pool filled up -- it's
        // honoured again without competing against the now-full pool.
        assert_eq!(sm.request_slot("alice", false, false), first);
    }

    #[test]
    fn release_frees_up_the_right_counter() {
        let mut sm = SlotManager::new();
        sm.request_slot("alice", false, false);
        assert_eq!(sm.free_slots(), defaults::SLOTS - 1);
        sm.release("alice");
        assert_eq!(sm.free_slots(), defaults::SLOTS);
    }

    #[test]
    fn disconnect_deadline_requires_grace_period() {
        let mut session = CcSession::new(Dialect::Modern, Direction::Upload, "bob".into(), "hub".into());
        session.transition(CcState::Disconnecting);
        assert!(!session.disconnect_deadline_passed(Instant::now()));
        assert!(session.disconnect_deadline_passed(Instant::now() + DISCONNECT_GRACE));
    }
}
