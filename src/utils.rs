//! Small stand-alone helpers that don't belong to any one module: local
//! identity generation and the handful of tunable defaults every
//! collaborator needs.

use crate::tth::Tth;
use digest::Digest;
use rand::RngCore;

/// Slots, minislots and refresh-interval defaults, mirrored from the
/// reference client's `conf_*` macros.
pub mod defaults {
    pub const SLOTS: u32 = 10;
    pub const MINISLOTS: u32 = 3;
    pub const MINISLOT_SIZE: u64 = 64 * 1024;
    pub const DOWNLOAD_SLOTS: u32 = 3;
    pub const AUTOREFRESH_SECS: u64 = 60 * 60;
}

/// Generate a fresh, random local PID: Tiger hash of 8 random bytes.
pub fn generate_pid() -> Tth {
    let mut seed = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut seed);
    tiger_of(&seed)
}

/// The client ID (CID) a PID implies: Tiger hash of the PID itself. Hubs
/// and peers only ever see the CID; the PID stays local so ownership of a
/// CID can be proven on request.
pub fn cid_from_pid(pid: &Tth) -> Tth {
    tiger_of(pid)
}

fn tiger_of(data: &[u8]) -> Tth {
    let mut hasher = tiger::Tiger::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut tth = [0u8; 24];
    tth.copy_from_slice(&out);
    tth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_and_cid_are_deterministically_linked() {
        let pid = generate_pid();
        let cid1 = cid_from_pid(&pid);
        let cid2 = cid_from_pid(&pid);
        assert_eq!(cid1, cid2);
    }

    #[test]
    fn two_generated_pids_differ() {
        assert_ne!(generate_pid(), generate_pid());
    }
}
