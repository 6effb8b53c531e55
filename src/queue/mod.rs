//! §4.10 Download queue: persisted `DLItem`/`DLUser` rows, resumable
//! transfers with TTHL block verification, and priority-ordered
//! connection scheduling.

pub mod store;

use crate::error::{CoreError, CoreResult, IntegrityKind};
use crate::tth::Tth;
use crate::utils::defaults;
use std::collections::HashMap;
use std::path::PathBuf;

/// A source willing to serve a queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlUser {
    pub hub: String,
    pub nick: String,
    pub error: Option<IntegrityKind>,
}

/// A `DLItem`'s scheduling priority: an ordinary signed level, or one of
/// the two sentinel states that pull it out of scheduling entirely --
/// `Off` (user-paused) and `Err` (parked after an item-level integrity
/// failure, e.g. a bad block hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Off,
    Err,
    Level(i32),
}

impl Priority {
    /// Reserved `dl.priority` values outside any real `set_priority` range,
    /// used to round-trip the sentinel states through `QueueStore`.
    const OFF_SENTINEL: i32 = i32::MIN;
    const ERR_SENTINEL: i32 = i32::MIN + 1;

    fn level(self) -> i32 {
        match self {
            Priority::Level(n) => n,
            Priority::Off | Priority::Err => i32::MIN,
        }
    }

    fn to_db(self) -> i32 {
        match self {
            Priority::Off => Self::OFF_SENTINEL,
            Priority::Err => Self::ERR_SENTINEL,
            Priority::Level(n) => n,
        }
    }

    fn from_db(n: i32) -> Self {
        match n {
            Self::OFF_SENTINEL => Priority::Off,
            Self::ERR_SENTINEL => Priority::Err,
            n => Priority::Level(n),
        }
    }
}

/// One queued download: the content-addressed target, where it lands on
/// disk, and in-flight progress.
#[derive(Debug, Clone)]
pub struct DlItem {
    pub tth: Tth,
    pub size: u64,
    pub dest: PathBuf,
    pub priority: Priority,
    pub received: u64,
    pub users: Vec<DlUser>,
    pub error: Option<IntegrityKind>,
}

impl DlItem {
    pub fn is_complete(&self) -> bool {
        self.received >= self.size
    }

    pub fn incomplete_path(&self) -> PathBuf {
        let mut p = self.dest.clone();
        let name = p.file_name().map(|n| format!("{}.part", n.to_string_lossy())).unwrap_or_else(|| "download.part".into());
        p.set_file_name(name);
        p
    }
}

/// An entry queued by matching against a peer's file list rather than a
/// direct TTH, held until the list arrives and resolves (or fails to
/// resolve) to one.
#[derive(Debug, Clone)]
pub struct FileListMatch {
    pub hub: String,
    pub nick: String,
    /// Regex over virtual paths; paths it matches are excluded from the
    /// resulting batch of enqueued items.
    pub exclude: Option<String>,
}

#[derive(Default)]
pub struct DownloadQueue {
    items: HashMap<Tth, DlItem>,
    pending_filelist_matches: Vec<FileListMatch>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the in-memory queue from `QueueStore`'s `dl`/`dl_users`
    /// tables, run once at startup. `received` is left at zero for every
    /// item -- the real resume offset comes back from the `.part` file's
    /// size when `DownloadWriter::open` truncates to a leaf boundary.
    pub fn load_from(store: &store::QueueStore) -> CoreResult<Self> {
        let mut queue = Self::new();
        for row in store.list_items()? {
            let users = store
                .list_users(&row.tth)?
                .into_iter()
                .map(|u| DlUser { hub: u.hub, nick: u.nick, error: u.error })
                .collect();
            queue.items.insert(
                row.tth,
                DlItem {
                    tth: row.tth,
                    size: row.size,
                    dest: PathBuf::from(row.dest),
                    priority: Priority::from_db(row.priority),
                    received: 0,
                    users,
                    error: row.error,
                },
            );
        }
        Ok(queue)
    }

    /// Like `enqueue`, but also writes the item and source through to
    /// `store` so it survives a restart.
    pub fn enqueue_persisted(
        &mut self,
        store: &store::QueueStore,
        tth: Tth,
        size: u64,
        dest: PathBuf,
        priority: i32,
        hub: &str,
        nick: &str,
    ) -> CoreResult<()> {
        store.insert_item(&tth, size, &dest.to_string_lossy(), priority)?;
        store.add_user(&tth, hub, nick)?;
        self.enqueue(tth, size, dest, priority, hub, nick);
        Ok(())
    }

    /// Like `remove`, but also deletes the row (and its sources, via the
    /// `dl_users` foreign key) from `store`.
    pub fn remove_persisted(&mut self, store: &store::QueueStore, tth: &Tth) -> CoreResult<Option<DlItem>> {
        store.remove_item(tth)?;
        Ok(self.remove(tth))
    }

    /// Like `failed`, but also writes the per-source error and, for an
    /// item-level integrity failure, the parked `Err` priority through to
    /// `store`.
    pub fn failed_persisted(
        &mut self,
        store: &store::QueueStore,
        tth: &Tth,
        hub: &str,
        nick: &str,
        error: IntegrityKind,
    ) -> CoreResult<()> {
        store.set_user_error(tth, hub, nick, Some(&error))?;
        if matches!(error, IntegrityKind::Hash(_) | IntegrityKind::InvTthl) {
            store.set_priority(tth, Priority::Err.to_db())?;
            store.set_item_error(tth, Some(&error))?;
        }
        self.failed(tth, hub, nick, error);
        Ok(())
    }

    /// Like `completed`, but also removes the finished item's row from
    /// `store`.
    pub fn completed_persisted(&mut self, store: &store::QueueStore, tth: &Tth) -> CoreResult<Option<DlItem>> {
        let done = self.completed(tth);
        if done.is_some() {
            store.remove_item(tth)?;
        }
        Ok(done)
    }

    /// Queue a single file for download. Directories have no TTH and so
    /// can never be enqueued directly (Open Question 3's resolution).
    pub fn enqueue(&mut self, tth: Tth, size: u64, dest: PathBuf, priority: i32, hub: &str, nick: &str) {
        let item = self.items.entry(tth).or_insert_with(|| DlItem {
            tth,
            size,
            dest,
            priority: Priority::Level(priority),
            received: 0,
            users: Vec::new(),
            error: None,
        });
        if !item.users.iter().any(|u| u.hub == hub && u.nick == nick) {
            item.users.push(DlUser { hub: hub.to_string(), nick: nick.to_string(), error: None });
        }
    }

    /// Register interest in a peer's whole file list; actual items are
    /// enqueued once `match_filelist` resolves it against the list's
    /// contents.
    pub fn enqueue_filelist(&mut self, hub: String, nick: String, exclude: Option<String>) {
        self.pending_filelist_matches.push(FileListMatch { hub, nick, exclude });
    }

    /// Resolve a previously queued file-list request against the list's
    /// parsed contents, enqueuing every file that doesn't match the
    /// exclusion pattern.
    pub fn match_filelist(
        &mut self,
        hub: &str,
        nick: &str,
        files: &[(String, u64, Tth)],
        dest_dir: &PathBuf,
    ) -> CoreResult<usize> {
        let idx = self
            .pending_filelist_matches
            .iter()
            .position(|m| m.hub == hub && m.nick == nick)
            .ok_or_else(|| CoreError::Protocol("no pending file-list match for this user".into()))?;
        let pending = self.pending_filelist_matches.remove(idx);
        let exclude_re = pending
            .exclude
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| CoreError::Config(format!("bad exclusion pattern: {e}")))?;

        let mut queued = 0;
        for (path, size, tth) in files {
            if let Some(re) = &exclude_re {
                if re.is_match(path) {
                    continue;
                }
            }
            let dest = dest_dir.join(path.rsplit('/').next().unwrap_or(path));
            self.enqueue(*tth, *size, dest, 0, hub, nick);
            queued += 1;
        }
        Ok(queued)
    }

    pub fn remove(&mut self, tth: &Tth) -> Option<DlItem> {
        self.items.remove(tth)
    }

    /// Drop a single user from every item's source list; items left with
    /// no sources are NOT auto-removed (they stay queued, awaiting a new
    /// source).
    pub fn remove_user(&mut self, hub: &str, nick: &str) {
        for item in self.items.values_mut() {
            item.users.retain(|u| !(u.hub == hub && u.nick == nick));
        }
    }

    pub fn set_priority(&mut self, tth: &Tth, priority: i32) -> CoreResult<()> {
        let item = self.items.get_mut(tth).ok_or_else(|| CoreError::Protocol("unknown download".into()))?;
        item.priority = Priority::Level(priority);
        Ok(())
    }

    pub fn received_bytes(&mut self, tth: &Tth, bytes: u64) -> CoreResult<()> {
        let item = self.items.get_mut(tth).ok_or_else(|| CoreError::Protocol("unknown download".into()))?;
        item.received += bytes;
        Ok(())
    }

    pub fn completed(&mut self, tth: &Tth) -> Option<DlItem> {
        let item = self.items.get(tth)?;
        if item.is_complete() {
            self.items.remove(tth)
        } else {
            None
        }
    }

    /// Record a source-level or item-level failure. `NoFile` and similar
    /// per-source errors only mark that user as bad, leaving the item free
    /// to try other sources; `Hash`/`InvTthl` are item-level integrity
    /// failures that park the whole item at `Priority::Err`.
    pub fn failed(&mut self, tth: &Tth, hub: &str, nick: &str, error: IntegrityKind) {
        if let Some(item) = self.items.get_mut(tth) {
            if let Some(user) = item.users.iter_mut().find(|u| u.hub == hub && u.nick == nick) {
                user.error = Some(error.clone());
            }
            if matches!(error, IntegrityKind::Hash(_) | IntegrityKind::InvTthl) {
                item.priority = Priority::Err;
                item.error = Some(error);
            }
        }
    }

    /// Pick the next eligible `(tth, hub, nick)` to open a connection for,
    /// highest priority first, skipping sources that errored and items
    /// already complete. Respects the global download-slot cap.
    pub fn next_candidate(&self, active_downloads: usize) -> Option<(Tth, String, String)> {
        if active_downloads >= defaults::DOWNLOAD_SLOTS as usize {
            return None;
        }
        let mut candidates: Vec<&DlItem> = self
            .items
            .values()
            .filter(|i| !i.is_complete() && matches!(i.priority, Priority::Level(_)))
            .collect();
        candidates.sort_by(|a, b| b.priority.level().cmp(&a.priority.level()));
        for item in candidates {
            if let Some(user) = item.users.iter().find(|u| u.error.is_none()) {
                return Some((item.tth, user.hub.clone(), user.nick.clone()));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, tth: &Tth) -> Option<&DlItem> {
        self.items.get(tth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store as sqlite_store;

    fn tth(n: u8) -> Tth {
        [n; 24]
    }

    #[test]
    fn enqueue_twice_from_same_user_does_not_duplicate_source() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 100, "/tmp/f".into(), 0, "hub", "bob");
        q.enqueue(tth(1), 100, "/tmp/f".into(), 0, "hub", "bob");
        assert_eq!(q.get(&tth(1)).unwrap().users.len(), 1);
    }

    #[test]
    fn received_bytes_and_completed() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 10, "/tmp/f".into(), 0, "hub", "bob");
        q.received_bytes(&tth(1), 10).unwrap();
        assert!(q.completed(&tth(1)).is_some());
        assert!(q.get(&tth(1)).is_none());
    }

    #[test]
    fn next_candidate_prefers_higher_priority() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 10, "/tmp/a".into(), 1, "hub", "bob");
        q.enqueue(tth(2), 10, "/tmp/b".into(), 5, "hub", "carol");
        let (t, _, nick) = q.next_candidate(0).unwrap();
        assert_eq!(t, tth(2));
        assert_eq!(nick, "carol");
    }

    #[test]
    fn next_candidate_respects_slot_cap() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 10, "/tmp/a".into(), 0, "hub", "bob");
        assert!(q.next_candidate(defaults::DOWNLOAD_SLOTS as usize).is_none());
    }

    #[test]
    fn failed_source_is_skipped_in_favor_of_a_healthy_one() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 10, "/tmp/a".into(), 0, "hub", "bob");
        q.enqueue(tth(1), 10, "/tmp/a".into(), 0, "hub", "carol");
        q.failed(&tth(1), "hub", "bob", IntegrityKind::NoFile);
        let (_, _, nick) = q.next_candidate(0).unwrap();
        assert_eq!(nick, "carol");
    }

    #[test]
    fn hash_failure_parks_the_whole_item_at_err_priority() {
        let mut q = DownloadQueue::new();
        q.enqueue(tth(1), 10, "/tmp/a".into(), 0, "hub", "bob");
        q.enqueue(tth(1), 10, "/tmp/a".into(), 0, "hub", "carol");
        q.failed(&tth(1), "hub", "bob", IntegrityKind::Hash(3));
        assert_eq!(q.get(&tth(1)).unwrap().priority, Priority::Err);
        assert!(matches!(q.get(&tth(1)).unwrap().error, Some(IntegrityKind::Hash(3))));
        assert!(q.next_candidate(0).is_none());
    }

    #[test]
    fn enqueue_persisted_survives_a_reload() {
        let conn = sqlite_store::open_in_memory().unwrap();
        let qstore = store::QueueStore::new(&conn);
        let mut q = DownloadQueue::new();
        q.enqueue_persisted(&qstore, tth(1), 10, "/tmp/a".into(), 2, "hub", "bob").unwrap();

        let reloaded = DownloadQueue::load_from(&qstore).unwrap();
        let item = reloaded.get(&tth(1)).unwrap();
        assert_eq!(item.priority, Priority::Level(2));
        assert_eq!(item.users.len(), 1);
    }

    #[test]
    fn failed_persisted_parks_err_priority_across_a_reload() {
        let conn = sqlite_store::open_in_memory().unwrap();
        let qstore = store::QueueStore::new(&conn);
        let mut q = DownloadQueue::new();
        q.enqueue_persisted(&qstore, tth(1), 10, "/tmp/a".into(), 0, "hub", "bob").unwrap();
        q.failed_persisted(&qstore, &tth(1), "hub", "bob", IntegrityKind::Hash(1)).unwrap();

        let reloaded = DownloadQueue::load_from(&qstore).unwrap();
        assert_eq!(reloaded.get(&tth(1)).unwrap().priority, Priority::Err);
    }

    #[test]
    fn match_filelist_respects_exclusion_pattern() {
        let mut q = DownloadQueue::new();
        q.enqueue_filelist("hub".into(), "bob".into(), Some(r"\.nfo$".into()));
        let files = vec![
            ("share/a.mkv".to_string(), 100, tth(1)),
            ("share/b.nfo".to_string(), 1, tth(2)),
        ];
        let queued = q.match_filelist("hub", "bob", &files, &"/tmp/dl".into()).unwrap();
        assert_eq!(queued, 1);
        assert!(q.get(&tth(1)).is_some());
        assert!(q.get(&tth(2)).is_none());
    }
}
