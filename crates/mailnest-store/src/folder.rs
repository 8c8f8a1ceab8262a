use crate::message::{canonicalize_crlf, StoredMessage};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rfc3501::{Flag, SequenceSet, StoreAction};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Folder change notifications. Events are published to the folder's
/// broadcast channel while the folder lock is held, so every
/// subscriber observes the same ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum FolderEvent {
    /// A message was appended; carries its UID.
    Added(u32),
    /// Flags changed on a message.
    FlagsUpdated {
        uid: u32,
        seq: u32,
        flags: Vec<Flag>,
    },
    /// A message was removed; carries the sequence number it had at
    /// removal time.
    Expunged(u32),
}

/// Capacity of each folder's event channel. A subscriber that lags
/// this far behind loses events and must resynchronize from the
/// folder state, which IMAP sessions do at every command boundary.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct FolderInner {
    uid_next: u32,
    messages: Vec<StoredMessage>,
}

/// A single mailbox folder. Owned by the store; sessions hold `Arc`s
/// and re-resolve by path where identity matters.
pub struct MailFolder {
    owner: String,
    path: Mutex<String>,
    uid_validity: u32,
    subscribed: AtomicBool,
    noselect: AtomicBool,
    inner: RwLock<FolderInner>,
    events: broadcast::Sender<FolderEvent>,
}

impl MailFolder {
    pub fn new(owner: &str, path: &str, uid_validity: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            owner: owner.to_string(),
            path: Mutex::new(path.to_string()),
            uid_validity,
            subscribed: AtomicBool::new(false),
            noselect: AtomicBool::new(false),
            inner: RwLock::new(FolderInner {
                uid_next: 1,
                messages: vec![],
            }),
            events,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> String {
        self.path.lock().clone()
    }

    pub(crate) fn set_path(&self, path: String) {
        *self.path.lock() = path;
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn uid_next(&self) -> u32 {
        self.inner.read().uid_next
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    pub fn set_subscribed(&self, value: bool) {
        self.subscribed.store(value, Ordering::Relaxed);
    }

    pub fn is_noselect(&self) -> bool {
        self.noselect.load(Ordering::Relaxed)
    }

    pub(crate) fn set_noselect(&self, value: bool) {
        self.noselect.store(value, Ordering::Relaxed);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FolderEvent> {
        self.events.subscribe()
    }

    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn recent_count(&self) -> usize {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| m.is_set(&Flag::Recent))
            .count()
    }

    pub fn unseen_count(&self) -> usize {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| !m.is_set(&Flag::Seen))
            .count()
    }

    pub fn first_unseen_seq(&self) -> Option<u32> {
        self.inner
            .read()
            .messages
            .iter()
            .position(|m| !m.is_set(&Flag::Seen))
            .map(|idx| idx as u32 + 1)
    }

    /// Append a message. The raw bytes are canonicalized to CRLF, the
    /// next UID is assigned, `\Recent` is added on top of any caller
    /// flags, and listeners are notified. Returns the new UID.
    pub fn append(
        &self,
        raw: &[u8],
        extra_flags: &[Flag],
        internal_date: Option<DateTime<Utc>>,
    ) -> u32 {
        let canonical: Arc<[u8]> = canonicalize_crlf(raw).into();
        self.append_canonical(canonical, extra_flags, internal_date, true)
    }

    fn append_canonical(
        &self,
        raw: Arc<[u8]>,
        extra_flags: &[Flag],
        internal_date: Option<DateTime<Utc>>,
        recent: bool,
    ) -> u32 {
        let mut inner = self.inner.write();
        let uid = inner.uid_next;
        inner.uid_next += 1;
        let mut flags: BTreeSet<Flag> = extra_flags.iter().cloned().collect();
        if recent {
            flags.insert(Flag::Recent);
        }
        let when = internal_date.unwrap_or_else(Utc::now);
        inner
            .messages
            .push(StoredMessage::new(uid, raw, flags, when));
        let _ = self.events.send(FolderEvent::Added(uid));
        uid
    }

    /// Run `f` against the current message list under the shared lock.
    pub fn with_messages<R>(&self, f: impl FnOnce(&[StoredMessage]) -> R) -> R {
        f(&self.inner.read().messages)
    }

    /// Resolve a sequence set against the folder, returning
    /// `(sequence_number, message)` pairs in mailbox order.
    pub fn select_matching(&self, set: &SequenceSet, by_uid: bool) -> Vec<(u32, StoredMessage)> {
        let inner = self.inner.read();
        let total = inner.messages.len() as u32;
        let max_uid = inner.messages.last().map(|m| m.uid).unwrap_or(0);
        inner
            .messages
            .iter()
            .enumerate()
            .filter(|(idx, m)| {
                if by_uid {
                    set.contains(m.uid, max_uid)
                } else {
                    set.contains(*idx as u32 + 1, total)
                }
            })
            .map(|(idx, m)| (idx as u32 + 1, m.clone()))
            .collect()
    }

    pub fn message_by_uid(&self, uid: u32) -> Option<StoredMessage> {
        self.inner
            .read()
            .messages
            .iter()
            .find(|m| m.uid == uid)
            .cloned()
    }

    /// Apply a STORE action. `\Recent` is server-managed: it survives
    /// a replace and cannot be added or removed by the client.
    /// Returns `(seq, new_flags)`, or None if the UID is gone.
    pub fn update_flags(
        &self,
        uid: u32,
        action: StoreAction,
        flags: &[Flag],
    ) -> Option<(u32, Vec<Flag>)> {
        let mut inner = self.inner.write();
        let idx = inner.messages.iter().position(|m| m.uid == uid)?;
        let message = &mut inner.messages[idx];
        let requested: BTreeSet<Flag> = flags
            .iter()
            .filter(|f| **f != Flag::Recent)
            .cloned()
            .collect();
        match action {
            StoreAction::Replace => {
                let recent = message.is_set(&Flag::Recent);
                message.flags = requested;
                if recent {
                    message.flags.insert(Flag::Recent);
                }
            }
            StoreAction::Add => {
                message.flags.extend(requested);
            }
            StoreAction::Remove => {
                for flag in &requested {
                    message.flags.remove(flag);
                }
            }
        }
        let seq = idx as u32 + 1;
        let new_flags: Vec<Flag> = message.flags.iter().cloned().collect();
        let _ = self.events.send(FolderEvent::FlagsUpdated {
            uid,
            seq,
            flags: new_flags.clone(),
        });
        Some((seq, new_flags))
    }

    /// Set `\Seen` on behalf of a non-peek body fetch. Returns the new
    /// flag list only if the flag was actually added.
    pub fn mark_seen(&self, uid: u32) -> Option<(u32, Vec<Flag>)> {
        let mut inner = self.inner.write();
        let idx = inner.messages.iter().position(|m| m.uid == uid)?;
        let message = &mut inner.messages[idx];
        if !message.flags.insert(Flag::Seen) {
            return None;
        }
        let seq = idx as u32 + 1;
        let new_flags: Vec<Flag> = message.flags.iter().cloned().collect();
        let _ = self.events.send(FolderEvent::FlagsUpdated {
            uid,
            seq,
            flags: new_flags.clone(),
        });
        Some((seq, new_flags))
    }

    /// Clear `\Recent` everywhere; done by a read-write SELECT after
    /// it has reported the recent count.
    pub fn clear_recent(&self) {
        let mut inner = self.inner.write();
        for message in &mut inner.messages {
            message.flags.remove(&Flag::Recent);
        }
    }

    /// Remove all `\Deleted` messages, optionally restricted to a UID
    /// set (UID EXPUNGE). Returns the removed sequence numbers in
    /// descending order, which is also the order events fire in.
    pub fn expunge(&self, uid_filter: Option<&SequenceSet>) -> Vec<u32> {
        let mut inner = self.inner.write();
        let max_uid = inner.messages.last().map(|m| m.uid).unwrap_or(0);
        let mut removed = vec![];
        for idx in (0..inner.messages.len()).rev() {
            let message = &inner.messages[idx];
            let selected = message.is_set(&Flag::Deleted)
                && uid_filter.map_or(true, |set| set.contains(message.uid, max_uid));
            if selected {
                inner.messages.remove(idx);
                let seq = idx as u32 + 1;
                let _ = self.events.send(FolderEvent::Expunged(seq));
                removed.push(seq);
            }
        }
        removed
    }

    /// Remove one message by UID regardless of flags; POP3's UPDATE
    /// phase uses this. Returns false if the UID is no longer present.
    pub fn remove_by_uid(&self, uid: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(idx) = inner.messages.iter().position(|m| m.uid == uid) else {
            return false;
        };
        inner.messages.remove(idx);
        let _ = self.events.send(FolderEvent::Expunged(idx as u32 + 1));
        true
    }

    /// Drain all messages, e.g. when INBOX is renamed. Events fire in
    /// descending sequence order as for expunge.
    pub(crate) fn drain_messages(&self) -> Vec<StoredMessage> {
        let mut inner = self.inner.write();
        let drained: Vec<StoredMessage> = inner.messages.drain(..).collect();
        for seq in (1..=drained.len() as u32).rev() {
            let _ = self.events.send(FolderEvent::Expunged(seq));
        }
        drained
    }

    pub(crate) fn adopt_message(&self, message: &StoredMessage, recent: bool) -> u32 {
        let flags: Vec<Flag> = message
            .flags
            .iter()
            .filter(|f| **f != Flag::Recent)
            .cloned()
            .collect();
        self.append_canonical(
            message.raw_shared(),
            &flags,
            Some(message.internal_date),
            recent,
        )
    }
}

/// Copy the matching messages into `dest`, preserving flags and
/// internal date and adding `\Recent` on the copies. Returns the
/// `(source_uid, destination_uid)` pairs for UIDPLUS COPYUID.
pub fn copy_messages(
    source: &MailFolder,
    set: &SequenceSet,
    by_uid: bool,
    dest: &MailFolder,
) -> Vec<(u32, u32)> {
    // Collect outside the destination lock so that copying a folder
    // onto itself cannot deadlock.
    let picked = source.select_matching(set, by_uid);
    picked
        .into_iter()
        .map(|(_, message)| {
            let new_uid = dest.adopt_message(&message, true);
            (message.uid, new_uid)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn folder() -> Arc<MailFolder> {
        MailFolder::new("fred", "INBOX", 42)
    }

    #[test]
    fn uids_are_monotonic_and_stable_across_expunge() {
        let folder = folder();
        let first = folder.append(b"one", &[], None);
        let second = folder.append(b"two", &[], None);
        let third = folder.append(b"three", &[], None);
        assert_equal!((first, second, third), (1, 2, 3));
        assert_equal!(folder.uid_next(), 4);

        folder.update_flags(first, StoreAction::Add, &[Flag::Deleted]);
        folder.update_flags(third, StoreAction::Add, &[Flag::Deleted]);
        let removed = folder.expunge(None);
        assert_equal!(removed, vec![3, 1]);

        // The survivor keeps its UID but renumbers to sequence 1.
        let survivors = folder.select_matching(&SequenceSet::parse("1:*").unwrap(), false);
        assert_equal!(survivors.len(), 1);
        assert_equal!(survivors[0].0, 1);
        assert_equal!(survivors[0].1.uid, second);

        // uid_next never goes backwards.
        let fourth = folder.append(b"four", &[], None);
        assert_equal!(fourth, 4);
    }

    #[test]
    fn append_sets_recent_and_clear_recent_drops_it() {
        let folder = folder();
        let uid = folder.append(b"hello", &[Flag::Seen], None);
        let message = folder.message_by_uid(uid).unwrap();
        assert_equal!(message.is_set(&Flag::Recent), true);
        assert_equal!(message.is_set(&Flag::Seen), true);
        assert_equal!(folder.recent_count(), 1);

        folder.clear_recent();
        assert_equal!(folder.recent_count(), 0);
        assert_equal!(folder.message_by_uid(uid).unwrap().is_set(&Flag::Seen), true);
    }

    #[test]
    fn replace_preserves_recent() {
        let folder = folder();
        let uid = folder.append(b"hello", &[], None);
        let (_, flags) = folder
            .update_flags(uid, StoreAction::Replace, &[Flag::Flagged])
            .unwrap();
        assert_equal!(flags.contains(&Flag::Recent), true);
        assert_equal!(flags.contains(&Flag::Flagged), true);

        // Clients cannot inject \Recent either.
        folder.clear_recent();
        let (_, flags) = folder
            .update_flags(uid, StoreAction::Add, &[Flag::Recent, Flag::Seen])
            .unwrap();
        assert_equal!(flags.contains(&Flag::Recent), false);
        assert_equal!(flags.contains(&Flag::Seen), true);
    }

    #[test]
    fn copy_preserves_bytes_and_maps_uids() {
        let src = folder();
        let dst = MailFolder::new("fred", "Archive", 43);
        src.append(b"alpha\r\n", &[], None);
        src.append(b"beta\r\n", &[Flag::Seen], None);

        let mapping = copy_messages(&src, &SequenceSet::parse("1:2").unwrap(), false, &dst);
        assert_equal!(mapping, vec![(1, 1), (2, 2)]);

        // Expunging the source leaves the destination bytes intact.
        src.update_flags(1, StoreAction::Add, &[Flag::Deleted]);
        src.update_flags(2, StoreAction::Add, &[Flag::Deleted]);
        src.expunge(None);

        assert_equal!(dst.message_by_uid(1).unwrap().raw(), b"alpha\r\n" as &[u8]);
        assert_equal!(dst.message_by_uid(2).unwrap().raw(), b"beta\r\n" as &[u8]);
        assert_equal!(dst.message_by_uid(2).unwrap().is_set(&Flag::Seen), true);
        assert_equal!(dst.message_by_uid(2).unwrap().is_set(&Flag::Recent), true);
    }

    #[test]
    fn events_fire_in_order() {
        let folder = folder();
        let mut events = folder.subscribe_events();
        let uid = folder.append(b"x", &[], None);
        folder.update_flags(uid, StoreAction::Add, &[Flag::Deleted]);
        folder.expunge(None);

        assert_equal!(events.try_recv().unwrap(), FolderEvent::Added(1));
        assert!(matches!(
            events.try_recv().unwrap(),
            FolderEvent::FlagsUpdated { uid: 1, seq: 1, .. }
        ));
        assert_equal!(events.try_recv().unwrap(), FolderEvent::Expunged(1));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn uid_expunge_only_touches_the_given_set() {
        let folder = folder();
        for body in [b"a" as &[u8], b"b", b"c"] {
            let uid = folder.append(body, &[], None);
            folder.update_flags(uid, StoreAction::Add, &[Flag::Deleted]);
        }
        let removed = folder.expunge(Some(&SequenceSet::parse("2").unwrap()));
        assert_equal!(removed, vec![2]);
        assert_equal!(folder.message_count(), 2);
    }
}
