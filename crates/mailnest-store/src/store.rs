use crate::error::StoreError;
use crate::folder::MailFolder;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const HIERARCHY_DELIMITER: char = '/';

/// One row of a LIST/LSUB reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub path: String,
    pub noselect: bool,
    pub has_children: bool,
    pub subscribed: bool,
}

/// STATUS data for a folder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FolderStatus {
    pub messages: usize,
    pub recent: usize,
    pub unseen: usize,
    pub uid_next: u32,
    pub uid_validity: u32,
}

struct Directory {
    // login -> path -> folder; BTreeMap so listings come out sorted.
    users: HashMap<String, BTreeMap<String, Arc<MailFolder>>>,
    next_uid_validity: u32,
}

/// The in-memory mailbox store. A global read-write lock guards the
/// folder directory; message-level state lives behind each folder's
/// own lock.
pub struct MailStore {
    inner: RwLock<Directory>,
}

impl Default for MailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Directory {
                users: HashMap::new(),
                next_uid_validity: 1,
            }),
        }
    }

    /// Validate a mailbox path and canonicalize the INBOX prefix.
    /// The delimiter may not open or close a name and components may
    /// not be empty.
    pub fn normalize_path(path: &str) -> Result<String, StoreError> {
        if path.is_empty()
            || path.starts_with(HIERARCHY_DELIMITER)
            || path.ends_with(HIERARCHY_DELIMITER)
        {
            return Err(StoreError::Forbidden(format!(
                "invalid mailbox name {path:?}"
            )));
        }
        let mut components = vec![];
        for (idx, component) in path.split(HIERARCHY_DELIMITER).enumerate() {
            if component.is_empty() {
                return Err(StoreError::Forbidden(format!(
                    "invalid mailbox name {path:?}"
                )));
            }
            if idx == 0 && component.eq_ignore_ascii_case("INBOX") {
                components.push("INBOX");
            } else {
                components.push(component);
            }
        }
        Ok(components.join("/"))
    }

    /// Make sure `login` has a user entry and an INBOX.
    pub fn provision_user(&self, login: &str) {
        let mut dir = self.inner.write();
        let validity = dir.next_uid_validity;
        let folders = dir.users.entry(login.to_string()).or_default();
        if !folders.contains_key("INBOX") {
            folders.insert("INBOX".to_string(), MailFolder::new(login, "INBOX", validity));
            dir.next_uid_validity += 1;
        }
    }

    pub fn create_mailbox(&self, login: &str, path: &str) -> Result<Arc<MailFolder>, StoreError> {
        let path = Self::normalize_path(path)?;
        if path == "INBOX" {
            return Err(StoreError::Forbidden("INBOX is reserved".to_string()));
        }
        let mut dir = self.inner.write();
        let mut validity = dir.next_uid_validity;
        let folders = dir
            .users
            .get_mut(login)
            .ok_or_else(|| StoreError::NoSuchUser(login.to_string()))?;
        if folders.contains_key(&path) {
            return Err(StoreError::AlreadyExists(path));
        }

        // Create any missing intermediate parents first.
        let components: Vec<&str> = path.split(HIERARCHY_DELIMITER).collect();
        let mut prefix = String::new();
        let mut created = None;
        for component in components {
            if !prefix.is_empty() {
                prefix.push(HIERARCHY_DELIMITER);
            }
            prefix.push_str(component);
            if !folders.contains_key(&prefix) {
                let folder = MailFolder::new(login, &prefix, validity);
                validity += 1;
                folders.insert(prefix.clone(), folder.clone());
                created = Some(folder);
            }
        }
        dir.next_uid_validity = validity;
        created.ok_or_else(|| StoreError::Internal(format!("create of {path} created nothing")))
    }

    pub fn get_folder(&self, login: &str, path: &str) -> Result<Arc<MailFolder>, StoreError> {
        let path = Self::normalize_path(path)?;
        let dir = self.inner.read();
        dir.users
            .get(login)
            .ok_or_else(|| StoreError::NoSuchUser(login.to_string()))?
            .get(&path)
            .cloned()
            .ok_or(StoreError::NoSuchMailbox(path))
    }

    pub fn inbox(&self, login: &str) -> Result<Arc<MailFolder>, StoreError> {
        self.get_folder(login, "INBOX")
    }

    pub fn delete_mailbox(&self, login: &str, path: &str) -> Result<(), StoreError> {
        let path = Self::normalize_path(path)?;
        if path == "INBOX" {
            return Err(StoreError::Forbidden("INBOX cannot be deleted".to_string()));
        }
        let mut dir = self.inner.write();
        let folders = dir
            .users
            .get_mut(login)
            .ok_or_else(|| StoreError::NoSuchUser(login.to_string()))?;
        let folder = folders
            .get(&path)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchMailbox(path.clone()))?;

        let child_prefix = format!("{path}{HIERARCHY_DELIMITER}");
        let has_children = folders.keys().any(|key| key.starts_with(&child_prefix));
        if has_children && folder.message_count() > 0 {
            // Keep the name for its inferiors; it can no longer be
            // selected and holds no messages.
            folder.drain_messages();
            folder.set_noselect(true);
        } else {
            if folder.is_noselect() && has_children {
                return Err(StoreError::Forbidden(format!(
                    "{path} has inferior mailboxes"
                )));
            }
            folders.remove(&path);
        }
        Ok(())
    }

    pub fn rename_mailbox(&self, login: &str, from: &str, to: &str) -> Result<(), StoreError> {
        let from = Self::normalize_path(from)?;
        let to = Self::normalize_path(to)?;
        if to == "INBOX" {
            return Err(StoreError::Forbidden("INBOX is reserved".to_string()));
        }
        let mut dir = self.inner.write();
        let mut validity = dir.next_uid_validity;
        let folders = dir
            .users
            .get_mut(login)
            .ok_or_else(|| StoreError::NoSuchUser(login.to_string()))?;
        if folders.contains_key(&to) {
            return Err(StoreError::AlreadyExists(to));
        }
        if !folders.contains_key(&from) {
            return Err(StoreError::NoSuchMailbox(from));
        }

        // Create the superior hierarchy of the destination as needed.
        if let Some((parents, _leaf)) = to.rsplit_once(HIERARCHY_DELIMITER) {
            let mut prefix = String::new();
            for component in parents.split(HIERARCHY_DELIMITER) {
                if !prefix.is_empty() {
                    prefix.push(HIERARCHY_DELIMITER);
                }
                prefix.push_str(component);
                if !folders.contains_key(&prefix) {
                    folders.insert(prefix.clone(), MailFolder::new(login, &prefix, validity));
                    validity += 1;
                }
            }
        }

        if from == "INBOX" {
            // Renaming INBOX moves its messages into a fresh folder
            // and leaves an empty INBOX behind.
            let target = MailFolder::new(login, &to, validity);
            validity += 1;
            let inbox = folders.get("INBOX").cloned().ok_or_else(|| {
                StoreError::Internal("INBOX disappeared during rename".to_string())
            })?;
            for message in inbox.drain_messages() {
                target.adopt_message(&message, message.is_set(&rfc3501::Flag::Recent));
            }
            folders.insert(to, target);
        } else {
            // Move the folder and its whole subtree; UIDVALIDITY and
            // message state ride along untouched.
            let child_prefix = format!("{from}{HIERARCHY_DELIMITER}");
            let moved: Vec<String> = folders
                .keys()
                .filter(|key| **key == from || key.starts_with(&child_prefix))
                .cloned()
                .collect();
            for old_path in moved {
                let folder = folders.remove(&old_path).ok_or_else(|| {
                    StoreError::Internal(format!("{old_path} disappeared during rename"))
                })?;
                let new_path = format!("{to}{}", &old_path[from.len()..]);
                folder.set_path(new_path.clone());
                folders.insert(new_path, folder);
            }
        }
        dir.next_uid_validity = validity;
        Ok(())
    }

    pub fn list(&self, login: &str, reference: &str, pattern: &str) -> Vec<ListEntry> {
        self.list_filtered(login, reference, pattern, false)
    }

    pub fn list_subscribed(&self, login: &str, reference: &str, pattern: &str) -> Vec<ListEntry> {
        self.list_filtered(login, reference, pattern, true)
    }

    fn list_filtered(
        &self,
        login: &str,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> Vec<ListEntry> {
        let mut combined = format!("{reference}{pattern}");
        // The INBOX prefix of a wildcard-free head component matches
        // case-insensitively.
        let head_len = combined.find(HIERARCHY_DELIMITER).unwrap_or(combined.len());
        if combined[..head_len].eq_ignore_ascii_case("INBOX") {
            combined.replace_range(..head_len, "INBOX");
        }

        let dir = self.inner.read();
        let Some(folders) = dir.users.get(login) else {
            return vec![];
        };
        folders
            .iter()
            .filter(|(path, folder)| {
                pattern_matches(&combined, path) && (!subscribed_only || folder.is_subscribed())
            })
            .map(|(path, folder)| {
                let child_prefix = format!("{path}{HIERARCHY_DELIMITER}");
                ListEntry {
                    path: path.clone(),
                    noselect: folder.is_noselect(),
                    has_children: folders.keys().any(|key| key.starts_with(&child_prefix)),
                    subscribed: folder.is_subscribed(),
                }
            })
            .collect()
    }

    pub fn set_subscribed(&self, login: &str, path: &str, value: bool) -> Result<(), StoreError> {
        self.get_folder(login, path)?.set_subscribed(value);
        Ok(())
    }

    pub fn status(&self, login: &str, path: &str) -> Result<FolderStatus, StoreError> {
        let folder = self.get_folder(login, path)?;
        Ok(FolderStatus {
            messages: folder.message_count(),
            recent: folder.recent_count(),
            unseen: folder.unseen_count(),
            uid_next: folder.uid_next(),
            uid_validity: folder.uid_validity(),
        })
    }

    /// All INBOXes in login order; the delivery log view is built
    /// from this.
    pub fn all_inboxes(&self) -> Vec<(String, Arc<MailFolder>)> {
        let dir = self.inner.read();
        let mut logins: Vec<&String> = dir.users.keys().collect();
        logins.sort();
        logins
            .into_iter()
            .filter_map(|login| {
                dir.users
                    .get(login)
                    .and_then(|folders| folders.get("INBOX"))
                    .map(|folder| (login.clone(), folder.clone()))
            })
            .collect()
    }
}

/// IMAP LIST glob: `*` matches anything, `%` matches anything except
/// the hierarchy delimiter.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => (0..=n.len()).any(|i| matches(&p[1..], &n[i..])),
            Some(b'%') => {
                let mut i = 0;
                loop {
                    if matches(&p[1..], &n[i..]) {
                        return true;
                    }
                    if i >= n.len() || n[i] == HIERARCHY_DELIMITER as u8 {
                        return false;
                    }
                    i += 1;
                }
            }
            Some(c) => n.first() == Some(c) && matches(&p[1..], &n[1..]),
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}
