use crate::error::StoreError;
use crate::store::MailStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct User {
    pub login: String,
    pub email: String,
    password: String,
}

impl User {
    pub fn check_password(&self, candidate: &str) -> bool {
        self.password == candidate
    }

    /// POP3 APOP needs the stored secret to verify the digest.
    pub fn password(&self) -> &str {
        &self.password
    }
}

/// The user directory. Creating a user provisions their INBOX in the
/// store. With `auth_disabled`, any credential is accepted and unknown
/// users are created on first use.
pub struct UserManager {
    store: Arc<MailStore>,
    auth_disabled: AtomicBool,
    users: RwLock<BTreeMap<String, Arc<User>>>,
}

impl UserManager {
    pub fn new(store: Arc<MailStore>, auth_disabled: bool) -> Self {
        Self {
            store,
            auth_disabled: AtomicBool::new(auth_disabled),
            users: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn auth_disabled(&self) -> bool {
        self.auth_disabled.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<MailStore> {
        &self.store
    }

    /// Create or update a user whose email equals their login.
    pub fn set_user(&self, login: &str, password: &str) -> Arc<User> {
        self.add_user(login, login, password)
    }

    /// Create or update a user. Replaces the password if the login is
    /// already known, matching the behavior tests rely on when they
    /// reconfigure credentials between scenarios.
    pub fn add_user(&self, email: &str, login: &str, password: &str) -> Arc<User> {
        let user = Arc::new(User {
            login: login.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        });
        self.users.write().insert(login.to_string(), user.clone());
        self.store.provision_user(login);
        user
    }

    pub fn get_user(&self, login: &str) -> Option<Arc<User>> {
        self.users.read().get(login).cloned()
    }

    pub fn get_user_by_email(&self, email: &str) -> Option<Arc<User>> {
        self.users
            .read()
            .values()
            .find(|user| user.email == email)
            .cloned()
    }

    pub fn list_users(&self) -> Vec<Arc<User>> {
        self.users.read().values().cloned().collect()
    }

    pub fn authenticate(&self, login: &str, password: &str) -> Result<Arc<User>, StoreError> {
        if let Some(user) = self.get_user(login) {
            if self.auth_disabled() || user.check_password(password) {
                return Ok(user);
            }
            return Err(StoreError::AuthFailed(login.to_string()));
        }
        if self.auth_disabled() {
            return Ok(self.set_user(login, password));
        }
        Err(StoreError::AuthFailed(login.to_string()))
    }

    /// Map an SMTP recipient address to a local user. Matches by
    /// email first, then by bare login; unknown addresses are
    /// provisioned when auth is disabled.
    pub fn resolve_recipient(&self, address: &str) -> Result<Arc<User>, StoreError> {
        if let Some(user) = self.get_user_by_email(address) {
            return Ok(user);
        }
        if let Some(user) = self.get_user(address) {
            return Ok(user);
        }
        if self.auth_disabled() {
            return Ok(self.set_user(address, address));
        }
        Err(StoreError::NoSuchUser(address.to_string()))
    }
}
