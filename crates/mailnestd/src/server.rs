use crate::config::{Protocol, ServerConfig};
use crate::lifecycle::Lifecycle;
use crate::listener::{bind_listener, ListenerHandle};
use crate::tls::make_self_signed_acceptor;
use anyhow::Context as _;
use mailnest_store::{DeliveredMessage, DeliveryPipeline, MailStore, UserManager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

/// Everything a session needs a handle on.
pub(crate) struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<MailStore>,
    pub users: Arc<UserManager>,
    pub delivery: Arc<DeliveryPipeline>,
    pub tls: Option<TlsAcceptor>,
}

/// The embeddable server: SMTP, IMAP and POP3 listeners over one
/// shared in-memory store. Tests construct one, `start()` it, drive
/// it over loopback sockets or the inspection API, and `stop()` it.
pub struct MailNest {
    ctx: Arc<ServerContext>,
    lifecycle: Arc<Lifecycle>,
    listeners: parking_lot::Mutex<Vec<ListenerHandle>>,
    started: AtomicBool,
}

impl MailNest {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let store = Arc::new(MailStore::new());
        let users = Arc::new(UserManager::new(store.clone(), config.auth_disabled));
        for user in &config.users {
            users.add_user(&user.email, &user.login, &user.password);
        }
        let delivery = Arc::new(DeliveryPipeline::new(store.clone(), users.clone()));

        // The acceptor also backs STARTTLS on the plaintext
        // listeners, so it is built unconditionally.
        let tls = make_self_signed_acceptor(&[config.mail_hostname.clone()])
            .context("construct TLS acceptor")?;

        Ok(Self {
            ctx: Arc::new(ServerContext {
                config: Arc::new(config),
                store,
                users,
                delivery,
                tls: Some(tls),
            }),
            lifecycle: Arc::new(Lifecycle::new()),
            listeners: parking_lot::Mutex::new(vec![]),
            started: AtomicBool::new(false),
        })
    }

    /// Bind every configured listener, failing if any bind fails or
    /// the whole set is not up within `startup.timeout`.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("server already started");
        }
        let timeout = Duration::from_millis(self.ctx.config.startup_timeout_ms);
        match tokio::time::timeout(timeout, self.bind_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.stop().await;
                return Err(err);
            }
            Err(_) => {
                self.stop().await;
                anyhow::bail!("listeners failed to bind within {timeout:?}");
            }
        }
        self.run_post_start_actions().context("post-start actions")?;
        Ok(())
    }

    async fn bind_all(&self) -> anyhow::Result<()> {
        let configs = self.ctx.config.listeners.clone();
        for config in &configs {
            let handle = bind_listener(self.ctx.clone(), &self.lifecycle, config).await?;
            self.listeners.lock().push(handle);
        }
        Ok(())
    }

    fn run_post_start_actions(&self) -> anyhow::Result<()> {
        let config = self.ctx.config.clone();
        for (login, folders) in &config.folders_create {
            self.create_folders(login, folders)?;
        }
        for (login, path) in &config.load_eml_files {
            self.load_eml_file(login, path)?;
        }
        for (login, dir) in &config.load_eml_dirs {
            self.load_eml_dir(login, dir)?;
        }
        Ok(())
    }

    /// Stop accepting, interrupt sessions, and wait for them to
    /// drain. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.lifecycle
            .shutdown(Duration::from_millis(self.ctx.config.shutdown_timeout_ms))
            .await;
        let handles: Vec<ListenerHandle> = std::mem::take(&mut *self.listeners.lock());
        for handle in handles {
            let _ = handle.task.await;
        }
    }

    /// The actual bound address of a protocol's listener; handy when
    /// a test configured port 0.
    pub fn listener_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .iter()
            .find(|handle| handle.protocol == protocol)
            .map(|handle| handle.addr)
    }

    pub fn store(&self) -> &Arc<MailStore> {
        &self.ctx.store
    }

    pub fn user_manager(&self) -> &Arc<UserManager> {
        &self.ctx.users
    }

    /// Create or update a user whose address equals their login.
    pub fn set_user(&self, login: &str, password: &str) {
        self.ctx.users.set_user(login, password);
    }

    pub fn set_user_with_email(&self, email: &str, login: &str, password: &str) {
        self.ctx.users.add_user(email, login, password);
    }

    /// Block until `count` more messages have been delivered, or the
    /// timeout expires.
    pub async fn wait_for_incoming_email(&self, timeout: Duration, count: usize) -> bool {
        self.ctx.delivery.wait_for_incoming(timeout, count).await
    }

    pub fn received_messages(&self) -> Vec<DeliveredMessage> {
        self.ctx.delivery.received_messages()
    }

    pub fn received_messages_for_domain(&self, domain: &str) -> Vec<DeliveredMessage> {
        self.ctx.delivery.received_messages_for_domain(domain)
    }

    pub fn create_folders(&self, login: &str, folders: &[String]) -> anyhow::Result<()> {
        self.require_user(login)?;
        for folder in folders {
            self.ctx
                .store
                .create_mailbox(login, folder)
                .with_context(|| format!("create folder {folder} for {login}"))?;
        }
        Ok(())
    }

    /// Load one raw RFC 822 file into a user's INBOX.
    pub fn load_eml_file(&self, login: &str, path: &Path) -> anyhow::Result<()> {
        let user = self.require_user(login)?;
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let inbox = self.ctx.store.inbox(&user)?;
        inbox.append(&raw, &[], None);
        Ok(())
    }

    /// Load every regular file in a directory, in name order.
    pub fn load_eml_dir(&self, login: &str, dir: &Path) -> anyhow::Result<()> {
        let mut paths = vec![];
        for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        for path in paths {
            self.load_eml_file(login, &path)?;
        }
        Ok(())
    }

    fn require_user(&self, login: &str) -> anyhow::Result<String> {
        if let Some(user) = self.ctx.users.get_user(login) {
            return Ok(user.login.clone());
        }
        if self.ctx.users.auth_disabled() {
            return Ok(self.ctx.users.set_user(login, login).login.clone());
        }
        anyhow::bail!("no such user {login}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn eml_loading_into_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.eml");
        std::fs::write(&path, b"Subject: loaded\r\n\r\nbody\r\n").unwrap();

        let server = MailNest::new(ServerConfig::default()).unwrap();
        server.set_user("fred", "pw");
        server.load_eml_file("fred", &path).unwrap();
        server.load_eml_dir("fred", dir.path()).unwrap();

        let inbox = server.store().inbox("fred").unwrap();
        assert_eq!(inbox.message_count(), 2);
        assert_eq!(server.received_messages().len(), 2);
        assert!(server.load_eml_file("nobody", &path).is_err());
    }

    #[test]
    fn folder_creation_requires_a_user() {
        let server = MailNest::new(ServerConfig::default()).unwrap();
        server.set_user("fred", "pw");
        server
            .create_folders("fred", &["work".to_string(), "work/done".to_string()])
            .unwrap();
        assert!(server.store().get_folder("fred", "work/done").is_ok());
        assert!(server
            .create_folders("ghost", &["work".to_string()])
            .is_err());
    }
}
