use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smtp,
    Imap,
    Pop3,
    Smtps,
    Imaps,
    Pop3s,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Smtp,
        Protocol::Imap,
        Protocol::Pop3,
        Protocol::Smtps,
        Protocol::Imaps,
        Protocol::Pop3s,
    ];

    /// The three plaintext protocols, what `setup.all` starts.
    pub const DEFAULT_SET: [Protocol; 3] = [Protocol::Smtp, Protocol::Imap, Protocol::Pop3];

    pub fn name(self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Imap => "imap",
            Self::Pop3 => "pop3",
            Self::Smtps => "smtps",
            Self::Imaps => "imaps",
            Self::Pop3s => "pop3s",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|proto| proto.name().eq_ignore_ascii_case(text))
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Smtp => 25,
            Self::Imap => 143,
            Self::Pop3 => 110,
            Self::Smtps => 465,
            Self::Imaps => 993,
            Self::Pop3s => 995,
        }
    }

    /// Offset applied by the `setup.test.*` properties so tests do
    /// not need privileged ports.
    pub const TEST_PORT_OFFSET: u16 = 3000;

    pub fn is_tls(self) -> bool {
        matches!(self, Self::Smtps | Self::Imaps | Self::Pop3s)
    }

    /// The wire protocol spoken once any implicit TLS is stripped.
    pub fn base(self) -> Self {
        match self {
            Self::Smtps => Self::Smtp,
            Self::Imaps => Self::Imap,
            Self::Pop3s => Self::Pop3,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub email: String,
    pub login: String,
    pub password: String,
}

/// Whether configured users log in with the local part of their
/// address or with the full address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    #[default]
    LocalPart,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
    pub users: Vec<UserConfig>,
    pub users_login: LoginMode,
    pub auth_disabled: bool,
    pub verbose: bool,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Per-connection read idle timeout outside IMAP IDLE.
    pub read_timeout_ms: u64,
    pub max_line_length: usize,
    pub max_message_size: Option<usize>,
    /// Host name used in protocol greetings.
    pub mail_hostname: String,
    pub folders_create: Vec<(String, Vec<String>)>,
    pub load_eml_files: Vec<(String, PathBuf)>,
    pub load_eml_dirs: Vec<(String, PathBuf)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![],
            users: vec![],
            users_login: LoginMode::default(),
            auth_disabled: false,
            verbose: false,
            startup_timeout_ms: 1000,
            shutdown_timeout_ms: 5000,
            read_timeout_ms: 5 * 60 * 1000,
            max_line_length: crate::codec::DEFAULT_MAX_LINE,
            max_message_size: None,
            mail_hostname: "localhost".to_string(),
            folders_create: vec![],
            load_eml_files: vec![],
            load_eml_dirs: vec![],
        }
    }
}

impl ServerConfig {
    /// Listeners for `protocols` on their standard ports.
    pub fn with_defaults(protocols: &[Protocol]) -> Self {
        let mut config = Self::default();
        for proto in protocols {
            config.add_protocol(*proto, false);
        }
        config
    }

    /// Listeners for `protocols` on standard port + 3000, the form
    /// nearly every test uses.
    pub fn with_test_defaults(protocols: &[Protocol]) -> Self {
        let mut config = Self::default();
        for proto in protocols {
            config.add_protocol(*proto, true);
        }
        config
    }

    pub fn add_protocol(&mut self, protocol: Protocol, test_ports: bool) {
        if self.listeners.iter().any(|l| l.protocol == protocol) {
            return;
        }
        let offset = if test_ports {
            Protocol::TEST_PORT_OFFSET
        } else {
            0
        };
        self.listeners.push(ListenerConfig {
            protocol,
            hostname: "127.0.0.1".to_string(),
            port: protocol.default_port() + offset,
        });
    }

    pub fn listener_for(&self, protocol: Protocol) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.protocol == protocol)
    }

    fn listener_for_mut(&mut self, protocol: Protocol) -> &mut ListenerConfig {
        let idx = match self.listeners.iter().position(|l| l.protocol == protocol) {
            Some(idx) => idx,
            None => {
                self.add_protocol(protocol, false);
                self.listeners.len() - 1
            }
        };
        &mut self.listeners[idx]
    }

    pub fn needs_tls(&self) -> bool {
        self.listeners.iter().any(|l| l.protocol.is_tls())
    }

    /// Build a config from flat `key=value` properties.
    pub fn from_properties<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> anyhow::Result<Self> {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply_property(key, value)?;
        }
        Ok(config)
    }

    pub fn apply_property(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "users" => {
                for entry in value.split(',').filter(|e| !e.is_empty()) {
                    let user = parse_user_entry(entry, self.users_login)?;
                    self.users.push(user);
                }
            }
            "users.login" => {
                self.users_login = match value {
                    "local_part" => LoginMode::LocalPart,
                    "email" => LoginMode::Email,
                    other => anyhow::bail!("invalid users.login value {other:?}"),
                };
                // Properties carry no ordering; remap anything that
                // was parsed before this key arrived.
                for user in &mut self.users {
                    user.login = match self.users_login {
                        LoginMode::Email => user.email.clone(),
                        LoginMode::LocalPart => local_part(&user.email).to_string(),
                    };
                }
            }
            "auth.disabled" => self.auth_disabled = parse_bool(value)?,
            "verbose" => self.verbose = parse_bool(value)?,
            "startup.timeout" => {
                self.startup_timeout_ms = value
                    .parse()
                    .with_context(|| format!("invalid startup.timeout {value:?}"))?
            }
            "hostname" => self.mail_hostname = value.to_string(),
            "smtp.max-message-size" => {
                self.max_message_size = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid smtp.max-message-size {value:?}"))?,
                )
            }
            "folders.create" => {
                let (user, folders) = split_user_value(key, value)?;
                self.folders_create.push((
                    user.to_string(),
                    folders
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(|f| f.to_string())
                        .collect(),
                ));
            }
            "load.eml.file" | "imap.load.eml.file" => {
                if key == "imap.load.eml.file" {
                    tracing::warn!(
                        "property imap.load.eml.file is deprecated, use load.eml.file"
                    );
                }
                let (user, path) = split_user_value(key, value)?;
                self.load_eml_files
                    .push((user.to_string(), PathBuf::from(path)));
            }
            "load.eml.dir" => {
                let (user, path) = split_user_value(key, value)?;
                self.load_eml_dirs
                    .push((user.to_string(), PathBuf::from(path)));
            }
            _ => {
                if let Some(rest) = key.strip_prefix("setup.") {
                    return self.apply_setup(rest);
                }
                if let Some((proto, attr)) = key.split_once('.') {
                    if let Some(protocol) = Protocol::parse(proto) {
                        match attr {
                            "hostname" => {
                                self.listener_for_mut(protocol).hostname = value.to_string();
                                return Ok(());
                            }
                            "port" => {
                                self.listener_for_mut(protocol).port = value
                                    .parse()
                                    .with_context(|| format!("invalid {key} {value:?}"))?;
                                return Ok(());
                            }
                            _ => {}
                        }
                    }
                }
                anyhow::bail!("unknown property {key}");
            }
        }
        Ok(())
    }

    fn apply_setup(&mut self, what: &str) -> anyhow::Result<()> {
        let (what, test_ports) = match what.strip_prefix("test.") {
            Some(rest) => (rest, true),
            None => (what, false),
        };
        if what == "all" {
            for proto in Protocol::DEFAULT_SET {
                self.add_protocol(proto, test_ports);
            }
            return Ok(());
        }
        let protocol = Protocol::parse(what)
            .with_context(|| format!("unknown protocol in setup property: {what}"))?;
        self.add_protocol(protocol, test_ports);
        Ok(())
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value {
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => anyhow::bail!("invalid boolean {other:?}"),
    }
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

fn split_user_value<'a>(key: &str, value: &'a str) -> anyhow::Result<(&'a str, &'a str)> {
    value
        .split_once(':')
        .with_context(|| format!("{key} expects user:value, got {value:?}"))
}

/// One `users` entry: `login:password[@domain]`.
fn parse_user_entry(entry: &str, mode: LoginMode) -> anyhow::Result<UserConfig> {
    let (login, rest) = entry
        .split_once(':')
        .with_context(|| format!("users entry {entry:?} is missing a password"))?;
    let (password, domain) = match rest.rsplit_once('@') {
        Some((password, domain)) => (password, Some(domain)),
        None => (rest, None),
    };
    let email = match domain {
        Some(domain) => format!("{login}@{domain}"),
        None => login.to_string(),
    };
    let login = match mode {
        LoginMode::LocalPart => login.to_string(),
        LoginMode::Email => email.clone(),
    };
    Ok(UserConfig {
        email,
        login,
        password: password.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn setup_properties() {
        let config = ServerConfig::from_properties([("setup.test.all", "")]).unwrap();
        let ports: Vec<(Protocol, u16)> = config
            .listeners
            .iter()
            .map(|l| (l.protocol, l.port))
            .collect();
        assert_equal!(
            ports,
            vec![
                (Protocol::Smtp, 3025),
                (Protocol::Imap, 3143),
                (Protocol::Pop3, 3110)
            ]
        );

        let config = ServerConfig::from_properties([("setup.smtps", "")]).unwrap();
        assert_equal!(config.listeners[0].port, 465);
        assert!(config.needs_tls());
    }

    #[test]
    fn explicit_bind_overrides() {
        let config = ServerConfig::from_properties([
            ("setup.test.smtp", ""),
            ("smtp.port", "2525"),
            ("smtp.hostname", "0.0.0.0"),
        ])
        .unwrap();
        assert_equal!(config.listeners.len(), 1);
        assert_equal!(config.listeners[0].port, 2525);
        assert_equal!(config.listeners[0].hostname, "0.0.0.0");
    }

    #[test]
    fn users_property() {
        let config =
            ServerConfig::from_properties([("users", "fred:secret@example.com,bare:pw")]).unwrap();
        assert_equal!(
            config.users[0],
            UserConfig {
                email: "fred@example.com".to_string(),
                login: "fred".to_string(),
                password: "secret".to_string(),
            }
        );
        assert_equal!(config.users[1].email, "bare");

        // users.login=email applies even when it arrives after users.
        let config = ServerConfig::from_properties([
            ("users", "fred:secret@example.com"),
            ("users.login", "email"),
        ])
        .unwrap();
        assert_equal!(config.users[0].login, "fred@example.com");
    }

    #[test]
    fn deprecated_eml_property_is_accepted() {
        let config = ServerConfig::from_properties([
            ("load.eml.file", "fred:/tmp/a.eml"),
            ("imap.load.eml.file", "fred:/tmp/b.eml"),
        ])
        .unwrap();
        assert_equal!(config.load_eml_files.len(), 2);
    }

    #[test]
    fn unknown_property_is_rejected() {
        assert!(ServerConfig::from_properties([("no.such.key", "1")]).is_err());
        assert!(ServerConfig::from_properties([("startup.timeout", "soon")]).is_err());
    }
}
