//! Black-box protocol tests: start a server on loopback, drive it
//! with raw protocol dialogue, and assert on what comes back.
use mailnestd::{ListenerConfig, MailNest, Protocol, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.expect("write");
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.expect("read line");
        assert!(n > 0, "unexpected EOF");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Read untagged responses until the tagged completion for `tag`,
    /// returning everything including the tagged line.
    async fn until_tagged(&mut self, tag: &str) -> Vec<String> {
        let mut lines = vec![];
        loop {
            let line = self.line().await;
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn read_exact(&mut self, count: usize) -> Vec<u8> {
        let mut buf = vec![0u8; count];
        self.stream.read_exact(&mut buf).await.expect("read bytes");
        buf
    }

    /// Read SMTP replies until the final line of the reply (the one
    /// with a space after the code).
    async fn smtp_reply(&mut self) -> String {
        loop {
            let line = self.line().await;
            if line.len() >= 4 && &line[3..4] == " " {
                return line;
            }
        }
    }
}

fn config_on_free_ports(protocols: &[Protocol]) -> ServerConfig {
    let mut config = ServerConfig::default();
    for protocol in protocols {
        config.listeners.push(ListenerConfig {
            protocol: *protocol,
            hostname: "127.0.0.1".to_string(),
            port: 0,
        });
    }
    config
}

async fn start(config: ServerConfig) -> MailNest {
    let server = MailNest::new(config).expect("construct");
    server.start().await.expect("start");
    server
}

async fn smtp_send(addr: SocketAddr, from: &str, to: &str, subject: &str, body: &str) {
    let mut client = Client::connect(addr).await;
    assert!(client.smtp_reply().await.starts_with("220 "));
    client.send("EHLO tester").await;
    assert!(client.smtp_reply().await.starts_with("250 "));
    client.send(&format!("MAIL FROM:<{from}>")).await;
    assert!(client.smtp_reply().await.starts_with("250 "));
    client.send(&format!("RCPT TO:<{to}>")).await;
    assert!(client.smtp_reply().await.starts_with("250 "));
    client.send("DATA").await;
    assert!(client.smtp_reply().await.starts_with("354 "));
    client.send(&format!("From: {from}")).await;
    client.send(&format!("To: {to}")).await;
    client.send(&format!("Subject: {subject}")).await;
    client.send("").await;
    client.send(body).await;
    client.send(".").await;
    assert!(client.smtp_reply().await.starts_with("250 "));
    client.send("QUIT").await;
    assert!(client.smtp_reply().await.starts_with("221 "));
}

async fn imap_login(addr: SocketAddr, login: &str, password: &str) -> Client {
    let mut client = Client::connect(addr).await;
    assert!(client.line().await.starts_with("* OK"));
    client.send(&format!("a0 LOGIN {login} {password}")).await;
    let done = client.until_tagged("a0").await;
    assert!(
        done.last().expect("tagged reply").starts_with("a0 OK"),
        "login failed: {done:?}"
    );
    client
}

/// SMTP on 3025, IMAP on 3143: send one message and
/// read it back byte-for-byte over IMAP.
#[tokio::test]
async fn smtp_delivery_read_back_over_imap() {
    let config = ServerConfig::with_test_defaults(&[Protocol::Smtp, Protocol::Imap]);
    let server = start(config).await;
    server.set_user("test@localhost", "test");

    let smtp_addr = server.listener_addr(Protocol::Smtp).expect("smtp addr");
    assert_eq!(smtp_addr.port(), 3025);
    let imap_addr = server.listener_addr(Protocol::Imap).expect("imap addr");
    assert_eq!(imap_addr.port(), 3143);

    smtp_send(smtp_addr, "a@b", "test@localhost", "hi", "hello").await;
    assert!(
        server
            .wait_for_incoming_email(Duration::from_secs(2), 1)
            .await
    );

    let mut client = imap_login(imap_addr, "test@localhost", "test").await;
    client.send("a1 SELECT INBOX").await;
    let select = client.until_tagged("a1").await;
    assert!(select.contains(&"* 1 EXISTS".to_string()), "{select:?}");
    assert!(select.last().expect("tagged").starts_with("a1 OK [READ-WRITE]"));

    client.send("a2 FETCH 1 RFC822").await;
    let header = client.line().await;
    let open = header.rfind('{').expect("literal");
    let size: usize = header[open + 1..header.len() - 1].parse().expect("size");
    let raw = client.read_exact(size).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("Subject: hi\r\n"), "{text}");
    assert!(text.contains("hello"), "{text}");
    client.until_tagged("a2").await;

    client.send("a3 LOGOUT").await;
    client.until_tagged("a3").await;
    server.stop().await;
}

/// Append two, expunge the first; the survivor keeps
/// its UID and renumbers to sequence 1.
#[tokio::test]
async fn expunge_keeps_survivor_uid() {
    let server = start(config_on_free_ports(&[Protocol::Imap])).await;
    server.set_user("fred", "secret");
    let addr = server.listener_addr(Protocol::Imap).expect("imap addr");

    let mut client = imap_login(addr, "fred", "secret").await;
    for (tag, body) in [("a1", "first"), ("a2", "second")] {
        let message = format!("Subject: {body}\r\n\r\n{body}\r\n");
        client
            .send(&format!("{tag} APPEND INBOX {{{}+}}", message.len()))
            .await;
        client.send_raw(message.as_bytes()).await;
        client.send_raw(b"\r\n").await;
        let done = client.until_tagged(tag).await;
        assert!(done.last().expect("tagged").contains("APPENDUID"), "{done:?}");
    }

    client.send("a3 SELECT INBOX").await;
    let select = client.until_tagged("a3").await;
    assert!(select.contains(&"* 2 EXISTS".to_string()), "{select:?}");

    client.send("a4 STORE 1 +FLAGS (\\Deleted)").await;
    client.until_tagged("a4").await;
    client.send("a5 EXPUNGE").await;
    let expunged = client.until_tagged("a5").await;
    assert!(expunged.contains(&"* 1 EXPUNGE".to_string()), "{expunged:?}");

    client.send("a6 FETCH 1 (UID)").await;
    let fetched = client.until_tagged("a6").await;
    assert!(
        fetched.contains(&"* 1 FETCH (UID 2)".to_string()),
        "{fetched:?}"
    );
    server.stop().await;
}

/// Two sessions have the same INBOX selected; an
/// SMTP delivery shows up as `* 1 EXISTS` in each session's next NOOP.
#[tokio::test]
async fn concurrent_sessions_observe_exists() {
    let server = start(config_on_free_ports(&[Protocol::Smtp, Protocol::Imap])).await;
    server.set_user("fred@localhost", "secret");
    let imap_addr = server.listener_addr(Protocol::Imap).expect("imap addr");
    let smtp_addr = server.listener_addr(Protocol::Smtp).expect("smtp addr");

    let mut first = imap_login(imap_addr, "fred@localhost", "secret").await;
    let mut second = imap_login(imap_addr, "fred@localhost", "secret").await;
    first.send("a1 SELECT INBOX").await;
    first.until_tagged("a1").await;
    second.send("a1 SELECT INBOX").await;
    second.until_tagged("a1").await;

    smtp_send(smtp_addr, "a@b", "fred@localhost", "news", "hello both").await;
    assert!(
        server
            .wait_for_incoming_email(Duration::from_secs(2), 1)
            .await
    );

    for client in [&mut first, &mut second] {
        client.send("a2 NOOP").await;
        let noop = client.until_tagged("a2").await;
        assert!(noop.contains(&"* 1 EXISTS".to_string()), "{noop:?}");
    }
    server.stop().await;
}

/// POP3 DELE then QUIT removes; DELE then drop does
/// not.
#[tokio::test]
async fn pop3_two_phase_deletion() {
    let server = start(config_on_free_ports(&[Protocol::Pop3])).await;
    server.set_user("fred", "secret");
    let inbox = server.store().inbox("fred").expect("inbox");
    for n in 1..=3 {
        inbox.append(format!("Subject: m{n}\r\n\r\nbody {n}\r\n").as_bytes(), &[], None);
    }
    let addr = server.listener_addr(Protocol::Pop3).expect("pop3 addr");

    // DELE 1, QUIT: message is gone.
    let mut client = Client::connect(addr).await;
    assert!(client.line().await.starts_with("+OK"));
    client.send("USER fred").await;
    assert!(client.line().await.starts_with("+OK"));
    client.send("PASS secret").await;
    assert!(client.line().await.starts_with("+OK"));
    client.send("STAT").await;
    assert!(client.line().await.starts_with("+OK 3 "));
    client.send("DELE 1").await;
    assert!(client.line().await.starts_with("+OK"));
    client.send("QUIT").await;
    assert!(client.line().await.starts_with("+OK"));
    assert_eq!(inbox.message_count(), 2);

    // DELE 2 then drop the connection: nothing changes.
    let mut client = Client::connect(addr).await;
    client.line().await;
    client.send("USER fred").await;
    client.line().await;
    client.send("PASS secret").await;
    assert!(client.line().await.starts_with("+OK"));
    client.send("DELE 1").await;
    assert!(client.line().await.starts_with("+OK"));
    drop(client);

    // Give the server a moment to notice the close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inbox.message_count(), 2);
    server.stop().await;
}

/// HEADER.FIELDS returns exactly the requested
/// header plus the terminating blank line.
#[tokio::test]
async fn header_fields_returns_single_header() {
    let server = start(config_on_free_ports(&[Protocol::Imap])).await;
    server.set_user("fred", "secret");
    server
        .store()
        .inbox("fred")
        .expect("inbox")
        .append(b"Subject: hi\r\nFrom: a@b\r\n\r\nhello\r\n", &[], None);
    let addr = server.listener_addr(Protocol::Imap).expect("imap addr");

    let mut client = imap_login(addr, "fred", "secret").await;
    client.send("a1 SELECT INBOX").await;
    client.until_tagged("a1").await;

    client
        .send("a2 FETCH 1 BODY.PEEK[HEADER.FIELDS (Subject)]")
        .await;
    let header = client.line().await;
    let open = header.rfind('{').expect("literal");
    let size: usize = header[open + 1..header.len() - 1].parse().expect("size");
    let bytes = client.read_exact(size).await;
    assert_eq!(bytes, b"Subject: hi\r\n\r\n".to_vec());
    client.until_tagged("a2").await;
    server.stop().await;
}

/// The incoming-mail waiter counts deliveries after
/// installation and times out honestly.
#[tokio::test]
async fn wait_for_incoming_email_counts() {
    let server = start(config_on_free_ports(&[Protocol::Smtp])).await;
    server.set_user("fred@localhost", "secret");
    let addr = server.listener_addr(Protocol::Smtp).expect("smtp addr");

    smtp_send(addr, "a@b", "fred@localhost", "one", "1").await;
    smtp_send(addr, "a@b", "fred@localhost", "two", "2").await;
    // Both arrived before the waiter was installed.
    assert!(
        !server
            .wait_for_incoming_email(Duration::from_millis(200), 1)
            .await
    );

    let waiter = {
        let server = &server;
        async move { server.wait_for_incoming_email(Duration::from_secs(1), 2).await }
    };
    let sender = async {
        smtp_send(addr, "a@b", "fred@localhost", "three", "3").await;
        smtp_send(addr, "a@b", "fred@localhost", "four", "4").await;
    };
    let (satisfied, ()) = tokio::join!(waiter, sender);
    assert!(satisfied);

    // Only one more message: a waiter for two times out.
    let waiter = {
        let server = &server;
        async move { server.wait_for_incoming_email(Duration::from_secs(1), 2).await }
    };
    let sender = async {
        smtp_send(addr, "a@b", "fred@localhost", "five", "5").await;
    };
    let (satisfied, ()) = tokio::join!(waiter, sender);
    assert!(!satisfied);
    server.stop().await;
}

/// IDLE sessions get EXISTS pushed without polling.
#[tokio::test]
async fn idle_receives_exists_push() {
    let server = start(config_on_free_ports(&[Protocol::Imap])).await;
    server.set_user("fred", "secret");
    let addr = server.listener_addr(Protocol::Imap).expect("imap addr");

    let mut client = imap_login(addr, "fred", "secret").await;
    client.send("a1 SELECT INBOX").await;
    client.until_tagged("a1").await;
    client.send("a2 IDLE").await;
    assert!(client.line().await.starts_with("+ "));

    server
        .store()
        .inbox("fred")
        .expect("inbox")
        .append(b"Subject: push\r\n\r\nnow\r\n", &[], None);

    let pushed = client.line().await;
    assert_eq!(pushed, "* 1 EXISTS");
    assert_eq!(client.line().await, "* 1 RECENT");

    client.send("DONE").await;
    let done = client.until_tagged("a2").await;
    assert!(done.last().expect("tagged").starts_with("a2 OK"));
    server.stop().await;
}

/// POP3 UIDL exposes store UIDs and RETR returns the exact bytes.
#[tokio::test]
async fn pop3_uidl_and_retr_roundtrip() {
    let server = start(config_on_free_ports(&[Protocol::Pop3])).await;
    server.set_user("fred", "secret");
    let raw = b"Subject: exact\r\n\r\n.leading dot\r\nbody\r\n";
    server
        .store()
        .inbox("fred")
        .expect("inbox")
        .append(raw, &[], None);
    let addr = server.listener_addr(Protocol::Pop3).expect("pop3 addr");

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.send("USER fred").await;
    client.line().await;
    client.send("PASS secret").await;
    assert!(client.line().await.starts_with("+OK"));

    client.send("UIDL").await;
    assert!(client.line().await.starts_with("+OK"));
    assert_eq!(client.line().await, "1 1");
    assert_eq!(client.line().await, ".");

    client.send("RETR 1").await;
    assert!(client.line().await.starts_with("+OK"));
    let mut body = vec![];
    loop {
        let line = client.line().await;
        if line == "." {
            break;
        }
        let line = line.strip_prefix('.').unwrap_or(&line);
        body.extend_from_slice(line.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    assert_eq!(body, raw.to_vec());
    client.send("QUIT").await;
    client.line().await;
    server.stop().await;
}

/// Implicit-TLS IMAP: handshake first, then the usual dialogue.
#[tokio::test]
async fn imaps_serves_over_tls() {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;
    use std::sync::Arc;

    // The server's certificate is self-signed; tests accept anything.
    #[derive(Debug)]
    struct AcceptAnyCert(rustls::crypto::CryptoProvider);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let server = start(config_on_free_ports(&[Protocol::Imaps])).await;
    server.set_user("fred", "secret");
    let addr = server.listener_addr(Protocol::Imaps).expect("imaps addr");

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(addr).await.expect("connect");
    let name = ServerName::try_from("127.0.0.1").expect("server name");
    let tls = connector.connect(name, tcp).await.expect("tls handshake");

    let mut stream = BufReader::new(tls);
    let mut greeting = String::new();
    stream.read_line(&mut greeting).await.expect("greeting");
    assert!(greeting.starts_with("* OK"), "{greeting}");

    stream
        .get_mut()
        .write_all(b"a1 LOGIN fred secret\r\n")
        .await
        .expect("login");
    let mut reply = String::new();
    stream.read_line(&mut reply).await.expect("reply");
    assert!(reply.starts_with("a1 OK"), "{reply}");
    server.stop().await;
}
