use crate::codec::BoxedAsyncReadAndWrite;
use crate::config::{ListenerConfig, Protocol};
use crate::error::SessionError;
use crate::imap::ImapSession;
use crate::lifecycle::{Activity, Lifecycle, ShutdownSubscription};
use crate::pop3::Pop3Session;
use crate::server::ServerContext;
use crate::smtp::SmtpSession;
use anyhow::Context as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) struct ListenerHandle {
    pub protocol: Protocol,
    pub addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Bind one configured listener and spawn its accept loop. Binding
/// happens here, in the caller's await, so `start()` completes only
/// when every socket is actually listening.
pub(crate) async fn bind_listener(
    ctx: Arc<ServerContext>,
    lifecycle: &Lifecycle,
    config: &ListenerConfig,
) -> anyhow::Result<ListenerHandle> {
    let listener = TcpListener::bind((config.hostname.as_str(), config.port))
        .await
        .with_context(|| {
            format!(
                "bind {} listener to {}:{}",
                config.protocol.name(),
                config.hostname,
                config.port
            )
        })?;
    let addr = listener.local_addr().context("local_addr")?;
    tracing::info!("{} listener on {addr}", config.protocol.name());

    let activity = lifecycle.activity().context("server is shutting down")?;
    let shutdown = lifecycle.subscribe();
    let protocol = config.protocol;
    let task = tokio::spawn(accept_loop(listener, protocol, ctx, activity, shutdown));
    Ok(ListenerHandle {
        protocol,
        addr,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    ctx: Arc<ServerContext>,
    activity: Activity,
    mut shutdown: ShutdownSubscription,
) {
    loop {
        tokio::select! {
            _ = shutdown.shutting_down() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("accept failed on {} listener: {err}", protocol.name());
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let session_activity = activity.clone();
                let session_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    // Keep the activity alive for the whole session so
                    // shutdown waits for us.
                    let _activity = session_activity;
                    run_session(protocol, socket, peer, ctx, session_shutdown).await;
                });
            }
        }
    }
}

async fn run_session(
    protocol: Protocol,
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    mut shutdown: ShutdownSubscription,
) {
    tracing::debug!("{} session from {peer}", protocol.name());
    let result = tokio::select! {
        // Dropping the session future closes the socket, which is how
        // sessions (IDLE included) observe shutdown promptly.
        _ = shutdown.shutting_down() => Ok(()),
        result = session_future(protocol, socket, ctx) => result,
    };
    match result {
        Ok(()) | Err(SessionError::ConnectionClosed) => {
            tracing::debug!("{} session from {peer} ended", protocol.name());
        }
        Err(err) => {
            tracing::debug!("{} session from {peer} ended: {err}", protocol.name());
        }
    }
}

async fn session_future(
    protocol: Protocol,
    socket: TcpStream,
    ctx: Arc<ServerContext>,
) -> Result<(), SessionError> {
    let implicit_tls = protocol.is_tls();
    let stream: BoxedAsyncReadAndWrite = if implicit_tls {
        let acceptor = ctx.tls.clone().ok_or_else(|| {
            SessionError::Protocol("TLS listener configured without an acceptor".to_string())
        })?;
        Box::new(acceptor.accept(socket).await?)
    } else {
        Box::new(socket)
    };
    match protocol.base() {
        Protocol::Smtp => SmtpSession::run(stream, ctx, implicit_tls).await,
        Protocol::Imap => ImapSession::run(stream, ctx, implicit_tls).await,
        Protocol::Pop3 => Pop3Session::run(stream, ctx).await,
        Protocol::Smtps | Protocol::Imaps | Protocol::Pop3s => {
            unreachable!("base() strips the TLS variants")
        }
    }
}
