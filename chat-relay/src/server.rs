use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast,
    context::{ServerContext, generate_admin_secret},
    session::Session,
};

/// How long shutdown waits for other sessions to write the shutdown notice.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Accept loop. Each connection gets its own task on the runtime's worker
/// pool.
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    shutdown: watch::Receiver<bool>,
}

impl Server {
    /// Wraps a bound listener and draws a fresh admin secret.
    pub fn new(listener: TcpListener) -> Result<Self> {
        Self::with_admin_secret(listener, generate_admin_secret())
    }

    pub fn with_admin_secret(listener: TcpListener, secret: impl Into<String>) -> Result<Self> {
        let address = listener
            .local_addr()
            .context("listening endpoint has no local address")?;
        let context = Arc::new(ServerContext::new(address, secret));
        let shutdown = context.subscribe_shutdown();
        Ok(Self {
            listener,
            context,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.context.address()
    }

    pub fn admin_secret(&self) -> &str {
        self.context.admin_secret()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    /// Accepts connections until an admin issues `-shutdown` or `stop`
    /// resolves. The listening endpoint is closed on return.
    ///
    /// An accept failure is fatal and returned as an error.
    pub async fn run_until<F>(self, stop: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            context,
            mut shutdown,
        } = self;
        tokio::pin!(stop);

        loop {
            select! {
                _ = &mut stop => {
                    info!("stop requested");
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("listening endpoint failed")?;
                    spawn_session(stream, peer, &context);
                }
            }
        }

        drop(listener);
        info!(address = %context.address(), "listener closed");
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, context: &Arc<ServerContext>) {
    if context.is_shutting_down() {
        debug!(%peer, "connection refused during shutdown");
        return;
    }
    debug!(%peer, "connection accepted");
    let context = Arc::clone(context);
    let local = stream.local_addr().ok();
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let session = Session::new(context, reader, writer, Some(peer));
        let session = match local {
            Some(local) => session.with_local_addr(local),
            None => session,
        };
        session.run().await;
    });
}

/// Stops the whole server on behalf of the admin `by`.
///
/// Everyone else is told first and given [`SHUTDOWN_GRACE`] to have the
/// notice written before the listener is told to close.
pub async fn shutdown(context: &ServerContext, by: &str) {
    broadcast::announce(context, Some(by), &format!("Server is shut down by {by}"));
    let confirmed = broadcast::drain(context, Some(by), SHUTDOWN_GRACE).await;
    debug!(confirmed, "shutdown notice delivered");
    context.signal_shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_future_closes_the_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = Server::with_admin_secret(listener, "4242").expect("server");
        let addr = server.local_addr();
        assert_eq!(server.admin_secret(), "4242");

        server.run_until(async {}).await.expect("run");

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_flag_stops_the_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = Server::new(listener).expect("server");
        let context = server.context();
        let running = tokio::spawn(server.run());

        shutdown(&context, "admin").await;

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("listener stopped")
            .expect("join")
            .expect("clean exit");
    }

    #[tokio::test]
    async fn shutdown_issued_before_the_loop_starts_is_not_missed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = Server::new(listener).expect("server");
        assert_eq!(server.admin_secret().len(), 4);

        shutdown(&server.context(), "admin").await;

        tokio::time::timeout(Duration::from_secs(1), server.run())
            .await
            .expect("listener stopped")
            .expect("clean exit");
    }
}
