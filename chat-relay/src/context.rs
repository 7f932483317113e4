use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::sync::watch;

use crate::registry::Registries;

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Process-wide state handed by reference to every session.
#[derive(Debug)]
pub struct ServerContext {
    pub registries: Registries,
    address: SocketAddr,
    started_at: Instant,
    admin_secret: String,
    shutdown: watch::Sender<bool>,
}

impl ServerContext {
    pub fn new(address: SocketAddr, admin_secret: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registries: Registries::default(),
            address,
            started_at: Instant::now(),
            admin_secret: admin_secret.into(),
            shutdown,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn admin_secret(&self) -> &str {
        &self.admin_secret
    }

    pub fn verify_admin_secret(&self, candidate: &str) -> bool {
        candidate == self.admin_secret
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Flips the shutdown flag; the listener stops accepting once it sees it.
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A fresh four-digit admin secret, drawn once per process.
pub fn generate_admin_secret() -> String {
    rand::thread_rng().gen_range(1000..=9999).to_string()
}

/// Renders a duration as `D day(s) H hour(s) M minute(s) S second(s)`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / SECONDS_PER_DAY;
    let hours = total % SECONDS_PER_DAY / 3600;
    let minutes = total % 3600 / 60;
    let seconds = total % 60;
    format!("{days} day(s) {hours} hour(s) {minutes} minute(s) {seconds} second(s)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_always_renders_all_four_components() {
        assert_eq!(
            format_elapsed(Duration::ZERO),
            "0 day(s) 0 hour(s) 0 minute(s) 0 second(s)"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(90_061)),
            "1 day(s) 1 hour(s) 1 minute(s) 1 second(s)"
        );
        assert_eq!(
            format_elapsed(Duration::from_millis(3_599_999)),
            "0 day(s) 0 hour(s) 59 minute(s) 59 second(s)"
        );
    }

    #[test]
    fn generated_secret_has_four_digits() {
        for _ in 0..100 {
            let secret = generate_admin_secret();
            let value: u32 = secret.parse().expect("numeric secret");
            assert!((1000..=9999).contains(&value), "{secret}");
        }
    }

    #[test]
    fn secret_must_match_exactly() {
        let context = ServerContext::new("127.0.0.1:0".parse().expect("addr"), "4242");
        assert!(context.verify_admin_secret("4242"));
        assert!(!context.verify_admin_secret("4242 "));
        assert!(!context.verify_admin_secret("4243"));
    }

    #[test]
    fn shutdown_flag_reaches_subscribers() {
        let context = ServerContext::new("127.0.0.1:0".parse().expect("addr"), "4242");
        let receiver = context.subscribe_shutdown();

        assert!(!context.is_shutting_down());
        context.signal_shutdown();

        assert!(context.is_shutting_down());
        assert!(*receiver.borrow());
    }
}
