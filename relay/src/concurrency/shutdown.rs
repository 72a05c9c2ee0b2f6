use tokio::sync::watch;

/// Sending half of the run shutdown signal.
///
/// The signal is a `watch` channel of `()`: every receiver sees a change once [`ShutdownTx::shutdown`]
/// has been called, no matter when it subscribed.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = watch::Receiver<()>;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

/// Returns `true` once shutdown has been requested.
///
/// Dropping every sender is not a request, so a detached run keeps going until its own limits.
pub fn shutdown_requested(rx: &ShutdownRx) -> bool {
    matches!(rx.has_changed(), Ok(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscribers_observe_shutdown() {
        let (tx, early) = create_shutdown_channel();
        assert!(!shutdown_requested(&early));

        let late = tx.subscribe();
        tx.shutdown().unwrap();

        assert!(shutdown_requested(&early));
        assert!(shutdown_requested(&late));
    }

    #[test]
    fn dropped_sender_is_not_a_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);
        assert!(!shutdown_requested(&rx));
    }
}
