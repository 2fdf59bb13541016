use tokio::sync::watch;

pub type ShutdownSignal = watch::Receiver<bool>;

/// Create a shutdown pair. Sending `true`, or dropping the sender, cancels
/// every task holding a receiver.
pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Resolves once shutdown has been requested or the sender is gone.
pub(crate) async fn cancelled(shutdown: &mut ShutdownSignal) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
