use tokio::sync::watch;

/// Cooperative shutdown for the receive loop. The application keeps the
///  [ShutdownToken] (e.g. tripping it from a signal handler at the process boundary);
///  the endpoint polls its [ShutdownSignal] between packets.
#[derive(Clone)]
pub struct ShutdownToken {
    sender: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> (ShutdownToken, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownToken { sender }, ShutdownSignal { receiver })
    }

    /// Idempotent.
    pub fn shut_down(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownSignal {
    pub fn is_shut_down(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn wait(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
