use tokio::sync::watch;

/// Owner side of the stop signal
#[derive(Debug)]
pub struct StopHandle {
    sender: watch::Sender<bool>,
}

/// Cloneable view handed to every loop that has to stop
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}

pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (sender, receiver) = watch::channel(false);
    (StopHandle { sender }, StopSignal { receiver })
}

impl StopHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once stop was requested or the handle was dropped
    pub async fn stopped(&mut self) {
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let (handle, mut signal) = stop_signal();
        let mut second = handle.signal();
        assert!(!signal.is_stopped());
        let waiter = tokio::spawn(async move {
            second.stopped().await;
        });
        handle.stop();
        signal.stopped().await;
        assert!(signal.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_stop() {
        let (handle, mut signal) = stop_signal();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), signal.stopped())
            .await
            .unwrap();
    }
}
