//! Outbound half of a subscriber connection

use async_trait::async_trait;
use ehub_core::Result;

/// Sends serialized frames to one subscriber.
///
/// `send` may suspend on backpressure; the hub bounds it with a timeout.
#[async_trait]
pub trait SubscriberTransport: Send + Sync + 'static {
    async fn send(&self, text: &str) -> Result<()>;

    /// Release the underlying socket. Called once, when the hub drops the
    /// connection.
    async fn close(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ehub_core::EhubError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records frames; failures can be scripted ahead of time.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<String>>,
        script: Mutex<VecDeque<bool>>,
        pub closed: AtomicBool,
    }

    impl RecordingTransport {
        /// Queue send outcomes; `false` fails that send. Unscripted sends succeed.
        pub fn script(&self, outcomes: &[bool]) {
            self.script.lock().extend(outcomes.iter().copied());
        }

        pub fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl SubscriberTransport for RecordingTransport {
        async fn send(&self, text: &str) -> Result<()> {
            if !self.script.lock().pop_front().unwrap_or(true) {
                return Err(EhubError::Network("scripted send failure".into()));
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
