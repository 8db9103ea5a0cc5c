//! Outbound signaling addressed to a single remote peer.

use crate::api::SignalApi;
use anyhow::Result;
use log::warn;
use std::sync::Arc;

/// Wraps the signaling transport with a fixed `(dst, src)` address pair so a
/// session never has to carry machine keys around.
#[derive(Clone)]
pub struct SignalSender {
    api: Arc<dyn SignalApi>,
    dst_mk: String,
    src_mk: String,
}

impl SignalSender {
    pub fn new(api: Arc<dyn SignalApi>, dst_mk: String, src_mk: String) -> Self {
        Self { api, dst_mk, src_mk }
    }

    pub fn dst_mk(&self) -> &str {
        &self.dst_mk
    }

    pub async fn offer(&self, ufrag: &str, pwd: &str) -> Result<()> {
        self.api.offer(&self.dst_mk, &self.src_mk, ufrag, pwd).await
    }

    pub async fn answer(&self, ufrag: &str, pwd: &str) -> Result<()> {
        self.api
            .answer(&self.dst_mk, &self.src_mk, ufrag, pwd)
            .await
    }

    /// Fire-and-forget: candidate delivery failures are logged, never
    /// surfaced. Candidates trickle in from an agent callback that has
    /// nowhere to return an error to.
    pub fn candidate(&self, candidate: String) {
        let api = Arc::clone(&self.api);
        let dst_mk = self.dst_mk.clone();
        let src_mk = self.src_mk.clone();
        tokio::spawn(async move {
            if let Err(e) = api.candidate(&dst_mk, &src_mk, &candidate).await {
                warn!("failed to signal candidate to [{dst_mk}]: {e:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeSignalApi, SentSignal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_offer_and_answer_carry_addressing() {
        let api = Arc::new(FakeSignalApi::default());
        let sender = SignalSender::new(api.clone(), "dst".into(), "src".into());

        sender.offer("u1", "p1").await.unwrap();
        sender.answer("u2", "p2").await.unwrap();

        let sent = api.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            SentSignal::Offer {
                dst_mk: "dst".into(),
                src_mk: "src".into(),
                ufrag: "u1".into(),
                pwd: "p1".into(),
            }
        );
        assert_eq!(
            sent[1],
            SentSignal::Answer {
                dst_mk: "dst".into(),
                src_mk: "src".into(),
                ufrag: "u2".into(),
                pwd: "p2".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_candidate_is_spawned() {
        let api = Arc::new(FakeSignalApi::default());
        let sender = SignalSender::new(api.clone(), "dst".into(), "src".into());

        sender.candidate("candidate:0 1 udp 1 1.2.3.4 5000 typ host".into());

        // the send happens on a spawned task
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !api.sent.lock().unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "candidate never sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
