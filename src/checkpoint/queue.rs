//! Single-writer queue in front of a [`DurableStore`]: one write in flight at a time,
//! concurrent requests wait their turn, and every request gets its own result back.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};

use super::store::DurableStore;

struct WriteRequest {
    section: String,
    value: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteRequest>,
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

impl WriteQueue {
    pub fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(64);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let res = store.write(&req.section, req.value).await;
                // caller may have stopped waiting; nothing to do then
                let _ = req.done.send(res);
            }
            tracing::debug!(target: "checkpoint", "write queue drained and closed");
        });
        Self { tx }
    }

    /// Queue a write and wait for its own outcome.
    pub async fn write(&self, section: &str, value: Vec<u8>) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                section: section.to_string(),
                value,
                done,
            })
            .await
            .map_err(|_| anyhow!("checkpoint write queue closed"))?;
        result
            .await
            .context("checkpoint writer dropped the request")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the peak number of overlapping writes.
    #[derive(Default)]
    struct Probe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DurableStore for Probe {
        async fn write(&self, section: &str, _value: Vec<u8>) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if section == "bad" {
                return Err(anyhow!("bad section"));
            }
            Ok(())
        }

        async fn read(&self, _section: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn writes_never_overlap_and_results_are_per_request() {
        let probe = Arc::new(Probe::default());
        let q = WriteQueue::spawn(probe.clone());

        let mut handles = Vec::new();
        for section in ["a", "bad", "b", "c"] {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                (section, q.write(section, vec![1]).await.is_ok())
            }));
        }
        for h in handles {
            let (section, ok) = h.await.unwrap();
            assert_eq!(ok, section != "bad");
        }
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }
}
