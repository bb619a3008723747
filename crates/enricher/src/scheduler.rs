use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    /// Send one tick at startup instead of waiting a full interval.
    pub run_immediately: bool,
}

pub fn start(jobs: Vec<JobSpec>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start_at = if job.run_immediately {
                    Instant::now()
                } else {
                    Instant::now() + job.interval
                };
                let mut interval = tokio::time::interval_at(start_at, job.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    tracing::debug!(job = %job.name, "scheduler tick");
                    // A full channel means the job is still busy; skip this tick.
                    match job.tick.try_send(()) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                        Err(mpsc::error::TrySendError::Closed(())) => break,
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_fires_jobs_at_intervals() {
        let (tx, mut rx) = mpsc::channel(16);
        let _handles = start(
            vec![JobSpec {
                name: "aggregation".to_string(),
                interval: Duration::from_secs(10),
                tick: tx,
                run_immediately: false,
            }],
            CancellationToken::new(),
        );

        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok()); // t=20
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_immediately_ticks_at_startup() {
        let (tx, mut rx) = mpsc::channel(16);
        let _handles = start(
            vec![JobSpec {
                name: "aggregation".to_string(),
                interval: Duration::from_secs(300),
                tick: tx,
                run_immediately: true,
            }],
            CancellationToken::new(),
        );

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_scheduler() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handles = start(
            vec![JobSpec {
                name: "aggregation".to_string(),
                interval: Duration::from_secs(10),
                tick: tx,
                run_immediately: false,
            }],
            cancel.clone(),
        );

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert!(rx.recv().await.is_none());
    }
}
