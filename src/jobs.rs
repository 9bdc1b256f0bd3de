//! Asynchronous job facility
//!
//! Retries, peer cleanup, and poll expiration must never block the
//! inbound request path, so handlers enqueue jobs here and a worker
//! task drains the queue. Every job runs in its own task: a hung
//! remote peer stalls its own delivery, not the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::Database;
use crate::federation::delivery::{DeliveryEngine, DeliveryTarget};

/// Work items accepted by the queue.
#[derive(Debug)]
pub enum Job {
    /// Deliver a stored activity to a set of inboxes
    Deliver {
        activity_uri: String,
        targets: Vec<DeliveryTarget>,
    },
    /// Remove follow relationships pointing at a dead domain
    CleanupPeer { domain: String },
    /// Mark a poll expired once its end time passes
    ExpirePoll {
        poll_id: String,
        at: DateTime<Utc>,
    },
}

/// Cloneable handle for enqueuing jobs.
#[derive(Clone)]
pub struct JobSender {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobSender {
    pub fn enqueue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::error!("Job queue is closed; dropping job");
        }
    }
}

pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

/// Create the queue endpoints.
pub fn channel() -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobSender { tx }, rx)
}

/// Spawn the worker that drains the queue.
pub fn spawn_worker(
    mut rx: JobReceiver,
    engine: Arc<DeliveryEngine>,
    db: Arc<Database>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let engine = engine.clone();
            let db = db.clone();

            tokio::spawn(async move {
                match job {
                    Job::Deliver {
                        activity_uri,
                        targets,
                    } => {
                        if let Err(error) = engine.deliver(&activity_uri, targets).await {
                            tracing::error!(%error, activity = %activity_uri, "Delivery job failed");
                        }
                    }
                    Job::CleanupPeer { domain } => {
                        match db.delete_follows_for_domain(&domain).await {
                            Ok(removed) => {
                                tracing::info!(domain, removed, "Cleaned up follows for dead peer");
                            }
                            Err(error) => {
                                tracing::error!(%error, domain, "Peer cleanup job failed");
                            }
                        }
                    }
                    Job::ExpirePoll { poll_id, at } => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        if !wait.is_zero() {
                            tokio::time::sleep(wait).await;
                        }
                        if let Err(error) = db.mark_poll_expired(&poll_id).await {
                            tracing::error!(%error, poll_id, "Poll expiration job failed");
                        } else {
                            tracing::debug!(poll_id, "Poll marked expired");
                        }
                    }
                }
            });
        }
    })
}
