//! Durable Redis-backed campaign queues.
//!
//! One queue exists per campaign type, named deterministically from the
//! type (`calls:review_request`, ...). Each queue uses a small family of
//! Redis keys:
//!
//! - `{queue_name}`: main list of waiting jobs
//! - `{queue_name}:processing`: jobs currently claimed by a worker
//! - `{queue_name}:delayed`: sorted set of jobs waiting on a delay or a
//!   retry backoff (score = ready-at, unix millis)
//! - `{queue_name}:completed` / `{queue_name}:failed`: bounded history
//!   of terminal jobs, kept for operability
//! - `{queue_name}:claims`: sorted set of claim timestamps, used to
//!   detect stalled jobs
//!
//! Dequeue uses BRPOPLPUSH so a claim is atomic: no two workers can hold
//! the same job, and a crashed worker's jobs stay visible in
//! `:processing` until the stalled sweep redelivers them.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use super::job::{CallOutcome, CampaignJob, CampaignType, EnqueueOptions};

/// First retry is delayed by this much; each further retry doubles it.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// How many completed jobs are retained per queue.
const COMPLETED_RETENTION: isize = 100;

/// How many failed jobs are retained per queue.
const FAILED_RETENTION: isize = 50;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the queue service.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Queue operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Exponential backoff for a retry: 2s, 4s, 8s, ... keyed off the
/// number of attempts already made.
pub fn backoff_delay(attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    RETRY_BASE_DELAY * 2u32.pow(exponent)
}

/// One durable queue for a single campaign type.
pub struct CampaignQueue {
    redis: ConnectionManager,
    campaign_type: CampaignType,
    queue_name: String,
    processing_key: String,
    delayed_key: String,
    completed_key: String,
    failed_key: String,
    claims_key: String,
}

impl CampaignQueue {
    /// Connects to the queue service and binds the queue for one
    /// campaign type.
    pub async fn connect(redis_url: &str, campaign_type: CampaignType) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, campaign_type))
    }

    /// Creates a queue from an existing connection manager.
    ///
    /// All five queues of a worker process share one connection this way.
    pub fn from_connection(redis: ConnectionManager, campaign_type: CampaignType) -> Self {
        let queue_name = campaign_type.queue_name().to_string();
        Self {
            redis,
            campaign_type,
            processing_key: format!("{}:processing", queue_name),
            delayed_key: format!("{}:delayed", queue_name),
            completed_key: format!("{}:completed", queue_name),
            failed_key: format!("{}:failed", queue_name),
            claims_key: format!("{}:claims", queue_name),
            queue_name,
        }
    }

    /// The campaign type this queue carries.
    pub fn campaign_type(&self) -> CampaignType {
        self.campaign_type
    }

    /// The queue's name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Verifies connectivity to the queue service.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Enqueues a job and returns its id.
    ///
    /// `options.delay` keeps the job invisible until it elapses;
    /// `options.priority > 0` schedules the job ahead of waiting ones.
    /// Failures surface synchronously to the caller; the queue does not
    /// retry enqueues.
    pub async fn enqueue(
        &self,
        mut job: CampaignJob,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        job.max_attempts = options.max_attempts;
        job.priority = options.priority;

        let job_id = job.job_id;
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();

        match options.delay {
            Some(delay) => {
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                conn.zadd::<_, _, _, ()>(&self.delayed_key, serialized, ready_at)
                    .await?;
            }
            None if options.priority > 0 => {
                // The consuming end: dequeued before anything already waiting.
                conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
            }
            None => {
                conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
            }
        }

        Ok(job_id)
    }

    /// Dequeues the next job, blocking up to `timeout`.
    ///
    /// Due delayed jobs are promoted first, then BRPOPLPUSH atomically
    /// moves the oldest waiting job into `:processing` and the claim is
    /// stamped for stalled detection.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<CampaignJob>, QueueError> {
        self.promote_due().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some(data) = result else {
            return Ok(None);
        };

        let job: CampaignJob = serde_json::from_str(&data)?;
        conn.zadd::<_, _, _, ()>(
            &self.claims_key,
            job.job_id.to_string(),
            Utc::now().timestamp_millis(),
        )
        .await?;

        Ok(Some(job))
    }

    /// Acknowledges a completed job and records it in the bounded
    /// completed history.
    pub async fn complete(&self, job: &CampaignJob, outcome: &CallOutcome) -> Result<(), QueueError> {
        self.release_claim(job).await?;

        let entry = serde_json::to_string(&serde_json::json!({
            "job": job,
            "outcome": outcome,
            "completed_at": Utc::now().to_rfc3339(),
        }))?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.lpush(&self.completed_key, entry)
            .ltrim(&self.completed_key, 0, COMPLETED_RETENTION - 1);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Schedules a failed job for redelivery with exponential backoff.
    ///
    /// The attempt counter must already reflect the failed attempt.
    /// Returns the applied delay.
    pub async fn retry_later(&self, job: &CampaignJob) -> Result<Duration, QueueError> {
        self.release_claim(job).await?;

        let delay = backoff_delay(job.attempts_made);
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let serialized = serde_json::to_string(job)?;

        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&self.delayed_key, serialized, ready_at)
            .await?;

        Ok(delay)
    }

    /// Terminally fails a job and records it in the bounded failed
    /// history.
    pub async fn fail_permanently(&self, job: &CampaignJob, error: &str) -> Result<(), QueueError> {
        self.release_claim(job).await?;

        let entry = serde_json::to_string(&serde_json::json!({
            "job": job,
            "error": error,
            "failed_at": Utc::now().to_rfc3339(),
        }))?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.lpush(&self.failed_key, entry)
            .ltrim(&self.failed_key, 0, FAILED_RETENTION - 1);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Redelivers jobs whose claim is older than `job_timeout`.
    ///
    /// A stalled job goes back to the main queue until it has been
    /// redelivered `max_stalled_deliveries` times; after that it is
    /// terminally failed instead of recycling forever.
    ///
    /// Returns the number of jobs redelivered.
    pub async fn recover_stalled(
        &self,
        job_timeout: Duration,
        max_stalled_deliveries: u32,
    ) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let cutoff = Utc::now().timestamp_millis() - job_timeout.as_millis() as i64;

        let stalled_ids: Vec<String> = conn
            .zrangebyscore(&self.claims_key, "-inf", cutoff)
            .await?;
        if stalled_ids.is_empty() {
            return Ok(0);
        }

        let entries: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        let mut redelivered = 0;

        for entry in entries {
            let Ok(mut job) = serde_json::from_str::<CampaignJob>(&entry) else {
                continue;
            };
            if !stalled_ids.contains(&job.job_id.to_string()) {
                continue;
            }

            conn.lrem::<_, _, ()>(&self.processing_key, 1, &entry).await?;
            conn.zrem::<_, _, ()>(&self.claims_key, job.job_id.to_string())
                .await?;

            job.stalled_deliveries += 1;
            if job.stalled_deliveries <= max_stalled_deliveries {
                let serialized = serde_json::to_string(&job)?;
                conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
                redelivered += 1;
            } else {
                self.fail_permanently(&job, "Exceeded stalled redelivery limit")
                    .await?;
            }
        }

        Ok(redelivered)
    }

    /// Moves delayed jobs whose ready time has passed onto the main
    /// queue.
    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = conn.zrangebyscore(&self.delayed_key, "-inf", now).await?;
        if due.is_empty() {
            return Ok(());
        }

        for entry in due {
            // Atomic per entry: the job moves exactly once even with
            // concurrent consumers promoting at the same time.
            let removed: i64 = conn.zrem(&self.delayed_key, &entry).await?;
            if removed > 0 {
                conn.rpush::<_, _, ()>(&self.queue_name, &entry).await?;
            }
        }

        Ok(())
    }

    /// Removes a job's processing entry and claim stamp.
    async fn release_claim(&self, job: &CampaignJob) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let entries: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        for entry in entries {
            if let Ok(parsed) = serde_json::from_str::<CampaignJob>(&entry) {
                if parsed.job_id == job.job_id {
                    conn.lrem::<_, _, ()>(&self.processing_key, 1, &entry).await?;
                    break;
                }
            }
        }

        // Absent claim is not an error: it may already have been swept.
        conn.zrem::<_, _, ()>(&self.claims_key, job.job_id.to_string())
            .await?;

        Ok(())
    }

    /// Returns the queue's depth counters.
    pub async fn stats(&self) -> Result<QueueDepths, QueueError> {
        let mut conn = self.redis.clone();

        let (pending, processing, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .llen(&self.queue_name)
                .llen(&self.processing_key)
                .zcard(&self.delayed_key)
                .llen(&self.completed_key)
                .llen(&self.failed_key)
                .query_async(&mut conn)
                .await?;

        Ok(QueueDepths {
            queue_name: self.queue_name.clone(),
            pending,
            processing,
            delayed,
            completed,
            failed,
        })
    }
}

/// Depth counters for one queue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueDepths {
    pub queue_name: String,
    /// Jobs waiting for a worker.
    pub pending: usize,
    /// Jobs currently claimed.
    pub processing: usize,
    /// Jobs waiting on a delay or retry backoff.
    pub delayed: usize,
    /// Retained completed jobs.
    pub completed: usize,
    /// Retained failed jobs.
    pub failed: usize,
}

impl QueueDepths {
    /// Jobs that are still live (not yet terminal).
    pub fn in_flight(&self) -> usize {
        self.pending + self.processing + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_starts_at_two_seconds_and_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_handles_zero_attempts() {
        // An unattempted job retries at the base delay.
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_queue_depths_in_flight() {
        let depths = QueueDepths {
            queue_name: "calls:reactivation".to_string(),
            pending: 4,
            processing: 2,
            delayed: 3,
            completed: 100,
            failed: 7,
        };
        assert_eq!(depths.in_flight(), 9);
    }

    #[test]
    fn test_failed_entry_structure() {
        let job = CampaignJob::new(CampaignType::FollowUp, "t1", "+31612345678");
        let entry = serde_json::json!({
            "job": job,
            "error": "No opted-in consent",
            "failed_at": Utc::now().to_rfc3339(),
        });

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&serialized).expect("entry should parse back");

        assert!(parsed.get("job").is_some());
        assert_eq!(parsed["job"]["campaign_type"], "FOLLOW_UP");
        assert!(parsed.get("error").is_some());
        assert!(parsed.get("failed_at").is_some());
    }
}
