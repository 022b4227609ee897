//! Job input: one JSON payload per line

use att_attacher::{Job, JobQueue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Counts of lines read by `feed`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub accepted: usize,
    pub rejected: usize,
}

/// Enqueue every job read from `reader` until EOF.
///
/// Blank lines are ignored, malformed payloads are logged and skipped.
pub async fn feed<R>(reader: R, queue: JobQueue) -> anyhow::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = FeedStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Job::from_json(line) {
            Ok(job) => {
                debug!(kind = job.kind(), "Job received");
                queue.enqueue(job)?;
                stats.accepted += 1;
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed job");
                stats.rejected += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_skips_malformed_lines() {
        let input = concat!(
            r#"{"type":"destroy","attachment":{"id":"a.jpg","storage":"store"}}"#,
            "\n\n",
            "not json\n",
            r#"{"type":"promote","record_class":"Photo","record_id":1,"attribute_name":"image","attachment":{"id":"b.jpg","storage":"cache","metadata":{}}}"#,
            "\n",
            r#"{"type":"promote","record_class":"Photo"}"#,
            "\n",
        );
        let (queue, mut receiver) = JobQueue::channel();

        let stats = feed(input.as_bytes(), queue).await.unwrap();
        assert_eq!(stats, FeedStats { accepted: 2, rejected: 2 });

        assert_eq!(receiver.recv().await.map(|j| j.kind()), Some("destroy"));
        assert_eq!(receiver.recv().await.map(|j| j.kind()), Some("promote"));
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_feed_fails_when_worker_is_gone() {
        let (queue, receiver) = JobQueue::channel();
        drop(receiver);

        let input = r#"{"type":"destroy","attachment":{"id":"a","storage":"store"}}"#;
        assert!(feed(input.as_bytes(), queue).await.is_err());
    }
}
