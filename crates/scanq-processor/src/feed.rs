//! Newline-delimited JSON request feed
//!
//! Each line is one scan request. Lines that do not parse are logged and skipped.
//! Cancellation stops intake; requests already being provisioned run to completion.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use scanq_allocator::{AllocationError, AllocationOrchestrator, ScanRequest};

/// Anything that can take a request through allocation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Allocate resources for one request
    async fn handle(&self, request: &ScanRequest) -> Result<(), AllocationError>;
}

#[async_trait]
impl RequestHandler for AllocationOrchestrator {
    async fn handle(&self, request: &ScanRequest) -> Result<(), AllocationError> {
        self.process(request).await.map(|_| ())
    }
}

/// Counts for one pass over the feed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Requests handled successfully
    pub scheduled: usize,
    /// Requests whose allocation failed
    pub failed: usize,
    /// Lines skipped as unparseable
    pub malformed: usize,
}

/// Parse one raw feed line. Blank lines yield `None`; invalid UTF-8 is a parse error.
pub fn parse_line(line: &[u8]) -> Option<Result<ScanRequest, serde_json::Error>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(line))
}

/// Drive every request from `reader` through `handler`.
///
/// At most `max_in_flight` requests are handled at once; with 1 they are handled
/// strictly in arrival order.
pub async fn run_feed<R>(
    reader: R,
    handler: &dyn RequestHandler,
    max_in_flight: usize,
    cancel: CancellationToken,
) -> FeedSummary
where
    R: AsyncBufRead + Unpin + Send,
{
    let scheduled = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let malformed = AtomicUsize::new(0);

    // Raw bytes so one undecodable line cannot end the feed
    let lines = stream::unfold(reader, |mut reader| async move {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => Some((line, reader)),
            Err(e) => {
                error!(error = %e, "Failed to read request feed");
                None
            }
        }
    });

    let requests = lines
        .take_until(cancel.cancelled())
        .filter_map(|line| {
            let parsed = match parse_line(&line) {
                Some(Ok(request)) => Some(request),
                Some(Err(e)) => {
                    warn!(error = %e, "Skipping malformed request");
                    malformed.fetch_add(1, Ordering::Relaxed);
                    None
                }
                None => None,
            };
            future::ready(parsed)
        });

    requests
        .for_each_concurrent(max_in_flight.max(1), |request| {
            let (scheduled, failed) = (&scheduled, &failed);
            async move {
                match handler.handle(&request).await {
                    Ok(()) => {
                        scheduled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!(
                            request_id = request.id,
                            repo = %request.full_name(),
                            retryable = e.is_retryable(),
                            stranded = ?e.stranded(),
                            error = %e,
                            "Scan request not scheduled"
                        );
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
        .await;

    let summary = FeedSummary {
        scheduled: scheduled.into_inner(),
        failed: failed.into_inner(),
        malformed: malformed.into_inner(),
    };
    if cancel.is_cancelled() {
        info!(?summary, "Intake stopped by shutdown");
    } else {
        info!(?summary, "Request feed exhausted");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn line(id: i64, repo: &str) -> String {
        format!(
            r#"{{"id":{id},"namespace":"acme","repoName":"{repo}","url":"https://github.com/acme/{repo}","encryptedToken":"","isPrivate":false}}"#
        )
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert!(parse_line(b"   \r\n").is_none());
        assert!(parse_line(b"").is_none());
    }

    #[test]
    fn parses_camel_case_request() {
        let request = parse_line(line(7, "api").as_bytes()).unwrap().unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.repo_name, "api");
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(parse_line(b"not json"), Some(Err(_))));
        assert!(matches!(parse_line(b"\xff\xfe garbage"), Some(Err(_))));
    }

    #[tokio::test]
    async fn sequential_feed_keeps_arrival_order_and_skips_garbage() {
        let input = format!("{}\n\n{{broken\n{}\n{}\n", line(1, "a"), line(2, "b"), line(3, "c"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handler = MockRequestHandler::new();
        let seen = order.clone();
        handler.expect_handle().times(3).returning(move |req| {
            seen.lock().unwrap().push(req.id);
            if req.id == 2 {
                Err(AllocationError::no_such_request(2))
            } else {
                Ok(())
            }
        });

        let summary = run_feed(input.as_bytes(), &handler, 1, CancellationToken::new()).await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            summary,
            FeedSummary {
                scheduled: 2,
                failed: 1,
                malformed: 1
            }
        );
    }

    #[tokio::test]
    async fn undecodable_line_is_skipped_and_intake_continues() {
        let mut input = line(1, "a").into_bytes();
        input.extend_from_slice(b"\n\xff\xfe garbage\n");
        input.extend_from_slice(line(2, "b").as_bytes());
        input.push(b'\n');

        let mut handler = MockRequestHandler::new();
        handler.expect_handle().times(2).returning(|_| Ok(()));

        let summary = run_feed(input.as_slice(), &handler, 1, CancellationToken::new()).await;
        assert_eq!(
            summary,
            FeedSummary {
                scheduled: 2,
                failed: 0,
                malformed: 1
            }
        );
    }

    #[tokio::test]
    async fn last_line_without_newline_is_read() {
        let input = line(9, "tail");
        let mut handler = MockRequestHandler::new();
        handler
            .expect_handle()
            .withf(|req| req.id == 9)
            .times(1)
            .returning(|_| Ok(()));

        let summary = run_feed(input.as_bytes(), &handler, 1, CancellationToken::new()).await;
        assert_eq!(summary.scheduled, 1);
    }

    #[tokio::test]
    async fn concurrent_feed_handles_every_request() {
        let input: String = (1..=20).map(|i| line(i, "repo") + "\n").collect();
        let mut handler = MockRequestHandler::new();
        handler.expect_handle().times(20).returning(|_| Ok(()));

        let summary = run_feed(input.as_bytes(), &handler, 4, CancellationToken::new()).await;
        assert_eq!(summary.scheduled, 20);
    }

    #[tokio::test]
    async fn cancelled_feed_takes_no_new_requests() {
        let input = format!("{}\n{}\n", line(1, "a"), line(2, "b"));
        let mut handler = MockRequestHandler::new();
        handler.expect_handle().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = run_feed(input.as_bytes(), &handler, 1, cancel).await;
        assert_eq!(summary, FeedSummary::default());
    }
}
