//! REST polling that runs alongside the push stream.
//!
//! Push events are the primary signal, but a stream can stall or drop its last
//! event. While a session is live the monitor periodically fetches the job's
//! records and runs the poll variant of terminal detection on them. A second,
//! coarser fetch refreshes the job listing shown to the user.
//!
//! [`PollingFallback`] only tracks the in-flight requests. The driver decides
//! when to start them (from [`TimerSet`](crate::timers::TimerSet) ticks) and
//! what to do with the results.

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::api::{ApiError, JobApi};
use crate::types::JobRecord;

type Fetch = BoxFuture<'static, Result<Vec<JobRecord>, ApiError>>;

/// A finished fetch.
#[derive(Debug)]
pub enum PollOutcome {
    /// Result of a status poll for the monitored session.
    Status(Result<Vec<JobRecord>, ApiError>),
    /// Result of a job list refresh.
    Listing(Result<Vec<JobRecord>, ApiError>),
}

/// In-flight fallback requests for one session.
///
/// At most one status poll and one list refresh run at a time; ticks that
/// arrive while a request is outstanding are skipped.
pub struct PollingFallback {
    api: Arc<dyn JobApi>,
    session_id: String,
    status_fetch: Option<Fetch>,
    list_fetch: Option<Fetch>,
}

impl fmt::Debug for PollingFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingFallback")
            .field("session_id", &self.session_id)
            .field("status_in_flight", &self.status_fetch.is_some())
            .field("list_in_flight", &self.list_fetch.is_some())
            .finish()
    }
}

impl PollingFallback {
    #[must_use]
    pub fn new(api: Arc<dyn JobApi>, session_id: impl Into<String>) -> Self {
        Self {
            api,
            session_id: session_id.into(),
            status_fetch: None,
            list_fetch: None,
        }
    }

    /// Starts a status poll. Returns false if one is already in flight.
    pub fn begin_status_check(&mut self) -> bool {
        if self.status_fetch.is_some() {
            return false;
        }
        let api = Arc::clone(&self.api);
        let session_id = self.session_id.clone();
        self.status_fetch = Some(async move { api.poll_records(&session_id).await }.boxed());
        true
    }

    /// Starts a list refresh. Returns false if one is already in flight.
    pub fn begin_list_refresh(&mut self) -> bool {
        if self.list_fetch.is_some() {
            return false;
        }
        let api = Arc::clone(&self.api);
        self.list_fetch = Some(async move { api.list_records().await }.boxed());
        true
    }

    /// Drops every in-flight request.
    pub fn cancel(&mut self) {
        self.status_fetch = None;
        self.list_fetch = None;
    }

    /// Number of requests in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        usize::from(self.status_fetch.is_some()) + usize::from(self.list_fetch.is_some())
    }

    /// Polls the in-flight requests. Pending forever when none are running.
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<PollOutcome> {
        if let Some(fetch) = self.status_fetch.as_mut() {
            if let Poll::Ready(result) = fetch.poll_unpin(cx) {
                self.status_fetch = None;
                return Poll::Ready(PollOutcome::Status(result));
            }
        }
        if let Some(fetch) = self.list_fetch.as_mut() {
            if let Poll::Ready(result) = fetch.poll_unpin(cx) {
                self.list_fetch = None;
                return Poll::Ready(PollOutcome::Listing(result));
            }
        }
        Poll::Pending
    }

    /// Waits for the next finished request.
    pub async fn next(&mut self) -> PollOutcome {
        poll_fn(|cx| self.poll_next(cx)).await
    }
}
