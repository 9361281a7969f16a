use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use ssre_core::{Record, RunStatus, RunSubmission};
use tracing::debug;
use uuid::Uuid;

use crate::{submit_logged, SreClient};

#[derive(Debug, Default)]
struct CaptureState {
    sample: Option<Vec<Record>>,
    snapshot: Option<String>,
    error: Option<String>,
}

/// Handle a monitored job uses to record what it extracted and saw.
#[derive(Debug, Clone, Default)]
pub struct RunCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl RunCapture {
    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the extracted items. The reported item count follows the sample length.
    pub fn capture_data(&self, records: Vec<Record>) {
        self.lock().sample = Some(records);
    }

    pub fn capture_snapshot(&self, html: impl Into<String>) {
        self.lock().snapshot = Some(html.into());
    }

    /// Mark the run failed with `error`, even if the job later returns `Ok`.
    pub fn record_error(&self, error: impl Display) {
        self.lock().error = Some(error.to_string());
    }

    fn into_submission(
        self,
        scraper_id: Uuid,
        duration_ms: f64,
        failure: Option<String>,
    ) -> RunSubmission {
        let mut state = self.lock();
        let error = failure.or_else(|| state.error.take());
        let sample = state.sample.take();

        let mut submission = RunSubmission::pending(scraper_id);
        submission.status = if error.is_some() {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
        submission.duration_ms = duration_ms;
        submission.items_extracted = sample.as_ref().map_or(0, |s| s.len() as u64);
        submission.extracted_data_sample = sample;
        submission.html_snapshot = state.snapshot.take();
        submission.error_message = error;
        submission
    }
}

/// Wraps scraping jobs for one registered scraper and reports each as a run.
#[derive(Debug, Clone)]
pub struct ScraperObserver {
    client: SreClient,
    scraper_id: Uuid,
}

impl ScraperObserver {
    pub fn new(client: SreClient, scraper_id: Uuid) -> Self {
        Self { client, scraper_id }
    }

    pub fn scraper_id(&self) -> Uuid {
        self.scraper_id
    }

    /// Run `job`, then submit a run record however it ends.
    ///
    /// The job's result is returned unchanged; a panic is resumed after the
    /// run has been submitted. Submission failures are only logged.
    pub async fn monitor<F, Fut, T, E>(&self, job: F) -> Result<T, E>
    where
        F: FnOnce(RunCapture) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let capture = RunCapture::default();
        let handle = capture.clone();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async move { job(handle).await })
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let failure = match &outcome {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        let submission = capture.into_submission(self.scraper_id, duration_ms, failure);
        debug!(
            scraper_id = %self.scraper_id,
            status = %submission.status,
            items = submission.items_extracted,
            duration_ms,
            "monitored job finished"
        );
        submit_logged(&self.client, &submission).await;

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown payload".to_string()
    }
}
