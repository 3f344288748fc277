use std::future::Future;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::progress::ProgressReporter;

#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub label: String,
    pub error: Error,
}

/// Outcome of a batch where each item succeeds or fails on its own.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<BatchFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// A batch is only an error when it had items and none of them worked.
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded.is_empty() && !self.failures.is_empty() {
            let first = self
                .failures
                .first()
                .map(|failure| format!("{}: {}", failure.label, failure.error))
                .unwrap_or_default();
            return Err(Error::BatchFailed {
                failed: self.failures.len(),
                first,
            });
        }
        Ok(self)
    }
}

/// Run `run` over every item in order. A failing item is recorded and the
/// batch moves on.
pub(crate) async fn run_isolated<I, T, L, F, Fut>(
    items: Vec<I>,
    reporter: &dyn ProgressReporter,
    label: L,
    mut run: F,
) -> Result<BatchReport<T>>
where
    L: Fn(&I) -> String,
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total = items.len();
    reporter.on_batch_start(total);

    let mut report = BatchReport::default();
    for (index, item) in items.into_iter().enumerate() {
        let name = label(&item);
        match run(item).await {
            Ok(value) => report.succeeded.push(value),
            Err(error) => {
                warn!("Batch item {} ({}) failed: {}", index + 1, name, error);
                report.failures.push(BatchFailure {
                    index,
                    label: name,
                    error,
                });
            }
        }
        reporter.on_batch_progress(index + 1, total);
    }

    reporter.on_batch_complete(report.succeeded.len(), report.failed());
    info!(
        "Batch finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed()
    );
    report.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentReporter;

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let report = run_isolated(
            (1..=5).collect(),
            &SilentReporter,
            |n: &i32| format!("item {}", n),
            |n| async move {
                if n == 3 {
                    Err(Error::Validation("three".to_string()))
                } else {
                    Ok(n * 10)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(report.succeeded, vec![10, 20, 40, 50]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].index, 2);
        assert_eq!(report.total(), 5);
    }

    #[tokio::test]
    async fn test_all_failed_is_an_error() {
        let result = run_isolated(
            vec!["a", "b"],
            &SilentReporter,
            |s: &&str| s.to_string(),
            |_| async { Err::<(), _>(Error::Cancelled) },
        )
        .await;

        match result {
            Err(Error::BatchFailed { failed, first }) => {
                assert_eq!(failed, 2);
                assert!(first.starts_with("a:"));
            }
            other => panic!("expected BatchFailed, got {:?}", other.map(|r| r.total())),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_ok() {
        let report = run_isolated(
            Vec::<u8>::new(),
            &SilentReporter,
            |_| String::new(),
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(report.total(), 0);
    }
}
