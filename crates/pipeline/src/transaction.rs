//! Unit-of-work boundary around a dispatched request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, PipelineError, Result};
use crate::request::{Next, PipelineBehavior, Request};

/// Source of transactions for the transaction behavior.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, BoxError>;
}

/// An open transaction. Commit and rollback consume it, so each runs at most once.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> std::result::Result<(), BoxError>;

    async fn rollback(self: Box<Self>) -> std::result::Result<(), BoxError>;
}

type Predicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Decides whether a failed request rolls its transaction back.
///
/// Rules are checked in order: the roll-back-on-everything flag, then the
/// predicate, then the allow-list of error types. When none matches, the
/// transaction is neither committed nor rolled back and is dropped.
#[derive(Clone)]
pub struct RollbackPolicy {
    rollback_on_all: bool,
    predicate: Option<Predicate>,
    allow_list: Vec<(&'static str, fn(&PipelineError) -> bool)>,
}

impl Default for RollbackPolicy {
    /// Rolls back on every error.
    fn default() -> Self {
        Self {
            rollback_on_all: true,
            predicate: None,
            allow_list: Vec::new(),
        }
    }
}

impl RollbackPolicy {
    /// A policy that rolls back on nothing until rules are added.
    pub fn none() -> Self {
        Self {
            rollback_on_all: false,
            ..Self::default()
        }
    }

    pub fn rollback_on_all(mut self, enabled: bool) -> Self {
        self.rollback_on_all = enabled;
        self
    }

    /// Rolls back when `predicate` returns true for the error.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Rolls back when an error of type `E` is in the error's source chain.
    pub fn rollback_on<E>(mut self) -> Self
    where
        E: std::error::Error + 'static,
    {
        self.allow_list.push((
            std::any::type_name::<E>(),
            |error: &PipelineError| error.is::<E>(),
        ));
        self
    }

    pub fn should_rollback(&self, error: &PipelineError) -> bool {
        self.rollback_on_all
            || self.predicate.as_ref().is_some_and(|p| p(error))
            || self.allow_list.iter().any(|(_, matches)| matches(error))
    }
}

impl std::fmt::Debug for RollbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackPolicy")
            .field("rollback_on_all", &self.rollback_on_all)
            .field("predicate", &self.predicate.is_some())
            .field(
                "allow_list",
                &self.allow_list.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Begins a transaction, runs the rest of the pipeline and commits on success.
pub struct TransactionBehavior {
    unit_of_work: Arc<dyn UnitOfWork>,
    policy: RollbackPolicy,
}

impl TransactionBehavior {
    pub fn new(unit_of_work: Arc<dyn UnitOfWork>, policy: RollbackPolicy) -> Self {
        Self {
            unit_of_work,
            policy,
        }
    }
}

#[async_trait]
impl<R: Request> PipelineBehavior<R> for TransactionBehavior {
    async fn handle(
        &self,
        request: R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response> {
        let name = request.name();
        let transaction = self
            .unit_of_work
            .begin()
            .await
            .map_err(PipelineError::UnitOfWork)?;

        match next.run(request, cancel).await {
            Ok(response) => {
                transaction
                    .commit()
                    .await
                    .map_err(PipelineError::UnitOfWork)?;
                metrics::counter!("pipeline_transactions_committed_total", "request" => name)
                    .increment(1);
                tracing::debug!(request = name, "Transaction committed");
                Ok(response)
            }
            Err(error) if self.policy.should_rollback(&error) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    tracing::error!(
                        request = name,
                        error = %error,
                        rollback_error = %rollback_error,
                        "Transaction rollback failed"
                    );
                }
                metrics::counter!("pipeline_transactions_rolled_back_total", "request" => name)
                    .increment(1);
                tracing::debug!(request = name, error = %error, "Transaction rolled back");
                Err(error)
            }
            Err(error) => {
                tracing::debug!(
                    request = name,
                    error = %error,
                    "Error not covered by rollback policy, transaction left uncommitted"
                );
                drop(transaction);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use thiserror::Error;

    use super::*;
    use crate::request::{Pipeline, RequestHandler};

    #[derive(Debug, Error)]
    #[error("constraint violated")]
    struct ConstraintViolated;

    #[derive(Debug, Error)]
    #[error("deadlock detected")]
    struct Deadlock;

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl Journal {
        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct RecordingUnitOfWork {
        journal: Arc<Journal>,
        fail_commit: bool,
        fail_rollback: bool,
    }

    struct RecordingTransaction {
        journal: Arc<Journal>,
        fail_commit: bool,
        fail_rollback: bool,
    }

    #[async_trait]
    impl UnitOfWork for RecordingUnitOfWork {
        async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, BoxError> {
            self.journal.0.lock().unwrap().push("begin");
            Ok(Box::new(RecordingTransaction {
                journal: self.journal.clone(),
                fail_commit: self.fail_commit,
                fail_rollback: self.fail_rollback,
            }))
        }
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn commit(self: Box<Self>) -> std::result::Result<(), BoxError> {
            self.journal.0.lock().unwrap().push("commit");
            if self.fail_commit {
                return Err("commit refused".into());
            }
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> std::result::Result<(), BoxError> {
            self.journal.0.lock().unwrap().push("rollback");
            if self.fail_rollback {
                return Err("rollback refused".into());
            }
            Ok(())
        }
    }

    struct Save {
        fail_with: Option<fn() -> BoxError>,
    }

    impl Request for Save {
        type Response = &'static str;
    }

    struct SaveHandler;

    #[async_trait]
    impl RequestHandler<Save> for SaveHandler {
        async fn handle(
            &self,
            request: &Save,
            _cancel: &CancellationToken,
        ) -> Result<&'static str> {
            match request.fail_with {
                Some(make) => Err(PipelineError::Handler(make())),
                None => Ok("saved"),
            }
        }
    }

    fn pipeline(journal: &Arc<Journal>, policy: RollbackPolicy) -> Pipeline<Save> {
        pipeline_with(journal, policy, false, false)
    }

    fn pipeline_with(
        journal: &Arc<Journal>,
        policy: RollbackPolicy,
        fail_commit: bool,
        fail_rollback: bool,
    ) -> Pipeline<Save> {
        let unit_of_work = Arc::new(RecordingUnitOfWork {
            journal: journal.clone(),
            fail_commit,
            fail_rollback,
        });
        Pipeline::builder(SaveHandler)
            .behavior(TransactionBehavior::new(unit_of_work, policy))
            .build()
    }

    fn constraint() -> BoxError {
        Box::new(ConstraintViolated)
    }

    fn deadlock() -> BoxError {
        Box::new(Deadlock)
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let journal = Arc::new(Journal::default());
        let response = pipeline(&journal, RollbackPolicy::default())
            .send(Save { fail_with: None }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response, "saved");
        assert_eq!(journal.entries(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_default_policy_rolls_back_any_error() {
        let journal = Arc::new(Journal::default());
        let result = pipeline(&journal, RollbackPolicy::default())
            .send(
                Save {
                    fail_with: Some(constraint),
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.unwrap_err().is::<ConstraintViolated>());
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_unlisted_error_is_neither_committed_nor_rolled_back() {
        let journal = Arc::new(Journal::default());
        let policy = RollbackPolicy::none().rollback_on::<Deadlock>();

        let result = pipeline(&journal, policy)
            .send(
                Save {
                    fail_with: Some(constraint),
                },
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is::<ConstraintViolated>());
        assert_eq!(err.to_string(), "Handler failed: constraint violated");
        assert_eq!(journal.entries(), vec!["begin"]);
    }

    #[tokio::test]
    async fn test_listed_error_rolls_back() {
        let journal = Arc::new(Journal::default());
        let policy = RollbackPolicy::none().rollback_on::<Deadlock>();

        let result = pipeline(&journal, policy)
            .send(
                Save {
                    fail_with: Some(deadlock),
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.unwrap_err().is::<Deadlock>());
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_predicate_is_consulted_before_allow_list() {
        let journal = Arc::new(Journal::default());
        let policy = RollbackPolicy::none()
            .when(|e| e.is::<ConstraintViolated>())
            .rollback_on::<Deadlock>();

        pipeline(&journal, policy)
            .send(
                Save {
                    fail_with: Some(constraint),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces_as_unit_of_work_error() {
        let journal = Arc::new(Journal::default());
        let result = pipeline_with(&journal, RollbackPolicy::default(), true, false)
            .send(Save { fail_with: None }, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::UnitOfWork(_))));
        assert_eq!(journal.entries(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let journal = Arc::new(Journal::default());
        let result = pipeline_with(&journal, RollbackPolicy::default(), false, true)
            .send(
                Save {
                    fail_with: Some(deadlock),
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.unwrap_err().is::<Deadlock>());
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
    }

    #[test]
    fn test_none_policy_rolls_back_nothing() {
        let policy = RollbackPolicy::none();
        assert!(!policy.should_rollback(&PipelineError::Cancelled));
        assert!(RollbackPolicy::default().should_rollback(&PipelineError::Cancelled));
    }
}
