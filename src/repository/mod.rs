//! Persistence contracts for jobs and executions.
//!
//! Aggregates are reached through repository traits returning value
//! types; the in-memory realizations below are the reference
//! implementations and back every test. Production realizations must
//! preserve the same contracts, including the uniqueness indexes.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{ExecutionId, JobId};
use crate::scheduler::job::{Execution, Job, JobStatus};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No aggregate under the given id.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness index was violated.
    #[error("conflict on {entity}: {message}")]
    Conflict { entity: &'static str, message: String },
}

/// Store for job aggregates.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts or replaces a job.
    async fn save(&self, job: Job) -> Result<(), RepositoryError>;

    /// Looks a job up by id.
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError>;

    /// Returns all jobs, ordered by creation time.
    async fn list(&self) -> Result<Vec<Job>, RepositoryError>;

    /// Returns the jobs in a given status, ordered by creation time.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError>;

    /// Deletes a job.
    async fn delete(&self, id: &JobId) -> Result<(), RepositoryError>;
}

/// Store for execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Inserts or replaces an execution.
    async fn save(&self, execution: Execution) -> Result<(), RepositoryError>;

    /// Looks an execution up by id.
    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError>;

    /// Returns the executions of one job, ordered by start time.
    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Execution>, RepositoryError>;

    /// Deletes an execution.
    async fn delete(&self, id: &ExecutionId) -> Result<(), RepositoryError>;
}

/// In-memory job store.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: Job) -> Result<(), RepositoryError> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job);
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn delete(&self, id: &JobId) -> Result<(), RepositoryError> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "job",
                id: id.to_string(),
            })
    }
}

/// In-memory execution store.
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: Execution) -> Result<(), RepositoryError> {
        self.executions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions: Vec<Execution> = self
            .executions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|execution| execution.job_id == *job_id)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        Ok(executions)
    }

    async fn delete(&self, id: &ExecutionId) -> Result<(), RepositoryError> {
        self.executions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorkerId;
    use crate::scheduler::job::JobContent;

    fn job(name: &str) -> Job {
        Job::new(name, JobContent::shell(vec!["true".to_string()]))
    }

    #[tokio::test]
    async fn test_job_save_find_roundtrip() {
        let repo = InMemoryJobRepository::new();
        let j = job("a");
        let id = j.id.clone();

        repo.save(j.clone()).await.unwrap();
        let found = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.name, "a");

        assert!(repo
            .find_by_id(&JobId::new("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_job_find_by_status() {
        let repo = InMemoryJobRepository::new();
        let mut queued = job("queued");
        queued.transition(JobStatus::Queued).unwrap();
        repo.save(queued).await.unwrap();
        repo.save(job("pending")).await.unwrap();

        let found = repo.find_by_status(JobStatus::Queued).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "queued");
    }

    #[tokio::test]
    async fn test_job_delete() {
        let repo = InMemoryJobRepository::new();
        let j = job("a");
        let id = j.id.clone();
        repo.save(j).await.unwrap();

        repo.delete(&id).await.unwrap();
        assert!(matches!(
            repo.delete(&id).await,
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execution_list_for_job() {
        let repo = InMemoryExecutionRepository::new();
        let job_id = JobId::new("j1");
        let first = Execution::new(job_id.clone(), WorkerId::new("w1"));
        let second = Execution::new(job_id.clone(), WorkerId::new("w2"));
        let other = Execution::new(JobId::new("j2"), WorkerId::new("w1"));

        repo.save(first.clone()).await.unwrap();
        repo.save(second.clone()).await.unwrap();
        repo.save(other).await.unwrap();

        let listed = repo.list_for_job(&job_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|execution| execution.job_id == job_id));
    }
}
