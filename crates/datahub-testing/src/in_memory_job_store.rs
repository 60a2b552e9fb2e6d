//! A `JobStore` backed entirely by `DashMap`s, for tests that want real
//! state-machine behavior without a database (spec §8 property tests,
//! S1-S6).

use dashmap::DashMap;
use std::sync::Mutex;

use datahub_core::event::Event;
use datahub_core::job::Job;
use datahub_core::progress::Progress;
use datahub_core::store::{JobStore, ListFilter};
use datahub_core::Result;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, Job>,
    progress: DashMap<String, Progress>,
    events: Mutex<Vec<Event>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event ever appended, in append order — what
    /// spec §8 property 1 checks for monotonicity and terminal-ness.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log lock poisoned").clone()
    }

    pub fn events_for(&self, job_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn save_progress(&self, progress: &Progress) -> Result<()> {
        self.progress.insert(progress.job_id.clone(), progress.clone());
        Ok(())
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        self.events.lock().expect("event log lock poisoned").push(event.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn load_progress(&self, job_id: &str) -> Result<Option<Progress>> {
        Ok(self.progress.get(job_id).map(|p| p.clone()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        let all: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        Ok(filter.apply(&all))
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs.remove(job_id);
        self.progress.remove(job_id);
        self.events
            .lock()
            .expect("event log lock poisoned")
            .retain(|e| e.job_id != job_id);
        Ok(())
    }
}
