// In-memory job table
//
// The orchestrator is the only writer. Live process handles stay with the
// backend; the registry refers to them by job id only.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::models::{BackendEvent, EngineEvent, Job, JobId, JobStatus};

struct Entry {
    job: Job,
    listeners: Vec<mpsc::UnboundedSender<EngineEvent>>,
}

impl Entry {
    fn publish(&mut self, event: &EngineEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        if event.is_terminal() {
            // Dropping the senders ends every subscription for this job.
            self.listeners.clear();
        }
    }
}

/// Event stream for a single job; yields `None` after the terminal event
pub struct JobSubscription {
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl JobSubscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }
}

#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<JobId, Entry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        self.entries.insert(
            job.id,
            Entry {
                job,
                listeners: Vec::new(),
            },
        );
    }

    pub fn get(&self, job_id: JobId) -> Option<&Job> {
        self.entries.get(&job_id).map(|e| &e.job)
    }

    /// Every tracked job, oldest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.entries.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        self.entries
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .count()
    }

    /// Fold a backend event into the job it belongs to.
    ///
    /// Returns the event to publish, if any. Events for unknown or already
    /// terminal jobs are dropped, as are progress values that would go
    /// backwards.
    pub fn apply(&mut self, event: BackendEvent) -> Option<EngineEvent> {
        let job_id = event.job_id();
        let Some(entry) = self.entries.get_mut(&job_id) else {
            debug!(%job_id, "event for unknown job ignored");
            return None;
        };
        if entry.job.status.is_terminal() {
            debug!(%job_id, status = ?entry.job.status, "late event ignored");
            return None;
        }

        let job = &mut entry.job;
        let published = match event {
            BackendEvent::Progress(p) => {
                let percent = p.percent.clamp(0.0, 100.0);
                if job.progress.is_some_and(|last| percent < last) {
                    return None;
                }
                job.status = JobStatus::Downloading;
                job.progress = Some(percent);
                EngineEvent::Progress { job_id, percent }
            }
            BackendEvent::Destination { path, .. } => {
                job.output_path = Some(path);
                return None;
            }
            BackendEvent::Completed { .. } => {
                job.status = JobStatus::Completed;
                job.progress = Some(100.0);
                EngineEvent::Completed {
                    job_id,
                    output_path: job.output_path.clone(),
                }
            }
            BackendEvent::Failed { message, .. } => {
                job.status = JobStatus::Failed;
                job.error = Some(message.clone());
                EngineEvent::Failed { job_id, message }
            }
        };

        entry.publish(&published);
        Some(published)
    }

    /// `None` when the job is unknown or already terminal
    pub fn mark_cancelled(&mut self, job_id: JobId) -> Option<EngineEvent> {
        let entry = self.entries.get_mut(&job_id)?;
        if entry.job.status.is_terminal() {
            return None;
        }
        entry.job.status = JobStatus::Cancelled;
        let event = EngineEvent::Cancelled { job_id };
        entry.publish(&event);
        Some(event)
    }

    /// `None` when the job is unknown or already terminal
    pub fn mark_failed(&mut self, job_id: JobId, message: impl Into<String>) -> Option<EngineEvent> {
        let entry = self.entries.get_mut(&job_id)?;
        if entry.job.status.is_terminal() {
            return None;
        }
        let message = message.into();
        entry.job.status = JobStatus::Failed;
        entry.job.error = Some(message.clone());
        let event = EngineEvent::Failed { job_id, message };
        entry.publish(&event);
        Some(event)
    }

    /// Subscribe to one job. A job that already finished yields its terminal
    /// event once.
    pub fn subscribe(&mut self, job_id: JobId) -> Option<JobSubscription> {
        let entry = self.entries.get_mut(&job_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if entry.job.status.is_terminal() {
            let _ = tx.send(terminal_event(&entry.job));
        } else {
            entry.listeners.push(tx);
        }
        Some(JobSubscription { job_id, rx })
    }

    /// Remove a finished job. Active jobs stay.
    pub fn reap(&mut self, job_id: JobId) -> Option<Job> {
        if !self.entries.get(&job_id)?.job.status.is_terminal() {
            return None;
        }
        self.entries.remove(&job_id).map(|e| e.job)
    }

    pub fn reap_terminal(&mut self) -> Vec<Job> {
        let finished: Vec<JobId> = self
            .entries
            .values()
            .filter(|e| e.job.status.is_terminal())
            .map(|e| e.job.id)
            .collect();
        finished
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| e.job))
            .collect()
    }
}

fn terminal_event(job: &Job) -> EngineEvent {
    let job_id = job.id;
    match job.status {
        JobStatus::Completed => EngineEvent::Completed {
            job_id,
            output_path: job.output_path.clone(),
        },
        JobStatus::Cancelled => EngineEvent::Cancelled { job_id },
        _ => EngineEvent::Failed {
            job_id,
            message: job.error.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::{DownloadOptions, ProgressEvent};
    use std::path::PathBuf;

    fn downloading(registry: &mut JobRegistry) -> JobId {
        let mut job = Job::new(
            JobId::new(),
            "https://x/y",
            DownloadOptions::audio("/out").with_filename_template(Some("Song".into())),
        );
        job.status = JobStatus::Downloading;
        let id = job.id;
        registry.insert(job);
        id
    }

    fn progress(job_id: JobId, percent: f32) -> BackendEvent {
        BackendEvent::Progress(ProgressEvent { job_id, percent })
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut registry = JobRegistry::new();
        let id = downloading(&mut registry);

        assert!(registry.apply(progress(id, 40.0)).is_some());
        assert!(registry.apply(progress(id, 20.0)).is_none());
        assert_eq!(
            registry.apply(progress(id, 140.0)),
            Some(EngineEvent::Progress { job_id: id, percent: 100.0 })
        );
        assert_eq!(registry.get(id).unwrap().progress, Some(100.0));
    }

    #[test]
    fn test_terminal_states_absorb_late_events() {
        let mut registry = JobRegistry::new();
        let id = downloading(&mut registry);

        assert!(registry.mark_cancelled(id).is_some());
        assert!(registry.apply(BackendEvent::Completed { job_id: id }).is_none());
        assert!(registry.apply(progress(id, 99.0)).is_none());
        assert!(registry.mark_failed(id, "late").is_none());
        assert!(registry.mark_cancelled(id).is_none());
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_completion_uses_reported_destination() {
        let mut registry = JobRegistry::new();
        let id = downloading(&mut registry);
        assert_eq!(
            registry.get(id).unwrap().output_path,
            Some(PathBuf::from("/out/Song.m4a"))
        );

        assert!(registry
            .apply(BackendEvent::Destination {
                job_id: id,
                path: PathBuf::from("/out/Song.f140.m4a"),
            })
            .is_none());
        let event = registry.apply(BackendEvent::Completed { job_id: id });
        assert_eq!(
            event,
            Some(EngineEvent::Completed {
                job_id: id,
                output_path: Some(PathBuf::from("/out/Song.f140.m4a")),
            })
        );
        assert_eq!(registry.get(id).unwrap().progress, Some(100.0));
    }

    #[test]
    fn test_events_never_cross_jobs() {
        let mut registry = JobRegistry::new();
        let a = downloading(&mut registry);
        let b = downloading(&mut registry);

        registry.apply(BackendEvent::Failed {
            job_id: a,
            message: "boom".into(),
        });
        assert_eq!(registry.get(a).unwrap().status, JobStatus::Failed);
        assert_eq!(registry.get(a).unwrap().error.as_deref(), Some("boom"));
        assert_eq!(registry.get(b).unwrap().status, JobStatus::Downloading);
        assert_eq!(registry.active_ids(), vec![b]);

        assert!(registry.apply(BackendEvent::Completed { job_id: JobId::new() }).is_none());
        assert!(registry.mark_cancelled(JobId::new()).is_none());
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_subscription_ends_after_terminal_event() {
        let mut registry = JobRegistry::new();
        let id = downloading(&mut registry);
        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(sub.job_id(), id);

        registry.apply(progress(id, 10.0));
        registry.apply(BackendEvent::Completed { job_id: id });
        registry.apply(progress(id, 20.0));

        assert_eq!(sub.next().await, Some(EngineEvent::Progress { job_id: id, percent: 10.0 }));
        assert!(matches!(sub.next().await, Some(EngineEvent::Completed { .. })));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_subscribing_to_finished_job_replays_outcome() {
        let mut registry = JobRegistry::new();
        let id = downloading(&mut registry);
        registry.mark_failed(id, "timed out");

        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(
            sub.next().await,
            Some(EngineEvent::Failed {
                job_id: id,
                message: "timed out".into()
            })
        );
        assert_eq!(sub.next().await, None);
        assert!(registry.subscribe(JobId::new()).is_none());
    }

    #[test]
    fn test_reap_only_removes_finished_jobs() {
        let mut registry = JobRegistry::new();
        let active = downloading(&mut registry);
        let done = downloading(&mut registry);
        let cancelled = downloading(&mut registry);
        registry.apply(BackendEvent::Completed { job_id: done });
        registry.mark_cancelled(cancelled);

        assert!(registry.reap(active).is_none());
        assert_eq!(registry.reap(done).map(|j| j.id), Some(done));
        assert!(registry.reap(done).is_none());

        let reaped = registry.reap_terminal();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, cancelled);
        assert_eq!(registry.list().len(), 1);
    }
}
