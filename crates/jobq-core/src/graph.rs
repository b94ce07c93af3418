//! Read-only view over job dependency edges.
//!
//! Jobs only store outgoing edges ("jobs I depend on"). The view indexes the
//! reverse direction once so dependents can be looked up by id.

use std::collections::BTreeMap;

use crate::{Job, JobId};

/// Adjacency lookup over a set of loaded jobs.
#[derive(Debug, Default)]
pub struct DependencyView<'a> {
    jobs: BTreeMap<JobId, &'a Job>,
    dependents: BTreeMap<JobId, Vec<JobId>>,
}

impl<'a> DependencyView<'a> {
    pub fn new(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let jobs: BTreeMap<JobId, &'a Job> = jobs.into_iter().map(|j| (j.id, j)).collect();

        let mut dependents: BTreeMap<JobId, Vec<JobId>> = BTreeMap::new();
        // BTreeMap iteration is id-ordered, so each dependents list is sorted.
        for job in jobs.values() {
            for dep in &job.dependencies {
                let list = dependents.entry(*dep).or_default();
                if list.last() != Some(&job.id) {
                    list.push(job.id);
                }
            }
        }

        Self { jobs, dependents }
    }

    fn get(&self, id: JobId) -> Option<&'a Job> {
        self.jobs.get(&id).copied()
    }

    /// Jobs in the view that depend on `id`, lowest id first.
    pub fn dependents(&self, id: JobId) -> Vec<&'a Job> {
        self.dependents
            .get(&id)
            .map(|ids| ids.iter().filter_map(|d| self.get(*d)).collect())
            .unwrap_or_default()
    }

    /// Dependencies of `job` that have not finished. Dependencies missing
    /// from the view count as unmet.
    pub fn unmet_dependencies(&self, job: &Job) -> Vec<JobId> {
        job.dependencies
            .iter()
            .filter(|dep| {
                !self
                    .get(**dep)
                    .map(|d| d.state.satisfies_dependency())
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// A job may start once every dependency has finished.
    pub fn is_startable(&self, job: &Job) -> bool {
        self.unmet_dependencies(job).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobState;
    use chrono::Utc;

    fn make_job(id: i64, state: JobState, deps: &[i64]) -> Job {
        Job {
            id: JobId::new(id),
            command: format!("job-{}", id),
            args: vec![],
            state,
            dependencies: deps.iter().copied().map(JobId::new).collect(),
            created_at: Utc::now(),
            started_at: None,
            closed_at: None,
        }
    }

    fn ids(jobs: &[&Job]) -> Vec<i64> {
        jobs.iter().map(|j| j.id.get()).collect()
    }

    #[test]
    fn test_dependents_are_reverse_edges() {
        let jobs = vec![
            make_job(1, JobState::Pending, &[]),
            make_job(2, JobState::Pending, &[1]),
            make_job(3, JobState::Pending, &[1, 2]),
        ];
        let view = DependencyView::new(&jobs);

        assert_eq!(ids(&view.dependents(JobId::new(1))), vec![2, 3]);
        assert_eq!(ids(&view.dependents(JobId::new(2))), vec![3]);
        assert!(view.dependents(JobId::new(3)).is_empty());
    }

    #[test]
    fn test_startable_requires_finished_dependencies() {
        let jobs = vec![
            make_job(1, JobState::Finished, &[]),
            make_job(2, JobState::Running, &[]),
            make_job(3, JobState::Pending, &[1]),
            make_job(4, JobState::Pending, &[1, 2]),
            make_job(5, JobState::Pending, &[]),
        ];
        let view = DependencyView::new(&jobs);

        assert!(view.is_startable(&jobs[2]));
        assert!(!view.is_startable(&jobs[3]));
        assert_eq!(view.unmet_dependencies(&jobs[3]), vec![JobId::new(2)]);
        assert!(view.is_startable(&jobs[4]));
    }

    #[test]
    fn test_missing_dependency_is_unmet() {
        let jobs = vec![make_job(2, JobState::Pending, &[1])];
        let view = DependencyView::new(&jobs);
        assert!(!view.is_startable(&jobs[0]));
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let jobs = vec![
            make_job(1, JobState::Failed, &[]),
            make_job(2, JobState::Pending, &[1]),
        ];
        let view = DependencyView::new(&jobs);
        assert!(!view.is_startable(&jobs[1]));
    }
}
