//! Run history shared between the orchestrator and its readers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{FinalResult, PipelineRun, StageResult, update_run_final, update_run_stage};

/// Default number of runs kept in history.
pub const MAX_RUNS: usize = 20;

#[derive(Debug)]
struct RegistryInner {
    runs: Vec<PipelineRun>,
    selected_run_id: Option<String>,
    max_runs: usize,
}

/// Most-recent-first, capped collection of runs.
///
/// Cloning the handle shares the same history. Every read returns an owned
/// snapshot, so a caller inspecting a run never observes later updates to
/// it, and updates go through id-addressed closures that touch exactly one
/// unit.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(MAX_RUNS)
    }
}

impl RunRegistry {
    pub fn new(max_runs: usize) -> Self {
        Self::with_runs(Vec::new(), None, max_runs)
    }

    /// Seed the registry from stored history, enforcing the cap.
    pub fn with_runs(
        mut runs: Vec<PipelineRun>,
        selected_run_id: Option<String>,
        max_runs: usize,
    ) -> Self {
        let max_runs = max_runs.max(1);
        runs.truncate(max_runs);
        let selected_run_id = selected_run_id.filter(|id| runs.iter().any(|r| &r.id == id));
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                runs,
                selected_run_id,
                max_runs,
            })),
        }
    }

    /// Insert a run at the head, evicting the oldest beyond the cap.
    pub async fn insert(&self, run: PipelineRun) {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(0, run);
        let cap = inner.max_runs;
        if inner.runs.len() > cap {
            let evicted: Vec<String> = inner.runs.drain(cap..).map(|r| r.id).collect();
            debug!(evicted = ?evicted, "Evicted runs beyond history cap");
            if inner
                .selected_run_id
                .as_ref()
                .is_some_and(|id| evicted.contains(id))
            {
                inner.selected_run_id = None;
            }
        }
    }

    pub async fn update_stage(
        &self,
        run_id: &str,
        result_id: &str,
        update: impl FnOnce(&mut StageResult),
    ) -> bool {
        let mut inner = self.inner.lock().await;
        update_run_stage(&mut inner.runs, run_id, result_id, update)
    }

    pub async fn update_final(&self, run_id: &str, update: impl FnOnce(&mut FinalResult)) -> bool {
        let mut inner = self.inner.lock().await;
        update_run_final(&mut inner.runs, run_id, update)
    }

    /// Independent snapshot of one run.
    pub async fn view(&self, run_id: &str) -> Option<PipelineRun> {
        let inner = self.inner.lock().await;
        inner.runs.iter().find(|r| r.id == run_id).cloned()
    }

    /// Mark a run as selected and return a snapshot of it. Selecting never
    /// mutates the run.
    pub async fn select(&self, run_id: &str) -> Option<PipelineRun> {
        let mut inner = self.inner.lock().await;
        let run = inner.runs.iter().find(|r| r.id == run_id).cloned()?;
        inner.selected_run_id = Some(run.id.clone());
        Some(run)
    }

    pub async fn selected_run_id(&self) -> Option<String> {
        self.inner.lock().await.selected_run_id.clone()
    }

    pub async fn selected(&self) -> Option<PipelineRun> {
        let inner = self.inner.lock().await;
        let id = inner.selected_run_id.as_ref()?;
        inner.runs.iter().find(|r| &r.id == id).cloned()
    }

    /// Snapshot of every run, most recent first.
    pub async fn runs(&self) -> Vec<PipelineRun> {
        self.inner.lock().await.runs.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.runs.is_empty()
    }

    pub async fn max_runs(&self) -> usize {
        self.inner.lock().await.max_runs
    }

    /// Drop every run and the selection together.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.runs.clear();
        inner.selected_run_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{ModelSelection, StageStatus, UnitState};
    use chrono::Utc;

    fn run(id: &str) -> PipelineRun {
        PipelineRun {
            id: id.to_string(),
            workflow_id: "default".into(),
            stages_config: vec![],
            models: ModelSelection::default(),
            problem: "p".into(),
            created_at: Utc::now(),
            stages: vec![StageResult {
                id: format!("{}:a:m1:0", id),
                stage_id: "a".into(),
                stage_label: "A".into(),
                model_id: "m1".into(),
                agent_label: "m1".into(),
                system_prompt: String::new(),
                state: UnitState::default(),
            }],
            final_result: None,
        }
    }

    #[tokio::test]
    async fn test_insert_is_most_recent_first_and_capped() {
        let registry = RunRegistry::new(3);
        for i in 0..5 {
            registry.insert(run(&format!("r{}", i))).await;
        }
        let ids: Vec<String> = registry.runs().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_default_cap_is_twenty() {
        let registry = RunRegistry::default();
        for i in 0..25 {
            registry.insert(run(&format!("r{}", i))).await;
        }
        assert_eq!(registry.len().await, MAX_RUNS);
        assert_eq!(registry.runs().await.last().unwrap().id, "r5");
    }

    #[tokio::test]
    async fn test_view_is_independent_of_later_updates() {
        let registry = RunRegistry::default();
        registry.insert(run("r1")).await;

        let snapshot = registry.select("r1").await.unwrap();
        registry
            .update_stage("r1", "r1:a:m1:0", |r| r.state.start(Utc::now()))
            .await;

        assert_eq!(snapshot.stages[0].status(), StageStatus::Pending);
        let live = registry.view("r1").await.unwrap();
        assert_eq!(live.stages[0].status(), StageStatus::Running);
    }

    #[tokio::test]
    async fn test_update_unknown_ids_returns_false() {
        let registry = RunRegistry::default();
        registry.insert(run("r1")).await;
        assert!(!registry.update_stage("r2", "r1:a:m1:0", |_| {}).await);
        assert!(!registry.update_stage("r1", "nope", |_| {}).await);
        assert!(!registry.update_final("r1", |_| {}).await);
    }

    #[tokio::test]
    async fn test_clear_drops_runs_and_selection() {
        let registry = RunRegistry::default();
        registry.insert(run("r1")).await;
        registry.select("r1").await;
        assert_eq!(registry.selected_run_id().await.as_deref(), Some("r1"));

        registry.clear().await;
        assert!(registry.is_empty().await);
        assert!(registry.selected_run_id().await.is_none());
        assert!(registry.selected().await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_clears_stale_selection() {
        let registry = RunRegistry::new(1);
        registry.insert(run("old")).await;
        registry.select("old").await;
        registry.insert(run("new")).await;
        assert!(registry.selected_run_id().await.is_none());
    }

    #[tokio::test]
    async fn test_with_runs_truncates_and_validates_selection() {
        let runs = vec![run("a"), run("b"), run("c")];
        let registry = RunRegistry::with_runs(runs, Some("c".into()), 2);
        assert_eq!(registry.len().await, 2);
        assert!(registry.selected_run_id().await.is_none());

        let registry = RunRegistry::with_runs(vec![run("a")], Some("a".into()), 2);
        assert_eq!(registry.selected().await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_clones_share_history() {
        let registry = RunRegistry::default();
        let handle = registry.clone();
        handle.insert(run("r1")).await;
        assert_eq!(registry.len().await, 1);
    }
}
