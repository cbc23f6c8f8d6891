use std::collections::HashSet;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Operating mode of the runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// Claiming and executing jobs.
    Running,
    /// Finishing running jobs, claiming nothing new (SIGUSR1).
    Draining,
    /// Shutting down (SIGTERM/SIGINT).
    Stopping,
    Stopped,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusFile {
    mode: RunnerMode,
    active_runs: Vec<String>,
    updated_at: String,
    pid: u32,
}

struct State {
    mode: RunnerMode,
    active: HashSet<Uuid>,
}

/// Mirrors the runner's mode and active runs to a small JSON file so
/// operators (and the deploy tooling) can observe it without an API.
pub struct StatusTracker {
    path: PathBuf,
    state: Mutex<State>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(State {
                mode: RunnerMode::Running,
                active: HashSet::new(),
            }),
        }
    }

    pub async fn write_initial(&self) {
        self.persist().await;
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        {
            let mut state = self.state.lock().await;
            state.mode = mode;
        }
        self.persist().await;
    }

    pub async fn add_run(&self, run_id: Uuid) {
        {
            let mut state = self.state.lock().await;
            state.active.insert(run_id);
        }
        self.persist().await;
    }

    pub async fn remove_run(&self, run_id: Uuid) {
        {
            let mut state = self.state.lock().await;
            state.active.remove(&run_id);
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let (mode, mut active) = {
            let state = self.state.lock().await;
            (
                state.mode,
                state
                    .active
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>(),
            )
        };
        active.sort();

        let file = StatusFile {
            mode,
            active_runs: active,
            updated_at: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
        };
        let Ok(content) = serde_json::to_vec_pretty(&file) else {
            return;
        };
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, &content).await {
            warn!(error = %e, "status write failed");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "status rename failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_file_tracks_mode_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;
        let run = Uuid::new_v4();
        tracker.add_run(run).await;
        tracker.set_mode(RunnerMode::Draining).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["mode"], "draining");
        assert_eq!(json["activeRuns"][0], run.to_string());

        tracker.remove_run(run).await;
        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(json["activeRuns"].as_array().unwrap().is_empty());
    }
}
