use std::fs;
use std::path::PathBuf;
use anyhow::{Context, Result};
use log::{debug, info};

use crate::task::Task;

/// Durable, bounded-retention persistence of task snapshots.
///
/// One JSON file holds the most recent N tasks by creation time; older
/// snapshots are dropped on every write. Tasks beyond the retention window
/// are deliberately unavailable after a restart.
pub struct TaskStore {
    path: PathBuf,
    retention: usize,
}

impl TaskStore {
    pub fn new(path: PathBuf, retention: usize) -> Self {
        Self { path, retention }
    }

    /// Persist all tasks, keeping only the most recently created N
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let mut recent: Vec<&Task> = tasks.iter().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(self.retention);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&recent)
            .context("Failed to serialize task snapshots")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write task state file: {}", self.path.display()))?;
        debug!("persisted {} task snapshot(s) to {}", recent.len(), self.path.display());
        Ok(())
    }

    /// Rehydrate task snapshots on process start; missing file means empty history
    pub fn load(&self) -> Result<Vec<Task>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read task state file: {}", self.path.display()))?;
        let tasks: Vec<Task> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task state file: {}", self.path.display()))?;
        info!("loaded {} historical task record(s)", tasks.len());
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskConfig;
    use chrono::Duration;

    fn temp_state_file() -> PathBuf {
        std::env::temp_dir().join(format!("matrixeval-store-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn load_of_missing_file_is_empty() {
        let store = TaskStore::new(temp_state_file(), 100);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_state_file();
        let store = TaskStore::new(path.clone(), 100);
        let tasks = vec![
            Task::new(TaskConfig::default(), 0),
            Task::new(TaskConfig::default(), 1),
        ];
        store.save(&tasks).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        fs::remove_file(path).ok();
    }

    #[test]
    fn retention_keeps_only_most_recent_tasks() {
        let path = temp_state_file();
        let store = TaskStore::new(path.clone(), 3);

        // Spread creation times so the ordering is unambiguous
        let mut tasks = Vec::new();
        let base = chrono::Utc::now();
        for i in 0..7 {
            let mut task = Task::new(TaskConfig::default(), i);
            task.created_at = base + Duration::seconds(i as i64);
            tasks.push(task);
        }
        store.save(&tasks).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        let newest_ids: Vec<&str> = tasks[4..].iter().rev().map(|t| t.id.as_str()).collect();
        let loaded_ids: Vec<&str> = loaded.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(loaded_ids, newest_ids);
        fs::remove_file(path).ok();
    }
}
