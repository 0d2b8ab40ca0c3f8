//! Commit and tag annotations
//!
//! Every commit Porch writes ends with a trailer line
//! `kpt:{"package":..,"workspaceName":..,"revision":..,"task":{..}}`.
//! The task list of a revision is rebuilt by following first parents while
//! the trailer names the same package and workspace.

use git2::{Commit, Repository};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Task;

const TRAILER_PREFIX: &str = "kpt:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAnnotation {
    pub package: String,
    pub workspace_name: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl CommitAnnotation {
    pub fn new(package: &str, workspace: &str, revision: &str, task: Option<Task>) -> Self {
        Self {
            package: package.to_string(),
            workspace_name: workspace.to_string(),
            revision: revision.to_string(),
            task,
        }
    }

    fn same_revision(&self, other: &CommitAnnotation) -> bool {
        self.package == other.package && self.workspace_name == other.workspace_name
    }
}

/// Commit or tag message carrying `annotation`
pub fn format_message(summary: &str, annotation: &CommitAnnotation) -> Result<String> {
    Ok(format!(
        "{summary}\n\n{TRAILER_PREFIX}{}\n",
        serde_json::to_string(annotation)?
    ))
}

/// Annotation of a commit or tag message, if it has one
pub fn parse_annotation(message: &str) -> Option<CommitAnnotation> {
    message
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(TRAILER_PREFIX))
        .and_then(|json| serde_json::from_str(json).ok())
}

/// Summary line for a step commit
pub fn step_summary(package: &str, task: Option<&Task>) -> String {
    match task {
        Some(task) => format!("{package}: {}", task.task_type()),
        None => format!("{package}: edit resources"),
    }
}

/// Tasks recorded on the first-parent chain ending at `head`
pub fn tasks_of(repo: &Repository, head: &Commit<'_>) -> Result<Vec<Task>> {
    let Some(anchor) = head.message().and_then(parse_annotation) else {
        return Ok(Vec::new());
    };
    let mut tasks = Vec::new();
    let mut current = Some(head.clone());
    while let Some(commit) = current {
        let annotation = commit.message().and_then(parse_annotation);
        match annotation {
            Some(a) if a.same_revision(&anchor) => {
                if let Some(task) = a.task {
                    tasks.push(task);
                }
            }
            _ => break,
        }
        current = match commit.parent_id(0) {
            Ok(id) => Some(repo.find_commit(id)?),
            Err(_) => None,
        };
    }
    tasks.reverse();
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::{InitTask, PatchTask};
    use tempfile::TempDir;

    fn commit(repo: &Repository, parent: Option<git2::Oid>, message: &str) -> git2::Oid {
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parents: Vec<git2::Commit<'_>> = parent.map(|p| repo.find_commit(p).unwrap()).into_iter().collect();
        let refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        repo.commit(None, &sig, &sig, message, &tree, &refs).unwrap()
    }

    #[test]
    fn test_message_round_trip() {
        let annotation = CommitAnnotation::new("pkg-a", "ws1", "", Some(Task::Init(InitTask::default())));
        let message = format_message("pkg-a: init", &annotation).unwrap();
        assert!(message.starts_with("pkg-a: init\n\nkpt:{"));
        assert_eq!(parse_annotation(&message), Some(annotation));
        assert_eq!(parse_annotation("plain commit"), None);
    }

    #[test]
    fn test_tasks_follow_first_parents_of_same_revision() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init_bare(temp.path()).unwrap();
        let base = commit(&repo, None, "unrelated base");
        let msg = |task: Option<Task>| format_message("s", &CommitAnnotation::new("pkg-a", "ws1", "", task)).unwrap();
        let c1 = commit(&repo, Some(base), &msg(Some(Task::Init(InitTask::default()))));
        let c2 = commit(&repo, Some(c1), &msg(None));
        let c3 = commit(&repo, Some(c2), &msg(Some(Task::Patch(PatchTask::default()))));
        let head = repo.find_commit(c3).unwrap();
        let tasks = tasks_of(&repo, &head).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(matches!(tasks[0], Task::Init(_)));
        assert!(matches!(tasks[1], Task::Patch(_)));
    }

    #[test]
    fn test_plain_commit_has_no_tasks() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init_bare(temp.path()).unwrap();
        let c = commit(&repo, None, "hand-made commit");
        assert!(tasks_of(&repo, &repo.find_commit(c).unwrap()).unwrap().is_empty());
    }
}
