use std::path::Path;

/// The config filename the agent runtime writes inside each team directory.
pub const TEAM_CONFIG_FILE: &str = "config.json";

/// Subdirectory of a team directory holding one inbox file per agent.
pub const INBOX_DIR: &str = "inboxes";

/// Typed descriptor for a path beneath the watched roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathClass {
    /// `teams_root/<team>/config.json`
    TeamConfig { team: String },
    /// `teams_root/<team>/inboxes/<agent>.json`
    Inbox { team: String, agent: String },
    /// `tasks_root/<team>/<task_id>.json`
    Task { team: String, task_id: String },
    /// Anything else, including every non-JSON file.
    Ignored,
}

/// Maps raw filesystem paths to [`PathClass`] values.
///
/// Pure and total: every input maps to exactly one class and classification
/// never fails. Separators are normalized before matching so the mapping is
/// platform independent.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    teams_root: String,
    tasks_root: String,
}

fn normalize(path: &Path) -> String {
    let mut s = path.to_string_lossy().replace('\\', "/");
    while s.ends_with('/') {
        s.pop();
    }
    s
}

fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    path.strip_prefix(root)?.strip_prefix('/')
}

fn json_stem(file: &str) -> Option<&str> {
    let stem = file.strip_suffix(".json")?;
    (!stem.is_empty()).then_some(stem)
}

impl PathClassifier {
    pub fn new(teams_root: &Path, tasks_root: &Path) -> Self {
        Self {
            teams_root: normalize(teams_root),
            tasks_root: normalize(tasks_root),
        }
    }

    pub fn classify(&self, path: &Path) -> PathClass {
        let path = normalize(path);

        if let Some(rel) = strip_root(&path, &self.teams_root) {
            return Self::classify_team_path(rel);
        }
        if let Some(rel) = strip_root(&path, &self.tasks_root) {
            return Self::classify_task_path(rel);
        }
        PathClass::Ignored
    }

    fn classify_team_path(rel: &str) -> PathClass {
        let segments: Vec<&str> = rel.split('/').collect();
        match segments.as_slice() {
            [team, file] if *file == TEAM_CONFIG_FILE && !team.is_empty() => {
                PathClass::TeamConfig {
                    team: (*team).to_string(),
                }
            }
            [team, dir, file] if *dir == INBOX_DIR && !team.is_empty() => match json_stem(file) {
                Some(agent) => PathClass::Inbox {
                    team: (*team).to_string(),
                    agent: agent.to_string(),
                },
                None => PathClass::Ignored,
            },
            _ => PathClass::Ignored,
        }
    }

    fn classify_task_path(rel: &str) -> PathClass {
        let segments: Vec<&str> = rel.split('/').collect();
        match segments.as_slice() {
            [team, file] if !team.is_empty() => match json_stem(file) {
                Some(task_id) => PathClass::Task {
                    team: (*team).to_string(),
                    task_id: task_id.to_string(),
                },
                None => PathClass::Ignored,
            },
            _ => PathClass::Ignored,
        }
    }
}
