//! Read-only collaborators consumed by the delegation engine: secrets,
//! project knowledge and folder preferences.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use devfleet_common::config::FolderSection;
use devfleet_supervisor::FolderPreferences;

#[async_trait]
pub trait SecretSource: Send + Sync {
    /// `None` when the secret is not available.
    async fn secret(&self, name: &str) -> Option<String>;
}

/// Secrets taken from the daemon's own environment.
#[derive(Clone, Debug, Default)]
pub struct EnvSecretSource;

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Knowledge snippets for a folder; the global set when `folder` is `None`.
    async fn knowledge(&self, folder: Option<&str>) -> Vec<String>;
}

/// Folder preferences plus the directory agents run in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedFolder {
    pub preferences: FolderPreferences,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
pub trait PreferenceSource: Send + Sync {
    async fn resolve(&self, folder: Option<&str>) -> ResolvedFolder;
}

/// Knowledge and preferences from the `[folders.<name>]` config sections.
#[derive(Clone, Debug, Default)]
pub struct StaticFolders {
    folders: BTreeMap<String, FolderSection>,
    global_knowledge: Vec<String>,
}

impl StaticFolders {
    pub fn new(folders: BTreeMap<String, FolderSection>) -> Self {
        Self {
            folders,
            global_knowledge: Vec::new(),
        }
    }

    pub fn with_global_knowledge(mut self, knowledge: Vec<String>) -> Self {
        self.global_knowledge = knowledge;
        self
    }
}

#[async_trait]
impl KnowledgeSource for StaticFolders {
    async fn knowledge(&self, folder: Option<&str>) -> Vec<String> {
        let mut out = self.global_knowledge.clone();
        if let Some(section) = folder.and_then(|name| self.folders.get(name)) {
            out.extend(section.knowledge.iter().cloned());
        }
        out.retain(|snippet| !snippet.trim().is_empty());
        out
    }
}

#[async_trait]
impl PreferenceSource for StaticFolders {
    async fn resolve(&self, folder: Option<&str>) -> ResolvedFolder {
        match folder.and_then(|name| self.folders.get(name)) {
            Some(section) => ResolvedFolder {
                preferences: FolderPreferences {
                    env: section.env.clone(),
                    ports: section.ports.clone(),
                },
                working_dir: (!section.path.as_os_str().is_empty())
                    .then(|| section.path.clone()),
            },
            None => ResolvedFolder::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folders() -> StaticFolders {
        let mut map = BTreeMap::new();
        map.insert(
            "web".to_string(),
            FolderSection {
                path: PathBuf::from("/srv/web"),
                env: BTreeMap::from([("NODE_ENV".to_string(), "development".to_string())]),
                ports: BTreeMap::from([("PORT".to_string(), 3000)]),
                knowledge: vec!["Use pnpm.".into(), "  ".into()],
            },
        );
        StaticFolders::new(map).with_global_knowledge(vec!["Be concise.".into()])
    }

    #[tokio::test]
    async fn knowledge_merges_global_and_folder() {
        let folders = folders();
        assert_eq!(
            folders.knowledge(Some("web")).await,
            vec!["Be concise.".to_string(), "Use pnpm.".to_string()]
        );
        assert_eq!(folders.knowledge(None).await, vec!["Be concise.".to_string()]);
    }

    #[tokio::test]
    async fn preferences_for_known_and_unknown_folders() {
        let folders = folders();
        let web = folders.resolve(Some("web")).await;
        assert_eq!(web.working_dir, Some(PathBuf::from("/srv/web")));
        assert_eq!(web.preferences.ports.get("PORT"), Some(&3000));
        assert_eq!(folders.resolve(Some("api")).await, ResolvedFolder::default());
    }
}
