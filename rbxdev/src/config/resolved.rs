use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};
use super::project_toml::{CONFIG_FILE, ProjectToml, ProjectType};
use crate::paths;

/// Project configuration with every path joined against the project root.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    pub project_type: ProjectType,
    pub rojo_project: PathBuf,
    pub output: PathBuf,
    pub port: u16,
    pub syncback_project: PathBuf,
    pub syncback_on_close: bool,
    pub typegen_output: Option<PathBuf>,
    pub toml: ProjectToml,
}

impl ResolvedConfig {
    pub fn from_toml(root: impl Into<PathBuf>, toml: ProjectToml) -> Self {
        let root = root.into();
        let rojo_project = root.join(&toml.project.rojo_project);
        let syncback_project = toml
            .syncback
            .project
            .as_deref()
            .map(|p| root.join(p))
            .unwrap_or_else(|| rojo_project.clone());
        let typegen_output = toml
            .typegen
            .enabled
            .then(|| root.join(&toml.typegen.output));

        Self {
            project_type: toml.project.kind,
            output: root.join(&toml.project.output),
            port: toml.server.port,
            syncback_on_close: toml.syncback.on_close,
            rojo_project,
            syncback_project,
            typegen_output,
            root,
            toml,
        }
    }

    /// Load from an explicit config file, or search upward from `dir` (default:
    /// the current directory) for rbxdev.toml.
    pub fn load(config: Option<&Path>, dir: Option<&Path>) -> Result<Self> {
        if let Some(file) = config {
            let toml = ProjectToml::load_from_file(file)?;
            let root = file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(Self::from_toml(root, toml));
        }

        let start = match dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| ConfigError::FileRead(PathBuf::from("."), e))?,
        };
        let root = paths::find_project_root(&start, CONFIG_FILE)
            .ok_or_else(|| ConfigError::Missing(start.clone()))?;
        let toml = ProjectToml::load_from_dir(&root)?;
        Ok(Self::from_toml(root, toml))
    }

    pub fn is_rbxts(&self) -> bool {
        self.project_type == ProjectType::Rbxts
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.toml.script(name)
    }

    pub fn server_lock_path(&self) -> PathBuf {
        paths::server_lock_path(&self.output)
    }

    pub fn tasks_lock_path(&self) -> PathBuf {
        paths::tasks_lock_path(&self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_paths_against_root() {
        let toml = ProjectToml::parse(
            r#"
[project]
output = "build/game.rbxl"

[typegen]
enabled = true
"#,
        )
        .unwrap();
        let config = ResolvedConfig::from_toml("/work/game", toml);

        assert_eq!(config.output, PathBuf::from("/work/game/build/game.rbxl"));
        assert_eq!(
            config.rojo_project,
            PathBuf::from("/work/game/default.project.json")
        );
        assert_eq!(config.syncback_project, config.rojo_project);
        assert_eq!(
            config.typegen_output,
            Some(PathBuf::from("/work/game/include/types.d.ts"))
        );
        assert_eq!(
            config.server_lock_path(),
            PathBuf::from("/work/game/build/game.rbxl.rojo.lock")
        );
    }

    #[test]
    fn syncback_project_overrides_rojo_project() {
        let toml = ProjectToml::parse("[syncback]\nproject = \"sync.project.json\"\n").unwrap();
        let config = ResolvedConfig::from_toml("/p", toml);
        assert_eq!(config.syncback_project, PathBuf::from("/p/sync.project.json"));
        assert!(config.typegen_output.is_none());
    }

    #[test]
    fn load_searches_parent_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[server]\nport = 40000\n").unwrap();
        let nested = dir.path().join("src").join("client");
        std::fs::create_dir_all(&nested).unwrap();

        let config = ResolvedConfig::load(None, Some(&nested)).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.port, 40000);
    }

    #[test]
    fn load_with_explicit_config_uses_its_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "[project]\ntype = \"rbxts\"\n").unwrap();

        let config = ResolvedConfig::load(Some(&file), None).unwrap();
        assert_eq!(config.root, dir.path());
        assert!(config.is_rbxts());
    }

    #[test]
    fn load_without_config_anywhere_is_missing() {
        let dir = TempDir::new().unwrap();
        let err = ResolvedConfig::load(None, Some(dir.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
