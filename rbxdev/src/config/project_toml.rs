use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

pub const CONFIG_FILE: &str = "rbxdev.toml";
pub const DEFAULT_SERVE_PORT: u16 = 34872;

/// Root configuration from rbxdev.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectToml {
    #[serde(default)]
    pub project: ProjectSection,

    #[serde(default)]
    pub server: ServerSection,

    /// [scripts] section - per-command shell commands
    #[serde(default)]
    pub scripts: HashMap<String, String>,

    #[serde(default)]
    pub syncback: SyncbackSection,

    #[serde(default)]
    pub typegen: TypegenSection,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    /// roblox-ts sources compiled to Luau before rojo sees them
    Rbxts,
    #[default]
    Luau,
}

/// [project] section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSection {
    #[serde(rename = "type", default)]
    pub kind: ProjectType,

    /// Rojo project file, relative to the project root
    #[serde(default = "default_rojo_project")]
    pub rojo_project: String,

    /// Built place file, relative to the project root
    #[serde(default = "default_output")]
    pub output: String,
}

/// [server] section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// First port tried for `rojo serve`
    #[serde(default = "default_port")]
    pub port: u16,
}

/// [syncback] section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncbackSection {
    /// Run syncback after Studio closes in `rbxdev open`
    #[serde(default)]
    pub on_close: bool,

    /// Project file used for syncback (defaults to project.rojo_project)
    pub project: Option<String>,
}

/// [typegen] section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypegenSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_typegen_output")]
    pub output: String,
}

fn default_rojo_project() -> String {
    "default.project.json".to_string()
}

fn default_output() -> String {
    "build/game.rbxl".to_string()
}

fn default_port() -> u16 {
    DEFAULT_SERVE_PORT
}

fn default_typegen_output() -> String {
    "include/types.d.ts".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            kind: ProjectType::default(),
            rojo_project: default_rojo_project(),
            output: default_output(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for TypegenSection {
    fn default() -> Self {
        Self {
            enabled: false,
            output: default_typegen_output(),
        }
    }
}

impl ProjectToml {
    /// Load rbxdev.toml from a directory
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Err(ConfigError::Missing(dir.as_ref().to_path_buf()));
        }

        Self::load_from_file(&path)
    }

    /// Load rbxdev.toml from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config = Self::parse_at(&content, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse rbxdev.toml content
    pub fn parse(content: &str) -> Result<Self> {
        Self::parse_at(content, Path::new(CONFIG_FILE))
    }

    fn parse_at(content: &str, path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<()> {
        validate_output(&self.project.output)?;

        if self.project.rojo_project.trim().is_empty() {
            return Err(ConfigError::Validation(
                "project.rojo_project must not be empty".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.typegen.enabled && self.typegen.output.trim().is_empty() {
            return Err(ConfigError::Validation(
                "typegen.output must not be empty when typegen is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

fn validate_output(output: &str) -> Result<()> {
    if output.trim().is_empty() {
        return Err(ConfigError::Validation(
            "project.output must not be empty".to_string(),
        ));
    }

    let is_place = PathBuf::from(output)
        .extension()
        .is_some_and(|ext| ext == "rbxl" || ext == "rbxlx");
    if !is_place {
        return Err(ConfigError::Validation(format!(
            "project.output '{output}' must be a .rbxl or .rbxlx place file"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_empty_file() {
        let config = ProjectToml::parse("").unwrap();
        assert_eq!(config, ProjectToml::default());
        assert_eq!(config.server.port, 34872);
        assert_eq!(config.project.kind, ProjectType::Luau);
    }

    #[test]
    fn test_parse_complete_config() {
        let toml = r#"
[project]
type = "rbxts"
rojo_project = "game.project.json"
output = "out/place.rbxlx"

[server]
port = 35000

[scripts]
build = "npm run build"
watch = "npm run watch"

[syncback]
on_close = true
project = "syncback.project.json"

[typegen]
enabled = true
output = "types/generated.d.ts"
"#;
        let config = ProjectToml::parse(toml).unwrap();
        assert_eq!(config.project.kind, ProjectType::Rbxts);
        assert_eq!(config.project.rojo_project, "game.project.json");
        assert_eq!(config.project.output, "out/place.rbxlx");
        assert_eq!(config.server.port, 35000);
        assert_eq!(config.script("build"), Some("npm run build"));
        assert_eq!(config.script("watch"), Some("npm run watch"));
        assert!(config.syncback.on_close);
        assert_eq!(
            config.syncback.project.as_deref(),
            Some("syncback.project.json")
        );
        assert!(config.typegen.enabled);
        assert_eq!(config.typegen.output, "types/generated.d.ts");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_rejects_unknown_project_type() {
        let err = ProjectToml::parse("[project]\ntype = \"python\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(..)), "got {err}");
    }

    #[test]
    fn test_parse_rejects_unknown_section() {
        let err = ProjectToml::parse("[deploy]\ntarget = \"prod\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(..)), "got {err}");
    }

    #[test]
    fn test_blank_script_is_ignored() {
        let config = ProjectToml::parse("[scripts]\nwatch = \"  \"\n").unwrap();
        assert_eq!(config.script("watch"), None);
        assert_eq!(config.script("build"), None);
    }

    #[test]
    fn test_validate_output_requires_place_extension() {
        let config = ProjectToml::parse("[project]\noutput = \"build/game.zip\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(".rbxl"), "got {err}");

        let config = ProjectToml::parse("[project]\noutput = \"\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config = ProjectToml::parse("[server]\nport = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_dir_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ProjectToml::load_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_load_from_dir_validates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[project]\noutput = \"game.txt\"\n",
        )
        .unwrap();
        let err = ProjectToml::load_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
