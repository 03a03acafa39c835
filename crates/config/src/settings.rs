// Debugger settings
// Loaded from ~/.config/petri-debug/settings.json (or a .toml file given explicitly)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Target language of the generated net and of evaluation stubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[default]
    Cpp,
    Lua,
}

impl Language {
    /// Source file extension for generated code
    pub fn source_extension(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Lua => "lua",
        }
    }

    /// Extension of the loadable artifact built from a source file
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            Language::C | Language::Cpp => {
                if cfg!(target_os = "macos") {
                    "dylib"
                } else {
                    "so"
                }
            }
            Language::Lua => "lua",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerSettings {
    // Debug peer
    #[serde(rename = "debugger.hostname")]
    pub hostname: String,
    #[serde(rename = "debugger.port")]
    pub port: u16,
    #[serde(rename = "debugger.connectTimeoutMs")]
    pub connect_timeout_ms: u64,

    // Code generation
    #[serde(rename = "codegen.language")]
    pub language: Language,
    /// Prefix of generated symbols (`<prefix>_evaluate`)
    #[serde(rename = "codegen.prefix")]
    pub prefix: String,

    // Compiler
    #[serde(rename = "compiler.invocation")]
    pub compiler: String,
    #[serde(rename = "compiler.flags")]
    pub compiler_flags: Vec<String>,
    /// Directory for the compiled net; empty means next to the source
    #[serde(rename = "compiler.libOutputPath")]
    pub lib_output_path: PathBuf,

    // Evaluation
    /// Directory for evaluation stubs; unset means the system temp directory
    #[serde(rename = "evaluation.tempDir", skip_serializing_if = "Option::is_none")]
    pub eval_dir: Option<PathBuf>,
    #[serde(rename = "evaluation.defaultFormat")]
    pub default_format: String,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 12345,
            connect_timeout_ms: 1000,
            language: Language::Cpp,
            prefix: "Petri".to_string(),
            compiler: "/usr/bin/c++".to_string(),
            compiler_flags: vec!["-std=c++1y".to_string(), "-g".to_string()],
            lib_output_path: PathBuf::new(),
            eval_dir: None,
            default_format: "%d".to_string(),
        }
    }
}

/// Error from strict loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Cannot read settings: {}", e),
            ConfigError::Parse { path, message } => {
                write!(f, "Error parsing {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl DebuggerSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("petri-debug");
        config_dir.join("settings.json")
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    /// Load settings from `path`. `.toml` files are parsed as TOML, anything
    /// else as JSON with `//` comment lines.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");

        let parsed = if is_toml {
            toml::from_str(&contents).map_err(|e| e.to_string())
        } else {
            Self::parse_json(&contents)
        };

        parsed.map_err(|message| ConfigError::Parse { path: path.to_path_buf(), message })
    }

    fn parse_json(contents: &str) -> Result<Self, String> {
        // Strip comments (lines starting with //)
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Save current settings to the default location
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;

        fs::write(path, json).map_err(|e| e.to_string())
    }

    /// `host:port` of the debug peer
    pub fn peer_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    /// Directory that receives evaluation stubs and their artifacts
    pub fn evaluation_dir(&self) -> PathBuf {
        self.eval_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Where the compiled net for `source` goes
    pub fn library_path_for(&self, source: &Path) -> PathBuf {
        let stem = source.file_stem().unwrap_or_default();
        let mut file = PathBuf::from(stem);
        file.set_extension(self.language.artifact_extension());

        if self.lib_output_path.as_os_str().is_empty() {
            source.with_file_name(file)
        } else {
            self.lib_output_path.join(file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = DebuggerSettings::default();
        assert_eq!(s.peer_address(), "localhost:12345");
        assert_eq!(s.language, Language::Cpp);
        assert_eq!(s.compiler, "/usr/bin/c++");
        assert_eq!(s.compiler_flags, vec!["-std=c++1y", "-g"]);
        assert_eq!(s.default_format, "%d");
    }

    #[test]
    fn test_json_with_comments_and_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
    // Debug peer
    "debugger.hostname": "10.0.0.2",
    "debugger.port": 4000,
    "codegen.language": "lua"
}"#,
        )
        .unwrap();

        let s = DebuggerSettings::load_from(&path).unwrap();
        assert_eq!(s.peer_address(), "10.0.0.2:4000");
        assert_eq!(s.language, Language::Lua);
        assert_eq!(s.connect_timeout_ms, 1000);
        assert_eq!(s.prefix, "Petri");
    }

    #[test]
    fn test_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.toml");
        fs::write(
            &path,
            "\"debugger.port\" = 23456\n\"compiler.flags\" = [\"-O0\"]\n\"evaluation.tempDir\" = \"/var/tmp\"\n",
        )
        .unwrap();

        let s = DebuggerSettings::load_from(&path).unwrap();
        assert_eq!(s.port, 23456);
        assert_eq!(s.compiler_flags, vec!["-O0"]);
        assert_eq!(s.evaluation_dir(), PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ \"debugger.port\": \"not a port\" }").unwrap();

        let err = DebuggerSettings::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");
        let mut s = DebuggerSettings::default();
        s.port = 9999;
        s.eval_dir = Some(PathBuf::from("/tmp/evals"));
        s.save_to(&path).unwrap();

        assert_eq!(DebuggerSettings::load_from(&path).unwrap(), s);
    }

    #[test]
    fn test_library_path() {
        let mut s = DebuggerSettings::default();
        s.language = Language::Lua;
        assert_eq!(
            s.library_path_for(Path::new("/work/net.lua.src")),
            PathBuf::from("/work/net.lua")
        );

        s.lib_output_path = PathBuf::from("/out");
        assert_eq!(s.library_path_for(Path::new("/work/net.src")), PathBuf::from("/out/net.lua"));
    }
}
