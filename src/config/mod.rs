use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::codec::TextEncoding;
use crate::prompt::{MmiStyle, PromptPolicy};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ets-bridge";

#[derive(Debug, Deserialize)]
pub struct EngineSettings {
    /// Directory holding the engine binaries. Defaults to the directory of
    /// the running executable.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_implicit_send_library")]
    pub implicit_send_library: String,
    #[serde(default = "default_verify_credential")]
    pub verify_credential: bool,
    #[serde(default)]
    pub post_logging: bool,
    #[serde(default = "default_max_log")]
    pub max_log: bool,
}

/// Prompt handling.
///
/// ```toml
/// [prompt]
/// fire_and_forget_style = 0x11141
/// fire_and_forget_answer = "OK"
/// ```
#[derive(Debug, Deserialize)]
pub struct PromptSettings {
    #[serde(default = "default_fire_and_forget_style")]
    pub fire_and_forget_style: u32,
    #[serde(default = "default_fire_and_forget_answer")]
    pub fire_and_forget_answer: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct OutputSettings {
    #[serde(default)]
    pub encoding: TextEncoding,
}

#[derive(Debug, Deserialize)]
pub struct VerdictSettings {
    #[serde(default = "default_verdict_logtype")]
    pub logtype: i32,
    #[serde(default = "default_verdict_marker")]
    pub marker: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionSettings {
    /// Undo completed lifecycle steps when a later step fails.
    #[serde(default)]
    pub teardown_on_failure: bool,
}

fn default_workspace() -> String {
    "NIL".to_string()
}

fn default_implicit_send_library() -> String {
    "implicit_send3.dll".to_string()
}

fn default_verify_credential() -> bool {
    true
}

fn default_max_log() -> bool {
    true
}

fn default_fire_and_forget_style() -> u32 {
    MmiStyle::OkCancel2 as u32
}

fn default_fire_and_forget_answer() -> String {
    "OK".to_string()
}

fn default_verdict_logtype() -> i32 {
    crate::engine::LogType::FinalVerdict as i32
}

fn default_verdict_marker() -> String {
    "VERDICT/".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            install_dir: None,
            workspace: default_workspace(),
            implicit_send_library: default_implicit_send_library(),
            verify_credential: default_verify_credential(),
            post_logging: false,
            max_log: default_max_log(),
        }
    }
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            fire_and_forget_style: default_fire_and_forget_style(),
            fire_and_forget_answer: default_fire_and_forget_answer(),
        }
    }
}

impl PromptSettings {
    pub fn policy(&self) -> PromptPolicy {
        PromptPolicy {
            fire_and_forget_style: self.fire_and_forget_style,
            fire_and_forget_answer: self.fire_and_forget_answer.clone(),
        }
    }
}

impl Default for VerdictSettings {
    fn default() -> Self {
        Self {
            logtype: default_verdict_logtype(),
            marker: default_verdict_marker(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub verdict: VerdictSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl BridgeConfig {
    /// Search upward from `start` for a `.ets-bridge/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        match Self::find_config_file(start) {
            Some(path) => Ok((Self::load_file(&path)?, Some(path))),
            None => Ok((BridgeConfig::default(), None)),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = BridgeConfig::default();
        assert!(config.engine.install_dir.is_none());
        assert_eq!(config.engine.workspace, "NIL");
        assert_eq!(config.engine.implicit_send_library, "implicit_send3.dll");
        assert!(config.engine.verify_credential);
        assert!(!config.engine.post_logging);
        assert!(config.engine.max_log);
        assert_eq!(config.prompt.fire_and_forget_style, 0x11141);
        assert_eq!(config.prompt.fire_and_forget_answer, "OK");
        assert_eq!(config.output.encoding, TextEncoding::Windows1252);
        assert_eq!(config.verdict.logtype, 5);
        assert_eq!(config.verdict.marker, "VERDICT/");
        assert!(!config.session.teardown_on_failure);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[engine]
install_dir = "C:/Program Files/Bluetooth SIG/PTS/bin"
workspace = "ws.pqw6"
implicit_send_library = "implicit_send4.dll"
verify_credential = false
post_logging = true
max_log = false

[prompt]
fire_and_forget_style = 0x11040
fire_and_forget_answer = "Yes"

[output]
encoding = "utf8"

[verdict]
logtype = 6
marker = "FINAL/"

[session]
teardown_on_failure = true
"#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.engine.install_dir.as_deref(),
            Some(Path::new("C:/Program Files/Bluetooth SIG/PTS/bin"))
        );
        assert_eq!(config.engine.workspace, "ws.pqw6");
        assert_eq!(config.engine.implicit_send_library, "implicit_send4.dll");
        assert!(!config.engine.verify_credential);
        assert!(config.engine.post_logging);
        assert!(!config.engine.max_log);
        assert_eq!(config.prompt.fire_and_forget_style, 0x11040);
        assert_eq!(config.prompt.fire_and_forget_answer, "Yes");
        assert_eq!(config.output.encoding, TextEncoding::Utf8);
        assert_eq!(config.verdict.logtype, 6);
        assert_eq!(config.verdict.marker, "FINAL/");
        assert!(config.session.teardown_on_failure);
    }

    #[test]
    fn parse_documented_default_encoding() {
        let toml = r#"
[output]
encoding = "windows-1252"
"#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.output.encoding, TextEncoding::Windows1252);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[prompt]
fire_and_forget_answer = "ACK"
"#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.prompt.fire_and_forget_answer, "ACK");
        assert_eq!(config.prompt.fire_and_forget_style, 0x11141);
        assert_eq!(config.engine.workspace, "NIL");
        assert!(!config.session.teardown_on_failure);
    }

    #[test]
    fn prompt_settings_build_policy() {
        let settings = PromptSettings::default();
        assert_eq!(settings.policy(), PromptPolicy::default());
    }

    #[test]
    fn rejects_unknown_encoding() {
        let toml = r#"
[output]
encoding = "ebcdic"
"#;
        assert!(toml::from_str::<BridgeConfig>(toml).is_err());
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".ets-bridge");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[session]
teardown_on_failure = true
"#,
        )
        .unwrap();

        let (config, path) = BridgeConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert!(config.session.teardown_on_failure);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = BridgeConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.engine.workspace, "NIL");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".ets-bridge");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[engine]
workspace = "nested.pqw6"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("runs").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = BridgeConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.engine.workspace, "nested.pqw6");
    }

    #[test]
    fn load_file_reports_parse_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.toml");
        fs::write(&path, "[engine\nworkspace = ").unwrap();

        let err = BridgeConfig::load_file(&path).unwrap_err();
        assert!(format!("{err}").contains("broken.toml"));
    }
}
