use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Bounds for a single diagnosis session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DiagnosisConfig {
    /// Maximum reasoning rounds before the session ends with a step-limit diagnostic.
    pub max_rounds: u32,
    /// Upper bound on a single reasoning call.
    pub reasoning_timeout_secs: u64,
    /// Body text beyond this many characters is truncated in the prompt.
    pub max_body_length: usize,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            reasoning_timeout_secs: 60,
            max_body_length: 4_000,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid DIAGNOSIS_MAX_ROUNDS override: {0}")]
    InvalidMaxRounds(std::num::ParseIntError),
    #[error("diagnosis.max_rounds must be at least 1")]
    ZeroMaxRounds,
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();

        if cfg.diagnosis.max_rounds == 0 {
            return Err(ConfigError::ZeroMaxRounds);
        }
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(model) = env::var("MODEL") {
            self.model.model = model;
        }

        if let Ok(rounds) = env::var("DIAGNOSIS_MAX_ROUNDS") {
            self.diagnosis.max_rounds = rounds.parse().map_err(ConfigError::InvalidMaxRounds)?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.model.provider)?;
        apply_env_marker(&mut self.model.model)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().expect("lock env");
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(&key, v) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }

    fn config_body(database_path: &str, diagnosis: &str) -> String {
        format!(
            r#"
[app]
service_name = "rulemend"
port = 17900
env = "dev"

[paths]
database = "{database_path}"

[telemetry]
otlp_endpoint = "http://localhost:4318"
export_traces = false

[model]
provider = "env:MODEL_PROVIDER"
model = "gpt-4o-mini"
temperature = 0.2
max_output_tokens = 1024

{diagnosis}
"#
        )
    }

    const NO_OVERRIDES: &[(&str, Option<&str>)] = &[
        ("APP_PORT", None),
        ("OTLP_ENDPOINT", None),
        ("MODEL", None),
        ("DIAGNOSIS_MAX_ROUNDS", None),
    ];

    #[test]
    fn load_expands_tilde_and_resolves_env_markers() {
        let (dir, path) = write_config(&config_body("env:DB_PATH", ""));
        let home_dir = dir.path().join("home");
        fs::create_dir_all(&home_dir).expect("create home dir");
        let expected_db = home_dir.join("db/rulemend.db");

        let mut vars = NO_OVERRIDES.to_vec();
        vars.extend([
            ("HOME", Some(home_dir.to_str().expect("utf8 path"))),
            ("DB_PATH", Some("~/db/rulemend.db")),
            ("MODEL_PROVIDER", Some("openai")),
        ]);

        with_env(&vars, || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.app.service_name, "rulemend");
            assert_eq!(cfg.paths.database, expected_db);
            assert_eq!(cfg.model.provider, "openai");
            assert_eq!(cfg.diagnosis, DiagnosisConfig::default());
        });
    }

    #[test]
    fn diagnosis_section_and_env_overrides_apply() {
        let (_dir, path) = write_config(&config_body(
            "/tmp/rules.sqlite",
            "[diagnosis]\nmax_rounds = 3\nreasoning_timeout_secs = 10",
        ));

        let mut vars = NO_OVERRIDES.to_vec();
        vars[0] = ("APP_PORT", Some("18001"));
        vars[2] = ("MODEL", Some("override-model"));
        vars.push(("MODEL_PROVIDER", Some("anthropic")));

        with_env(&vars, || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.app.port, 18001);
            assert_eq!(cfg.model.model, "override-model");
            assert_eq!(cfg.diagnosis.max_rounds, 3);
            assert_eq!(cfg.diagnosis.reasoning_timeout_secs, 10);
            assert_eq!(
                cfg.diagnosis.max_body_length,
                DiagnosisConfig::default().max_body_length
            );
        });
    }

    #[test]
    fn missing_env_marker_is_reported() {
        let (_dir, path) = write_config(&config_body("/tmp/rules.sqlite", ""));
        let mut vars = NO_OVERRIDES.to_vec();
        vars.push(("MODEL_PROVIDER", None));

        with_env(&vars, || {
            let err = Config::load(&path).expect_err("should fail");
            assert!(matches!(err, ConfigError::MissingEnvVar(ref name) if name == "MODEL_PROVIDER"));
        });
    }

    #[test]
    fn zero_max_rounds_is_rejected() {
        let (_dir, path) = write_config(&config_body("/tmp/rules.sqlite", ""));
        let mut vars = NO_OVERRIDES.to_vec();
        vars[3] = ("DIAGNOSIS_MAX_ROUNDS", Some("0"));
        vars.push(("MODEL_PROVIDER", Some("openai")));

        with_env(&vars, || {
            let err = Config::load(&path).expect_err("should fail");
            assert!(matches!(err, ConfigError::ZeroMaxRounds));
        });
    }
}
