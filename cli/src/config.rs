use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use glucimiam_core::providers::{LlmSettings, ProviderKind};
use glucimiam_core::settings::AnalysisSettings;

pub const PROVIDER_ENV: &str = "GLUCIMIAM_PROVIDER";
pub const MODEL_ENV: &str = "GLUCIMIAM_MODEL";
pub const API_KEY_ENV: &str = "GLUCIMIAM_API_KEY";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("", "", "glucimiam")
            .context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("glucimiam.db");
        let settings_path = data_dir.join("settings.json");

        Ok(Config {
            db_path,
            data_dir,
            settings_path,
        })
    }

    /// Analysis settings from `settings.json`, or the defaults when the
    /// file does not exist.
    pub fn analysis_settings(&self) -> Result<AnalysisSettings> {
        load_settings_file(&self.settings_path)
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new server key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

pub fn load_settings_file(path: &Path) -> Result<AnalysisSettings> {
    if !path.exists() {
        return Ok(AnalysisSettings::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid settings file: {}", path.display()))
}

/// Provider credentials from flags, falling back to the environment.
pub fn resolve_llm(provider: Option<ProviderKind>, model: Option<String>) -> Result<LlmSettings> {
    resolve_llm_with(provider, model, |name| std::env::var(name).ok())
}

/// The provider comes from the flag, then `GLUCIMIAM_PROVIDER`, then
/// defaults to Claude. The key comes from `GLUCIMIAM_API_KEY`, then the
/// vendor's own variable.
pub fn resolve_llm_with(
    provider: Option<ProviderKind>,
    model: Option<String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<LlmSettings> {
    let var = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let provider = match provider {
        Some(p) => p,
        None => match var(PROVIDER_ENV) {
            Some(name) => name.parse()?,
            None => ProviderKind::Claude,
        },
    };

    let Some(api_key) = var(API_KEY_ENV).or_else(|| var(provider.api_key_env())) else {
        bail!(
            "No API key for {provider}. Set {API_KEY_ENV} or {}",
            provider.api_key_env()
        );
    };

    let mut settings = LlmSettings::new(provider, api_key);
    settings.model = model.or_else(|| var(MODEL_ENV));
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_flag_beats_environment() {
        let llm = resolve_llm_with(
            Some(ProviderKind::Gemini),
            None,
            env(&[(PROVIDER_ENV, "openai"), ("GEMINI_API_KEY", "g-key")]),
        )
        .unwrap();
        assert_eq!(llm.provider, ProviderKind::Gemini);
        assert_eq!(llm.api_key, "g-key");
        assert_eq!(llm.model(), ProviderKind::Gemini.default_model());
    }

    #[test]
    fn test_generic_key_and_model_env() {
        let llm = resolve_llm_with(
            None,
            None,
            env(&[
                (PROVIDER_ENV, "chatgpt"),
                (API_KEY_ENV, "generic"),
                ("OPENAI_API_KEY", "vendor"),
                (MODEL_ENV, "gpt-4.1"),
            ]),
        )
        .unwrap();
        assert_eq!(llm.provider, ProviderKind::OpenAi);
        assert_eq!(llm.api_key, "generic");
        assert_eq!(llm.model(), "gpt-4.1");
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let err = resolve_llm_with(None, None, env(&[("OPENAI_API_KEY", "x")])).unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
        assert!(resolve_llm_with(None, None, env(&[(PROVIDER_ENV, "mistral")])).is_err());
    }

    #[test]
    fn test_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings_file(&path).unwrap(), AnalysisSettings::default());

        std::fs::write(&path, r#"{"cache_max_distance": 8}"#).unwrap();
        let s = load_settings_file(&path).unwrap();
        assert_eq!(s.cache_max_distance, 8);
        assert_eq!(s.correction_window, 10);

        std::fs::write(&path, "not json").unwrap();
        assert!(load_settings_file(&path).is_err());
    }
}
