use crate::engine::identity::{DEFAULT_STUDENT_ID_HINT, DEFAULT_STUDENT_ID_PATTERN};
use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendSourceType {
    Memory,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub source_type: BackendSourceType,
    /// JSON snapshot loaded into the in-memory backend at startup.
    pub seed_file: Option<String>,
    pub rest_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuizConfig {
    pub student_id_pattern: String,
    /// Example shown to students whose ID does not match the pattern.
    pub student_id_hint: String,
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub quiz: QuizConfig,
}

pub fn load_settings() -> AppResult<AppSettings> {
    let builder = Config::builder()
        .add_source(
            Environment::with_prefix("QUIZGATE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false))
        .set_default("server.port", 3000)
        .and_then(|b| b.set_default("server.cors_origins", Vec::<String>::new()))
        .and_then(|b| b.set_default("backend.source_type", "memory"))
        .and_then(|b| b.set_default("quiz.student_id_pattern", DEFAULT_STUDENT_ID_PATTERN))
        .and_then(|b| b.set_default("quiz.student_id_hint", DEFAULT_STUDENT_ID_HINT))
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &AppSettings) -> Result<(), ConfigError> {
    if settings.backend.source_type == BackendSourceType::Rest {
        if settings.backend.rest_url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Missing("backend.rest_url".to_string()));
        }
        if settings.backend.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Missing("backend.api_key".to_string()));
        }
    }

    if let Err(e) = regex::Regex::new(&settings.quiz.student_id_pattern) {
        return Err(ConfigError::InvalidValue(format!(
            "quiz.student_id_pattern is not a valid regex: {e}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(source_type: BackendSourceType, rest_url: Option<&str>) -> AppSettings {
        AppSettings {
            server: ServerConfig {
                port: 3000,
                cors_origins: vec![],
            },
            backend: BackendConfig {
                source_type,
                seed_file: None,
                rest_url: rest_url.map(str::to_string),
                api_key: Some("anon-key".to_string()),
            },
            quiz: QuizConfig {
                student_id_pattern: DEFAULT_STUDENT_ID_PATTERN.to_string(),
                student_id_hint: DEFAULT_STUDENT_ID_HINT.to_string(),
            },
        }
    }

    #[test]
    fn test_rest_backend_requires_url() {
        let result = validate_settings(&settings(BackendSourceType::Rest, None));
        assert!(matches!(result, Err(ConfigError::Missing(key)) if key == "backend.rest_url"));

        let ok = validate_settings(&settings(
            BackendSourceType::Rest,
            Some("https://example.supabase.co"),
        ));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_memory_backend_needs_no_url() {
        assert!(validate_settings(&settings(BackendSourceType::Memory, None)).is_ok());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut s = settings(BackendSourceType::Memory, None);
        s.quiz.student_id_pattern = "^BTH/(\\d{2}".to_string();
        assert!(matches!(
            validate_settings(&s),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
