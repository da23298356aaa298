mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use transcriptforge_common::Error;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let root = shellexpand::tilde(&config.storage.root.to_string_lossy()).into_owned();
    config.storage.root = root.into();

    Ok(config)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content)?;

    validate_config(&config)?;

    prepare_collections(&mut config.collections);

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./transcriptforge.toml",
        "~/.config/transcriptforge/config.toml",
        "/etc/transcriptforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Processing order: descending priority, ties broken by name.
fn prepare_collections(collections: &mut [CollectionConfig]) {
    collections.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be at least 1");
    }
    if config.retry.max_phase_attempts == 0 {
        anyhow::bail!("retry.max_phase_attempts must be at least 1");
    }
    if config.retry.circuit_breaker_threshold == 0 {
        anyhow::bail!("retry.circuit_breaker_threshold must be at least 1");
    }
    if config.pacing.batch_size == 0 {
        anyhow::bail!("pacing.batch_size must be at least 1");
    }

    let mut seen = HashSet::new();
    for collection in &config.collections {
        let name = collection.name.as_str();
        if name.is_empty() || name == "all" {
            anyhow::bail!("Invalid collection name: {:?}", name);
        }
        if name.contains(['/', '\\']) {
            anyhow::bail!("Collection name '{}' must not contain path separators", name);
        }
        if !seen.insert(name) {
            anyhow::bail!("Collection '{}' is defined more than once", name);
        }
        if collection.total == 0 {
            anyhow::bail!("Collection '{}' has a total of 0 items", name);
        }
    }

    for field in &config.verification.required_fields {
        if field.trim().is_empty() {
            anyhow::bail!("verification.required_fields contains an empty name");
        }
    }

    Ok(())
}

impl Config {
    /// Look up a configured collection by name.
    pub fn collection(&self, name: &str) -> transcriptforge_common::Result<&CollectionConfig> {
        self.collections
            .iter()
            .find(|c| c.name.as_str() == name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// Resolve a CLI selector (`all` or a collection name) in processing order.
    pub fn select(&self, selector: &str) -> transcriptforge_common::Result<Vec<&CollectionConfig>> {
        if selector.eq_ignore_ascii_case("all") {
            return Ok(self.collections.iter().collect());
        }
        Ok(vec![self.collection(selector)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
root = "/data/kabbalah"

[retry]
max_attempts = 4
rate_limit_pause_secs = 600

[verification]
identity = "item_id"

[tools.extract_command]
program = "extract-content"
args = ["--profile", "{profile}", "{input}"]

[[collections]]
name = "sefer_yetzirah"
display = "Sefer Yetzirah"
total = 19
priority = 1
catalog = "catalogs/sefer_yetzirah.json"
profile = { type = "lesson" }

[[collections]]
name = "preguntas"
total = 40
priority = 5
catalog = "catalogs/preguntas.json"
audio_fallback = false
profile = { type = "question_answer", min_questions = 5 }
"#;

    #[test]
    fn parses_sample_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.rate_limit_pause_secs, 600);
        assert_eq!(config.retry.max_phase_attempts, 5);
        assert_eq!(config.verification.identity, IdentityPolicy::ItemId);
        assert_eq!(config.verification.required_fields, vec!["metadata"]);
        assert_eq!(config.collections.len(), 2);

        let extract = config.tools.extract_command.as_ref().unwrap();
        assert_eq!(extract.program, "extract-content");
        assert_eq!(extract.args.len(), 3);
    }

    #[test]
    fn collections_sorted_by_descending_priority() {
        let config = parse_config(SAMPLE).unwrap();
        let names: Vec<_> = config.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["preguntas", "sefer_yetzirah"]);
    }

    #[test]
    fn profile_is_a_closed_set() {
        let bad = SAMPLE.replace("type = \"lesson\"", "type = \"podcast\"");
        assert!(parse_config(&bad).is_err());

        let config = parse_config(SAMPLE).unwrap();
        let preguntas = config.collection("preguntas").unwrap();
        assert_eq!(
            preguntas.profile,
            ExtractionProfile::QuestionAnswer { min_questions: 5 }
        );
        assert!(!preguntas.audio_fallback);
        assert!(config.collection("sefer_yetzirah").unwrap().audio_fallback);
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let config = parse_config(SAMPLE).unwrap();
        assert!(matches!(
            config.select("tefila"),
            Err(Error::UnknownCollection(name)) if name == "tefila"
        ));
        assert_eq!(config.select("all").unwrap().len(), 2);
        assert_eq!(config.select("ALL").unwrap().len(), 2);
        assert_eq!(config.select("preguntas").unwrap().len(), 1);
    }

    #[test]
    fn rejects_duplicate_collections() {
        let dup = format!(
            "{}\n[[collections]]\nname = \"preguntas\"\ntotal = 1\ncatalog = \"x.json\"\nprofile = {{ type = \"meditation\" }}\n",
            SAMPLE
        );
        let err = parse_config(&dup).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_zero_totals_and_budgets() {
        let zero_total = SAMPLE.replace("total = 19", "total = 0");
        assert!(parse_config(&zero_total).is_err());

        let zero_attempts = SAMPLE.replace("max_attempts = 4", "max_attempts = 0");
        assert!(parse_config(&zero_attempts).is_err());
    }

    #[test]
    fn storage_directories_per_kind() {
        let storage = StorageConfig::at("/data");
        let name = "tefila".into();
        assert_eq!(
            storage.artifact_dir(transcriptforge_common::ArtifactKind::Subtitle, &name),
            Path::new("/data/transcripts/tefila")
        );
        assert_eq!(
            storage.artifact_dir(transcriptforge_common::ArtifactKind::Audio, &name),
            Path::new("/data/audio/tefila")
        );
        assert_eq!(
            storage.artifact_dir(transcriptforge_common::ArtifactKind::Extracted, &name),
            Path::new("/data/processed/tefila")
        );
        assert_eq!(storage.registry_path(), Path::new("/data/processing_state.json"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
