use super::{CollaboratorError, Downloader, Extractor, ItemDescriptor, SubtitleFetch, TemplateContext, Transcriber};
use crate::config::{CommandSpec, ExtractionProfile, ToolsConfig};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use transcriptforge_common::paths::{is_audio_file, is_subtitle_file};
use transcriptforge_common::{Error, Result};

/// Exit status meaning "no such content" (no subtitles, nothing to extract).
pub const EXIT_NO_CONTENT: i32 = 3;

/// Exit status meaning "throttled, try again later" (`EX_TEMPFAIL`).
pub const EXIT_RATE_LIMITED: i32 = 75;

/// Exit status used by `timeout(1)`.
pub const EXIT_TIMED_OUT: i32 = 124;

/// Collaborators backed by configured external programs.
///
/// Arguments support `{item_id}`, `{title}`, `{index}`, `{input}`,
/// `{output}` and `{profile}`. Programs write their artifact to `{output}`
/// (a staging path) and may print the artifact's extension on stdout; the
/// extractor prints its JSON document on stdout instead.
#[derive(Debug, Clone)]
pub struct CommandTools {
    tools: ToolsConfig,
    timeout: Duration,
}

impl CommandTools {
    pub fn new(tools: ToolsConfig, timeout: Duration) -> Self {
        Self { tools, timeout }
    }

    /// Fail unless every named command is configured.
    pub fn require(&self, names: &[&str]) -> Result<()> {
        for name in names {
            let configured = match *name {
                "subtitle_command" => self.tools.subtitle_command.is_some(),
                "audio_command" => self.tools.audio_command.is_some(),
                "transcribe_command" => self.tools.transcribe_command.is_some(),
                "extract_command" => self.tools.extract_command.is_some(),
                other => return Err(Error::invalid_input(format!("unknown tool: {}", other))),
            };
            if !configured {
                return Err(Error::invalid_input(format!("tools.{} is not configured", name)));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        name: &str,
        spec: Option<&CommandSpec>,
        ctx: &TemplateContext,
    ) -> std::result::Result<String, CollaboratorError> {
        let spec = spec.ok_or_else(|| CollaboratorError::Failed(format!("tools.{} is not configured", name)))?;
        let program = ctx.substitute(&spec.program);
        let args = ctx.substitute_all(&spec.args);

        tracing::debug!("Executing {}: {} {:?}", name, program, args);

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollaboratorError::Failed(format!("failed to execute {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(self.classify_exit(&program, output.status.code(), stderr))
    }

    fn classify_exit(&self, program: &str, code: Option<i32>, stderr: String) -> CollaboratorError {
        match code {
            Some(EXIT_NO_CONTENT) => CollaboratorError::ContentAbsent(stderr),
            Some(EXIT_RATE_LIMITED) => CollaboratorError::RateLimited {
                retry_after: parse_retry_after(&stderr),
            },
            Some(EXIT_TIMED_OUT) => CollaboratorError::Timeout(self.timeout),
            Some(code) => CollaboratorError::Network(format!("{} exited with {}: {}", program, code, stderr)),
            None => CollaboratorError::Failed(format!("{} was terminated by a signal", program)),
        }
    }
}

/// `retry-after=<secs>` anywhere in the program's stderr.
fn parse_retry_after(stderr: &str) -> Option<Duration> {
    let lower = stderr.to_lowercase();
    let rest = &lower[lower.find("retry-after=")? + "retry-after=".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().map(Duration::from_secs)
}

/// Extension printed on the last non-empty stdout line, if it passes `accept`.
fn printed_extension(stdout: &str, accept: fn(&Path) -> bool, default: &str) -> String {
    stdout
        .lines()
        .rev()
        .map(|l| l.trim().trim_start_matches('.').to_lowercase())
        .find(|l| !l.is_empty())
        .filter(|ext| accept(Path::new(&format!("x.{ext}"))))
        .unwrap_or_else(|| default.to_string())
}

fn ensure_written(staging: &Path, program: &str) -> std::result::Result<(), CollaboratorError> {
    if staging.is_file() {
        Ok(())
    } else {
        Err(CollaboratorError::Failed(format!(
            "{} reported success but wrote nothing to {:?}",
            program, staging
        )))
    }
}

#[async_trait]
impl Downloader for CommandTools {
    async fn fetch_subtitle(
        &self,
        item: &ItemDescriptor,
        staging: &Path,
    ) -> std::result::Result<SubtitleFetch, CollaboratorError> {
        let ctx = TemplateContext::new().with_item(item).with_output(staging);
        match self.run("subtitle_command", self.tools.subtitle_command.as_ref(), &ctx).await {
            Ok(stdout) => {
                ensure_written(staging, "subtitle_command")?;
                Ok(SubtitleFetch::Fetched {
                    extension: printed_extension(&stdout, is_subtitle_file, "json3"),
                })
            }
            Err(CollaboratorError::ContentAbsent(_)) => Ok(SubtitleFetch::NoSubtitles),
            Err(e) => Err(e),
        }
    }

    async fn fetch_audio(&self, item: &ItemDescriptor, staging: &Path) -> std::result::Result<String, CollaboratorError> {
        let ctx = TemplateContext::new().with_item(item).with_output(staging);
        let stdout = self.run("audio_command", self.tools.audio_command.as_ref(), &ctx).await?;
        ensure_written(staging, "audio_command")?;
        Ok(printed_extension(&stdout, is_audio_file, "mp3"))
    }
}

#[async_trait]
impl Transcriber for CommandTools {
    async fn transcribe(
        &self,
        item: &ItemDescriptor,
        audio: &Path,
        staging: &Path,
    ) -> std::result::Result<(), CollaboratorError> {
        let ctx = TemplateContext::new()
            .with_item(item)
            .with_input(audio)
            .with_output(staging);
        self.run("transcribe_command", self.tools.transcribe_command.as_ref(), &ctx)
            .await?;
        ensure_written(staging, "transcribe_command")
    }
}

#[async_trait]
impl Extractor for CommandTools {
    async fn extract(
        &self,
        item: &ItemDescriptor,
        transcript: &Path,
        profile: &ExtractionProfile,
    ) -> std::result::Result<serde_json::Value, CollaboratorError> {
        let ctx = TemplateContext::new()
            .with_item(item)
            .with_input(transcript)
            .with_var("profile", profile.name());
        let stdout = self
            .run("extract_command", self.tools.extract_command.as_ref(), &ctx)
            .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| CollaboratorError::Failed(format!("extractor printed invalid JSON: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    fn sh(script: &str) -> Option<CommandSpec> {
        Some(CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
    }

    fn tools(config: ToolsConfig) -> CommandTools {
        CommandTools::new(config, Duration::from_secs(30))
    }

    fn item() -> ItemDescriptor {
        ItemDescriptor::new(1, "abc123", "Clase 1")
    }

    #[tokio::test]
    async fn test_subtitle_written_to_staging() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("001_Clase 1.json3.partial");
        let tools = tools(ToolsConfig {
            subtitle_command: sh("echo '{item_id}' > '{output}' && echo vtt"),
            ..Default::default()
        });

        let fetched = tools.fetch_subtitle(&item(), &staging).await.unwrap();
        assert_eq!(
            fetched,
            SubtitleFetch::Fetched {
                extension: "vtt".to_string()
            }
        );
        assert_eq!(std::fs::read_to_string(&staging).unwrap().trim(), "abc123");
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_classes() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("x.partial");

        let no_subs = tools(ToolsConfig {
            subtitle_command: sh("exit 3"),
            audio_command: sh("echo 'retry-after=120' >&2; exit 75"),
            ..Default::default()
        });
        assert_eq!(
            no_subs.fetch_subtitle(&item(), &staging).await.unwrap(),
            SubtitleFetch::NoSubtitles
        );
        assert_matches!(
            no_subs.fetch_audio(&item(), &staging).await,
            Err(CollaboratorError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(120)
        );

        let failing = tools(ToolsConfig {
            audio_command: sh("exit 124"),
            transcribe_command: sh("exit 1"),
            ..Default::default()
        });
        assert_matches!(
            failing.fetch_audio(&item(), &staging).await,
            Err(CollaboratorError::Timeout(_))
        );
        assert_matches!(
            failing
                .transcribe(&item(), Path::new("/nonexistent.mp3"), &staging)
                .await,
            Err(CollaboratorError::Network(_))
        );
    }

    #[tokio::test]
    async fn test_success_without_output_is_a_failure() {
        let dir = tempdir().unwrap();
        let tools = tools(ToolsConfig {
            audio_command: sh("true"),
            ..Default::default()
        });
        assert_matches!(
            tools.fetch_audio(&item(), &dir.path().join("a.partial")).await,
            Err(CollaboratorError::Failed(_))
        );
    }

    #[tokio::test]
    async fn test_extractor_parses_stdout() {
        let tools = tools(ToolsConfig {
            extract_command: sh(r#"printf '{"profile": "%s", "summary": "ok"}' '{profile}'"#),
            ..Default::default()
        });
        let value = tools
            .extract(&item(), Path::new("/t/001.srt"), &ExtractionProfile::default())
            .await
            .unwrap();
        assert_eq!(value["profile"], "lesson");
        assert_eq!(value["summary"], "ok");
    }

    #[tokio::test]
    async fn test_unconfigured_command() {
        let tools = tools(ToolsConfig::default());
        assert!(tools.require(&["extract_command"]).is_err());
        assert_matches!(
            tools
                .extract(&item(), Path::new("/t/001.srt"), &ExtractionProfile::default())
                .await,
            Err(CollaboratorError::Failed(_))
        );
    }

    #[test]
    fn test_printed_extension() {
        assert_eq!(printed_extension("downloading...\n.M4A\n", is_audio_file, "mp3"), "m4a");
        assert_eq!(printed_extension("", is_audio_file, "mp3"), "mp3");
        assert_eq!(printed_extension("exe\n", is_audio_file, "mp3"), "mp3");
    }
}
