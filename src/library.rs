//! Library client: wraps the external library-management CLI
//! (`calibredb`-equivalent) behind a narrow async trait.
//!
//! Grounded in `root/app/calibre_integration/calibredb_utils.py`. All real
//! invocations are serialized through a process-wide mutex — `calibredb`
//! itself is not safe for concurrent invocation against the same library —
//! matching the original's single shared subprocess lock.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::LibraryConfig;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("library command failed: {command}\n{stderr_excerpt}")]
    CommandFailed {
        command: String,
        stderr_excerpt: String,
    },
    #[error("failed to launch library command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

const STDERR_EXCERPT_LIMIT: usize = 2000;

/// Story metadata as reported by the library.
#[derive(Debug, Clone, Default)]
pub struct StoryMetadata {
    pub title: Option<String>,
    pub custom_fields: std::collections::HashMap<String, String>,
}

/// Narrow async surface over the external library CLI, so tests can
/// substitute an in-memory fake rather than shelling out.
#[async_trait]
pub trait LibraryClient: Send + Sync {
    async fn get_story_id(&self, url: &str) -> Result<Option<String>, LibraryError>;
    async fn export(&self, library_id: &str, dest_dir: &std::path::Path) -> Result<PathBuf, LibraryError>;
    async fn add(&self, epub_path: &std::path::Path) -> Result<String, LibraryError>;
    async fn remove(&self, library_id: &str) -> Result<(), LibraryError>;
    async fn replace_format(&self, library_id: &str, epub_path: &std::path::Path) -> Result<(), LibraryError>;
    async fn get_metadata(&self, library_id: &str) -> Result<StoryMetadata, LibraryError>;
    async fn set_metadata(&self, library_id: &str, metadata: &StoryMetadata) -> Result<(), LibraryError>;
}

/// `calibredb`-backed implementation.
pub struct CalibreLibraryClient {
    config: LibraryConfig,
    lock: Arc<Mutex<()>>,
}

impl CalibreLibraryClient {
    #[must_use]
    pub fn new(config: LibraryConfig) -> Self {
        Self {
            config,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--library-path".to_string(), self.config.path.clone()];
        if let Some(u) = &self.config.username {
            args.push("--username".to_string());
            args.push(u.clone());
        }
        if let Some(p) = &self.config.password {
            args.push("--password".to_string());
            args.push(p.clone());
        }
        args
    }

    #[instrument(skip(self, args), fields(command = %format!("calibredb {subcommand}")))]
    async fn run(&self, subcommand: &str, args: &[String]) -> Result<String, LibraryError> {
        let _guard = self.lock.lock().await;

        let mut full_args = vec![subcommand.to_string()];
        full_args.extend(self.base_args());
        full_args.extend(args.iter().cloned());

        let command_display = format!("calibredb {}", full_args.join(" "));

        let output = Command::new("calibredb")
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| LibraryError::Spawn {
                command: command_display.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT_LIMIT).collect();
            return Err(LibraryError::CommandFailed {
                command: command_display,
                stderr_excerpt: excerpt,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl LibraryClient for CalibreLibraryClient {
    async fn get_story_id(&self, url: &str) -> Result<Option<String>, LibraryError> {
        let out = self
            .run(
                "search",
                &[format!("identifiers:url:{url}"), "--for-machine".to_string()],
            )
            .await?;
        let trimmed = out.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    async fn export(&self, library_id: &str, dest_dir: &std::path::Path) -> Result<PathBuf, LibraryError> {
        self.run(
            "export",
            &[
                library_id.to_string(),
                "--to-dir".to_string(),
                dest_dir.display().to_string(),
                "--single-dir".to_string(),
                "--dont-save-cover".to_string(),
                "--dont-write-opf".to_string(),
            ],
        )
        .await?;
        find_epub(dest_dir).ok_or_else(|| LibraryError::CommandFailed {
            command: "calibredb export".to_string(),
            stderr_excerpt: format!("no .epub file found in {}", dest_dir.display()),
        })
    }

    async fn add(&self, epub_path: &std::path::Path) -> Result<String, LibraryError> {
        let out = self
            .run("add", &[epub_path.display().to_string()])
            .await?;
        parse_added_id(&out).ok_or_else(|| LibraryError::CommandFailed {
            command: "calibredb add".to_string(),
            stderr_excerpt: format!("could not parse new library id from: {out}"),
        })
    }

    async fn remove(&self, library_id: &str) -> Result<(), LibraryError> {
        self.run("remove", &[library_id.to_string()]).await?;
        Ok(())
    }

    async fn replace_format(&self, library_id: &str, epub_path: &std::path::Path) -> Result<(), LibraryError> {
        self.run(
            "add_format",
            &[library_id.to_string(), epub_path.display().to_string()],
        )
        .await?;
        Ok(())
    }

    async fn get_metadata(&self, library_id: &str) -> Result<StoryMetadata, LibraryError> {
        let out = self
            .run(
                "show_metadata",
                &[library_id.to_string(), "--as-opf".to_string()],
            )
            .await?;
        Ok(parse_opf_metadata(&out))
    }

    async fn set_metadata(&self, library_id: &str, metadata: &StoryMetadata) -> Result<(), LibraryError> {
        let mut args = vec![library_id.to_string()];
        for (field, value) in &metadata.custom_fields {
            args.push("--field".to_string());
            args.push(format!("{field}:{value}"));
        }
        self.run("set_metadata", &args).await?;
        Ok(())
    }
}

/// Scans `dir` for the `.epub` file a preceding `export`/download step wrote,
/// matching the original's `system_utils.get_files(location, ".epub")` scan.
pub(crate) fn find_epub(dir: &std::path::Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|e| e.to_str()) == Some("epub"))
}

fn parse_added_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Added book ids:"))
        .map(|rest| rest.trim().to_string())
}

/// Minimal OPF field extraction, sufficient for `#`-prefixed custom fields
/// that the update strategies diff/restore; not a general OPF parser.
fn parse_opf_metadata(opf: &str) -> StoryMetadata {
    let mut metadata = StoryMetadata::default();
    for line in opf.lines() {
        let line = line.trim();
        if let Some(title) = extract_tag_text(line, "dc:title") {
            metadata.title = Some(title);
        }
        if let Some((name, value)) = extract_custom_field(line) {
            metadata.custom_fields.insert(name, value);
        }
    }
    metadata
}

fn extract_tag_text(line: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = line.find(&open)? + open.len();
    let end = line.find(&close)?;
    (start <= end).then(|| line[start..end].to_string())
}

fn extract_custom_field(line: &str) -> Option<(String, String)> {
    if !line.contains("name=\"calibre:user_metadata:#") {
        return None;
    }
    let name_start = line.find("#")? + 1;
    let name_end = line[name_start..].find('"')? + name_start;
    let name = line[name_start..name_end].to_string();
    let content_start = line.find("content=\"")? + "content=\"".len();
    let content_end = line[content_start..].find('"')? + content_start;
    let value = line[content_start..content_end].to_string();
    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_added_book_id() {
        let out = "Added book ids: 42\n";
        assert_eq!(parse_added_id(out), Some("42".to_string()));
    }

    #[test]
    fn parses_opf_title_and_custom_field() {
        let opf = r#"<dc:title>My Story</dc:title>
<meta name="calibre:user_metadata:#status" content="ongoing"/>"#;
        let meta = parse_opf_metadata(opf);
        assert_eq!(meta.title.as_deref(), Some("My Story"));
        assert_eq!(meta.custom_fields.get("status"), Some(&"ongoing".to_string()));
    }

    #[test]
    fn find_epub_picks_the_exported_file_among_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"").unwrap();
        std::fs::write(dir.path().join("My Story.epub"), b"").unwrap();
        let found = find_epub(dir.path()).unwrap();
        assert_eq!(found.extension().unwrap(), "epub");
    }

    #[test]
    fn find_epub_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_epub(dir.path()).is_none());
    }
}
