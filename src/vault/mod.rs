// Vault access
// Lists, reads and watches the markdown notes that get indexed


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::{RagError, Result};

const WATCH_CHANNEL_CAPACITY: usize = 64;

static INLINE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?<![\w#&/])#([\p{L}_][\p{L}\p{N}_/-]*)").expect("inline tag pattern is valid")
});

/// A note in the vault, identified by its vault-relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultDocument {
    /// Relative to the vault root, `/`-separated
    pub path: String,
    /// File stem; see [`extract_title`] for the heading-based title
    pub title: String,
    pub extension: String,
    /// Milliseconds since the Unix epoch
    pub modified: i64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    /// Created or changed
    Modified(VaultDocument),
    Deleted(String),
}

/// Read-only view of a vault
#[async_trait]
pub trait VaultReader: Send + Sync {
    async fn list_markdown_documents(&self) -> Result<Vec<VaultDocument>>;

    async fn read_document(&self, document: &VaultDocument) -> Result<String>;

    /// Start reporting changes. Reporting stops once the receiver is dropped.
    fn watch(&self) -> Result<mpsc::Receiver<VaultEvent>>;
}

/// Vault backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
    extensions: Vec<String>,
    poll_interval: Duration,
}

impl FsVault {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let defaults = VaultConfig::default();
        Self {
            root: root.as_ref().to_path_buf(),
            extensions: defaults.extensions,
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
        }
    }

    #[inline]
    pub fn from_config(root: &Path, config: &VaultConfig) -> Self {
        Self::new(root)
            .with_extensions(config.extensions.clone())
            .with_poll_interval(Duration::from_millis(config.poll_interval_ms))
    }

    #[inline]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    #[inline]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn wanted_extension(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.extensions.contains(&ext).then_some(ext)
    }

    async fn scan(&self) -> Result<Vec<VaultDocument>> {
        let mut documents = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                RagError::Vault(format!("Failed to read directory {}: {}", dir.display(), e))
            })?;

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }

                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Some(extension) = self.wanted_extension(&path) else {
                    continue;
                };

                match entry.metadata().await {
                    Ok(metadata) => {
                        if let Some(document) = self.document_for(&path, extension, &metadata) {
                            documents.push(document);
                        }
                    }
                    Err(e) => warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }

        documents.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(documents)
    }

    fn document_for(
        &self,
        path: &Path,
        extension: String,
        metadata: &std::fs::Metadata,
    ) -> Option<VaultDocument> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let modified = metadata
            .modified()
            .map(|time| DateTime::<Utc>::from(time).timestamp_millis())
            .unwrap_or_default();

        Some(VaultDocument {
            title: file_stem(&relative).to_string(),
            path: relative,
            extension,
            modified,
            size: metadata.len(),
        })
    }
}

#[async_trait]
impl VaultReader for FsVault {
    #[inline]
    async fn list_markdown_documents(&self) -> Result<Vec<VaultDocument>> {
        let documents = self.scan().await?;
        debug!(
            "Found {} documents under {}",
            documents.len(),
            self.root.display()
        );
        Ok(documents)
    }

    #[inline]
    async fn read_document(&self, document: &VaultDocument) -> Result<String> {
        let path = self.root.join(&document.path);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RagError::Vault(format!("Failed to read {}: {}", document.path, e)))
    }

    #[inline]
    fn watch(&self) -> Result<mpsc::Receiver<VaultEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let vault = self.clone();

        tokio::spawn(async move {
            let mut known = match vault.scan().await {
                Ok(documents) => snapshot(documents),
                Err(e) => {
                    warn!("Initial vault scan failed, watching from empty: {}", e);
                    HashMap::new()
                }
            };
            info!(
                "Watching {} ({} documents) every {:?}",
                vault.root.display(),
                known.len(),
                vault.poll_interval
            );

            let mut interval = tokio::time::interval(vault.poll_interval);
            interval.tick().await;

            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                let current = match vault.scan().await {
                    Ok(documents) => snapshot(documents),
                    Err(e) => {
                        warn!("Vault scan failed: {}", e);
                        continue;
                    }
                };

                let mut events = Vec::new();
                for (path, document) in &current {
                    let changed = known.get(path).is_none_or(|old| {
                        old.modified != document.modified || old.size != document.size
                    });
                    if changed {
                        events.push(VaultEvent::Modified(document.clone()));
                    }
                }
                for path in known.keys() {
                    if !current.contains_key(path) {
                        events.push(VaultEvent::Deleted(path.clone()));
                    }
                }
                known = current;

                for event in events {
                    debug!("Vault event: {:?}", event);
                    if tx.send(event).await.is_err() {
                        debug!("Vault watcher receiver dropped");
                        return;
                    }
                }
            }

            debug!("Vault watcher stopped");
        });

        Ok(rx)
    }
}

fn snapshot(documents: Vec<VaultDocument>) -> HashMap<String, VaultDocument> {
    documents
        .into_iter()
        .map(|document| (document.path.clone(), document))
        .collect()
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Title of a note: its first level-1 heading, else the file name
#[inline]
pub fn extract_title(content: &str, path: &str) -> String {
    let parser = Parser::new_ext(content, Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);
    let mut in_heading = false;
    let mut title = String::new();

    for event in parser {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) => {
                in_heading = true;
            }
            Event::End(TagEnd::Heading(HeadingLevel::H1)) => {
                if !title.trim().is_empty() {
                    return title.trim().to_string();
                }
                in_heading = false;
            }
            Event::Text(text) | Event::Code(text) if in_heading => {
                title.push_str(&text);
            }
            _ => {}
        }
    }

    file_stem(path).to_string()
}

/// Tags from the frontmatter `tags:` field and inline `#tag` markers,
/// without the leading `#`, in first-seen order
#[inline]
pub fn extract_tags(content: &str) -> Vec<String> {
    let (frontmatter, body) = split_frontmatter(content);
    let mut tags: Vec<String> = Vec::new();
    let mut push = |tag: &str| {
        let tag = tag.trim().trim_matches(|c: char| c == '"' || c == '\'').trim_start_matches('#');
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    };

    if let Some(frontmatter) = frontmatter {
        let mut in_list = false;
        for line in frontmatter.lines() {
            if in_list {
                if let Some(item) = line.trim_start().strip_prefix("- ") {
                    push(item);
                    continue;
                }
                if line.starts_with([' ', '\t']) && line.trim().is_empty() {
                    continue;
                }
                in_list = false;
            }

            if let Some(value) = line.strip_prefix("tags:") {
                let value = value.trim().trim_start_matches('[').trim_end_matches(']');
                if value.is_empty() {
                    in_list = true;
                } else {
                    value.split(',').for_each(&mut push);
                }
            }
        }
    }

    for captures in INLINE_TAG.captures_iter(body) {
        let Ok(captures) = captures else {
            break;
        };
        if let Some(tag) = captures.get(1) {
            push(tag.as_str());
        }
    }

    tags
}

/// Split a leading `---` delimited YAML block from the body
fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (None, content);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return (Some(&rest[..offset]), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }

    (None, content)
}
