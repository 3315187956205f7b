//! Cacheable context for agent sessions.
//!
//! Loads content from files, glob patterns, or inline text and structures
//! it as labeled system blocks flagged for provider-side prompt caching.
//! Missing sources are warned about and skipped; a bad source never fails
//! the session build.

use std::path::Path;
use tracing::{debug, warn};

use crate::definitions::schema::{CacheSource, CachingConfig};
use crate::llm::SystemBlock;

/// Build the cached system blocks for an agent's caching configuration.
pub fn build_cached_blocks(project_root: &Path, caching: &CachingConfig) -> Vec<SystemBlock> {
    let mut blocks = Vec::new();
    if !caching.enabled {
        return blocks;
    }

    for source in &caching.cache_sources {
        match source {
            CacheSource::File { path, label } => {
                load_file(project_root, path, label, &mut blocks);
            }
            CacheSource::Glob { pattern, label } => {
                load_glob(project_root, pattern, label, &mut blocks);
            }
            CacheSource::Inline { content, label } => {
                add_block(label, content, &mut blocks);
            }
            CacheSource::Codex { uri, label } => {
                // The codex provider hook is unconfigured; sources of this
                // kind are skipped until an integration is registered.
                let _ = label;
                warn!(
                    uri = %uri,
                    "codex cache source is configured but no provider is integrated; skipping"
                );
            }
        }
    }

    blocks
}

fn add_block(label: &str, content: &str, blocks: &mut Vec<SystemBlock>) {
    if content.trim().is_empty() {
        warn!(label = label, "Skipping empty cached block");
        return;
    }
    blocks.push(SystemBlock::cached_text(format!(
        "## {}\n\n{}",
        label, content
    )));
    debug!(label = label, chars = content.len(), "Added cached block");
}

fn load_file(project_root: &Path, path: &str, label: &str, blocks: &mut Vec<SystemBlock>) {
    let file_path = project_root.join(path);
    match std::fs::read_to_string(&file_path) {
        Ok(content) => add_block(label, &content, blocks),
        Err(e) => warn!(path = %file_path.display(), error = %e, "File not found for caching"),
    }
}

fn load_glob(project_root: &Path, pattern: &str, label: &str, blocks: &mut Vec<SystemBlock>) {
    let full_pattern = project_root.join(pattern);
    let Some(pattern_str) = full_pattern.to_str() else {
        warn!(pattern = pattern, "Glob pattern is not valid UTF-8");
        return;
    };

    let mut paths: Vec<_> = match glob::glob(pattern_str) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
        Err(e) => {
            warn!(pattern = pattern, error = %e, "Invalid glob pattern");
            return;
        }
    };
    paths.sort();

    if paths.is_empty() {
        warn!(pattern = pattern, "No files found for pattern");
        return;
    }

    let mut contents = Vec::new();
    for path in &paths {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let relative = path.strip_prefix(project_root).unwrap_or(path);
                contents.push(format!("### {}\n\n{}", relative.display(), content));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read file for caching"),
        }
    }

    if !contents.is_empty() {
        add_block(label, &contents.join("\n\n"), blocks);
        debug!(pattern = pattern, files = paths.len(), "Loaded glob cache source");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn caching(sources: Vec<CacheSource>) -> CachingConfig {
        CachingConfig {
            enabled: true,
            cache_sources: sources,
        }
    }

    #[test]
    fn test_disabled_caching_yields_nothing() {
        let dir = tempdir().unwrap();
        let config = CachingConfig {
            enabled: false,
            cache_sources: vec![CacheSource::Inline {
                content: "text".to_string(),
                label: "L".to_string(),
            }],
        };
        assert!(build_cached_blocks(dir.path(), &config).is_empty());
    }

    #[test]
    fn test_inline_source() {
        let dir = tempdir().unwrap();
        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::Inline {
                content: "Team conventions".to_string(),
                label: "Conventions".to_string(),
            }]),
        );
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].cached);
        assert!(blocks[0].text.starts_with("## Conventions"));
        assert!(blocks[0].text.contains("Team conventions"));
    }

    #[test]
    fn test_empty_inline_content_skipped() {
        let dir = tempdir().unwrap();
        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::Inline {
                content: "   ".to_string(),
                label: "Empty".to_string(),
            }]),
        );
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_file_source() {
        let dir = tempdir().unwrap();
        let docs = dir.path().join(".fractary/docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("STANDARDS.md"), "# Standards\n\nUse tabs.").unwrap();

        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::File {
                path: ".fractary/docs/STANDARDS.md".to_string(),
                label: "Standards".to_string(),
            }]),
        );
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].text.contains("Use tabs."));
    }

    #[test]
    fn test_missing_file_skipped() {
        let dir = tempdir().unwrap();
        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::File {
                path: "nope.md".to_string(),
                label: "Missing".to_string(),
            }]),
        );
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_glob_source_concatenates_sorted() {
        let dir = tempdir().unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("b.md"), "second").unwrap();
        fs::write(templates.join("a.md"), "first").unwrap();

        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::Glob {
                pattern: "templates/*.md".to_string(),
                label: "Templates".to_string(),
            }]),
        );
        assert_eq!(blocks.len(), 1);
        let text = &blocks[0].text;
        let a_pos = text.find("### templates/a.md").unwrap();
        let b_pos = text.find("### templates/b.md").unwrap();
        assert!(a_pos < b_pos);
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_glob_no_matches_skipped() {
        let dir = tempdir().unwrap();
        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::Glob {
                pattern: "missing/*.md".to_string(),
                label: "None".to_string(),
            }]),
        );
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_codex_source_is_skipped() {
        let dir = tempdir().unwrap();
        let blocks = build_cached_blocks(
            dir.path(),
            &caching(vec![CacheSource::Codex {
                uri: "codex://org/project/standards.md".to_string(),
                label: "Standards".to_string(),
            }]),
        );
        assert!(blocks.is_empty());
    }
}
