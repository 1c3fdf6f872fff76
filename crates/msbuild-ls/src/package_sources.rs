//
// package_sources.rs
//
// Package source discovery and name/version suggestion
//

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::syntax::{self, NodeId, SyntaxTree};

/// A configured package feed reachable over the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSource {
    pub name: String,
    pub url: Url,
}

/// Boundary to the package registry client.
#[async_trait]
pub trait PackageSourceProvider: Send + Sync {
    /// Network package sources in effect for projects under `directory`.
    async fn list_sources(&self, directory: &Path) -> anyhow::Result<Vec<PackageSource>>;

    /// Package ids starting with `prefix` (case-insensitive).
    async fn suggest_names(&self, prefix: &str) -> anyhow::Result<BTreeSet<String>>;

    /// Available versions of package `name`, lowest first.
    async fn suggest_versions(&self, name: &str) -> anyhow::Result<BTreeSet<PackageVersion>>;
}

// ============================================================================
// Versions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid package version")]
pub struct InvalidVersion(pub String);

#[derive(Debug, Clone)]
enum PreRelease {
    Numeric(u64),
    Text(String),
}

impl PreRelease {
    fn cmp_precedence(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreRelease::Numeric(a), PreRelease::Numeric(b)) => a.cmp(b),
            (PreRelease::Numeric(_), PreRelease::Text(_)) => Ordering::Less,
            (PreRelease::Text(_), PreRelease::Numeric(_)) => Ordering::Greater,
            (PreRelease::Text(a), PreRelease::Text(b)) => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
        }
    }
}

/// A package version ordered by semantic-version precedence.
///
/// Up to four numeric components are accepted (`1.2.3.4`); missing ones
/// count as zero, so `1.0` and `1.0.0` are equal. Pre-release labels sort
/// below the release and compare case-insensitively. Build metadata is kept
/// for display but ignored by comparisons.
#[derive(Debug, Clone)]
pub struct PackageVersion {
    numbers: [u64; 4],
    pre_release: Vec<PreRelease>,
    original: String,
}

impl PackageVersion {
    pub fn major(&self) -> u64 {
        self.numbers[0]
    }

    pub fn minor(&self) -> u64 {
        self.numbers[1]
    }

    pub fn patch(&self) -> u64 {
        self.numbers[2]
    }

    pub fn is_pre_release(&self) -> bool {
        !self.pre_release.is_empty()
    }
}

impl FromStr for PackageVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_string());
        let trimmed = s.trim();
        let without_build = trimmed.split_once('+').map_or(trimmed, |(v, _)| v);
        let (release, pre) = match without_build.split_once('-') {
            Some((release, pre)) => (release, Some(pre)),
            None => (without_build, None),
        };

        let parts: Vec<&str> = release.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid());
        }
        let mut numbers = [0u64; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        let mut pre_release = Vec::new();
        if let Some(pre) = pre {
            for identifier in pre.split('.') {
                let valid = !identifier.is_empty()
                    && identifier
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'-');
                if !valid {
                    return Err(invalid());
                }
                pre_release.push(match identifier.parse::<u64>() {
                    Ok(n) if identifier.bytes().all(|b| b.is_ascii_digit()) => PreRelease::Numeric(n),
                    _ => PreRelease::Text(identifier.to_string()),
                });
            }
        }

        Ok(Self {
            numbers,
            pre_release,
            original: trimmed.to_string(),
        })
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numbers.cmp(&other.numbers).then_with(|| {
            match (self.pre_release.is_empty(), other.pre_release.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    for (a, b) in self.pre_release.iter().zip(&other.pre_release) {
                        let ordering = a.cmp_precedence(b);
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    self.pre_release.len().cmp(&other.pre_release.len())
                }
            }
        })
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

// ============================================================================
// nuget.config discovery
// ============================================================================

/// Reads package sources from the `nuget.config` files above a project and
/// suggests packages from local folder feeds.
#[derive(Debug, Clone, Default)]
pub struct NuGetConfigSources {
    /// Folder feeds laid out as `<feed>/<id>/<version>/`.
    feeds: Vec<PathBuf>,
}

impl NuGetConfigSources {
    pub fn new(feeds: Vec<PathBuf>) -> Self {
        Self { feeds }
    }

    pub fn feeds(&self) -> &[PathBuf] {
        &self.feeds
    }
}

/// Find `nuget.config` in `dir`, matching the file name case-insensitively.
async fn find_config(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.eq_ignore_ascii_case("nuget.config"))
        {
            return Some(entry.path());
        }
    }
    None
}

/// Child elements of `parent` named `name` (case-insensitive).
fn children_named<'t>(
    tree: &'t SyntaxTree,
    parent: NodeId,
    name: &'t str,
) -> impl Iterator<Item = NodeId> + 't {
    tree.child_elements(parent).filter(move |child| {
        tree.node(*child)
            .name()
            .is_some_and(|n| n.eq_ignore_ascii_case(name))
    })
}

fn attribute_value<'t>(tree: &'t SyntaxTree, element: NodeId, name: &str) -> Option<&'t str> {
    tree.attributes(element)
        .filter_map(|attr| tree.node(attr).as_attribute())
        .find(|parts| parts.name.eq_ignore_ascii_case(name))
        .map(|parts| parts.value.as_str())
}

/// Fold one config file into the sources inherited from outer directories.
fn apply_config(text: &str, sources: &mut IndexMap<String, (String, String)>) {
    let tree = syntax::parse(text);
    let Some(root) = tree.root_element() else {
        return;
    };
    for section in children_named(&tree, root, "packageSources") {
        for entry in tree.child_elements(section) {
            match tree.node(entry).name().unwrap_or_default() {
                name if name.eq_ignore_ascii_case("clear") => sources.clear(),
                name if name.eq_ignore_ascii_case("add") => {
                    let (Some(key), Some(value)) = (
                        attribute_value(&tree, entry, "key"),
                        attribute_value(&tree, entry, "value"),
                    ) else {
                        continue;
                    };
                    sources.insert(key.to_ascii_lowercase(), (key.to_string(), value.to_string()));
                }
                name if name.eq_ignore_ascii_case("remove") => {
                    if let Some(key) = attribute_value(&tree, entry, "key") {
                        sources.shift_remove(&key.to_ascii_lowercase());
                    }
                }
                _ => {}
            }
        }
    }
    for section in children_named(&tree, root, "disabledPackageSources") {
        for entry in children_named(&tree, section, "add") {
            let disabled = attribute_value(&tree, entry, "value")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
            if let (true, Some(key)) = (disabled, attribute_value(&tree, entry, "key")) {
                sources.shift_remove(&key.to_ascii_lowercase());
            }
        }
    }
}

#[async_trait]
impl PackageSourceProvider for NuGetConfigSources {
    async fn list_sources(&self, directory: &Path) -> anyhow::Result<Vec<PackageSource>> {
        let mut dirs: Vec<&Path> = directory.ancestors().collect();
        dirs.reverse();

        let mut sources = IndexMap::new();
        for dir in dirs {
            let Some(config) = find_config(dir).await else {
                continue;
            };
            match tokio::fs::read_to_string(&config).await {
                Ok(text) => apply_config(&text, &mut sources),
                Err(err) => log::warn!("Skipping unreadable {}: {}", config.display(), err),
            }
        }

        let network = sources
            .into_values()
            .filter_map(|(name, value)| {
                let url = Url::parse(value.trim()).ok()?;
                matches!(url.scheme(), "http" | "https").then_some(PackageSource { name, url })
            })
            .collect::<Vec<_>>();
        log::trace!("{} package sources for {}", network.len(), directory.display());
        Ok(network)
    }

    async fn suggest_names(&self, prefix: &str) -> anyhow::Result<BTreeSet<String>> {
        let prefix = prefix.to_ascii_lowercase();
        let mut names = BTreeSet::new();
        for feed in &self.feeds {
            let Ok(mut entries) = tokio::fs::read_dir(feed).await else {
                log::debug!("Package feed {} is not readable", feed.display());
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if name.to_ascii_lowercase().starts_with(&prefix) {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn suggest_versions(&self, name: &str) -> anyhow::Result<BTreeSet<PackageVersion>> {
        let mut versions = BTreeSet::new();
        for feed in &self.feeds {
            let Ok(mut packages) = tokio::fs::read_dir(feed).await else {
                continue;
            };
            while let Some(package) = packages.next_entry().await? {
                let matches = package
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name));
                if !matches || !package.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(package.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let parsed = entry
                        .file_name()
                        .to_str()
                        .and_then(|v| v.parse::<PackageVersion>().ok());
                    if let Some(version) = parsed {
                        versions.insert(version);
                    }
                }
            }
        }
        Ok(versions)
    }
}
