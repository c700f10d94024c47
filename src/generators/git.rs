//! Git generator: one parameter set per matching directory or file
//!
//! Directory entries emit `path`, `path.basename` and
//! `path.basenameNormalized`. File entries parse each matching JSON or YAML
//! file, flatten its content into dotted keys and add the same path fields
//! for the file's directory plus `path.filename`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::{append_values, Generator, Params};
use crate::crd::{ApplicationSet, GeneratorKind, GeneratorSpec, GitDirectoryItem, GitGenerator};
use crate::Error;

/// Repository access used by the Git generator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepoService: Send + Sync {
    /// Every directory of the repository at `revision`, repository-relative
    async fn list_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>, Error>;

    /// Contents of every file matching `pattern`, keyed by repository-relative path
    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error>;
}

/// Generates parameters from a git repository
pub struct GitParamsGenerator<S: RepoService> {
    repo: S,
}

impl<S: RepoService> GitParamsGenerator<S> {
    /// Create a generator over `repo`
    pub fn new(repo: S) -> Self {
        Self { repo }
    }

    async fn directory_params(&self, git: &GitGenerator) -> Result<Vec<Params>, Error> {
        let filter = DirectoryFilter::new(&git.directories)?;
        let mut dirs = self.repo.list_directories(&git.repo_url, &git.revision).await?;
        dirs.sort();

        let params = dirs
            .into_iter()
            .filter(|dir| filter.accepts(dir))
            .map(|dir| {
                let mut params = Params::new();
                insert_path_params(&mut params, &dir);
                params
            })
            .collect::<Vec<_>>();

        debug!(repo = %git.repo_url, count = params.len(), "matched directories");
        Ok(params)
    }

    async fn file_params(&self, git: &GitGenerator) -> Result<Vec<Params>, Error> {
        let mut all = Vec::new();

        for item in &git.files {
            let files = self
                .repo
                .get_files(&git.repo_url, &git.revision, &item.path)
                .await?;

            for (path, content) in files {
                for mut params in parse_file(&path, &content)? {
                    let dir = parent_dir(&path);
                    insert_path_params(&mut params, dir);
                    let filename = path.rsplit('/').next().unwrap_or(&path);
                    params.insert("path.filename".to_string(), filename.to_string());
                    params.insert("path.filenameNormalized".to_string(), normalize_name(filename));
                    all.push(params);
                }
            }
        }

        debug!(repo = %git.repo_url, count = all.len(), "parsed parameter files");
        Ok(all)
    }
}

#[async_trait]
impl<S: RepoService> Generator for GitParamsGenerator<S> {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _owner: &ApplicationSet,
    ) -> Result<Option<Vec<Params>>, Error> {
        let GeneratorKind::Git(git) = spec.kind()? else {
            return Ok(None);
        };

        if git.repo_url.trim().is_empty() {
            return Err(Error::generator("git", "repoURL must not be empty"));
        }
        if git.directories.is_empty() && git.files.is_empty() {
            return Err(Error::generator(
                "git",
                "at least one of directories or files must be set",
            ));
        }

        let mut params = Vec::new();
        if !git.directories.is_empty() {
            params.extend(self.directory_params(git).await?);
        }
        if !git.files.is_empty() {
            params.extend(self.file_params(git).await?);
        }

        for p in &mut params {
            append_values(p, &git.values);
        }

        Ok(Some(params))
    }
}

/// Include/exclude glob filter for directory entries
struct DirectoryFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl DirectoryFilter {
    const OPTIONS: MatchOptions = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    fn new(items: &[GitDirectoryItem]) -> Result<Self, Error> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for item in items {
            let pattern = Pattern::new(&item.path).map_err(|e| {
                Error::generator("git", format!("invalid directory glob '{}': {}", item.path, e))
            })?;
            if item.exclude {
                exclude.push(pattern);
            } else {
                include.push(pattern);
            }
        }

        Ok(Self { include, exclude })
    }

    fn accepts(&self, dir: &str) -> bool {
        let hit = |p: &Pattern| p.matches_with(dir, Self::OPTIONS);
        self.include.iter().any(hit) && !self.exclude.iter().any(hit)
    }
}

fn insert_path_params(params: &mut Params, dir: &str) {
    let basename = dir.rsplit('/').next().unwrap_or(dir);
    params.insert("path".to_string(), dir.to_string());
    params.insert("path.basename".to_string(), basename.to_string());
    params.insert("path.basenameNormalized".to_string(), normalize_name(basename));
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Lower-case and replace anything outside `[a-z0-9-]` with `-`, so the
/// value can be used in resource names
fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Parse a parameter file into one parameter set per document entry.
///
/// A top-level mapping yields one set; a top-level sequence of mappings
/// yields one set per element.
fn parse_file(path: &str, content: &[u8]) -> Result<Vec<Params>, Error> {
    let doc: serde_yaml::Value = serde_yaml::from_slice(content)
        .map_err(|e| Error::generator("git", format!("unable to parse {path}: {e}")))?;

    let entries = match doc {
        serde_yaml::Value::Mapping(_) => vec![doc],
        serde_yaml::Value::Sequence(items) => items,
        _ => {
            return Err(Error::generator(
                "git",
                format!("{path} must contain an object or a list of objects"),
            ))
        }
    };

    entries
        .iter()
        .map(|entry| {
            if !entry.is_mapping() {
                return Err(Error::generator(
                    "git",
                    format!("{path}: list entries must be objects"),
                ));
            }
            let mut params = Params::new();
            flatten(None, entry, &mut params);
            Ok(params)
        })
        .collect()
}

/// Flatten nested YAML into dotted keys; sequences use numeric segments
fn flatten(prefix: Option<&str>, value: &serde_yaml::Value, out: &mut Params) {
    let join = |segment: &str| match prefix {
        Some(p) => format!("{p}.{segment}"),
        None => segment.to_string(),
    };

    match value {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                flatten(Some(&join(&scalar_to_string(k))), v, out);
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(Some(&join(&i.to_string())), v, out);
            }
        }
        serde_yaml::Value::Tagged(tagged) => flatten(prefix, &tagged.value, out),
        scalar => {
            if let Some(p) = prefix {
                out.insert(p.to_string(), scalar_to_string(scalar));
            }
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
