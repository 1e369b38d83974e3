// Logical script resolution and the loaded-unit cache

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::download::{fetch_bytes, http_client, write_atomically, FetchError};
use crate::error::{CibootError, Result, ScriptError};

/// Where a logical path resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedModule {
    pub path: PathBuf,
    /// True when the file lives in the internal scripts directory rather than
    /// the working directory.
    pub in_scripts_dir: bool,
}

/// How a unit was loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOrigin {
    /// Found at its expected place in the scripts directory, addressable by a
    /// dotted module name like any other unit there.
    Namespace { module: String },
    /// Loaded straight from a file path.
    File,
}

/// A loaded script. Shared as `Arc<ScriptUnit>`; repeated imports of the
/// same `(domain, path)` return the same allocation.
#[derive(Debug)]
pub struct ScriptUnit {
    pub logical_path: String,
    pub path: PathBuf,
    pub source: String,
    pub origin: UnitOrigin,
}

pub struct ScriptCache {
    scripts_dir: PathBuf,
    working_dir: PathBuf,
    units: HashMap<(String, String), Arc<ScriptUnit>>,
    client: Option<reqwest::blocking::Client>,
}

impl ScriptCache {
    /// Cache rooted at `scripts_dir`, resolving local copies against the
    /// current working directory.
    pub fn new(scripts_dir: PathBuf) -> Result<Self> {
        let working_dir = std::env::current_dir()?;
        Ok(Self::with_working_dir(scripts_dir, working_dir))
    }

    pub fn with_working_dir(scripts_dir: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            scripts_dir,
            working_dir,
            units: HashMap::new(),
            client: None,
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Find `logical_path` locally, or download it from `domain`.
    ///
    /// A copy in the working directory always wins and never touches the
    /// network. Otherwise the file is mirrored under the scripts directory.
    pub fn resolve(&mut self, logical_path: &str, domain: &str) -> Result<FetchedModule> {
        let relative = validate_logical_path(logical_path)?;

        let local = self.working_dir.join(&relative);
        if local.is_file() {
            debug!(path = %local.display(), "Using working copy");
            return Ok(FetchedModule {
                path: local,
                in_scripts_dir: false,
            });
        }

        let mirrored = self.scripts_dir.join(&relative);
        if !mirrored.is_file() {
            let url = script_url(domain, logical_path)?;
            self.download(&url, &mirrored)?;
        }

        Ok(FetchedModule {
            path: mirrored,
            in_scripts_dir: true,
        })
    }

    /// Resolve and load `logical_path`, memoized on `(domain, logical_path)`.
    pub fn fetch_and_import(&mut self, logical_path: &str, domain: &str) -> Result<Arc<ScriptUnit>> {
        let key = (domain.to_string(), logical_path.to_string());
        if let Some(unit) = self.units.get(&key) {
            debug!(logical_path, domain, "Script cache hit");
            return Ok(unit.clone());
        }

        let fetched = self.resolve(logical_path, domain)?;
        let source = std::fs::read_to_string(&fetched.path).map_err(|e| {
            CibootError::Script(Box::new(ScriptError::LoadFailed {
                path: fetched.path.clone(),
                error: e.to_string(),
            }))
        })?;

        let origin = if fetched.in_scripts_dir {
            namespace_module(logical_path)
                .map(|module| UnitOrigin::Namespace { module })
                .unwrap_or(UnitOrigin::File)
        } else {
            UnitOrigin::File
        };

        let unit = Arc::new(ScriptUnit {
            logical_path: logical_path.to_string(),
            path: fetched.path,
            source,
            origin,
        });
        self.units.insert(key, unit.clone());
        Ok(unit)
    }

    pub fn is_cached(&self, domain: &str, logical_path: &str) -> bool {
        self.units
            .contains_key(&(domain.to_string(), logical_path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn download(&mut self, url: &str, dest: &Path) -> Result<()> {
        let fetch_failed = |error: FetchError| match error {
            FetchError::Status(status) => CibootError::Script(Box::new(ScriptError::BadStatus {
                url: url.to_string(),
                status,
            })),
            FetchError::Transport(error) => {
                CibootError::Script(Box::new(ScriptError::FetchFailed {
                    url: url.to_string(),
                    error,
                }))
            }
        };

        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let client = http_client().map_err(fetch_failed)?;
                self.client = Some(client.clone());
                client
            }
        };

        debug!(url, path = %dest.display(), "Fetching script");
        let body = fetch_bytes(&client, url).map_err(fetch_failed)?;
        write_atomically(dest, &body)?;
        Ok(())
    }
}

fn invalid(path: &str, reason: &str) -> CibootError {
    CibootError::Script(Box::new(ScriptError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }))
}

fn validate_logical_path(logical_path: &str) -> Result<PathBuf> {
    if logical_path.is_empty() {
        return Err(invalid(logical_path, "path is empty"));
    }
    let path = Path::new(logical_path);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(invalid(logical_path, "must be relative and stay inside its domain")),
        }
    }
    Ok(path.to_path_buf())
}

fn script_url(domain: &str, logical_path: &str) -> Result<String> {
    let base = if domain.contains("://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", domain.trim_end_matches('/'))
    };
    let url = format!("{base}/{logical_path}");
    url::Url::parse(&url).map_err(|e| invalid(logical_path, &e.to_string()))?;
    Ok(url)
}

/// Dotted module name for a path like `ciscripts/python/setup.py`, if every
/// component is a valid identifier.
fn namespace_module(logical_path: &str) -> Option<String> {
    let path = Path::new(logical_path);
    let stem = path.file_stem()?.to_str()?;
    let mut parts: Vec<&str> = path
        .parent()
        .into_iter()
        .flat_map(|parent| parent.components())
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    parts.push(stem);

    let is_identifier = |part: &&str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if parts.iter().all(is_identifier) {
        Some(parts.join("."))
    } else {
        None
    }
}
