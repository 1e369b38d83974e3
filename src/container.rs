// The per-job container: on-disk layout, language record, script cache and
// failure accounting

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DOMAIN;
use crate::download::{Downloader, RetryPolicy};
use crate::environment::SharedEnvironment;
use crate::error::{exit_codes, CibootError, ContainerError, Result};
use crate::language::{activation, Capability, LanguageContainer, LanguageKind};
use crate::logging::Printer;
use crate::process::LongRunningSuppressed;
use crate::script_cache::{FetchedModule, ScriptCache, ScriptUnit};
use crate::shell::ParentShell;

pub const CACHE_DIR: &str = "_cache";
pub const LANGUAGES_DIR: &str = "_languages";
pub const SCRIPTS_DIR: &str = "_scripts";
pub const LANGUAGE_RECORD: &str = "record";
pub const EPHEMERAL_LIST: &str = "ephemeral";

pub struct Container {
    root: PathBuf,
    cache_dir: PathBuf,
    languages_dir: PathBuf,
    scripts: Mutex<ScriptCache>,
    failures: AtomicU32,
    shell: Arc<ParentShell>,
    environment: SharedEnvironment,
    printer: Arc<Printer>,
    domain: String,
    heartbeat_interval: Duration,
    retry_policy: RetryPolicy,
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        CibootError::Container(Box::new(ContainerError::DirectoryFailed {
            path: path.to_path_buf(),
            error: e.to_string(),
        }))
    })
}

fn invalid_cache_name(name: &str) -> CibootError {
    CibootError::Container(Box::new(ContainerError::InvalidCacheName {
        name: name.to_string(),
    }))
}

/// A single path component, so cache entries stay inside the cache.
fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(invalid_cache_name(name));
    }
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn append_line_once(path: &Path, line: &str) -> Result<bool> {
    if read_lines(path)?.iter().any(|existing| existing == line) {
        return Ok(false);
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(true)
}

impl Container {
    /// Create (or reopen) the container at `root`.
    ///
    /// Scripts are mirrored under `<root>/_scripts` unless `scripts_dir`
    /// points at an existing directory to reuse.
    pub fn new(
        root: &Path,
        scripts_dir: Option<PathBuf>,
        shell: Arc<ParentShell>,
        environment: SharedEnvironment,
        printer: Arc<Printer>,
    ) -> Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        let cache_dir = root.join(CACHE_DIR);
        let languages_dir = root.join(LANGUAGES_DIR);
        let scripts_dir = scripts_dir.unwrap_or_else(|| root.join(SCRIPTS_DIR));

        for dir in [&root, &cache_dir, &languages_dir, &scripts_dir] {
            ensure_dir(dir)?;
        }
        debug!(root = %root.display(), "Container ready");

        Ok(Self {
            root,
            cache_dir,
            languages_dir,
            scripts: Mutex::new(ScriptCache::new(scripts_dir)?),
            failures: AtomicU32::new(0),
            shell,
            environment,
            printer,
            domain: DEFAULT_DOMAIN.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Default domain for logical script fetches.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Retry policy for auxiliary downloads.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Resolve working copies of scripts against `dir` instead of the
    /// current directory.
    pub fn with_working_dir(self, dir: PathBuf) -> Self {
        let scripts_dir = self.scripts.lock().scripts_dir().to_path_buf();
        *self.scripts.lock() = ScriptCache::with_working_dir(scripts_dir, dir);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn languages_dir(&self) -> &Path {
        &self.languages_dir
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts.lock().scripts_dir().to_path_buf()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn shell(&self) -> &Arc<ParentShell> {
        &self.shell
    }

    pub fn environment(&self) -> &SharedEnvironment {
        &self.environment
    }

    pub fn printer(&self) -> &Arc<Printer> {
        &self.printer
    }

    /// Heartbeat strategy at the configured interval, for long silent tools.
    pub fn long_running_output(&self) -> LongRunningSuppressed {
        LongRunningSuppressed::new(self.heartbeat_interval)
    }

    /// `<root>/_cache/<name>`, created if needed. Ephemeral caches are
    /// removed by `clean`.
    pub fn named_cache_dir(&self, name: &str, ephemeral: bool) -> Result<PathBuf> {
        if name == EPHEMERAL_LIST {
            return Err(invalid_cache_name(name));
        }
        check_entry_name(name)?;

        let dir = self.cache_dir.join(name);
        ensure_dir(&dir)?;
        if ephemeral && append_line_once(&self.cache_dir.join(EPHEMERAL_LIST), name)? {
            debug!(name, "Registered ephemeral cache");
        }
        Ok(dir)
    }

    /// Download an auxiliary binary or package into the durable cache
    /// `cache_name`, unless an earlier job already fetched it.
    pub fn fetch_auxiliary(&self, url: &str, cache_name: &str, file_name: &str) -> Result<PathBuf> {
        check_entry_name(file_name)?;
        let dest = self.named_cache_dir(cache_name, false)?.join(file_name);
        if dest.is_file() {
            debug!(url, path = %dest.display(), "Auxiliary download already cached");
            return Ok(dest);
        }
        self.printer.line(&format!("-> Downloading {url}"));
        Downloader::new(self.retry_policy.clone())?.download(url, &dest)
    }

    pub fn language_installation_path(&self, language: &str, version: &str) -> PathBuf {
        self.languages_dir.join(language).join(version)
    }

    /// Persist `(language, version)` so `clean` can find it later.
    pub fn register_language(&self, language: &str, version: &str) -> Result<()> {
        if language.is_empty() || language.contains('-') || version.is_empty() {
            return Err(CibootError::Container(Box::new(
                ContainerError::MalformedRecord {
                    entry: format!("{language}-{version}"),
                    path: self.record_path(),
                },
            )));
        }
        if append_line_once(&self.record_path(), &format!("{language}-{version}"))? {
            debug!(language, version, "Recorded language");
        }
        Ok(())
    }

    /// Every `(language, version)` ever requested from this container.
    pub fn language_record(&self) -> Result<BTreeSet<(String, String)>> {
        let path = self.record_path();
        read_lines(&path)?
            .into_iter()
            .map(|entry| match entry.split_once('-') {
                Some((language, version)) if !language.is_empty() && !version.is_empty() => {
                    Ok((language.to_string(), version.to_string()))
                }
                _ => Err(CibootError::Container(Box::new(
                    ContainerError::MalformedRecord {
                        entry,
                        path: path.clone(),
                    },
                ))),
            })
            .collect()
    }

    /// Container for one of the built-in runtimes.
    pub fn language_container(&self, kind: LanguageKind, version: &str) -> Result<LanguageContainer> {
        self.language_container_with(kind.name(), version, kind.capability())
    }

    /// Container for `language` using a caller-supplied capability.
    pub fn language_container_with(
        &self,
        language: &str,
        version: &str,
        capability: Arc<dyn Capability>,
    ) -> Result<LanguageContainer> {
        self.register_language(language, version)?;
        LanguageContainer::new(
            language,
            version,
            self.language_installation_path(language, version),
            self.environment.clone(),
            self.shell.clone(),
            capability,
        )
    }

    pub fn fetch_script(&self, logical_path: &str) -> Result<FetchedModule> {
        self.scripts.lock().resolve(logical_path, &self.domain)
    }

    /// Load `logical_path` from `domain` (the container's domain by default).
    pub fn import_script(&self, logical_path: &str, domain: Option<&str>) -> Result<Arc<ScriptUnit>> {
        let domain = domain.unwrap_or(&self.domain);
        self.scripts.lock().fetch_and_import(logical_path, domain)
    }

    /// Count a failed command. With `instant_fail`, tell the parent shell to
    /// exit and stop here.
    pub fn note_failure(&self, instant_fail: bool) -> Result<()> {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if instant_fail {
            warn!(failures, "Instant failure requested, aborting");
            self.shell.exit(exit_codes::from_failures(failures));
            return Err(CibootError::InstantFail { failures });
        }
        Ok(())
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Exit status for the whole invocation.
    pub fn exit_code(&self) -> i32 {
        exit_codes::from_failures(self.failures())
    }

    /// Undo whichever activation of `language` is current. Returns `false` if
    /// it is not active.
    pub fn deactivate_language(&self, language: &str) -> Result<bool> {
        let mut table = self.environment.lock();
        activation::deactivate(&mut table, &self.shell, language)
    }

    /// Deactivate every recorded language and delete ephemeral caches.
    pub fn clean(&self) -> Result<()> {
        for (language, version) in self.language_record()? {
            if self.deactivate_language(&language)? {
                info!(language, version, "Deactivated");
            }
        }

        let ephemeral_list = self.cache_dir.join(EPHEMERAL_LIST);
        for name in read_lines(&ephemeral_list)? {
            let dir = self.cache_dir.join(&name);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
                debug!(name, "Removed ephemeral cache");
            }
        }
        if ephemeral_list.exists() {
            std::fs::remove_file(&ephemeral_list)?;
        }
        Ok(())
    }

    fn record_path(&self) -> PathBuf {
        self.languages_dir.join(LANGUAGE_RECORD)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("root", &self.root)
            .field("domain", &self.domain)
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}
