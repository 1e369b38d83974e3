// A handle to one installed, versioned tool runtime

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::environment::SharedEnvironment;
use crate::error::{CibootError, ContainerError, Result};
use crate::shell::ParentShell;

use super::activation::{self, ActivationKeys};
use super::capability::{ActiveEnvironment, Capability};

pub struct LanguageContainer {
    language: String,
    version: String,
    installation: PathBuf,
    environment: SharedEnvironment,
    shell: Arc<ParentShell>,
    capability: Arc<dyn Capability>,
}

impl LanguageContainer {
    /// Wrap an existing installation. Fails if `installation` does not exist.
    pub fn new(
        language: &str,
        version: &str,
        installation: PathBuf,
        environment: SharedEnvironment,
        shell: Arc<ParentShell>,
        capability: Arc<dyn Capability>,
    ) -> Result<Self> {
        if !installation.is_dir() {
            return Err(CibootError::Container(Box::new(
                ContainerError::LanguageNotInstalled {
                    language: language.to_string(),
                    version: version.to_string(),
                    path: installation,
                    suggestion: Some(format!(
                        "Run the {language} installer before requesting its container"
                    )),
                },
            )));
        }

        Ok(Self {
            language: language.to_string(),
            version: version.to_string(),
            installation,
            environment,
            shell,
            capability,
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn installation_path(&self) -> &Path {
        &self.installation
    }

    pub fn shell(&self) -> &ParentShell {
        &self.shell
    }

    pub fn keys(&self) -> ActivationKeys {
        ActivationKeys::for_language(&self.language)
    }

    pub fn active_environment(&self) -> ActiveEnvironment {
        self.capability
            .active_environment(&self.installation, &self.version)
    }

    /// Make this runtime active locally and in the parent shell.
    ///
    /// Returns `false` without touching anything if it is already active.
    pub fn activate(&self) -> Result<bool> {
        let environment = self.active_environment();
        let mut table = self.environment.lock();
        activation::activate(
            &mut table,
            &self.shell,
            &self.language,
            &self.version,
            &environment,
        )
    }

    /// Restore the environment captured by `activate`.
    ///
    /// Returns `false` without touching anything if it is not active.
    pub fn deactivate(&self) -> Result<bool> {
        let mut table = self.environment.lock();
        activation::deactivate(&mut table, &self.shell, &self.language)
    }

    pub fn is_active(&self) -> bool {
        self.environment.lock().contains(&self.keys().activated)
    }

    /// Version recorded by whichever container of this language is active.
    pub fn active_version(&self) -> Option<String> {
        self.environment
            .lock()
            .get(&self.keys().version)
            .map(str::to_string)
    }

    /// Activate until the guard is dropped.
    pub fn activated(&self) -> Result<ActivationGuard<'_>> {
        let changed = self.activate()?;
        Ok(ActivationGuard {
            container: self,
            changed,
        })
    }

    /// Deactivate until the guard is dropped.
    pub fn deactivated(&self) -> Result<DeactivationGuard<'_>> {
        let changed = self.deactivate()?;
        Ok(DeactivationGuard {
            container: self,
            changed,
        })
    }
}

impl std::fmt::Debug for LanguageContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageContainer")
            .field("language", &self.language)
            .field("version", &self.version)
            .field("installation", &self.installation)
            .finish()
    }
}

/// Deactivates on drop, if this guard was the one that activated.
#[must_use = "the container is deactivated as soon as the guard is dropped"]
pub struct ActivationGuard<'a> {
    container: &'a LanguageContainer,
    changed: bool,
}

impl ActivationGuard<'_> {
    /// Whether entering the scope changed anything.
    pub fn changed(&self) -> bool {
        self.changed
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if self.changed {
            if let Err(e) = self.container.deactivate() {
                tracing::error!(
                    language = %self.container.language,
                    "Deactivation on scope exit failed: {e}"
                );
            }
        }
    }
}

/// Re-activates on drop, if the container was active when the guard was taken.
#[must_use = "the container is re-activated as soon as the guard is dropped"]
pub struct DeactivationGuard<'a> {
    container: &'a LanguageContainer,
    changed: bool,
}

impl DeactivationGuard<'_> {
    pub fn changed(&self) -> bool {
        self.changed
    }
}

impl Drop for DeactivationGuard<'_> {
    fn drop(&mut self) {
        if self.changed {
            if let Err(e) = self.container.activate() {
                tracing::error!(
                    language = %self.container.language,
                    "Re-activation on scope exit failed: {e}"
                );
            }
        }
    }
}
