// Installer registration for per-language provisioning collaborators

use dashmap::DashMap;
use std::sync::Arc;

use crate::container::Container;
use crate::error::{CibootError, ContainerError, Result};
use crate::process::ProcessRunner;
use crate::shell::ParentShell;

use super::container::LanguageContainer;

/// Provisions a runtime inside a container and hands back its handle.
///
/// Installers download and build the tool; the core only calls through this
/// seam and never looks inside.
pub trait Installer: Send + Sync {
    fn language(&self) -> &str;

    /// Install `version` if needed and return its container.
    fn get(
        &self,
        container: &Container,
        runner: &ProcessRunner,
        shell: &ParentShell,
        version: &str,
    ) -> Result<LanguageContainer>;
}

/// Installers keyed by language name
#[derive(Default)]
pub struct InstallerRegistry {
    installers: DashMap<String, Arc<dyn Installer>>,
}

impl InstallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an installer, replacing any previous one for the same language.
    pub fn register(&self, installer: Arc<dyn Installer>) {
        self.installers
            .insert(installer.language().to_string(), installer);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn Installer>> {
        self.installers
            .get(language)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CibootError::Container(Box::new(ContainerError::UnknownLanguage {
                    language: language.to_string(),
                    available: self.languages(),
                }))
            })
    }

    pub fn languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .installers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Look up the installer for `language` and ask it for `version`.
    pub fn container_for(
        &self,
        language: &str,
        container: &Container,
        runner: &ProcessRunner,
        version: &str,
    ) -> Result<LanguageContainer> {
        let installer = self.get(language)?;
        let shell = container.shell();
        installer.get(container, runner, shell.as_ref(), version)
    }
}
