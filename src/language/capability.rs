// Active environment declarations for each supported tool runtime

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::environment::InsertMode;
use crate::error::{CibootError, ContainerError};

/// A value inserted into a path-like list variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListInsertion {
    pub value: String,
    pub mode: InsertMode,
}

/// The environment delta that makes one runtime active.
///
/// `overwrite` replaces variables outright (`None` means the variable must be
/// unset while active). `insert` adds one token to path-like lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveEnvironment {
    pub overwrite: BTreeMap<String, Option<String>>,
    pub insert: BTreeMap<String, ListInsertion>,
}

impl ActiveEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overwrite.insert(name.into(), Some(value.into()));
        self
    }

    pub fn with_unset(mut self, name: impl Into<String>) -> Self {
        self.overwrite.insert(name.into(), None);
        self
    }

    pub fn with_prepend(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert.insert(
            name.into(),
            ListInsertion {
                value: value.into(),
                mode: InsertMode::Prepend,
            },
        );
        self
    }

    pub fn with_append(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert.insert(
            name.into(),
            ListInsertion {
                value: value.into(),
                mode: InsertMode::Append,
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.overwrite.is_empty() && self.insert.is_empty()
    }
}

/// Computes the active environment of an installed runtime.
///
/// Implemented for plain functions and closures, so each kind's strategy is
/// just a function over the installation path and version.
pub trait Capability: Send + Sync {
    fn active_environment(&self, installation: &Path, version: &str) -> ActiveEnvironment;
}

impl<F> Capability for F
where
    F: Fn(&Path, &str) -> ActiveEnvironment + Send + Sync,
{
    fn active_environment(&self, installation: &Path, version: &str) -> ActiveEnvironment {
        self(installation, version)
    }
}

/// The runtimes with built-in activation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LanguageKind {
    Python,
    Ruby,
    Haskell,
    Conan,
    Bii,
    Sandbox,
}

impl LanguageKind {
    pub const ALL: [LanguageKind; 6] = [
        LanguageKind::Python,
        LanguageKind::Ruby,
        LanguageKind::Haskell,
        LanguageKind::Conan,
        LanguageKind::Bii,
        LanguageKind::Sandbox,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LanguageKind::Python => "python",
            LanguageKind::Ruby => "ruby",
            LanguageKind::Haskell => "haskell",
            LanguageKind::Conan => "conan",
            LanguageKind::Bii => "bii",
            LanguageKind::Sandbox => "sandbox",
        }
    }

    pub fn capability(&self) -> Arc<dyn Capability> {
        match self {
            LanguageKind::Python => Arc::new(python_environment),
            LanguageKind::Ruby => Arc::new(ruby_environment),
            LanguageKind::Haskell => Arc::new(haskell_environment),
            LanguageKind::Conan => Arc::new(conan_environment),
            LanguageKind::Bii => Arc::new(bii_environment),
            LanguageKind::Sandbox => Arc::new(sandbox_environment),
        }
    }
}

impl fmt::Display for LanguageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LanguageKind {
    type Err = CibootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LanguageKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                CibootError::Container(Box::new(ContainerError::UnknownLanguage {
                    language: s.to_string(),
                    available: LanguageKind::ALL
                        .iter()
                        .map(|kind| kind.name().to_string())
                        .collect(),
                }))
            })
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn bin_dir(installation: &Path) -> String {
    display(&installation.join("bin"))
}

fn python_environment(installation: &Path, _version: &str) -> ActiveEnvironment {
    let scripts = if cfg!(windows) {
        display(&installation.join("Scripts"))
    } else {
        bin_dir(installation)
    };
    ActiveEnvironment::new()
        .with_overwrite("VIRTUAL_ENV", display(installation))
        .with_overwrite("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .with_unset("PYTHONHOME")
        .with_prepend("PATH", scripts)
}

fn ruby_environment(installation: &Path, _version: &str) -> ActiveEnvironment {
    let gems = installation.join("gems");
    ActiveEnvironment::new()
        .with_overwrite("GEM_HOME", display(&gems))
        .with_overwrite("BUNDLE_IGNORE_CONFIG", "1")
        .with_prepend("PATH", bin_dir(installation))
        .with_append("GEM_PATH", display(&gems))
}

fn haskell_environment(installation: &Path, _version: &str) -> ActiveEnvironment {
    ActiveEnvironment::new()
        .with_overwrite("CABAL_DIR", display(&installation.join(".cabal")))
        .with_overwrite("STACK_ROOT", display(&installation.join(".stack")))
        .with_prepend("PATH", bin_dir(installation))
}

fn conan_environment(installation: &Path, _version: &str) -> ActiveEnvironment {
    ActiveEnvironment::new()
        .with_overwrite("CONAN_USER_HOME", display(installation))
        .with_overwrite("CONAN_NON_INTERACTIVE", "1")
        .with_prepend("PATH", bin_dir(installation))
}

fn bii_environment(installation: &Path, _version: &str) -> ActiveEnvironment {
    ActiveEnvironment::new()
        .with_overwrite("BII_HOME", display(installation))
        .with_prepend("PATH", bin_dir(installation))
}

// The sandbox root holds a distribution image; its wrapper scripts live in bin/.
fn sandbox_environment(installation: &Path, version: &str) -> ActiveEnvironment {
    ActiveEnvironment::new()
        .with_overwrite("CIBOOT_SANDBOX_ROOT", display(&installation.join("root")))
        .with_overwrite("CIBOOT_SANDBOX_DISTRO", version)
        .with_prepend("PATH", bin_dir(installation))
}
