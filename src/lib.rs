// ciboot - Library module
// Runtime containers for CI jobs: reversible environment activation that is
// propagated back to the invoking shell, cached script resolution, and
// external process execution with selectable output visibility.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod container;
pub mod download;
pub mod environment;
pub mod error;
pub mod language;
pub mod logging;
pub mod process;
pub mod script_cache;
pub mod shell;

// Re-export main types for easier access
pub use bootstrap::run_entry_script;
pub use config::{Config, DownloadConfig};
pub use container::Container;
pub use download::{retry_with_backoff, Downloader, RetryPolicy};
pub use environment::{EnvChange, EnvironmentTable, InsertMode, SharedEnvironment};
pub use error::{
    exit_codes, CibootError, CliError, ConfigError, ContainerError, DownloadError,
    EnvironmentError, ProcessError, Result, ScriptError,
};
pub use language::{
    ActivationGuard, ActivationKeys, ActiveEnvironment, Capability, DeactivationGuard, Installer,
    InstallerRegistry, LanguageContainer, LanguageKind, ListInsertion,
};
pub use logging::{ColorConfig, LogConfig, LogFormat, Printer};
pub use process::{
    ExecuteOptions, LongRunningSuppressed, OutputOnFail, OutputStrategy, ProcessRunner,
    RunningOutput,
};
pub use script_cache::{FetchedModule, ScriptCache, ScriptUnit, UnitOrigin};
pub use shell::{ParentShell, ShellCommand, ShellDialect};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

// Build information (set by build script)
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const GIT_COMMIT: &str = env!("GIT_COMMIT");
pub const GIT_BRANCH: &str = env!("GIT_BRANCH");
pub const RUST_VERSION: &str = env!("RUST_VERSION");

/// Get formatted version string with build information
pub fn version_info() -> String {
    format!(
        "{NAME} {VERSION} (commit: {GIT_COMMIT}, branch: {GIT_BRANCH}, built: {BUILD_DATE}, rustc: {RUST_VERSION})"
    )
}
