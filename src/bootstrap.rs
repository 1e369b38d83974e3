// Handing control to an entry script

use crate::container::Container;
use crate::error::Result;
use crate::process::{ExecuteOptions, ProcessRunner, RunningOutput};

/// Variables describing the container to the entry script.
pub fn container_environment(container: &Container) -> ExecuteOptions {
    ExecuteOptions::new()
        .with_env("CIBOOT_ROOT", container.root().to_string_lossy())
        .with_env("CIBOOT_CACHE_DIR", container.cache_dir().to_string_lossy())
        .with_env(
            "CIBOOT_LANGUAGES_DIR",
            container.languages_dir().to_string_lossy(),
        )
        .with_env(
            "CIBOOT_SCRIPTS_DIR",
            container.scripts_dir().to_string_lossy(),
        )
}

/// Fetch `logical_path` and run it with `args`, streaming its output.
///
/// Returns the script's status. A failing script is also counted against the
/// container like any other command.
pub fn run_entry_script(
    container: &Container,
    runner: &ProcessRunner,
    logical_path: &str,
    args: &[String],
) -> Result<i32> {
    let unit = container.import_script(logical_path, None)?;
    container
        .printer()
        .line(&format!("-> Running {logical_path}"));
    let _indent = container.printer().indent();

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(unit.path.to_string_lossy().to_string());
    argv.extend(args.iter().cloned());

    tracing::info!(script = logical_path, path = %unit.path.display(), "Handing over to entry script");
    runner.execute(
        container,
        &RunningOutput,
        &argv,
        &container_environment(container),
    )
}
