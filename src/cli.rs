// CLI interface for ciboot using clap
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

use crate::bootstrap::run_entry_script;
use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::container::Container;
use crate::download::RetryPolicy;
use crate::environment::EnvironmentTable;
use crate::error::{CibootError, CliError, Result};
use crate::language::LanguageKind;
use crate::logging::Printer;
use crate::process::ProcessRunner;
use crate::shell::{ParentShell, ShellDialect};

#[derive(Parser)]
#[command(
    name = "ciboot",
    about = "Bootstrap per-tool runtime containers inside a CI job",
    version = crate::VERSION,
    long_about = "ciboot sets up a container directory for a CI job, hands control to an entry script, \
                  and propagates runtime activation back to the invoking shell."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Control color output (auto, always, never)
    #[arg(long, global = true, value_name = "WHEN")]
    pub color: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up the container and run an entry script (default command)
    Setup {
        /// Container root directory
        #[arg(long, default_value = "./container")]
        root: PathBuf,

        /// Reuse an existing scripts directory instead of <root>/_scripts
        #[arg(long)]
        scripts_directory: Option<PathBuf>,

        /// Logical path of the script to hand control to
        #[arg(long, value_name = "LOGICAL_PATH")]
        script: Option<String>,

        /// Domain to fetch scripts from
        #[arg(long)]
        domain: Option<String>,

        /// Emit parent shell commands on stdout
        #[arg(long)]
        print_to_shell: bool,

        /// Dialect of the emitted shell commands
        #[arg(long, value_enum)]
        shell: Option<ShellDialect>,

        /// Arguments forwarded to the entry script
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Activate an installed runtime; evaluate the output in the calling shell
    Activate {
        /// Container root directory
        #[arg(long, default_value = "./container")]
        root: PathBuf,

        /// Runtime to activate (python, ruby, haskell, conan, bii, sandbox)
        #[arg(long)]
        language: String,

        /// Installed version of the runtime
        #[arg(long)]
        version: String,

        /// Emit parent shell commands on stdout
        #[arg(long)]
        print_to_shell: bool,

        /// Dialect of the emitted shell commands
        #[arg(long, value_enum)]
        shell: Option<ShellDialect>,
    },

    /// Undo a previous activation of a runtime
    Deactivate {
        /// Container root directory
        #[arg(long, default_value = "./container")]
        root: PathBuf,

        /// Runtime to deactivate
        #[arg(long)]
        language: String,

        /// Emit parent shell commands on stdout
        #[arg(long)]
        print_to_shell: bool,

        /// Dialect of the emitted shell commands
        #[arg(long, value_enum)]
        shell: Option<ShellDialect>,
    },

    /// Deactivate every recorded runtime and remove ephemeral caches
    Clean {
        /// Container root directory
        #[arg(long, default_value = "./container")]
        root: PathBuf,

        /// Emit parent shell commands on stdout
        #[arg(long)]
        print_to_shell: bool,

        /// Dialect of the emitted shell commands
        #[arg(long, value_enum)]
        shell: Option<ShellDialect>,
    },

    /// Generate shell completion scripts
    GenerateCompletion {
        /// Shell to generate completion for
        shell: Shell,
    },
}

impl Cli {
    pub fn run(&self) -> Result<i32> {
        self.init_logging();

        if self.verbose && self.quiet {
            return Err(CibootError::Cli(Box::new(CliError::ConflictingArguments {
                first: "--verbose".to_string(),
                second: "--quiet".to_string(),
                suggestion: "Use either --verbose for more output or --quiet for less output, but not both".to_string(),
            })));
        }

        match &self.command {
            Some(Commands::GenerateCompletion { shell }) => {
                let mut cmd = Self::command();
                let name = cmd.get_name().to_string();
                generate(*shell, &mut cmd, name, &mut std::io::stdout());
                Ok(0)
            }
            Some(Commands::Activate {
                root,
                language,
                version,
                print_to_shell,
                shell,
            }) => {
                let kind: LanguageKind = language.parse()?;
                let config = self.load_config()?;
                let dialect = shell.unwrap_or(config.shell);
                let container = open_container(root, None, *print_to_shell, dialect)?;
                if !container.language_container(kind, version)?.activate()? {
                    tracing::info!(language, "Already active");
                }
                Ok(0)
            }
            Some(Commands::Deactivate {
                root,
                language,
                print_to_shell,
                shell,
            }) => {
                let config = self.load_config()?;
                let dialect = shell.unwrap_or(config.shell);
                let container = open_container(root, None, *print_to_shell, dialect)?;
                if !container.deactivate_language(language)? {
                    tracing::info!(language, "Not active");
                }
                Ok(0)
            }
            Some(Commands::Clean {
                root,
                print_to_shell,
                shell,
            }) => {
                let config = self.load_config()?;
                let dialect = shell.unwrap_or(config.shell);
                let container = open_container(root, None, *print_to_shell, dialect)?;
                container.clean()?;
                Ok(0)
            }
            Some(Commands::Setup {
                root,
                scripts_directory,
                script,
                domain,
                print_to_shell,
                shell,
                args,
            }) => self.setup(
                root,
                scripts_directory.clone(),
                script.as_deref(),
                domain.as_deref(),
                *print_to_shell,
                *shell,
                args,
            ),
            None => self.setup(Path::new("./container"), None, None, None, false, None, &[]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &self,
        root: &Path,
        scripts_directory: Option<PathBuf>,
        script: Option<&str>,
        domain: Option<&str>,
        print_to_shell: bool,
        shell: Option<ShellDialect>,
        args: &[String],
    ) -> Result<i32> {
        let config = self.load_config()?;
        if let Some(dir) = &scripts_directory {
            if !dir.is_dir() {
                return Err(CibootError::Cli(Box::new(CliError::InvalidArgument {
                    argument: "--scripts-directory".to_string(),
                    message: format!("{} is not a directory", dir.display()),
                    suggestion: Some("Omit it to use <root>/_scripts".to_string()),
                })));
            }
        }
        if script.is_none() && !args.is_empty() {
            return Err(CibootError::Cli(Box::new(CliError::InvalidArgument {
                argument: "ARGS".to_string(),
                message: "arguments given without an entry script".to_string(),
                suggestion: Some("Pass --script <LOGICAL_PATH> to choose the script".to_string()),
            })));
        }

        let dialect = shell.unwrap_or(config.shell);
        let container = open_container(root, scripts_directory, print_to_shell, dialect)?
            .with_domain(domain.unwrap_or(&config.domain))
            .with_heartbeat_interval(Duration::from_secs(config.heartbeat_interval_secs))
            .with_retry_policy(RetryPolicy::from_config(&config.download));

        let Some(script) = script else {
            tracing::info!(root = %container.root().display(), "Container set up");
            return Ok(0);
        };

        let runner = ProcessRunner::new()?;
        run_entry_script(&container, &runner, script, args)?;
        tracing::debug!(failures = container.failures(), "Entry script finished");
        Ok(container.exit_code())
    }

    fn load_config(&self) -> Result<Config> {
        Config::load_or_default(Path::new(&self.config))
    }

    fn init_logging(&self) {
        use crate::logging::{init_logging, LogConfig};

        let log_config = LogConfig::from_cli(self.verbose, self.quiet, self.color.clone());

        if let Err(e) = init_logging(log_config) {
            eprintln!("Failed to initialize logging: {e}");
        }
    }
}

fn open_container(
    root: &Path,
    scripts_directory: Option<PathBuf>,
    print_to_shell: bool,
    dialect: ShellDialect,
) -> Result<Container> {
    let shell = if print_to_shell {
        ParentShell::stdout(dialect)
    } else {
        ParentShell::discard(dialect)
    };
    Container::new(
        root,
        scripts_directory,
        Arc::new(shell),
        EnvironmentTable::from_process().into_shared(),
        Arc::new(Printer::stderr()),
    )
}
