// Error handling framework for ciboot
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CibootError>;

/// Main error type for ciboot
#[derive(Debug, Error)]
pub enum CibootError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<ConfigError>),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("CLI argument error: {0}")]
    Cli(#[from] Box<CliError>),

    #[error("Process execution failed: {0}")]
    Process(#[from] Box<ProcessError>),

    #[error("Script resolution failed: {0}")]
    Script(#[from] Box<ScriptError>),

    #[error("Environment update failed: {0}")]
    Environment(#[from] Box<EnvironmentError>),

    #[error("Container operation failed: {0}")]
    Container(#[from] Box<ContainerError>),

    #[error("Download failed: {0}")]
    Download(#[from] Box<DownloadError>),

    /// A command marked instant-fail exited non-zero. The exit directive has
    /// already been sent to the parent shell.
    #[error("Aborting after {failures} failure(s)")]
    InstantFail { failures: u32 },
}

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid YAML syntax: {message}")]
    InvalidYaml {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
        file_path: Option<PathBuf>,
    },

    #[error("Configuration file not found: {path}")]
    NotFound {
        path: PathBuf,
        suggestion: Option<String>,
    },

    #[error("Invalid configuration value: {message}")]
    InvalidValue {
        message: String,
        field: String,
        value: String,
        expected: String,
        file_path: Option<PathBuf>,
    },
}

/// CLI argument and command-line interface errors
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid argument: {argument}")]
    InvalidArgument {
        argument: String,
        message: String,
        suggestion: Option<String>,
    },

    #[error("Conflicting arguments: {first} and {second}")]
    ConflictingArguments {
        first: String,
        second: String,
        suggestion: String,
    },
}

/// Process execution errors with detailed context
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Process spawn failed: {command}")]
    SpawnFailed { command: String, error: String },

    #[error("Output capture failed: {message}")]
    OutputCaptureFailed { message: String, command: String },

    #[error("Waiting for process failed: {command}")]
    WaitFailed { command: String, error: String },

    #[error("Invalid interpreter line in {path}")]
    InvalidInterpreter { path: PathBuf, line: String },

    #[error("Command not found: {command}")]
    CommandNotFound {
        command: String,
        suggestion: Option<String>,
    },

    #[error("Runtime initialization failed: {error}")]
    RuntimeFailed { error: String },
}

/// Logical script resolution and loading errors
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Invalid logical script path: {path}")]
    InvalidPath { path: String, reason: String },

    #[error("Fetching {url} failed: {error}")]
    FetchFailed { url: String, error: String },

    #[error("Fetching {url} returned HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Loading script {path} failed: {error}")]
    LoadFailed { path: PathBuf, error: String },
}

/// Environment table and activation errors
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Invalid environment variable name: {name:?}")]
    InvalidName { name: String },

    #[error("Invalid value for environment variable {name}")]
    InvalidValue { name: String },

    #[error("Corrupt activation record in {key}: {value:?}")]
    CorruptRecord { key: String, value: String },
}

/// Container layout and language record errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Directory creation failed: {path}")]
    DirectoryFailed { path: PathBuf, error: String },

    #[error("{language} {version} is not installed at {path}")]
    LanguageNotInstalled {
        language: String,
        version: String,
        path: PathBuf,
        suggestion: Option<String>,
    },

    #[error("Unknown language: {language}")]
    UnknownLanguage {
        language: String,
        available: Vec<String>,
    },

    #[error("Malformed language record entry: {entry:?}")]
    MalformedRecord { entry: String, path: PathBuf },

    #[error("Invalid cache directory name: {name:?}")]
    InvalidCacheName { name: String },
}

/// Auxiliary download errors
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Downloading {url} failed after {} attempt(s)", attempts.len())]
    RetriesExhausted { url: String, attempts: Vec<String> },

    #[error("Writing download to {path} failed: {error}")]
    WriteFailed { path: PathBuf, error: String },
}

/// Format errors with colors and context
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Format an error with context and colors
    pub fn format_error(&self, error: &CibootError) -> String {
        use tracing::error;

        let error_type = match error {
            CibootError::Config(_) => "config",
            CibootError::Io(_) => "io",
            CibootError::Cli(_) => "cli",
            CibootError::Process(_) => "process",
            CibootError::Script(_) => "script",
            CibootError::Environment(_) => "environment",
            CibootError::Container(_) => "container",
            CibootError::Download(_) => "download",
            CibootError::InstantFail { .. } => "instant_fail",
        };
        error!(error_type = error_type, error = %error, "Operation failed");

        let mut output = String::new();

        if self.use_colors {
            output.push_str("\x1b[31m");
        }
        output.push_str("Error: ");
        if self.use_colors {
            output.push_str("\x1b[0m");
        }

        output.push_str(&error.to_string());

        match error {
            CibootError::Config(config_err) => {
                self.add_config_context(&mut output, config_err.as_ref());
            }
            CibootError::Cli(cli_err) => {
                self.add_cli_context(&mut output, cli_err.as_ref());
            }
            CibootError::Process(process_err) => {
                self.add_process_context(&mut output, process_err.as_ref());
            }
            CibootError::Container(container_err) => {
                self.add_container_context(&mut output, container_err.as_ref());
            }
            CibootError::Download(download_err) => {
                self.add_download_context(&mut output, download_err.as_ref());
            }
            _ => {}
        }

        output
    }

    fn add_config_context(&self, output: &mut String, error: &ConfigError) {
        match error {
            ConfigError::InvalidYaml {
                file_path: Some(path),
                line: Some(line),
                ..
            } => {
                output.push_str(&format!("\n  --> {}:{}", path.display(), line));
            }
            ConfigError::NotFound {
                suggestion: Some(suggestion),
                ..
            } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            ConfigError::InvalidValue { expected, .. } => {
                output.push_str(&format!("\n  Expected: {expected}"));
            }
            _ => {}
        }
    }

    fn add_cli_context(&self, output: &mut String, error: &CliError) {
        match error {
            CliError::InvalidArgument {
                suggestion: Some(suggestion),
                ..
            } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            CliError::ConflictingArguments { suggestion, .. } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            _ => {}
        }
    }

    fn add_process_context(&self, output: &mut String, error: &ProcessError) {
        match error {
            ProcessError::CommandNotFound {
                suggestion: Some(suggestion),
                ..
            } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            ProcessError::SpawnFailed { error, .. } => {
                output.push_str(&format!("\n  Process error: {error}"));
            }
            ProcessError::InvalidInterpreter { line, .. } => {
                output.push_str(&format!("\n  Interpreter line: {line}"));
            }
            _ => {}
        }
    }

    fn add_container_context(&self, output: &mut String, error: &ContainerError) {
        match error {
            ContainerError::LanguageNotInstalled {
                suggestion: Some(suggestion),
                ..
            } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            ContainerError::UnknownLanguage { available, .. } => {
                output.push_str(&format!("\n  Available: {}", available.join(", ")));
            }
            _ => {}
        }
    }

    fn add_download_context(&self, output: &mut String, error: &DownloadError) {
        if let DownloadError::RetriesExhausted { attempts, .. } = error {
            for (i, attempt) in attempts.iter().enumerate() {
                output.push_str(&format!("\n    {}: {}", i + 1, attempt));
            }
        }
    }
}

/// Exit codes for hard errors. Check failures exit with their count instead.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const CLI_ERROR: i32 = 7;
    pub const PROCESS_ERROR: i32 = 9;
    pub const SCRIPT_ERROR: i32 = 11;
    pub const ENVIRONMENT_ERROR: i32 = 12;
    pub const CONTAINER_ERROR: i32 = 13;
    pub const DOWNLOAD_ERROR: i32 = 14;

    /// Highest status a process can report; counts above it saturate.
    pub const MAX_STATUS: i32 = 255;

    /// Exit status for `failures` accumulated check failures.
    pub fn from_failures(failures: u32) -> i32 {
        failures.min(MAX_STATUS as u32) as i32
    }
}

impl CibootError {
    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CibootError::Config(_) => exit_codes::CONFIG_ERROR,
            CibootError::Cli(_) => exit_codes::CLI_ERROR,
            CibootError::Process(_) => exit_codes::PROCESS_ERROR,
            CibootError::Script(_) => exit_codes::SCRIPT_ERROR,
            CibootError::Environment(_) => exit_codes::ENVIRONMENT_ERROR,
            CibootError::Container(_) => exit_codes::CONTAINER_ERROR,
            CibootError::Download(_) => exit_codes::DOWNLOAD_ERROR,
            CibootError::InstantFail { failures } => exit_codes::from_failures(*failures),
            CibootError::Io(_) => exit_codes::GENERAL_ERROR,
        }
    }

    /// Create a user-friendly error message with context
    pub fn user_message(&self, use_colors: bool) -> String {
        let formatter = ErrorFormatter::new(use_colors);
        formatter.format_error(self)
    }
}

// Conversion from serde_yaml::Error to ConfigError
impl From<serde_yaml::Error> for Box<ConfigError> {
    fn from(error: serde_yaml::Error) -> Self {
        let location = error.location();
        Box::new(ConfigError::InvalidYaml {
            message: error.to_string(),
            line: location.as_ref().map(|l| l.line() as u32),
            column: location.as_ref().map(|l| l.column() as u32),
            file_path: None,
        })
    }
}
