// Parent shell command log.
//
// This process is a child of the shell that invoked it and cannot change that
// shell's environment directly. Instead every mutation is recorded as a
// `ShellCommand` and rendered as one line of text that the parent evaluates
// afterwards, e.g. `eval "$(ciboot --print-to-shell setup)"`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::environment::{insert_token, remove_token, InsertMode, LIST_SEPARATOR};
use crate::logging::CapturedOutput;

/// One operation the parent shell must replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Set `key` to `value`, or unset it when `value` is `None`.
    Overwrite { key: String, value: Option<String> },
    InsertIntoList {
        key: String,
        value: String,
        mode: InsertMode,
    },
    /// Remove one previously inserted `token`; which occurrence depends on `mode`.
    RemoveFromList {
        key: String,
        token: String,
        mode: InsertMode,
    },
    DefineCommand { name: String, command: String },
    Exit(i32),
}

impl ShellCommand {
    /// Evaluate the command against a variable map the way the parent would.
    pub fn apply(&self, vars: &mut BTreeMap<String, String>) {
        match self {
            ShellCommand::Overwrite { key, value } => match value {
                Some(value) => {
                    vars.insert(key.clone(), value.clone());
                }
                None => {
                    vars.remove(key);
                }
            },
            ShellCommand::InsertIntoList { key, value, mode } => {
                let updated = insert_token(vars.get(key).map(String::as_str), value, *mode);
                vars.insert(key.clone(), updated);
            }
            ShellCommand::RemoveFromList { key, token, mode } => {
                if let Some(updated) = vars
                    .get(key)
                    .and_then(|list| remove_token(list, token, *mode))
                {
                    vars.insert(key.clone(), updated);
                }
            }
            ShellCommand::DefineCommand { .. } | ShellCommand::Exit(_) => {}
        }
    }
}

/// Target shell dialect for rendered commands.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ShellDialect {
    /// bash and other POSIX shells
    #[default]
    Bash,
    Powershell,
}

impl ShellDialect {
    /// Render a command as exactly one statement-terminated line.
    pub fn render(&self, command: &ShellCommand) -> String {
        match self {
            ShellDialect::Bash => render_bash(command),
            ShellDialect::Powershell => render_powershell(command),
        }
    }
}

fn bash_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn render_bash(command: &ShellCommand) -> String {
    let sep = LIST_SEPARATOR;
    match command {
        ShellCommand::Overwrite {
            key,
            value: Some(value),
        } => format!("export {key}={};\n", bash_quote(value)),
        ShellCommand::Overwrite { key, value: None } => format!("unset {key};\n"),
        ShellCommand::InsertIntoList {
            key,
            value,
            mode: InsertMode::Prepend,
        } => format!(
            "export {key}={}\"${{{key}:+{sep}${{{key}}}}}\";\n",
            bash_quote(value)
        ),
        ShellCommand::InsertIntoList {
            key,
            value,
            mode: InsertMode::Append,
        } => format!(
            "export {key}=\"${{{key}:+${{{key}}}{sep}}}\"{};\n",
            bash_quote(value)
        ),
        ShellCommand::RemoveFromList { key, token, mode } => {
            let needle = bash_quote(&format!("{sep}{token}{sep}"));
            let (head, tail) = match mode {
                InsertMode::Prepend => ("%%", "#"),
                InsertMode::Append => ("%", "##"),
            };
            format!(
                "case \"{sep}${{{key}}}{sep}\" in *{needle}*) \
                 __ciboot_l=\"{sep}${{{key}}}{sep}\"; \
                 __ciboot_l=\"${{__ciboot_l{head}{needle}*}}{sep}${{__ciboot_l{tail}*{needle}}}\"; \
                 __ciboot_l=\"${{__ciboot_l#\"{sep}\"}}\"; \
                 export {key}=\"${{__ciboot_l%\"{sep}\"}}\"; \
                 unset __ciboot_l;; esac;\n"
            )
        }
        ShellCommand::DefineCommand { name, command } => {
            format!("{name}() {{ {command} \"$@\"; }};\n")
        }
        ShellCommand::Exit(status) => format!("exit {status};\n"),
    }
}

fn powershell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '`' | '"' | '$') {
            quoted.push('`');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn render_powershell(command: &ShellCommand) -> String {
    let sep = "[IO.Path]::PathSeparator";
    match command {
        ShellCommand::Overwrite {
            key,
            value: Some(value),
        } => format!("$env:{key} = {};\n", powershell_quote(value)),
        ShellCommand::Overwrite { key, value: None } => {
            format!("Remove-Item Env:{key} -ErrorAction SilentlyContinue;\n")
        }
        ShellCommand::InsertIntoList {
            key,
            value,
            mode: InsertMode::Prepend,
        } => {
            let value = powershell_quote(value);
            format!(
                "$env:{key} = if ($env:{key}) {{ {value} + {sep} + $env:{key} }} else {{ {value} }};\n"
            )
        }
        ShellCommand::InsertIntoList {
            key,
            value,
            mode: InsertMode::Append,
        } => {
            let value = powershell_quote(value);
            format!(
                "$env:{key} = if ($env:{key}) {{ $env:{key} + {sep} + {value} }} else {{ {value} }};\n"
            )
        }
        ShellCommand::RemoveFromList { key, token, mode } => {
            let find = match mode {
                InsertMode::Prepend => "IndexOf",
                InsertMode::Append => "LastIndexOf",
            };
            format!(
                "if ($env:{key}) {{ \
                 $__ciboot_l = [Collections.Generic.List[string]]($env:{key}.Split({sep})); \
                 $__ciboot_i = $__ciboot_l.{find}({}); \
                 if ($__ciboot_i -ge 0) {{ $__ciboot_l.RemoveAt($__ciboot_i); $env:{key} = $__ciboot_l -join {sep} }} }};\n",
                powershell_quote(token)
            )
        }
        ShellCommand::DefineCommand { name, command } => {
            format!("function {name} {{ {command} @args }};\n")
        }
        ShellCommand::Exit(status) => format!("exit {status};\n"),
    }
}

struct ShellState {
    sink: Box<dyn Write + Send>,
    commands: Vec<ShellCommand>,
}

/// Write-only, order-preserving log of commands for the parent shell.
///
/// None of the operations can fail: they only append text. Problems surface
/// later, when the parent evaluates what was written.
pub struct ParentShell {
    dialect: ShellDialect,
    state: Mutex<ShellState>,
}

impl ParentShell {
    pub fn new(dialect: ShellDialect, sink: Box<dyn Write + Send>) -> Self {
        Self {
            dialect,
            state: Mutex::new(ShellState {
                sink,
                commands: Vec::new(),
            }),
        }
    }

    /// Emit to standard output, for an enclosing `eval`.
    pub fn stdout(dialect: ShellDialect) -> Self {
        Self::new(dialect, Box::new(io::stdout()))
    }

    /// Record commands without emitting any text.
    pub fn discard(dialect: ShellDialect) -> Self {
        Self::new(dialect, Box::new(io::sink()))
    }

    pub fn captured(dialect: ShellDialect) -> (Self, CapturedOutput) {
        let output = CapturedOutput::default();
        (Self::new(dialect, Box::new(output.clone())), output)
    }

    pub fn dialect(&self) -> ShellDialect {
        self.dialect
    }

    pub fn overwrite(&self, key: &str, value: Option<&str>) {
        self.push(ShellCommand::Overwrite {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }

    pub fn prepend_to_list(&self, key: &str, value: &str) {
        self.insert_into_list(key, value, InsertMode::Prepend);
    }

    pub fn append_to_list(&self, key: &str, value: &str) {
        self.insert_into_list(key, value, InsertMode::Append);
    }

    pub fn insert_into_list(&self, key: &str, value: &str, mode: InsertMode) {
        self.push(ShellCommand::InsertIntoList {
            key: key.to_string(),
            value: value.to_string(),
            mode,
        });
    }

    pub fn remove_from_list(&self, key: &str, token: &str, mode: InsertMode) {
        self.push(ShellCommand::RemoveFromList {
            key: key.to_string(),
            token: token.to_string(),
            mode,
        });
    }

    pub fn define_command(&self, name: &str, command: &str) {
        self.push(ShellCommand::DefineCommand {
            name: name.to_string(),
            command: command.to_string(),
        });
    }

    pub fn exit(&self, status: i32) {
        self.push(ShellCommand::Exit(status));
    }

    /// Every command recorded so far, in emission order.
    pub fn commands(&self) -> Vec<ShellCommand> {
        self.state.lock().commands.clone()
    }

    /// The parent's view of `initial` after it evaluates everything emitted.
    pub fn replay(&self, initial: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut vars = initial.clone();
        for command in &self.state.lock().commands {
            command.apply(&mut vars);
        }
        vars
    }

    fn push(&self, command: ShellCommand) {
        let line = self.dialect.render(&command);
        let mut state = self.state.lock();
        let mut written = state.sink.write_all(line.as_bytes());
        if written.is_ok() {
            written = state.sink.flush();
        }
        if let Err(e) = written {
            tracing::debug!("Parent shell sink write failed: {e}");
        }
        state.commands.push(command);
    }
}

impl std::fmt::Debug for ParentShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentShell")
            .field("dialect", &self.dialect)
            .field("commands", &self.state.lock().commands.len())
            .finish()
    }
}
