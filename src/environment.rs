// Process-wide environment variable table.
//
// The table is the source of truth for every activation. It is snapshotted
// from the real process environment at start, mutated only through
// activation, and handed to every spawned child as its complete environment.
// Variables that are not valid UTF-8 cannot be activated but are carried
// through to children untouched.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use crate::error::{CibootError, EnvironmentError, Result};

/// Separator used inside path-like list variables.
pub const LIST_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

pub type SharedEnvironment = Arc<Mutex<EnvironmentTable>>;

/// Where a value is inserted into a path-like list variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMode {
    Prepend,
    Append,
}

/// One difference between two views of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Added { name: String, value: String },
    Changed { name: String, old: String, new: String },
    Removed { name: String, old: String },
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentTable {
    vars: BTreeMap<String, String>,
    opaque: BTreeMap<OsString, OsString>,
    sync_process: bool,
}

impl EnvironmentTable {
    /// Snapshot the current process environment. Later mutations are mirrored
    /// into the process so in-process library calls observe them too.
    pub fn from_process() -> Self {
        let mut vars = BTreeMap::new();
        let mut opaque = BTreeMap::new();
        for (name, value) in std::env::vars_os() {
            match (name.into_string(), value.into_string()) {
                (Ok(name), Ok(value)) => {
                    vars.insert(name, value);
                }
                (name, value) => {
                    let name = name.map_or_else(|n| n, OsString::from);
                    let value = value.map_or_else(|v| v, OsString::from);
                    opaque.insert(name, value);
                }
            }
        }
        Self {
            vars,
            opaque,
            sync_process: true,
        }
    }

    /// Detached table that never touches the real process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            opaque: BTreeMap::new(),
            sync_process: false,
        }
    }

    pub fn into_shared(self) -> SharedEnvironment {
        Arc::new(Mutex::new(self))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name) || self.opaque.contains_key(OsStr::new(name))
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        validate_name(name)?;
        if value.contains('\0') {
            return Err(CibootError::Environment(Box::new(
                EnvironmentError::InvalidValue {
                    name: name.to_string(),
                },
            )));
        }
        if self.sync_process {
            std::env::set_var(name, value);
        }
        self.opaque.remove(OsStr::new(name));
        self.vars.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        if self.sync_process && validate_name(name).is_ok() {
            std::env::remove_var(name);
        }
        self.opaque.remove(OsStr::new(name));
        self.vars.remove(name)
    }

    /// Set `name` to `value`, or remove it when `value` is `None`.
    pub fn assign(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.set(name, value),
            None => {
                self.remove(name);
                Ok(())
            }
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Inherited variables whose name or value is not UTF-8.
    pub fn opaque_vars(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.opaque
            .iter()
            .map(|(name, value)| (name.as_os_str(), value.as_os_str()))
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }

    /// Changes that turn `earlier` into the current table.
    pub fn diff(&self, earlier: &BTreeMap<String, String>) -> Vec<EnvChange> {
        let mut changes = Vec::new();
        for (name, value) in &self.vars {
            match earlier.get(name) {
                None => changes.push(EnvChange::Added {
                    name: name.clone(),
                    value: value.clone(),
                }),
                Some(old) if old != value => changes.push(EnvChange::Changed {
                    name: name.clone(),
                    old: old.clone(),
                    new: value.clone(),
                }),
                Some(_) => {}
            }
        }
        for (name, old) in earlier {
            if !self.vars.contains_key(name) {
                changes.push(EnvChange::Removed {
                    name: name.clone(),
                    old: old.clone(),
                });
            }
        }
        changes
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(CibootError::Environment(Box::new(
            EnvironmentError::InvalidName {
                name: name.to_string(),
            },
        )));
    }
    Ok(())
}

/// Insert `token` into a list variable whose current value is `existing`.
///
/// An absent or empty list becomes just the token.
pub fn insert_token(existing: Option<&str>, token: &str, mode: InsertMode) -> String {
    match existing {
        Some(list) if !list.is_empty() => match mode {
            InsertMode::Prepend => format!("{token}{LIST_SEPARATOR}{list}"),
            InsertMode::Append => format!("{list}{LIST_SEPARATOR}{token}"),
        },
        _ => token.to_string(),
    }
}

/// Remove one occurrence of `token` from `list`: the first for prepended
/// values, the last for appended ones. Returns `None` if it is not present.
///
/// A token that itself contains separators matches as a contiguous run of
/// elements, the same way the parent shell's substring surgery does.
pub fn remove_token(list: &str, token: &str, mode: InsertMode) -> Option<String> {
    let mut tokens: Vec<&str> = list.split(LIST_SEPARATOR).collect();
    let run: Vec<&str> = token.split(LIST_SEPARATOR).collect();
    if run.len() > tokens.len() {
        return None;
    }

    let mut starts =
        (0..=tokens.len() - run.len()).filter(|&i| tokens[i..i + run.len()] == run[..]);
    let start = match mode {
        InsertMode::Prepend => starts.next()?,
        InsertMode::Append => starts.last()?,
    };
    tokens.drain(start..start + run.len());
    Some(tokens.join(LIST_SEPARATOR.to_string().as_str()))
}
