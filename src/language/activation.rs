// Activation protocol shared by every language container.
//
// Activation applies an `ActiveEnvironment` to the local environment table and,
// line for line, to the parent shell. Before anything is changed a record is
// written under a namespaced key so deactivation can restore the exact prior
// state, including variables that did not exist. The names of all touched
// variables are recorded too, so deactivation needs nothing but the table.

use tracing::debug;

use crate::environment::{insert_token, remove_token, EnvironmentTable, InsertMode};
use crate::error::{CibootError, EnvironmentError, Result};
use crate::shell::ParentShell;

use super::capability::ActiveEnvironment;

const KEY_PREFIX: &str = "_CIBOOT";

/// Environment variable names used to track one language's activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationKeys {
    pub activated: String,
    pub version: String,
    pub variables: String,
    backup_prefix: String,
    inserted_prefix: String,
}

impl ActivationKeys {
    pub fn for_language(language: &str) -> Self {
        let tag = sanitize(language);
        Self {
            activated: format!("{KEY_PREFIX}_ACTIVE_{tag}"),
            version: format!("{KEY_PREFIX}_{tag}_VERSION"),
            variables: format!("{KEY_PREFIX}_{tag}_VARS"),
            backup_prefix: format!("{KEY_PREFIX}_{tag}_BACKUP_"),
            inserted_prefix: format!("{KEY_PREFIX}_{tag}_INSERTED_"),
        }
    }

    /// Key holding the pre-activation value of an overwritten variable.
    pub fn backup_key(&self, variable: &str) -> String {
        format!("{}{}", self.backup_prefix, sanitize(variable))
    }

    /// Key holding the token inserted into a list variable.
    pub fn inserted_key(&self, variable: &str) -> String {
        format!("{}{}", self.inserted_prefix, sanitize(variable))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

// Backups are `=<value>` for a present value and `!` for an absent one.
fn encode_backup(value: Option<&str>) -> String {
    match value {
        Some(value) => format!("={value}"),
        None => "!".to_string(),
    }
}

fn decode_backup(key: &str, encoded: &str) -> Result<Option<String>> {
    if encoded == "!" {
        Ok(None)
    } else if let Some(value) = encoded.strip_prefix('=') {
        Ok(Some(value.to_string()))
    } else {
        Err(corrupt(key, encoded))
    }
}

// Insertion records are `+<token>` if the list existed and `!<token>` if not.
fn encode_insertion(existed: bool, token: &str) -> String {
    format!("{}{token}", if existed { '+' } else { '!' })
}

fn decode_insertion<'a>(key: &str, encoded: &'a str) -> Result<(bool, &'a str)> {
    if let Some(token) = encoded.strip_prefix('+') {
        Ok((true, token))
    } else if let Some(token) = encoded.strip_prefix('!') {
        Ok((false, token))
    } else {
        Err(corrupt(key, encoded))
    }
}

/// One variable touched by an activation, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Touched {
    Overwrite(String),
    Insert(String, InsertMode),
}

const MANIFEST_SEPARATOR: char = ',';

// Manifest entries are `=NAME`, `<NAME` (prepend) or `>NAME` (append).
fn encode_manifest(environment: &ActiveEnvironment) -> Result<String> {
    let overwrites = environment.overwrite.keys().map(|name| ('=', name));
    let inserts = environment.insert.iter().map(|(name, insertion)| {
        let marker = match insertion.mode {
            InsertMode::Prepend => '<',
            InsertMode::Append => '>',
        };
        (marker, name)
    });

    let mut entries = Vec::new();
    for (marker, name) in overwrites.chain(inserts) {
        if name.contains(MANIFEST_SEPARATOR) {
            return Err(CibootError::Environment(Box::new(
                EnvironmentError::InvalidName { name: name.clone() },
            )));
        }
        entries.push(format!("{marker}{name}"));
    }
    Ok(entries.join(MANIFEST_SEPARATOR.to_string().as_str()))
}

fn decode_manifest(key: &str, encoded: &str) -> Result<Vec<Touched>> {
    encoded
        .split(MANIFEST_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut chars = entry.chars();
            let marker = chars.next();
            let name = chars.as_str().to_string();
            match marker {
                _ if name.is_empty() => Err(corrupt(key, encoded)),
                Some('=') => Ok(Touched::Overwrite(name)),
                Some('<') => Ok(Touched::Insert(name, InsertMode::Prepend)),
                Some('>') => Ok(Touched::Insert(name, InsertMode::Append)),
                _ => Err(corrupt(key, encoded)),
            }
        })
        .collect()
}

fn corrupt(key: &str, value: &str) -> CibootError {
    CibootError::Environment(Box::new(EnvironmentError::CorruptRecord {
        key: key.to_string(),
        value: value.to_string(),
    }))
}

/// Mirrors every assignment into the local table and the parent shell.
struct Propagator<'a> {
    table: &'a mut EnvironmentTable,
    shell: &'a ParentShell,
}

impl Propagator<'_> {
    fn assign(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.table.assign(name, value)?;
        self.shell.overwrite(name, value);
        Ok(())
    }
}

/// Apply `environment` for `language`. Returns `false` if already active.
pub fn activate(
    table: &mut EnvironmentTable,
    shell: &ParentShell,
    language: &str,
    version: &str,
    environment: &ActiveEnvironment,
) -> Result<bool> {
    let keys = ActivationKeys::for_language(language);
    if table.contains(&keys.activated) {
        debug!(language, "Already active");
        return Ok(false);
    }

    let manifest = encode_manifest(environment)?;
    let mut out = Propagator { table, shell };
    out.assign(&keys.variables, Some(&manifest))?;

    for (name, value) in &environment.overwrite {
        let backup = encode_backup(out.table.get(name));
        out.assign(&keys.backup_key(name), Some(&backup))?;
        out.assign(name, value.as_deref())?;
    }

    for (name, insertion) in &environment.insert {
        let existing = out.table.get(name).map(str::to_string);
        let record = encode_insertion(existing.is_some(), &insertion.value);
        out.assign(&keys.inserted_key(name), Some(&record))?;

        let updated = insert_token(existing.as_deref(), &insertion.value, insertion.mode);
        out.table.set(name, &updated)?;
        out.shell
            .insert_into_list(name, &insertion.value, insertion.mode);
    }

    out.assign(&keys.activated, Some("1"))?;
    out.assign(&keys.version, Some(version))?;

    debug!(language, version, "Activated");
    Ok(true)
}

/// Undo a previous `activate`. Returns `false` if not active.
///
/// Everything needed is read back from the table, so this works for any
/// language without its capability.
pub fn deactivate(table: &mut EnvironmentTable, shell: &ParentShell, language: &str) -> Result<bool> {
    let keys = ActivationKeys::for_language(language);
    if !table.contains(&keys.activated) {
        debug!(language, "Not active");
        return Ok(false);
    }

    let touched = match table.get(&keys.variables) {
        Some(manifest) => decode_manifest(&keys.variables, manifest)?,
        None => Vec::new(),
    };
    let mut out = Propagator { table, shell };

    for entry in touched.iter().rev() {
        match entry {
            Touched::Insert(name, mode) => {
                let key = keys.inserted_key(name);
                let Some(record) = out.table.get(&key).map(str::to_string) else {
                    continue;
                };
                let (existed, token) = decode_insertion(&key, &record)?;
                strip_token(&mut out, name, token, *mode, existed)?;
                out.assign(&key, None)?;
            }
            Touched::Overwrite(name) => {
                let key = keys.backup_key(name);
                let Some(record) = out.table.get(&key).map(str::to_string) else {
                    continue;
                };
                let previous = decode_backup(&key, &record)?;
                out.assign(name, previous.as_deref())?;
                out.assign(&key, None)?;
            }
        }
    }

    out.assign(&keys.version, None)?;
    out.assign(&keys.variables, None)?;
    out.assign(&keys.activated, None)?;

    debug!(language, "Deactivated");
    Ok(true)
}

fn strip_token(
    out: &mut Propagator<'_>,
    name: &str,
    token: &str,
    mode: InsertMode,
    existed: bool,
) -> Result<()> {
    let Some(current) = out.table.get(name).map(str::to_string) else {
        return Ok(());
    };
    let Some(remaining) = remove_token(&current, token, mode) else {
        debug!(variable = name, token, "Inserted value already gone");
        return Ok(());
    };

    if remaining.is_empty() && !existed {
        out.assign(name, None)
    } else {
        out.table.set(name, &remaining)?;
        out.shell.remove_from_list(name, token, mode);
        Ok(())
    }
}
