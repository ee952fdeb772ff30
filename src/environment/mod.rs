//! # Environment & Variables
//!
//! Builds the variable mapping used to resolve `{{variable}}` tokens.
//! Sources, lowest to highest precedence:
//!
//! 1. `[vars]` in the request file (overlaid by enclosing playlists)
//! 2. `.napenv` in the environment directory
//! 3. `.napenv.<name>` when an environment name was supplied
//! 4. `.napenv.local`
//! 5. variables bound by script steps, then `--var key=value` overrides
//!
//! A later source overwrites earlier ones key by key; it never removes a key.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{NapError, Result};

pub type Variables = BTreeMap<String, String>;

pub const BASE_ENV_FILE: &str = ".napenv";
pub const LOCAL_ENV_NAME: &str = "local";

/// The env-file and command-line layers, loaded once per invocation.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentManager {
    pub base: Variables,
    pub named: Variables,
    pub local: Variables,
    pub cli: Variables,
    pub active_environment: Option<String>,
}

impl EnvironmentManager {
    /// Load `.napenv`, `.napenv.<name>` and `.napenv.local` from `dir`.
    /// Absent files contribute nothing.
    pub fn load(dir: &Path, env_name: Option<&str>, cli: Variables) -> Result<Self> {
        let base = read_env_file(&dir.join(BASE_ENV_FILE))?.unwrap_or_default();

        let named = match env_name {
            Some(name) => {
                let path = named_env_path(dir, name);
                read_env_file(&path)?.unwrap_or_else(|| {
                    warn!(environment = name, path = %path.display(), "environment file not found");
                    Variables::new()
                })
            }
            None => Variables::new(),
        };

        let local = read_env_file(&named_env_path(dir, LOCAL_ENV_NAME))?.unwrap_or_default();

        debug!(
            dir = %dir.display(),
            environment = env_name.unwrap_or("-"),
            base = base.len(),
            named = named.len(),
            local = local.len(),
            cli = cli.len(),
            "loaded environment layers"
        );

        Ok(Self {
            base,
            named,
            local,
            cli,
            active_environment: env_name.map(str::to_string),
        })
    }

    /// Merge all layers over the in-file variables.
    pub fn resolve(&self, file_vars: &Variables, script_vars: &Variables) -> Variables {
        let mut resolved = file_vars.clone();
        for layer in [&self.base, &self.named, &self.local, script_vars, &self.cli] {
            for (key, value) in layer {
                resolved.insert(key.clone(), value.clone());
            }
        }
        resolved
    }
}

fn named_env_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{BASE_ENV_FILE}.{name}"))
}

/// Read an env file; `Ok(None)` when it does not exist.
fn read_env_file(path: &Path) -> Result<Option<Variables>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(parse_env(&raw))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(NapError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parse `key = value` lines. Blank lines, `#` comments and lines without
/// `=` are skipped. `key =` yields an empty value.
pub fn parse_env(input: &str) -> Variables {
    let mut variables = Variables::new();

    for line in input.lines() {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let Some((key, value)) = raw.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        variables.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    variables
}

/// Strip one wrapping pair of double quotes.
pub fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Parse a `key=value` command-line override.
pub fn parse_cli_var(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid variable `{raw}`, expected key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Variable name cannot be empty: `{raw}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Replace `{{name}}` tokens with values from `variables`.
///
/// Single pass: substituted values are not scanned again. Unknown names are
/// left verbatim.
pub fn interpolate(text: &str, variables: &Variables) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            result.push_str(&rest[start..]);
            return result;
        };

        let name = &after_open[..end];
        match lookup(variables, name) {
            Some(value) => {
                result.push_str(value);
                rest = &after_open[end + 2..];
            }
            None => {
                // keep the braces and rescan after them; a nested `{{` may still resolve
                result.push_str("{{");
                rest = after_open;
            }
        }
    }

    result.push_str(rest);
    result
}

fn lookup<'a>(variables: &'a Variables, name: &str) -> Option<&'a str> {
    if name.contains("{{") {
        return None;
    }
    variables
        .get(name)
        .or_else(|| variables.get(name.trim()))
        .map(String::as_str)
}
