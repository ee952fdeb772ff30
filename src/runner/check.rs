//! Parse-only validation behind `nap check`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::playlist::request_files;
use crate::error::{NapError, Result, read_file};
use crate::spec::{PLAYLIST_EXTENSION, Step, extension_of, is_script_extension, parse_playlist, parse_request};

/// Verdict for one checked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedFile {
    pub file: PathBuf,
    pub error: Option<String>,
}

impl CheckedFile {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Parse `target` and everything it references, without executing anything.
///
/// Each file is reported once, in the order a run would reach it.
pub fn check(target: &Path) -> Result<Vec<CheckedFile>> {
    if !target.exists() {
        return Err(NapError::Config(format!("{} does not exist", target.display())));
    }
    if target.is_dir() && request_files(target)?.is_empty() {
        return Err(NapError::Config(format!("no request files found in {}", target.display())));
    }

    let mut checker = Checker::default();
    checker.visit(target);
    Ok(checker.files)
}

#[derive(Default)]
struct Checker {
    seen: HashSet<PathBuf>,
    files: Vec<CheckedFile>,
}

impl Checker {
    fn visit(&mut self, path: &Path) {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.seen.insert(key) {
            return;
        }

        if path.is_dir() {
            match request_files(path) {
                Ok(files) => files.iter().for_each(|file| self.visit(file)),
                Err(err) => self.record(path, Some(err.to_string())),
            }
            return;
        }

        match extension_of(path).as_deref() {
            Some(PLAYLIST_EXTENSION) => self.visit_playlist(path),
            Some(ext) if is_script_extension(ext) => {
                let error = (!path.is_file()).then(|| format!("script {} not found", path.display()));
                self.record(path, error);
            }
            _ => {
                let parsed = read_file(path).and_then(|text| {
                    parse_request(&text).map_err(|source| NapError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })
                });
                self.record(path, parsed.err().map(|err| err.to_string()));
            }
        }
    }

    fn visit_playlist(&mut self, path: &Path) {
        let playlist = match read_file(path).and_then(|text| {
            parse_playlist(&text).map_err(|source| NapError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }) {
            Ok(playlist) => playlist,
            Err(err) => return self.record(path, Some(err.to_string())),
        };
        self.record(path, None);

        let base = path.parent().unwrap_or(Path::new(""));
        for step in &playlist.steps {
            let resolved = base.join(step.path());
            match step {
                Step::Folder(_) if !resolved.is_dir() => {
                    self.record(&resolved, Some(format!("folder {} not found", resolved.display())));
                }
                _ => self.visit(&resolved),
            }
        }
    }

    fn record(&mut self, path: &Path, error: Option<String>) {
        debug!(file = %path.display(), ok = error.is_none(), "checked");
        self.files.push(CheckedFile {
            file: path.to_path_buf(),
            error,
        });
    }
}
