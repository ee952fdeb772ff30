//! Request and playlist specifications parsed from `.nap` / `.naplist` files.

mod parser;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::environment::{Variables, interpolate};
use crate::http::client::ensure_content_type;
use crate::http::{HttpMethod, ResolvedRequest};
use crate::testing::Assertion;

pub use parser::{parse_assertion, parse_playlist, parse_request};

pub const REQUEST_EXTENSION: &str = "nap";
pub const PLAYLIST_EXTENSION: &str = "naplist";
pub const SCRIPT_EXTENSIONS: [&str; 2] = ["fsx", "csx"];
pub const DEFAULT_BODY_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Body>,
}

/// Script hooks run around the request, paths relative to the request file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptHooks {
    pub pre: Option<String>,
    pub post: Option<String>,
}

/// One parsed `.nap` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSpec {
    pub meta: Meta,
    pub vars: Variables,
    pub request: Request,
    pub assertions: Vec<Assertion>,
    pub script: ScriptHooks,
}

impl RequestSpec {
    /// Substitute variables into the URL, header values, body content and
    /// assertion operands.
    pub fn resolve(&self, variables: &Variables) -> (ResolvedRequest, Vec<Assertion>) {
        let mut request = ResolvedRequest {
            method: self.request.method,
            url: interpolate(&self.request.url, variables),
            headers: self
                .request
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), interpolate(value, variables)))
                .collect(),
            body: self
                .request
                .body
                .as_ref()
                .map(|body| interpolate(&body.content, variables)),
        };
        if let Some(body) = &self.request.body {
            ensure_content_type(&mut request, &body.content_type);
        }

        let assertions = self
            .assertions
            .iter()
            .map(|assertion| Assertion {
                target: assertion.target.clone(),
                operator: assertion
                    .operator
                    .map_operand(|value| interpolate(value, variables)),
            })
            .collect();

        (request, assertions)
    }
}

/// One entry under `[steps]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Request(PathBuf),
    Playlist(PathBuf),
    Script(PathBuf),
    /// Expands to the `.nap` files of a directory, sorted.
    Folder(PathBuf),
}

impl Step {
    /// Classify a step reference by its extension.
    pub fn classify(reference: &str) -> Self {
        let path = PathBuf::from(reference);
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

        match extension.as_deref() {
            Some(ext) if is_script_extension(ext) => Step::Script(path),
            Some(PLAYLIST_EXTENSION) => Step::Playlist(path),
            Some(_) => Step::Request(path),
            None if !has_leading_path_marker(reference) => Step::Folder(path),
            None => Step::Request(path),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Step::Request(path) | Step::Playlist(path) | Step::Script(path) | Step::Folder(path) => {
                path
            }
        }
    }

    pub fn with_path(&self, path: PathBuf) -> Self {
        match self {
            Step::Request(_) => Step::Request(path),
            Step::Playlist(_) => Step::Playlist(path),
            Step::Script(_) => Step::Script(path),
            Step::Folder(_) => Step::Folder(path),
        }
    }
}

fn has_leading_path_marker(reference: &str) -> bool {
    reference.starts_with('.') || reference.starts_with('/') || reference.starts_with('\\')
}

pub fn is_script_extension(extension: &str) -> bool {
    SCRIPT_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(extension))
}

/// Lower-cased extension of `path`, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// One parsed `.naplist` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistSpec {
    pub meta: Meta,
    pub env: Option<String>,
    pub vars: Variables,
    pub steps: Vec<Step>,
}
