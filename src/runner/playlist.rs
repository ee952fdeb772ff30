//! Playlist orchestration.
//!
//! Steps run strictly in document order. Nested playlists and folders are
//! expanded when they are reached and walked depth-first before the rest of
//! the parent continues. A failing step never stops the run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{RunConfig, RunSummary, StepExecutor, StepKind, StepResult};
use crate::environment::{EnvironmentManager, Variables};
use crate::error::{NapError, Result, read_file};
use crate::http::HttpExecutor;
use crate::script::{ScriptError, ScriptRuntime};
use crate::spec::{
    PLAYLIST_EXTENSION, PlaylistSpec, REQUEST_EXTENSION, Step, extension_of, is_script_extension, parse_playlist,
    parse_request,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Done,
}

/// Enclosing playlists of a step: their merged `[vars]` and their paths.
#[derive(Debug, Default)]
struct Scope {
    vars: Variables,
    playlists: Vec<PathBuf>,
}

impl Scope {
    fn enter(&self, playlist: &Path, vars: Variables) -> Self {
        let mut scope = Self {
            vars: self.vars.clone(),
            playlists: self.playlists.clone(),
        };
        scope.vars.extend(vars);
        scope.playlists.push(playlist_key(playlist));
        scope
    }

    fn includes(&self, playlist: &Path) -> bool {
        self.playlists.contains(&playlist_key(playlist))
    }
}

fn playlist_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// A step waiting to run.
struct Pending {
    step: Step,
    scope: Arc<Scope>,
}

/// What a run target expands to before anything executes.
struct Plan {
    steps: Vec<Step>,
    env: Option<String>,
    scope: Scope,
}

impl Plan {
    fn single(steps: Vec<Step>) -> Self {
        Self {
            steps,
            env: None,
            scope: Scope::default(),
        }
    }
}

/// Drives one invocation from a target path to a [`RunSummary`].
pub struct Runner<'a> {
    config: &'a RunConfig,
    http: &'a dyn HttpExecutor,
    scripts: &'a dyn ScriptRuntime,
    state: RunState,
}

impl<'a> Runner<'a> {
    pub fn new(config: &'a RunConfig, http: &'a dyn HttpExecutor, scripts: &'a dyn ScriptRuntime) -> Self {
        Self {
            config,
            http,
            scripts,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run a `.nap` file, a `.naplist` playlist, a script or a directory.
    ///
    /// `on_result` is called as soon as each step finishes.
    pub async fn run(&mut self, target: &Path, on_result: &mut dyn FnMut(&StepResult)) -> Result<RunSummary> {
        let plan = plan(target)?;
        let env_name = self.config.env_name.as_deref().or(plan.env.as_deref());
        let environment = EnvironmentManager::load(&self.config.env_dir, env_name, self.config.cli_vars.clone())?;

        self.state = RunState::Running;
        info!(path = %target.display(), steps = plan.steps.len(), "run started");
        let outcome = self.walk(plan.steps, plan.scope, &environment, on_result).await;
        self.state = RunState::Done;

        let summary = outcome?;
        if summary.results.is_empty() {
            return Err(NapError::Config(format!("no steps resolved from {}", target.display())));
        }
        info!(
            steps = summary.results.len(),
            failed = summary.failed_count(),
            passed = summary.passed(),
            "run finished"
        );
        Ok(summary)
    }

    async fn walk(
        &self,
        steps: Vec<Step>,
        scope: Scope,
        environment: &EnvironmentManager,
        on_result: &mut dyn FnMut(&StepResult),
    ) -> Result<RunSummary> {
        let executor = StepExecutor {
            http: self.http,
            scripts: self.scripts,
            environment,
        };
        let mut stack = Vec::new();
        push_steps(&mut stack, steps, &Arc::new(scope));

        let mut script_vars = Variables::new();
        let mut summary = RunSummary::default();

        while let Some(Pending { step, scope }) = stack.pop() {
            debug!(step = ?step, "next step");
            let result = match step {
                Step::Folder(path) => match expand_folder(&mut stack, &path, &scope) {
                    Ok(()) => continue,
                    Err(err) => StepResult::failed(&path, StepKind::Request, err.to_string()),
                },
                Step::Request(path) if path.is_dir() => match expand_folder(&mut stack, &path, &scope) {
                    Ok(()) => continue,
                    Err(err) => StepResult::failed(&path, StepKind::Request, err.to_string()),
                },
                Step::Playlist(path) if scope.includes(&path) => {
                    warn!(playlist = %path.display(), "playlist includes itself");
                    StepResult::failed(&path, StepKind::Request, "playlist includes itself")
                }
                Step::Playlist(path) => match load_playlist(&path) {
                    Ok(playlist) => {
                        let inner = scope.enter(&path, playlist.vars);
                        let steps = relative_to(&path, playlist.steps);
                        push_steps(&mut stack, steps, &Arc::new(inner));
                        continue;
                    }
                    Err(err) => StepResult::failed(&path, StepKind::Request, err.to_string()),
                },
                Step::Request(path) => match executor.run_request(&path, &scope.vars, &mut script_vars).await {
                    Ok(result) => result,
                    Err(err) => unlaunched(&path, StepKind::Request, err, &summary)?,
                },
                Step::Script(path) => match executor.run_script(&path, &scope.vars, &mut script_vars).await {
                    Ok(result) => result,
                    Err(err) => unlaunched(&path, StepKind::Script, err, &summary)?,
                },
            };

            on_result(&result);
            summary.results.push(result);
        }

        Ok(summary)
    }
}

/// A step whose script could not be run. Fatal while no step has produced
/// a result yet.
fn unlaunched(path: &Path, kind: StepKind, err: ScriptError, summary: &RunSummary) -> Result<StepResult> {
    if err.is_launch_failure() && summary.results.is_empty() {
        return Err(NapError::Runtime(format!("cannot run script for {}: {err}", path.display())));
    }
    let message = match kind {
        StepKind::Request => format!("pre-request script failed: {err}"),
        StepKind::Script => err.to_string(),
    };
    Ok(StepResult::failed(path, kind, message))
}

fn expand_folder(stack: &mut Vec<Pending>, dir: &Path, scope: &Arc<Scope>) -> Result<()> {
    let files = request_files(dir).inspect_err(|err| {
        warn!(dir = %dir.display(), error = %err, "cannot expand folder");
    })?;
    debug!(dir = %dir.display(), files = files.len(), "expanding folder");
    push_steps(stack, files.into_iter().map(Step::Request).collect(), scope);
    Ok(())
}

fn plan(target: &Path) -> Result<Plan> {
    if !target.exists() {
        return Err(NapError::Config(format!("{} does not exist", target.display())));
    }

    if target.is_dir() {
        let files = request_files(target)?;
        if files.is_empty() {
            return Err(NapError::Config(format!(
                "no .{REQUEST_EXTENSION} files found in {}",
                target.display()
            )));
        }
        return Ok(Plan::single(files.into_iter().map(Step::Request).collect()));
    }

    match extension_of(target).as_deref() {
        Some(PLAYLIST_EXTENSION) => {
            let playlist = load_playlist(target)?;
            if playlist.steps.is_empty() {
                return Err(NapError::Config(format!("{} has no steps", target.display())));
            }
            Ok(Plan {
                steps: relative_to(target, playlist.steps),
                env: playlist.env,
                scope: Scope::default().enter(target, playlist.vars),
            })
        }
        Some(ext) if is_script_extension(ext) => Ok(Plan::single(vec![Step::Script(target.to_path_buf())])),
        _ => {
            // fail fast on a single unparseable file
            parse_request(&read_file(target)?).map_err(|source| NapError::Parse {
                path: target.to_path_buf(),
                source,
            })?;
            Ok(Plan::single(vec![Step::Request(target.to_path_buf())]))
        }
    }
}

fn load_playlist(path: &Path) -> Result<PlaylistSpec> {
    parse_playlist(&read_file(path)?).map_err(|source| NapError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Rebase step paths onto the directory of `playlist`.
fn relative_to(playlist: &Path, steps: Vec<Step>) -> Vec<Step> {
    let base = playlist.parent().unwrap_or(Path::new(""));
    steps
        .into_iter()
        .map(|step| step.with_path(base.join(step.path())))
        .collect()
}

/// Push so that the first step is popped first.
fn push_steps(stack: &mut Vec<Pending>, steps: Vec<Step>, scope: &Arc<Scope>) {
    stack.extend(steps.into_iter().rev().map(|step| Pending {
        step,
        scope: Arc::clone(scope),
    }));
}

/// `.nap` files directly inside `dir`, sorted by file name.
pub fn request_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| NapError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && extension_of(path).as_deref() == Some(REQUEST_EXTENSION))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::super::fakes::*;
    use super::*;
    use crate::http::HttpResponse;
    use crate::script::{ScriptError, ScriptOutcome};

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn file(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
            path
        }

        fn config(&self) -> RunConfig {
            RunConfig {
                env_dir: self.dir.path().to_path_buf(),
                ..RunConfig::default()
            }
        }
    }

    fn request(url: &str, status: u16) -> String {
        format!("[request]\nurl = {url}\n[assert]\nstatus = {status}\n")
    }

    fn file_names(summary: &RunSummary) -> Vec<String> {
        summary
            .results
            .iter()
            .map(|result| result.file.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    async fn run(
        config: &RunConfig,
        http: &FakeHttp,
        scripts: &FakeScripts,
        target: &Path,
    ) -> (Result<RunSummary>, Vec<String>) {
        let mut streamed = Vec::new();
        let mut runner = Runner::new(config, http, scripts);
        assert_eq!(runner.state(), RunState::Idle);
        let summary = runner
            .run(target, &mut |result: &StepResult| {
                streamed.push(result.file.display().to_string());
            })
            .await;
        if summary.is_ok() {
            assert_eq!(runner.state(), RunState::Done);
        }
        (summary, streamed)
    }

    #[tokio::test]
    async fn second_step_failure_fails_the_run() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        fixture.file("b.nap", &request("https://api.test/b", 200));
        let list = fixture.file("smoke.naplist", "[steps]\na.nap\nb.nap\n");
        let http = FakeHttp::default()
            .with("https://api.test/a", HttpResponse::new(200))
            .with("https://api.test/b", HttpResponse::new(500));

        let (summary, streamed) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(summary.results.len(), 2);
        assert_eq!(streamed.len(), 2);
        assert!(summary.results[0].passed);
        assert!(!summary.results[1].passed);
        assert!(!summary.passed());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_steps() {
        let fixture = Fixture::new();
        fixture.file("1-down.nap", "GET https://down.test\n");
        fixture.file("2-broken.nap", "[assert]\nstatus ~ 200\n");
        fixture.file("3-ok.nap", &request("https://api.test/ok", 200));
        let http = FakeHttp::default().with("https://api.test/ok", HttpResponse::new(200));

        let (summary, _) = run(&fixture.config(), &http, &FakeScripts::default(), fixture.dir.path()).await;
        let summary = summary.unwrap();
        assert_eq!(file_names(&summary), vec!["1-down.nap", "2-broken.nap", "3-ok.nap"]);
        assert!(summary.results[0].error.is_some());
        assert!(summary.results[1].error.as_deref().unwrap().contains("Parse error"));
        assert!(summary.results[2].passed);
    }

    #[tokio::test]
    async fn nested_playlists_expand_depth_first() {
        let fixture = Fixture::new();
        for name in ["a", "b", "c", "d"] {
            fixture.file(&format!("{name}.nap"), &request(&format!("https://api.test/{name}"), 200));
        }
        fixture.file("folder/y.nap", &request("https://api.test/y", 200));
        fixture.file("folder/x.nap", &request("https://api.test/x", 200));
        fixture.file("folder/notes.txt", "ignored");
        fixture.file("inner/inner.naplist", "[steps]\n../b.nap\n../folder\n");
        let list = fixture.file("outer.naplist", "[steps]\na.nap\ninner/inner.naplist\nc.nap\nfolder\nd.nap\n");

        let mut http = FakeHttp::default();
        for name in ["a", "b", "c", "d", "x", "y"] {
            http = http.with(&format!("https://api.test/{name}"), HttpResponse::new(200));
        }

        let (summary, streamed) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(
            file_names(&summary),
            vec!["a.nap", "b.nap", "x.nap", "y.nap", "c.nap", "x.nap", "y.nap", "d.nap"]
        );
        assert_eq!(streamed.len(), 8);
        assert!(summary.passed());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn script_bindings_reach_later_steps() {
        let fixture = Fixture::new();
        fixture.file("get.nap", "[request]\nurl = https://api.test/me\n[request.headers]\nAuthorization = Bearer {{token}}\n");
        fixture.file("login.fsx", "");
        let list = fixture.file("flow.naplist", "[steps]\nlogin.fsx\nget.nap\n");
        let http = FakeHttp::default().with("https://api.test/me", HttpResponse::new(200));
        let scripts = FakeScripts::default().with("login.fsx", passing_script(&["logged in"], &[("token", "t-1")]));

        let (summary, _) = run(&fixture.config(), &http, &scripts, &list).await;
        let summary = summary.unwrap();
        assert_eq!(summary.results[0].kind, StepKind::Script);
        assert_eq!(summary.results[0].log, vec!["logged in"]);
        assert!(summary.results[0].response.is_none());
        let sent = http.sent.lock().unwrap();
        assert_eq!(sent[0].header("authorization"), Some("Bearer t-1"));
    }

    #[tokio::test]
    async fn script_runtime_unavailable_is_a_runtime_error() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        let list = fixture.file("flow.naplist", "[steps]\nsetup.fsx\na.nap\n");
        let http = FakeHttp::default().with("https://api.test/a", HttpResponse::new(200));
        let scripts = FakeScripts::default().with(
            "setup.fsx",
            Err(ScriptError::Spawn {
                program: "dotnet".into(),
                reason: "No such file or directory".into(),
            }),
        );

        let (summary, streamed) = run(&fixture.config(), &http, &scripts, &list).await;
        let err = summary.unwrap_err();
        assert!(matches!(err, NapError::Runtime(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(streamed.is_empty());
        assert!(http.sent_urls().is_empty());
    }

    #[tokio::test]
    async fn later_launch_failure_is_a_failed_step() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        let list = fixture.file("flow.naplist", "[steps]\na.nap\nteardown.csx\n");
        let http = FakeHttp::default().with("https://api.test/a", HttpResponse::new(200));

        let (summary, _) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.results[1].kind, StepKind::Script);
        assert!(summary.results[1].error.as_deref().unwrap().contains("No script runner"));
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn failing_script_step_keeps_log() {
        let fixture = Fixture::new();
        let script = fixture.file("check.fsx", "");
        let scripts = FakeScripts::default().with(
            "check.fsx",
            Ok(ScriptOutcome {
                log: vec!["checked 3 rows".into()],
                passed: false,
                error: Some("script exited with status 1".into()),
                variables: Variables::new(),
            }),
        );

        let (summary, _) = run(&fixture.config(), &FakeHttp::default(), &scripts, &script).await;
        let summary = summary.unwrap();
        assert_eq!(summary.results[0].log, vec!["checked 3 rows"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn environment_layers_apply_to_steps() {
        let fixture = Fixture::new();
        fixture.file(".napenv", "host = base.test\nversion = v1\n");
        fixture.file(".napenv.staging", "host = staging.test\n");
        fixture.file("get.nap", "[vars]\nhost = file.test\nversion = v0\nuser = me\n[request]\nurl = https://{{host}}/{{version}}/{{user}}/{{id}}\n");
        let list = fixture.file("env.naplist", "[meta]\nenv = staging\n[vars]\nuser = playlist\n[steps]\nget.nap\n");

        let mut config = fixture.config();
        config.cli_vars.insert("id".into(), "7".into());
        let http = FakeHttp::default();

        let (summary, _) = run(&config, &http, &FakeScripts::default(), &list).await;
        assert_eq!(summary.unwrap().results.len(), 1);
        assert_eq!(http.sent_urls(), vec!["https://staging.test/v1/playlist/7"]);
    }

    #[tokio::test]
    async fn cli_env_overrides_playlist_env() {
        let fixture = Fixture::new();
        fixture.file(".napenv.staging", "host = staging.test\n");
        fixture.file(".napenv.prod", "host = prod.test\n");
        fixture.file("get.nap", "GET https://{{host}}/\n");
        let list = fixture.file("env.naplist", "[meta]\nenv = staging\n[steps]\nget.nap\n");

        let mut config = fixture.config();
        config.env_name = Some("prod".into());
        let http = FakeHttp::default();

        let _ = run(&config, &http, &FakeScripts::default(), &list).await;
        assert_eq!(http.sent_urls(), vec!["https://prod.test/"]);
    }

    #[tokio::test]
    async fn nested_playlist_parse_error_is_a_failed_step() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        fixture.file("broken.naplist", "[stepz]\na.nap\n");
        let list = fixture.file("outer.naplist", "[steps]\nbroken.naplist\na.nap\n");
        let http = FakeHttp::default().with("https://api.test/a", HttpResponse::new(200));

        let (summary, _) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(file_names(&summary), vec!["broken.naplist", "a.nap"]);
        assert!(summary.results[0].error.as_deref().unwrap().contains("unknown section"));
    }

    #[tokio::test]
    async fn missing_folder_is_a_failed_step() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        let list = fixture.file("outer.naplist", "[steps]\nghosts\na.nap\n");
        let http = FakeHttp::default().with("https://api.test/a", HttpResponse::new(200));

        let (summary, _) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(file_names(&summary), vec!["ghosts", "a.nap"]);
        assert!(!summary.results[0].passed);
        assert!(summary.results[1].passed);
    }

    #[tokio::test]
    async fn self_including_playlist_fails_once() {
        let fixture = Fixture::new();
        fixture.file("a.nap", &request("https://api.test/a", 200));
        let list = fixture.file("loop.naplist", "[steps]\na.nap\n./loop.naplist\n");
        let http = FakeHttp::default().with("https://api.test/a", HttpResponse::new(200));

        let (summary, _) = run(&fixture.config(), &http, &FakeScripts::default(), &list).await;
        let summary = summary.unwrap();
        assert_eq!(file_names(&summary), vec!["a.nap", "loop.naplist"]);
        assert_eq!(summary.results[1].error.as_deref(), Some("playlist includes itself"));
    }

    #[tokio::test]
    async fn playlist_resolving_no_steps_is_a_config_error() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.dir.path().join("empty")).unwrap();
        let list = fixture.file("hollow.naplist", "[steps]\nempty\n");
        let config = fixture.config();
        let http = FakeHttp::default();
        let scripts = FakeScripts::default();

        let mut runner = Runner::new(&config, &http, &scripts);
        let mut streamed = 0;
        let err = runner
            .run(&list, &mut |_: &StepResult| streamed += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, NapError::Config(ref message) if message.contains("no steps resolved")));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(streamed, 0);
        assert_eq!(runner.state(), RunState::Done);
    }

    #[tokio::test]
    async fn unlaunchable_pre_hook_on_first_step_is_a_runtime_error() {
        let fixture = Fixture::new();
        fixture.file("hooked.nap", "[request]\nurl = https://api.test/a\n[script]\npre = setup.fsx\n");
        fixture.file("b.nap", &request("https://api.test/b", 200));
        let first = fixture.file("first.naplist", "[steps]\nhooked.nap\nb.nap\n");
        let later = fixture.file("later.naplist", "[steps]\nb.nap\nhooked.nap\n");
        let http = FakeHttp::default()
            .with("https://api.test/a", HttpResponse::new(200))
            .with("https://api.test/b", HttpResponse::new(200));
        let scripts = FakeScripts::default();

        let (summary, streamed) = run(&fixture.config(), &http, &scripts, &first).await;
        assert!(matches!(summary, Err(NapError::Runtime(_))));
        assert!(streamed.is_empty());
        assert!(http.sent_urls().is_empty());

        let (summary, _) = run(&fixture.config(), &http, &scripts, &later).await;
        let summary = summary.unwrap();
        assert_eq!(file_names(&summary), vec!["b.nap", "hooked.nap"]);
        assert!(summary.results[1].error.as_deref().unwrap().starts_with("pre-request script failed"));
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn configuration_errors() {
        let fixture = Fixture::new();
        let empty = fixture.dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let no_steps = fixture.file("none.naplist", "[meta]\nname = nothing\n");
        let bad = fixture.file("bad.nap", "[request]\nurl = https://x.test\n[request.body]\n\"\"\"\n");
        let http = FakeHttp::default();
        let scripts = FakeScripts::default();
        let config = fixture.config();

        let (missing, _) = run(&config, &http, &scripts, &fixture.dir.path().join("nope.nap")).await;
        assert!(matches!(missing, Err(NapError::Config(_))));
        let (empty, _) = run(&config, &http, &scripts, &empty).await;
        assert!(matches!(empty, Err(NapError::Config(_))));
        let (no_steps, _) = run(&config, &http, &scripts, &no_steps).await;
        assert!(matches!(no_steps, Err(NapError::Config(_))));
        let (bad, _) = run(&config, &http, &scripts, &bad).await;
        assert!(matches!(bad, Err(NapError::Parse { .. })));
    }
}
