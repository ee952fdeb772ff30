//! Step execution: one request file or one script in, one [`StepResult`] out.

pub mod check;
pub mod playlist;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::environment::{EnvironmentManager, Variables};
use crate::error::{NapError, read_file};
use crate::http::{HttpExecutor, HttpResponse, ResolvedRequest};
use crate::script::{ScriptContext, ScriptError, ScriptOutcome, ScriptPhase, ScriptRuntime, default_runners};
use crate::spec::parse_request;
use crate::testing::{AssertionResult, evaluate};

pub use playlist::{RunState, Runner};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one invocation, threaded explicitly into the runner.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory holding `.napenv` files.
    pub env_dir: PathBuf,
    pub env_name: Option<String>,
    pub cli_vars: Variables,
    pub timeout: Duration,
    pub script_runners: BTreeMap<String, Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            env_dir: PathBuf::from("."),
            env_name: None,
            cli_vars: Variables::new(),
            timeout: DEFAULT_TIMEOUT,
            script_runners: default_runners(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Request,
    Script,
}

/// Outcome of one executed step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub file: PathBuf,
    pub kind: StepKind,
    pub name: Option<String>,
    pub request: Option<ResolvedRequest>,
    pub response: Option<HttpResponse>,
    pub assertions: Vec<AssertionResult>,
    pub passed: bool,
    /// Set only when the step could not be executed.
    pub error: Option<String>,
    pub log: Vec<String>,
    pub duration: Duration,
}

impl StepResult {
    pub fn new(file: impl Into<PathBuf>, kind: StepKind) -> Self {
        Self {
            file: file.into(),
            kind,
            name: None,
            request: None,
            response: None,
            assertions: Vec::new(),
            passed: false,
            error: None,
            log: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(file: impl Into<PathBuf>, kind: StepKind, error: impl Into<String>) -> Self {
        let mut result = Self::new(file, kind);
        result.error = Some(error.into());
        result
    }

    pub fn first_failed_assertion(&self) -> Option<&AssertionResult> {
        self.assertions.iter().find(|assertion| !assertion.passed)
    }

    /// Display name: `[meta] name` or the file name.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.file.display().to_string())
    }
}

/// Executes single steps against the HTTP and script collaborators.
pub struct StepExecutor<'a> {
    pub http: &'a dyn HttpExecutor,
    pub scripts: &'a dyn ScriptRuntime,
    pub environment: &'a EnvironmentManager,
}

impl StepExecutor<'_> {
    /// Parse, resolve and send one request file, then evaluate its assertions.
    ///
    /// `inherited` holds the `[vars]` of enclosing playlists; `script_vars`
    /// collects bindings made by scripts, including this file's hooks.
    /// `Err` means the pre-request hook could not be started.
    pub async fn run_request(
        &self,
        path: &Path,
        inherited: &Variables,
        script_vars: &mut Variables,
    ) -> Result<StepResult, ScriptError> {
        let started = Instant::now();
        let mut result = self.request_step(path, inherited, script_vars).await?;
        result.duration = started.elapsed();
        info!(file = %path.display(), passed = result.passed, "request step finished");
        Ok(result)
    }

    async fn request_step(
        &self,
        path: &Path,
        inherited: &Variables,
        script_vars: &mut Variables,
    ) -> Result<StepResult, ScriptError> {
        let spec = match read_file(path).and_then(|text| {
            parse_request(&text).map_err(|source| NapError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }) {
            Ok(spec) => spec,
            Err(err) => return Ok(StepResult::failed(path, StepKind::Request, err.to_string())),
        };

        let mut result = StepResult::new(path, StepKind::Request);
        result.name = spec.meta.name.clone();
        let base_dir = path.parent().unwrap_or(Path::new(""));

        let mut file_vars = spec.vars.clone();
        file_vars.extend(inherited.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(pre) = &spec.script.pre {
            let variables = self.environment.resolve(&file_vars, script_vars);
            let context = ScriptContext::new(ScriptPhase::BeforeRequest, variables);
            let hook = match self.scripts.run(&base_dir.join(pre), &context).await {
                Ok(outcome) => absorb(outcome, script_vars, &mut result.log),
                Err(err) if err.is_launch_failure() => return Err(err),
                Err(err) => Err(err.to_string()),
            };
            if let Err(error) = hook {
                result.error = Some(format!("pre-request script failed: {error}"));
                return Ok(result);
            }
        }

        let variables = self.environment.resolve(&file_vars, script_vars);
        let (request, assertions) = spec.resolve(&variables);
        debug!(method = %request.method, url = %request.url, "resolved request");

        let response = match self.http.execute(&request).await {
            Ok(response) => response,
            Err(err) => {
                result.request = Some(request);
                result.error = Some(err.to_string());
                return Ok(result);
            }
        };

        result.assertions = evaluate(&response, &assertions);
        result.request = Some(request);

        if let Some(post) = &spec.script.post {
            let mut context = ScriptContext::new(ScriptPhase::AfterResponse, variables);
            context.response = Some((response.status_code, response.body.clone()));
            // a post hook that cannot start fails only this step
            let hook = match self.scripts.run(&base_dir.join(post), &context).await {
                Ok(outcome) => absorb(outcome, script_vars, &mut result.log),
                Err(err) => Err(err.to_string()),
            };
            if let Err(error) = hook {
                result.error = Some(format!("post-request script failed: {error}"));
            }
        }

        result.response = Some(response);
        result.passed = result.error.is_none() && result.assertions.iter().all(|assertion| assertion.passed);
        Ok(result)
    }

    /// Run a script step. `Err` means the runtime could not be started.
    pub async fn run_script(
        &self,
        path: &Path,
        inherited: &Variables,
        script_vars: &mut Variables,
    ) -> Result<StepResult, ScriptError> {
        let started = Instant::now();
        let variables = self.environment.resolve(inherited, script_vars);
        let context = ScriptContext::new(ScriptPhase::Step, variables);

        let ScriptOutcome {
            log,
            passed,
            error,
            variables,
        } = self.scripts.run(path, &context).await?;
        script_vars.extend(variables);

        let mut result = StepResult::new(path, StepKind::Script);
        result.log = log;
        result.passed = passed;
        result.error = error;
        result.duration = started.elapsed();
        info!(file = %path.display(), passed, "script step finished");
        Ok(result)
    }
}

/// Fold a hook's log and bindings into the step; `Err` carries its failure.
fn absorb(outcome: ScriptOutcome, script_vars: &mut Variables, log: &mut Vec<String>) -> Result<(), String> {
    log.extend(outcome.log);
    script_vars.extend(outcome.variables);
    if outcome.passed {
        Ok(())
    } else {
        Err(outcome.error.unwrap_or_else(|| "script failed".to_string()))
    }
}

/// Every step's result, in execution order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<StepResult>,
}

impl RunSummary {
    /// At least one step ran and every step passed.
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|result| result.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|result| !result.passed).count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.results.is_empty() {
            2
        } else if self.passed() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::http::RequestError;

    /// Canned responses by URL; unknown URLs fail with a transport error.
    #[derive(Default)]
    pub struct FakeHttp {
        pub responses: HashMap<String, HttpResponse>,
        pub sent: Mutex<Vec<ResolvedRequest>>,
    }

    impl FakeHttp {
        pub fn with(mut self, url: &str, response: HttpResponse) -> Self {
            self.responses.insert(url.to_string(), response);
            self
        }

        pub fn sent_urls(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }
    }

    #[async_trait]
    impl HttpExecutor for FakeHttp {
        async fn execute(&self, request: &ResolvedRequest) -> Result<HttpResponse, RequestError> {
            self.sent.lock().unwrap().push(request.clone());
            self.responses
                .get(&request.url)
                .cloned()
                .ok_or_else(|| RequestError::Transport(format!("connection refused: {}", request.url)))
        }
    }

    /// Canned outcomes by script file name.
    #[derive(Default)]
    pub struct FakeScripts {
        pub outcomes: HashMap<String, Result<ScriptOutcome, ScriptError>>,
        pub contexts: Mutex<Vec<(String, ScriptContext)>>,
    }

    impl FakeScripts {
        pub fn with(mut self, name: &str, outcome: Result<ScriptOutcome, ScriptError>) -> Self {
            self.outcomes.insert(name.to_string(), outcome);
            self
        }
    }

    #[async_trait]
    impl ScriptRuntime for FakeScripts {
        async fn run(&self, script: &Path, context: &ScriptContext) -> Result<ScriptOutcome, ScriptError> {
            let name = script
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.contexts.lock().unwrap().push((name.clone(), context.clone()));
            self.outcomes
                .get(&name)
                .cloned()
                .unwrap_or_else(|| Err(ScriptError::NoRunner(name)))
        }
    }

    pub fn passing_script(log: &[&str], bindings: &[(&str, &str)]) -> Result<ScriptOutcome, ScriptError> {
        Ok(ScriptOutcome {
            log: log.iter().map(|line| line.to_string()).collect(),
            passed: true,
            error: None,
            variables: bindings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}
