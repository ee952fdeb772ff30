//! # Command Line
//!
//! `nap run <path>` executes a request file, playlist, script or directory;
//! `nap check <path>` only parses. Exit codes: `0` every step passed, `1` a
//! step failed, `2` the invocation itself could not complete.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::environment::parse_cli_var;
use crate::error::NapError;
use crate::http::ReqwestExecutor;
use crate::report::{OutputFormat, fatal_line, render, render_ndjson_line};
use crate::runner::check::check;
use crate::runner::{RunConfig, Runner, StepResult};
use crate::script::{ProcessScriptRuntime, default_runners};

/// Run HTTP request files and playlists from the command line
#[derive(Debug, Parser)]
#[command(name = "nap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a .nap file, a .naplist playlist, a script or a directory
    Run(RunArgs),

    /// Parse files without executing them
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// File or directory to run
    pub path: PathBuf,

    /// Named environment (.napenv.<name>)
    #[arg(long, env = "NAP_ENV")]
    pub env: Option<String>,

    /// Variable override, highest precedence (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_cli_var)]
    pub vars: Vec<(String, String)>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,

    /// Directory holding the .napenv files
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub env_dir: PathBuf,

    /// Timeout for each HTTP call and each script, in milliseconds
    #[arg(long = "timeout-ms", env = "NAP_TIMEOUT_MS", default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// Command used to run scripts with an extension, e.g. fsx="dotnet fsi"
    #[arg(long = "script-runner", value_name = "EXT=COMMAND", value_parser = parse_script_runner)]
    pub script_runners: Vec<(String, Vec<String>)>,
}

impl RunArgs {
    pub fn config(&self) -> RunConfig {
        let mut script_runners: BTreeMap<String, Vec<String>> = default_runners();
        script_runners.extend(self.script_runners.iter().cloned());

        RunConfig {
            env_dir: self.env_dir.clone(),
            env_name: self.env.clone(),
            cli_vars: self.vars.iter().cloned().collect(),
            timeout: Duration::from_millis(self.timeout_ms),
            script_runners,
        }
    }
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// File or directory to check
    pub path: PathBuf,
}

fn parse_script_runner(raw: &str) -> Result<(String, Vec<String>), String> {
    let (extension, command) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected EXT=COMMAND, got `{raw}`"))?;
    let extension = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if extension.is_empty() || command.is_empty() {
        return Err(format!("expected EXT=COMMAND, got `{raw}`"));
    }
    Ok((extension, command))
}

/// Run the parsed command and return the process exit code.
pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check(args) => check_files(args),
    }
}

async fn run(args: RunArgs) -> i32 {
    let config = args.config();
    let format = args.output;
    debug!(?config, ?format, "run configuration");

    let http = match ReqwestExecutor::new(config.timeout) {
        Ok(http) => http,
        Err(err) => return fatal(format, &NapError::Runtime(err.to_string())),
    };
    let scripts = ProcessScriptRuntime::new(config.script_runners.clone(), config.timeout);
    let mut runner = Runner::new(&config, &http, &scripts);

    let mut stream = |result: &StepResult| {
        if format.streams() {
            println!("{}", render_ndjson_line(result));
        }
    };

    match runner.run(&args.path, &mut stream).await {
        Ok(summary) => {
            if !format.streams() {
                println!("{}", render(format, &summary));
            }
            summary.exit_code()
        }
        Err(err) => fatal(format, &err),
    }
}

fn fatal(format: OutputFormat, err: &NapError) -> i32 {
    if format.streams() {
        println!("{}", fatal_line(&err.to_string()));
    } else {
        eprintln!("error: {err}");
    }
    err.exit_code()
}

fn check_files(args: CheckArgs) -> i32 {
    let files = match check(&args.path) {
        Ok(files) => files,
        Err(err) => {
            eprintln!("error: {err}");
            return err.exit_code();
        }
    };

    for checked in &files {
        match &checked.error {
            None => println!("OK {}", checked.file.display()),
            Some(error) => println!("ERROR {}: {error}", checked.file.display()),
        }
    }
    if files.iter().all(|checked| checked.ok()) { 0 } else { 2 }
}
