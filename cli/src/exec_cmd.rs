use clap::Parser;
use loaf_core::Config;
use loaf_core::Runtime;
use loaf_core::ToolCall;
use loaf_core::notify_on_sigint;
use serde_json::json;

#[derive(Debug, Parser)]
pub struct ExecCli {
    /// Working directory for the command.
    #[arg(long, short = 'C')]
    pub cwd: Option<String>,

    /// Timeout in seconds (default 120, max 1200).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the full structured tool result as JSON instead of raw streams.
    #[arg(long)]
    pub json: bool,

    /// Record the session to a rollout file under the loaf home directory.
    #[arg(long)]
    pub record: bool,

    /// The command to run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

pub async fn run_exec(cli: ExecCli) -> anyhow::Result<i32> {
    let config = Config::load()?;
    let runtime = if cli.record {
        Runtime::new(config).await?
    } else {
        Runtime::without_persistence(config)?
    };
    let cancel = notify_on_sigint();

    // A single argument is taken as a full shell script; separate argv words
    // are re-joined with quoting preserved.
    let command = match cli.command.as_slice() {
        [script] => script.clone(),
        words => shlex::try_join(words.iter().map(String::as_str))
            .unwrap_or_else(|_| words.join(" ")),
    };
    let mut input = json!({ "command": command });
    if let Some(cwd) = &cli.cwd {
        input["cwd"] = json!(cwd);
    }
    if let Some(timeout) = cli.timeout {
        input["timeout"] = json!(timeout);
    }

    let result = runtime
        .run_tool(
            &ToolCall {
                id: None,
                name: "bash".to_string(),
                input,
            },
            Some(cancel),
        )
        .await;
    runtime.shutdown();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": result.ok,
                "output": result.output,
                "error": result.error,
            }))?
        );
    } else {
        if let Some(stdout) = result.output.get("stdout").and_then(|v| v.as_str()) {
            print!("{stdout}");
        }
        if let Some(stderr) = result.output.get("stderr").and_then(|v| v.as_str())
            && !stderr.is_empty()
        {
            eprint!("{stderr}");
        }
        if let Some(error) = &result.error
            && result.output.get("exit_code").is_none()
        {
            eprintln!("{error}");
        }
    }

    let exit_code = result
        .output
        .get("exit_code")
        .and_then(|v| v.as_i64())
        .unwrap_or(if result.ok { 0 } else { 1 });
    Ok(exit_code as i32)
}
