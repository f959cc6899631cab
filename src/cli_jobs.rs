use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use job_server::cli_style::{self, get_styles, TableBuilder};
use job_server::job_store::{cutoff_before, Job, JobStore, SqliteJobStore};

use crossterm::style::Stylize;
use rustyline::{
    completion::Completer, highlight::Highlighter, history::FileHistory, validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Path to jobs.db, or to the directory that holds it.
    #[clap(value_parser = parse_path)]
    pub path: PathBuf,
}

#[derive(Parser)]
#[command(styles=get_styles(), name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Lists the most recent jobs, optionally of a single type.
    List {
        #[clap(long = "type")]
        job_type: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Shows every field of a job.
    Show { id: String },

    /// Creates a pending job. Data is given as key=value pairs.
    Create {
        job_type: String,
        data: Vec<String>,
    },

    /// Cancels a pending or running job.
    Cancel { id: String },

    /// Shows job counts by type and status.
    Stats,

    /// Fails running jobs with no activity in the last N seconds.
    ReapStale { secs: u64 },

    /// Shows the path of the current jobs db.
    Where,

    /// Close this program.
    Exit,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

const PROMPT: &str = ">> ";

fn parse_data(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut data = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid data entry '{}', expected key=value", pair);
        };
        if key.is_empty() {
            bail!("Invalid data entry '{}', empty key", pair);
        }
        data.insert(key.to_string(), value.to_string());
    }
    Ok(data)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        cli_style::print_empty_list("(no jobs)");
        return;
    }
    let mut table = TableBuilder::new(&["id", "type", "status", "created", "finished"]);
    for job in jobs {
        table.add_row(vec![
            job.id.clone(),
            job.job_type.clone(),
            job.status.to_string(),
            format_time(Some(job.created_at)),
            format_time(job.finished_at),
        ]);
    }
    table.print();
}

fn print_job(job: &Job) {
    cli_style::print_section_header(&format!("Job {}", job.id));
    cli_style::print_key_value("type", &job.job_type);
    println!(
        "  {} {}",
        "status:".with(cli_style::colors::DIM),
        job.status.as_str().with(cli_style::status_color(job.status))
    );
    cli_style::print_key_value("message", job.message.as_deref().unwrap_or("-"));
    cli_style::print_key_value("created", &format_time(Some(job.created_at)));
    cli_style::print_key_value("started", &format_time(job.started_at));
    cli_style::print_key_value("last activity", &format_time(Some(job.last_activity_at)));
    cli_style::print_key_value("finished", &format_time(job.finished_at));

    let mut keys: Vec<&String> = job.data.keys().collect();
    keys.sort();
    for key in keys {
        cli_style::print_key_value(&format!("data.{}", key), &job.data[key]);
    }
}

fn execute_command(line: String, store: &dyn JobStore, db_path: &str) -> CommandExecutionResult {
    if line.is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    let command = match cli {
        Ok(cli) => cli.command,
        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
            return CommandExecutionResult::Ok;
        }
    };

    println!("{} {}", PROMPT, &line);
    let result = match command {
        InnerCommand::List { job_type, limit } => {
            let jobs = match job_type {
                Some(job_type) => store.list_jobs_by_type(&job_type, limit),
                None => store.list_recent_jobs(limit),
            };
            jobs.map(|jobs| print_jobs(&jobs))
        }
        InnerCommand::Show { id } => store.get_job(&id).map(|job| match job {
            Some(job) => print_job(&job),
            None => cli_style::print_warning(&format!("Job {} not found", id)),
        }),
        InnerCommand::Create { job_type, data } => parse_data(&data)
            .and_then(|data| store.create_job(&job_type, &data))
            .map(|job| cli_style::print_success(&format!("Created job {}", job.id))),
        InnerCommand::Cancel { id } => store.cancel_job(&id).map(|canceled| {
            if canceled {
                cli_style::print_success(&format!("Job {} canceled", id));
            } else {
                cli_style::print_warning(&format!(
                    "Job {} not canceled, it is missing or already finished",
                    id
                ));
            }
        }),
        InnerCommand::Stats => store.count_jobs_by_status().map(|counts| {
            if counts.is_empty() {
                cli_style::print_empty_list("(no jobs)");
                return;
            }
            let mut table = TableBuilder::new(&["type", "status", "count"]);
            for count in counts {
                table.add_row(vec![
                    count.job_type,
                    count.status.to_string(),
                    count.count.to_string(),
                ]);
            }
            table.print();
        }),
        InnerCommand::ReapStale { secs } => cutoff_before(Duration::from_secs(secs))
            .ok_or_else(|| anyhow!("{} seconds is out of range", secs))
            .and_then(|inactive_since| store.fail_stale_jobs(inactive_since))
            .map(|failed| cli_style::print_success(&format!("Failed {} stale jobs", failed))),
        InnerCommand::Where => {
            println!("{}", db_path);
            Ok(())
        }
        InnerCommand::Exit => return CommandExecutionResult::Exit,
    };

    match result {
        Ok(()) => CommandExecutionResult::Ok,
        Err(err) => CommandExecutionResult::Error(format!("{:#}", err)),
    }
}

#[derive(rustyline_derive::Hinter)]
struct JobsHelper {
    commands_names: Vec<String>,
}

impl JobsHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        JobsHelper { commands_names }
    }
}

impl Completer for JobsHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(' ') {
            return Ok((0, Vec::new()));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .cloned()
            .collect();

        Ok((0, matches))
    }
}

impl Highlighter for JobsHelper {}
impl Validator for JobsHelper {}
impl Helper for JobsHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let db_path = if cli_args.path.is_dir() {
        cli_args.path.join("jobs.db")
    } else {
        cli_args.path
    };
    let store = SqliteJobStore::new(&db_path)?;
    let db_path = db_path.display().to_string();

    InnerCli::command().print_long_help()?;

    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<JobsHelper, FileHistory>::with_config(config)?;
    rl.set_helper(Some(JobsHelper::new()));

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                match execute_command(line, &store, &db_path) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => break,
                    CommandExecutionResult::Error(err) => cli_style::print_error(&err),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                println!("Error: {:?}", e);
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_pairs() {
        let data = parse_data(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(data["a"], "1");
        assert_eq!(data["b"], "x=y");

        assert!(parse_data(&["novalue".to_string()]).is_err());
        assert!(parse_data(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_inner_cli_parses_commands() {
        let cli = InnerCli::try_parse_from([" ", "list", "--type", "job_cleanup", "--limit", "5"])
            .unwrap();
        assert!(matches!(
            cli.command,
            InnerCommand::List { job_type: Some(ref t), limit: 5 } if t == "job_cleanup"
        ));

        let cli = InnerCli::try_parse_from([" ", "reap-stale", "60"]).unwrap();
        assert!(matches!(cli.command, InnerCommand::ReapStale { secs: 60 }));
    }

    #[test]
    fn test_reap_stale_rejects_out_of_range_ages() {
        use job_server::job_store::JobStatus;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap();
        let job = store.create_job("t", &HashMap::new()).unwrap();
        store.claim_next_pending("t").unwrap();

        for secs in ["18446744073709551615", "99999999999999"] {
            let result = execute_command(format!("reap-stale {}", secs), &store, "jobs.db");
            assert!(matches!(result, CommandExecutionResult::Error(ref e) if e.contains("out of range")));
        }
        assert_eq!(
            store.get_job(&job.id).unwrap().unwrap().status,
            JobStatus::InProgress
        );

        // A fresh job is not stale for a sane age either
        assert!(matches!(
            execute_command("reap-stale 3600".to_string(), &store, "jobs.db"),
            CommandExecutionResult::Ok
        ));
        assert_eq!(
            store.get_job(&job.id).unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }
}
