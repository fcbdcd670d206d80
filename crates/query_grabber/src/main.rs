//! `query-grabber` binary.
//!
//! `run` executes one batch and prints `results sent to redis as <key>` as the
//! last stdout line; callers parse the final token. Logs go to stderr.
//!
//! Without a subcommand the run flags are read from the top level, so
//! `query-grabber -k <id> -c <cap> -t <n> -l <level> -r <json> -p <json>`
//! (or the same with `--k`, `--c`, ...) behaves like `query-grabber run ...`.

use std::fs::File;
use std::io::{BufReader, BufWriter, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use query_grabber::config::{DEFAULT_QUEUE_LOGIN, DEFAULT_RELATIONAL_LOGIN};
use query_grabber::{
    result_key_for, run_batch, transfer, BatchConfig, FailurePolicy, MemorySetStore,
    PgConnector, QueueStoreLogin, RelationalLogin, RespConnector, RespQueueStore,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "query-grabber", version, args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    cmd: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

impl Args {
    fn into_command(self) -> Command {
        self.cmd.unwrap_or(Command::Run(self.run))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one batch of queued jobs with a pool of workers.
    Run(RunArgs),
    /// Load JSON-lines jobs into a job queue.
    Submit(SubmitArgs),
    /// Pop every row out of a result set and print it as JSON lines.
    Collect(CollectArgs),
    /// Serve an in-memory set store over RESP2 (local runs and testing).
    ServeStore(ServeStoreArgs),
}

/// Queue-store connection options shared by every subcommand that talks to it.
#[derive(ClapArgs, Debug, Clone)]
struct QueueStoreArgs {
    /// Set-store login as JSON: {"Addr": "host:port", "Password": "", "DB": 0}
    #[arg(
        short = 'r',
        long,
        alias = "r",
        env = "GRABBER_REDIS_LOGIN",
        default_value = DEFAULT_QUEUE_LOGIN
    )]
    redis_login: String,

    /// Per-operation timeout for set-store round trips.
    #[arg(long, env = "GRABBER_OP_TIMEOUT", default_value = "10s")]
    op_timeout: humantime::Duration,
}

impl QueueStoreArgs {
    fn login(&self) -> anyhow::Result<QueueStoreLogin> {
        QueueStoreLogin::from_json(&self.redis_login).context("parse --redis-login")
    }

    async fn connect(&self) -> anyhow::Result<RespQueueStore> {
        let login = self.login()?;
        RespQueueStore::connect(&login, self.op_timeout.into())
            .await
            .with_context(|| format!("connect to set store at {}", login.addr))
    }
}

/// Log verbosity shared by every subcommand.
#[derive(ClapArgs, Debug, Clone)]
struct LogArgs {
    /// Logging level: 0 is silent, 5 is very noisy. Overrides RUST_LOG.
    #[arg(
        short = 'l',
        long = "log-level",
        alias = "l",
        value_parser = clap::value_parser!(u8).range(0..=5)
    )]
    log_level: Option<u8>,
}

impl LogArgs {
    fn filter(&self) -> tracing_subscriber::EnvFilter {
        match self.log_level {
            Some(level) => tracing_subscriber::EnvFilter::new(level_directives(level)),
            None => tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_DIRECTIVES.into()),
        }
    }
}

const DEFAULT_LOG_DIRECTIVES: &str = "info,tokio_postgres=warn";

fn level_directives(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "warn",
        2 => DEFAULT_LOG_DIRECTIVES,
        3 => "debug,tokio_postgres=info",
        4 => "trace,tokio_postgres=debug",
        _ => "trace",
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Key of the job queue; results land in `<key>_results`.
    #[arg(
        short = 'k',
        long,
        alias = "k",
        env = "GRABBER_SEARCH_KEY",
        default_value = "queries"
    )]
    search_key: String,

    /// Target maximum number of results (best effort).
    #[arg(short = 'c', long, alias = "c", env = "GRABBER_HIT_CAP", default_value_t = 200)]
    hit_cap: u64,

    /// Number of workers; each gets its own thread and connections.
    #[arg(short = 't', long, alias = "t", env = "GRABBER_WORKERS", default_value_t = 5)]
    workers: usize,

    #[command(flatten)]
    queue_store: QueueStoreArgs,

    /// Relational login as JSON: {"Host", "Port", "User", "Pass", "DBName"}
    #[arg(
        short = 'p',
        long,
        alias = "p",
        env = "GRABBER_PSQL_LOGIN",
        default_value = DEFAULT_RELATIONAL_LOGIN
    )]
    psql_login: String,

    #[command(flatten)]
    log: LogArgs,

    /// Record failing jobs and keep going instead of aborting the batch.
    #[arg(long, env = "GRABBER_SKIP_FAILED_JOBS")]
    skip_failed_jobs: bool,

    /// Publish `<key>_remaining` and `<key>_hitcount` while the batch runs.
    #[arg(long, env = "GRABBER_PROGRESS")]
    progress: bool,
}

#[derive(ClapArgs, Debug, Clone)]
struct SubmitArgs {
    #[arg(short = 'k', long, env = "GRABBER_SEARCH_KEY", default_value = "queries")]
    search_key: String,

    /// JSON-lines file of jobs; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Add to the existing queue instead of replacing it.
    #[arg(long)]
    append: bool,

    #[command(flatten)]
    queue_store: QueueStoreArgs,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct CollectArgs {
    /// Search key whose `<key>_results` set is drained.
    #[arg(short = 'k', long, conflicts_with = "result_key")]
    search_key: Option<String>,

    /// Exact result key to drain.
    #[arg(long)]
    result_key: Option<String>,

    #[command(flatten)]
    queue_store: QueueStoreArgs,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeStoreArgs {
    #[arg(long, env = "GRABBER_STORE_LISTEN", default_value = "127.0.0.1:6379")]
    listen: SocketAddr,

    #[command(flatten)]
    log: LogArgs,
}

impl Command {
    fn log(&self) -> &LogArgs {
        match self {
            Command::Run(args) => &args.log,
            Command::Submit(args) => &args.log,
            Command::Collect(args) => &args.log,
            Command::ServeStore(args) => &args.log,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cmd = Args::parse().into_command();

    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(cmd.log().filter())
        .init();

    // One runtime thread per worker for batch runs.
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Command::Run(run_args) = &cmd {
        builder.worker_threads(run_args.workers.max(1));
    }
    let runtime = builder.enable_all().build().context("build tokio runtime")?;

    runtime.block_on(async move {
        match cmd {
            Command::Run(args) => run(args).await,
            Command::Submit(args) => submit(args).await,
            Command::Collect(args) => collect(args).await,
            Command::ServeStore(args) => serve_store(args).await,
        }
    })
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.workers > 0, "--workers must be > 0");
    let queue_login = args.queue_store.login()?;
    let relational_login =
        RelationalLogin::from_json(&args.psql_login).context("parse --psql-login")?;
    let op_timeout: Duration = args.queue_store.op_timeout.into();

    let policy = if args.skip_failed_jobs {
        FailurePolicy::SkipFailedJob
    } else {
        FailurePolicy::AbortBatch
    };
    let config = BatchConfig::new(args.search_key, args.hit_cap, args.workers)
        .with_failure_policy(policy)
        .with_progress(args.progress);

    let report = run_batch(
        config,
        RespConnector::new(queue_login, op_timeout),
        PgConnector::new(relational_login),
    )
    .await
    .context("batch failed")?;

    for skipped in report.skipped() {
        eprintln!(
            "skipped job (worker {}): {} ({})",
            skipped.worker, skipped.job, skipped.reason
        );
    }
    println!("results sent to redis as {}", report.result_key);
    Ok(())
}

async fn submit(args: SubmitArgs) -> anyhow::Result<()> {
    let jobs = match &args.input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
            transfer::read_job_lines(BufReader::new(file))
        }
        None => transfer::read_job_lines(std::io::stdin().lock()),
    }
    .context("read jobs")?;

    let mut store = args.queue_store.connect().await?;
    let written = transfer::submit_jobs(&mut store, &args.search_key, &jobs, args.append)
        .await
        .context("submit jobs")?;
    eprintln!("queued {written} jobs under {}", args.search_key);
    Ok(())
}

async fn collect(args: CollectArgs) -> anyhow::Result<()> {
    let result_key = match (&args.result_key, &args.search_key) {
        (Some(key), _) => key.clone(),
        (None, Some(search_key)) => result_key_for(search_key),
        (None, None) => anyhow::bail!("one of --search-key or --result-key is required"),
    };

    let mut store = args.queue_store.connect().await?;
    let rows = transfer::drain_results(&mut store, &result_key)
        .await
        .with_context(|| format!("drain {result_key}"))?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for row in &rows {
        serde_json::to_writer(&mut out, row).context("encode row")?;
        out.write_all(b"\n").context("write row")?;
    }
    out.flush().context("flush stdout")?;
    eprintln!("collected {} rows from {result_key}", rows.len());
    Ok(())
}

async fn serve_store(args: ServeStoreArgs) -> anyhow::Result<()> {
    query_grabber::store_server::run(args.listen, MemorySetStore::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_JSON: &str = r#"{"Addr": "127.0.0.1:6380", "Password": "", "DB": 2}"#;
    const PSQL_JSON: &str = r#"{"Host": "db", "Port": 5433, "User": "hippa_wr", "Pass": "pw", "DBName": "hipparchiaDB"}"#;

    fn parse_run(argv: &[&str]) -> RunArgs {
        match Args::try_parse_from(argv).unwrap().into_command() {
            Command::Run(run) => run,
            other => panic!("expected a batch run, got {other:?}"),
        }
    }

    #[test]
    fn run_flags_match_historical_short_options() {
        let run = parse_run(&[
            "query-grabber",
            "run",
            "-k",
            "ff128837",
            "-c",
            "50",
            "-t",
            "3",
            "--skip-failed-jobs",
        ]);
        assert_eq!(run.search_key, "ff128837");
        assert_eq!(run.hit_cap, 50);
        assert_eq!(run.workers, 3);
        assert!(run.skip_failed_jobs);
        assert!(!run.progress);
        assert_eq!(run.queue_store.login().unwrap().addr, "localhost:6379");

        // The argument vector the search server builds: no subcommand.
        let run = parse_run(&[
            "HipparchiaGoDBHelper",
            "-k",
            "ff128837",
            "-c",
            "200",
            "-t",
            "6",
            "-l",
            "1",
            "-r",
            REDIS_JSON,
            "-p",
            PSQL_JSON,
        ]);
        assert_eq!(run.search_key, "ff128837");
        assert_eq!(run.hit_cap, 200);
        assert_eq!(run.workers, 6);
        assert_eq!(run.log.log_level, Some(1));
        let login = run.queue_store.login().unwrap();
        assert_eq!((login.addr.as_str(), login.db), ("127.0.0.1:6380", 2));
        let pg = RelationalLogin::from_json(&run.psql_login).unwrap();
        assert_eq!((pg.host.as_str(), pg.port), ("db", 5433));
    }

    #[test]
    fn double_dash_single_letter_flags_are_accepted() {
        let run = parse_run(&[
            "HipparchiaRustDBHelper",
            "--k",
            "abc",
            "--c",
            "10",
            "--t",
            "2",
            "--l",
            "3",
            "--r",
            REDIS_JSON,
            "--p",
            PSQL_JSON,
        ]);
        assert_eq!(run.search_key, "abc");
        assert_eq!(run.hit_cap, 10);
        assert_eq!(run.workers, 2);
        assert_eq!(run.log.log_level, Some(3));
        assert_eq!(run.queue_store.login().unwrap().db, 2);
    }

    #[test]
    fn log_level_is_bounded() {
        assert!(Args::try_parse_from(["query-grabber", "-l", "6"]).is_err());
        assert_eq!(level_directives(0), "off");
        assert_eq!(level_directives(2), DEFAULT_LOG_DIRECTIVES);
        assert_eq!(level_directives(5), "trace");
    }

    #[test]
    fn top_level_flags_conflict_with_subcommands() {
        assert!(Args::try_parse_from(["query-grabber", "-k", "a", "collect", "-k", "a"]).is_err());
        let cmd = Args::try_parse_from(["query-grabber", "collect", "-k", "a"])
            .unwrap()
            .into_command();
        assert!(matches!(cmd, Command::Collect(_)));
    }

    #[test]
    fn collect_rejects_both_keys() {
        let res = Args::try_parse_from([
            "query-grabber",
            "collect",
            "-k",
            "a",
            "--result-key",
            "a_results",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn jobs_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"TempTable": "", "PsqlQuery": "SELECT 1", "PsqlData": "x"}}"#
        )
        .unwrap();
        let reader = BufReader::new(File::open(file.path()).unwrap());
        let jobs = transfer::read_job_lines(reader).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].query_parameter, "x");
    }
}
