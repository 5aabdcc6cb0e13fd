// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and command routing.

use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts, OutputWriter, StdoutStyles},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use flakeguard_metadata::{FlakeguardExitCode, GatingVerdict, QuarantineState, TestIdentifier};
use flakeguard_runner::{
    audit,
    config::FlakeguardConfig,
    engine::{DecisionEngineBuilder, EvaluationReport},
    executor::CommandExecutor,
    quarantine::{QuarantineEntry, QuarantineManager},
    record::ExecutionRecord,
    signal::SignalHandlerKind,
    store::{FileStore, QueryWindow, ResultStore},
};
use owo_colors::OwoColorize;
use std::io::{Read, Write};
use tracing::{debug, info};

const STATE_FILE_NAME: &str = "quarantine.json";
const AUDIT_FILE_NAME: &str = "audit.jsonl";

/// Detects flaky tests from CI results, and quarantines them so they stop blocking the pipeline.
///
/// Feed each CI batch to `flakeguard evaluate`. Tests without enough history are re-run through the
/// configured runner command under varied conditions, classified, and moved through the quarantine
/// lifecycle. The exit code says whether the batch should gate the pipeline.
#[derive(Debug, Parser)]
#[command(
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct FlakeguardApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl FlakeguardApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        let config = self.config_opts.make_config()?;
        match self.command {
            Command::Evaluate(opts) => opts.exec(&config, &self.config_opts, output, output_writer),
            Command::Status {
                tests,
                message_format,
            } => exec_status(
                &config,
                &self.config_opts,
                &tests,
                message_format,
                output,
                output_writer,
            ),
            Command::History {
                test,
                last,
                message_format,
            } => exec_history(&config, &test, last, message_format, output, output_writer),
        }
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Config options")]
struct ConfigOpts {
    /// Workspace root [default: current directory]
    #[arg(long, global = true, value_name = "PATH", env = "FLAKEGUARD_WORKSPACE_ROOT")]
    workspace_root: Option<Utf8PathBuf>,

    /// Config file [default: workspace-root/.config/flakeguard.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Evaluation profile to use
    #[arg(
        long,
        short = 'P',
        global = true,
        env = "FLAKEGUARD_PROFILE",
        default_value = FlakeguardConfig::DEFAULT_PROFILE,
    )]
    profile: String,
}

impl ConfigOpts {
    fn make_config(&self) -> Result<FlakeguardConfig> {
        let workspace_root = match &self.workspace_root {
            Some(root) => root.clone(),
            None => current_dir()?,
        };
        debug!(%workspace_root, "loading config");
        Ok(FlakeguardConfig::from_sources(
            workspace_root,
            self.config_file.as_deref(),
        )?)
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().map_err(|error| ExpectedError::CurrentDirFailed { error })?;
    Utf8PathBuf::try_from(dir).map_err(|error| ExpectedError::CurrentDirInvalidUtf8 { error })
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a batch of CI results
    ///
    /// The batch is a JSON array of execution records. Records are appended to the result store,
    /// each test is classified (sampling it through the runner command if its history is too
    /// short), and quarantine state is updated.
    ///
    /// Exits with code 100 if any test in the batch gates the pipeline.
    Evaluate(EvaluateOpts),

    /// Show quarantine state
    Status {
        /// Tests to show [default: every test with quarantine state]
        #[arg(value_name = "TEST")]
        tests: Vec<TestIdentifier>,

        /// Output format
        #[arg(short = 'T', long, value_enum, default_value_t, value_name = "FMT")]
        message_format: MessageFormat,
    },

    /// Show stored execution records for a test
    History {
        /// The test, as `suite::case`
        test: TestIdentifier,

        /// Only show the most recent N records
        #[arg(long, value_name = "N")]
        last: Option<usize>,

        /// Output format
        #[arg(short = 'T', long, value_enum, default_value_t, value_name = "FMT")]
        message_format: MessageFormat,
    },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum MessageFormat {
    /// Human-readable output
    #[default]
    Human,

    /// JSON output
    Json,
}

#[derive(Debug, Args)]
struct EvaluateOpts {
    /// JSON file with the batch's execution records, or `-` for standard input
    #[arg(long, value_name = "PATH")]
    batch: String,

    /// Runner command used for sampling, overriding `runner.command` in config
    #[arg(long, value_name = "COMMAND", env = "FLAKEGUARD_RUNNER")]
    runner: Option<String>,

    /// Output format
    #[arg(short = 'T', long, value_enum, default_value_t, value_name = "FMT")]
    message_format: MessageFormat,
}

impl EvaluateOpts {
    fn exec(
        self,
        config: &FlakeguardConfig,
        config_opts: &ConfigOpts,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let profile = config.profile(&config_opts.profile)?;
        let batch = read_batch(&self.batch)?;

        let store_dir = config.store_dir();
        let store =
            FileStore::open(store_dir).map_err(|err| ExpectedError::store_error(store_dir, err))?;
        let state_path = store_dir.join(STATE_FILE_NAME);
        let settings = profile.engine_settings();
        let manager = QuarantineManager::load(&state_path, settings.quarantine)?;

        let command = self.runner.as_deref().or(config.runner().command());
        let executor = command
            .map(|command| CommandExecutor::new(command, config.runner().skip_exit_code()))
            .transpose()
            .map_err(|err| ExpectedError::RunnerCommandError { err })?;
        if let Some(executor) = &executor {
            debug!(program = executor.program(), "sampling with runner command");
        }

        let mut builder = DecisionEngineBuilder::new(settings);
        builder
            .set_signal_handler(SignalHandlerKind::Standard)
            .set_quarantine_manager(manager);
        let mut engine = builder.build(store, executor)?;

        info!(
            profile = profile.name(),
            records = batch.len(),
            "evaluating batch"
        );
        let report = engine.evaluate(batch)?;

        engine.quarantine().save(&state_path)?;
        let events = engine.take_audit_events();
        audit::append_to_file(&store_dir.join(AUDIT_FILE_NAME), &events)?;

        let mut writer = output_writer.stdout_writer();
        match self.message_format {
            MessageFormat::Human => {
                write_report(&report, &output.stdout_styles(), &mut writer)
                    .map_err(|err| ExpectedError::WriteOutputError { err })?;
            }
            MessageFormat::Json => write_json(&report.to_summary(), &mut writer)?,
        }
        writer
            .flush()
            .map_err(|err| ExpectedError::WriteOutputError { err })?;

        if report.gated() > 0 {
            Ok(FlakeguardExitCode::GATED)
        } else {
            Ok(FlakeguardExitCode::OK)
        }
    }
}

fn read_batch(path: &str) -> Result<Vec<ExecutionRecord>> {
    let read_err = |err| ExpectedError::BatchReadError {
        path: path.to_owned(),
        err,
    };
    let contents = if path == "-" {
        let mut contents = String::new();
        std::io::stdin()
            .read_to_string(&mut contents)
            .map_err(read_err)?;
        contents
    } else {
        std::fs::read_to_string(path).map_err(read_err)?
    };

    serde_json::from_str(&contents).map_err(|err| ExpectedError::BatchParseError {
        path: path.to_owned(),
        err,
    })
}

fn write_report(
    report: &EvaluationReport,
    styles: &StdoutStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    for decision in report.iter() {
        let (verdict, style) = match decision.verdict {
            GatingVerdict::Pass => ("PASS", styles.pass),
            GatingVerdict::Gate => ("GATE", styles.gate),
            GatingVerdict::Quarantined => ("QUARANTINED", styles.quarantined),
        };
        write!(
            writer,
            "{} {}: {}, confidence {:.2} over {} {}, {}",
            format!("{verdict:>11}").style(style),
            decision.test_id.style(styles.test_id),
            decision.label,
            decision.confidence,
            decision.evidence,
            if decision.evidence == 1 { "run" } else { "runs" },
            decision.state,
        )?;
        if let (Some(first), Some(last)) = (decision.transitions.first(), decision.transitions.last())
        {
            write!(writer, " ({} -> {})", first.from, last.to)?;
        }
        if let Some(reason) = &decision.deferred {
            write!(writer, " {}", format!("[deferred: {reason}]").style(styles.dimmed))?;
        }
        writeln!(writer)?;
    }

    let gated = report.gated();
    writeln!(
        writer,
        "{} evaluated, {} gated",
        match report.len() {
            1 => "1 test".to_owned(),
            n => format!("{n} tests"),
        },
        gated.style(if gated > 0 { styles.gate } else { styles.pass }),
    )
}

fn exec_status(
    config: &FlakeguardConfig,
    config_opts: &ConfigOpts,
    tests: &[TestIdentifier],
    message_format: MessageFormat,
    output: OutputContext,
    output_writer: &mut OutputWriter,
) -> Result<i32> {
    let profile = config.profile(&config_opts.profile)?;
    let state_path = config.store_dir().join(STATE_FILE_NAME);
    let manager = QuarantineManager::load(&state_path, profile.engine_settings().quarantine)?;

    // Tests that have never been through a cycle are active.
    let entries: Vec<Option<&QuarantineEntry>> = if tests.is_empty() {
        manager.entries().map(Some).collect()
    } else {
        tests.iter().map(|test_id| manager.entry(test_id)).collect()
    };

    let mut writer = output_writer.stdout_writer();
    match message_format {
        MessageFormat::Human => {
            let styles = output.stdout_styles();
            let write_err = |err| ExpectedError::WriteOutputError { err };
            if entries.is_empty() {
                writeln!(writer, "no quarantine state in {}", state_path).map_err(write_err)?;
            }
            for (index, entry) in entries.iter().enumerate() {
                match entry {
                    Some(entry) => {
                        write_status_line(entry, &styles, &mut writer).map_err(write_err)?
                    }
                    None => writeln!(
                        writer,
                        "{} {}",
                        tests[index].style(styles.test_id),
                        "active".style(styles.pass),
                    )
                    .map_err(write_err)?,
                }
            }
        }
        MessageFormat::Json => {
            let entries: Vec<&QuarantineEntry> = entries.into_iter().flatten().collect();
            write_json(&entries, &mut writer)?;
        }
    }
    writer
        .flush()
        .map_err(|err| ExpectedError::WriteOutputError { err })?;

    Ok(FlakeguardExitCode::OK)
}

fn write_status_line(
    entry: &QuarantineEntry,
    styles: &StdoutStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    let state_style = match entry.state {
        QuarantineState::Quarantined => styles.quarantined,
        QuarantineState::UnderObservation => styles.gate,
        _ => styles.pass,
    };
    write!(
        writer,
        "{} {} since {}",
        entry.test_id.style(styles.test_id),
        entry.state.style(state_style),
        entry.since.to_rfc3339(),
    )?;
    let details = format!(
        "(flaky streak {}, stable streak {}{})",
        entry.flaky_streak,
        entry.stable_streak,
        match &entry.last_batch {
            Some(batch) => format!(", last batch {batch}"),
            None => String::new(),
        },
    );
    writeln!(writer, " {}", details.style(styles.dimmed))
}

fn exec_history(
    config: &FlakeguardConfig,
    test: &TestIdentifier,
    last: Option<usize>,
    message_format: MessageFormat,
    output: OutputContext,
    output_writer: &mut OutputWriter,
) -> Result<i32> {
    let store_dir = config.store_dir();
    let store =
        FileStore::open(store_dir).map_err(|err| ExpectedError::store_error(store_dir, err))?;
    let window = last.map_or(QueryWindow::All, QueryWindow::Last);
    let snapshot = store
        .query(test, window)
        .map_err(|err| ExpectedError::store_error(store_dir, err))?;

    let mut writer = output_writer.stdout_writer();
    match message_format {
        MessageFormat::Human => {
            let styles = output.stdout_styles();
            write_history(test, snapshot.as_slice(), &styles, &mut writer)
                .map_err(|err| ExpectedError::WriteOutputError { err })?;
        }
        MessageFormat::Json => write_json(&snapshot.as_slice(), &mut writer)?,
    }
    writer
        .flush()
        .map_err(|err| ExpectedError::WriteOutputError { err })?;

    Ok(FlakeguardExitCode::OK)
}

fn write_history(
    test: &TestIdentifier,
    records: &[ExecutionRecord],
    styles: &StdoutStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    if records.is_empty() {
        return writeln!(writer, "no records for {}", test.style(styles.test_id));
    }
    for record in records {
        let kind = record.kind();
        let style = if kind.is_failure() {
            styles.gate
        } else {
            styles.pass
        };
        write!(
            writer,
            "{} {} {} {:>8.3}s {}",
            record.timestamp.to_rfc3339(),
            record.batch_id,
            format!("{:>7}", kind.to_string()).style(style),
            record.outcome.duration.as_secs_f64(),
            record.fingerprint,
        )?;
        if let Some(reason) = &record.outcome.reason {
            write!(writer, " {}", reason.message.style(styles.dimmed))?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

fn write_json<T: serde::Serialize + ?Sized>(value: &T, writer: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value)
        .map_err(|err| ExpectedError::SerializeError { err })?;
    writeln!(writer).map_err(|err| ExpectedError::WriteOutputError { err })
}
