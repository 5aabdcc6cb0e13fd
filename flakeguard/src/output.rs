// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::{
    fmt,
    io::{self, BufWriter, Write},
    sync::Once,
};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
    warn,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Events logged to this target are printed without a level prefix.
pub(crate) const NO_HEADING_TARGET: &str = "flakeguard::no_heading";

/// The environment variable that overrides log filtering, e.g. `flakeguard_runner=debug`.
const LOG_ENV: &str = "FLAKEGUARD_LOG";

pub(crate) mod clap_styles {
    use clap::builder::{
        Styles,
        styling::{AnsiColor, Effects},
    };

    pub(crate) const fn style() -> Styles {
        let heading = AnsiColor::Yellow.on_default().effects(Effects::BOLD);
        Styles::styled()
            .header(heading)
            .usage(heading)
            .literal(AnsiColor::Green.on_default().effects(Effects::BOLD))
            .placeholder(AnsiColor::Green.on_default())
            .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
            .valid(AnsiColor::Green.on_default().effects(Effects::BOLD))
            .invalid(AnsiColor::Red.on_default().effects(Effects::BOLD))
    }
}

#[derive(Copy, Clone, Debug, Args)]
#[command(next_help_heading = "Output options")]
pub(crate) struct OutputOpts {
    /// Verbose output: also show debug logs
    #[arg(long, short, global = true, env = "FLAKEGUARD_VERBOSE")]
    verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "FLAKEGUARD_COLOR"
    )]
    color: Color,
}

impl OutputOpts {
    /// Installs the logger and returns the output context.
    pub(crate) fn init(self) -> OutputContext {
        let output = OutputContext {
            verbose: self.verbose,
            color: self.color,
        };
        init_logger(output);
        output
    }
}

/// Output settings for the current invocation.
#[derive(Copy, Clone, Debug)]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: Color,
}

impl OutputContext {
    /// Returns styles for messages printed to stderr.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.color.should_colorize(supports_color::Stream::Stderr) {
            StderrStyles {
                bold: style().bold(),
                warning_text: style().yellow(),
            }
        } else {
            StderrStyles::default()
        }
    }

    /// Returns styles for reports printed to stdout.
    pub(crate) fn stdout_styles(&self) -> StdoutStyles {
        if self.color.should_colorize(supports_color::Stream::Stdout) {
            StdoutStyles {
                pass: style().green().bold(),
                gate: style().red().bold(),
                quarantined: style().yellow().bold(),
                test_id: style().bold(),
                dimmed: style().dimmed(),
            }
        } else {
            StdoutStyles::default()
        }
    }

    fn log_styles(&self) -> LogStyles {
        if self.color.should_colorize(supports_color::Stream::Stderr) {
            LogStyles {
                error: style().red().bold(),
                warning: style().yellow().bold(),
                info: style().cyan().bold(),
                debug: style().bold(),
                trace: style().dimmed(),
                fields: style().dimmed(),
            }
        } else {
            LogStyles::default()
        }
    }
}

/// When to produce color output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Color {
    /// Colorize if the stream is a terminal that supports color.
    #[default]
    Auto,

    /// Always colorize.
    Always,

    /// Never colorize.
    Never,
}

impl Color {
    pub(crate) fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Self::Auto => supports_color::on_cached(stream).is_some(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

fn init_logger(output: OutputContext) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let default_level = if output.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_targets = Targets::new().with_default(default_level);

        // An invalid filter falls back to the default, and is reported once the logger is up.
        let filter = std::env::var(LOG_ENV).ok().filter(|s| !s.is_empty());
        let (targets, invalid) = match filter.as_deref().map(str::parse::<Targets>) {
            Some(Ok(targets)) => (targets, None),
            Some(Err(error)) => (default_targets, Some(error)),
            None => (default_targets, None),
        };

        let layer = tracing_subscriber::fmt::layer()
            .event_format(LogFormatter {
                styles: output.log_styles(),
            })
            .with_writer(io::stderr)
            .with_filter(targets);
        tracing_subscriber::registry().with(layer).init();

        if let Some(error) = invalid {
            warn!(
                "ignoring {LOG_ENV}={}: {error}",
                filter.as_deref().unwrap_or_default()
            );
        }
    });
}

/// Formats events as `level: message key=value...`.
struct LogFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for LogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let (heading, heading_style) = match *metadata.level() {
                Level::ERROR => ("error", self.styles.error),
                Level::WARN => ("warning", self.styles.warning),
                Level::INFO => ("info", self.styles.info),
                Level::DEBUG => ("debug", self.styles.debug),
                Level::TRACE => ("trace", self.styles.trace),
            };
            write!(writer, "{}: ", heading.style(heading_style))?;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        writer.write_str(&fields.message)?;
        if !fields.rest.is_empty() {
            write!(writer, " {}", fields.rest.join(" ").style(self.styles.fields))?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    rest: Vec<String>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.rest.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.rest.push(format!("{}={value}", field.name()));
        }
    }
}

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    info: Style,
    debug: Style,
    trace: Style,
    fields: Style,
}

/// Styles for messages printed to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning_text: Style,
}

#[derive(Debug, Default)]
pub(crate) struct StdoutStyles {
    pub(crate) pass: Style,
    pub(crate) gate: Style,
    pub(crate) quarantined: Style,
    pub(crate) test_id: Style,
    pub(crate) dimmed: Style,
}

/// Where command output goes. Tests capture stdout into a buffer.
#[derive(Default)]
pub enum OutputWriter {
    /// Write to the process's stdout.
    #[default]
    Normal,

    /// Capture stdout.
    #[cfg(test)]
    Test {
        /// The captured output.
        stdout: Vec<u8>,
    },
}

impl OutputWriter {
    pub(crate) fn stdout_writer(&mut self) -> Box<dyn Write + '_> {
        match self {
            Self::Normal => Box::new(BufWriter::new(io::stdout().lock())),
            #[cfg(test)]
            Self::Test { stdout } => Box::new(stdout),
        }
    }
}
