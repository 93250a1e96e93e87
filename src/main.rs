//! Booking CLI
//!
//! Usage: booking [VERB] < envelope.json

use booking_rgi::logging::{self, Profile};
use booking_rgi::sqlite::DEFAULT_TABLE;
use booking_rgi::{handle, BookingError, StoreConfig};
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use serde::Serialize;
use std::io::{self, Read, Write};

#[derive(Debug, Parser)]
#[command(name = "booking")]
#[command(about = "Run one CRUD command against the booking table", long_about = None)]
struct Cli {
    /// get, post, patch, delete or list (default: get)
    verb: Option<String>,

    /// Record store location (sqlite://path, file: URI or plain path)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Table holding the booking records
    #[arg(long, env = "BOOKING_TABLE", default_value = DEFAULT_TABLE)]
    table: String,

    /// `json` for structured logs on stderr
    #[arg(long, env = "BOOKING_LOG_FORMAT")]
    log_format: Option<String>,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => usage_error(e),
    };
    logging::init(Profile::from_format(cli.log_format.as_deref()));

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(kind = e.kind(), error = %e, "command failed");
            if let Err(io_err) = emit(&e.body()) {
                tracing::error!(error = %io_err, "cannot write result");
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// Command-line mistakes still answer with a JSON error document.
fn usage_error(e: clap::Error) -> ! {
    if matches!(
        e.kind(),
        ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    ) {
        e.exit();
    }
    let log_format = std::env::var("BOOKING_LOG_FORMAT").ok();
    logging::init(Profile::from_format(log_format.as_deref()));

    let err = match e.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => BookingError::UnknownCommand(arg.clone()),
        _ => BookingError::malformed(e.render().to_string().trim()),
    };
    tracing::warn!(kind = err.kind(), error = %err, "invalid command line");
    if let Err(io_err) = emit(&err.body()) {
        tracing::error!(error = %io_err, "cannot write result");
    }
    std::process::exit(err.exit_code());
}

fn run(cli: &Cli) -> Result<(), BookingError> {
    let mut raw = Vec::new();
    io::stdin()
        .read_to_end(&mut raw)
        .map_err(|e| BookingError::malformed(format!("cannot read stdin: {e}")))?;
    let input = String::from_utf8(raw)
        .map_err(|_| BookingError::malformed("stdin is not valid UTF-8"))?;

    // Verb and envelope errors take priority over a missing store URL.
    let config = StoreConfig::new(cli.database_url.clone().unwrap_or_default(), &cli.table);
    let response = handle(cli.verb.as_deref(), &input, &config)?;
    emit(&response).map_err(|e| BookingError::unavailable(format!("cannot write result: {e}")))
}

fn emit<T: Serialize>(value: &T) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()
}
