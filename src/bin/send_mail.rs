//! Send one plain-text mail through Gmail.
//!
//! Usage: send-mail --from A --to B --subject S [--body TEXT]

use anyhow::{Context, Result};
use booking_rgi::logging::{self, Profile};
use booking_rgi::mail::{self, CredentialCache, GmailTransport, MailMessage};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "send-mail")]
#[command(about = "Send a plain-text mail with a cached Gmail credential", long_about = None)]
struct Cli {
    /// Sender address; must belong to the authorized account
    #[arg(long = "from")]
    sender: String,

    /// Recipient address
    #[arg(long)]
    to: String,

    #[arg(long)]
    subject: String,

    /// Message body; read from stdin when omitted
    #[arg(long)]
    body: Option<String>,

    /// Credential cache written by the authorization flow
    #[arg(long, env = "MAIL_TOKEN_PATH", default_value = "token.json")]
    token: PathBuf,

    /// `json` for structured logs on stderr
    #[arg(long, env = "BOOKING_LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(Profile::from_format(cli.log_format.as_deref()));

    let body = match cli.body {
        Some(body) => body,
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("reading message body from stdin")?;
            body
        }
    };

    let http = reqwest::Client::new();
    let cache = CredentialCache::new(&cli.token);
    let credential = mail::load_credential(&cache, &http)
        .await
        .with_context(|| format!("loading credential from {}", cli.token.display()))?;

    let transport = GmailTransport::new(http, &credential);
    let message = MailMessage::new(cli.sender, cli.to, cli.subject, body);
    let sent = mail::send(&transport, &message)
        .await
        .context("sending message")?;

    println!("{}", serde_json::to_string(&sent)?);
    Ok(())
}
