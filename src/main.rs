//! CLI entry point for `mailsnare`.

use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use mailsnare::config::{self, Config};
use mailsnare::ingest::IngestAdapter;
use mailsnare::query::{LiveUpdate, QueryAdapter};
use mailsnare::smtp::SmtpServer;
use mailsnare::store::MessageStore;

#[derive(Parser)]
#[command(
    name = "mailsnare",
    version,
    about = "Catch mail sent by local applications and keep it in memory"
)]
struct Cli {
    /// Set the ip address of all servers
    #[arg(long, value_name = "IP")]
    ip: Option<String>,

    /// Set the ip address of the smtp server
    #[arg(long, value_name = "IP", env = "MAILSNARE_SMTP_IP")]
    smtp_ip: Option<String>,

    /// Set the port of the smtp server
    #[arg(long, value_name = "PORT", env = "MAILSNARE_SMTP_PORT")]
    smtp_port: Option<u16>,

    /// Print live updates as JSON lines instead of a table
    #[arg(long)]
    json: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(ip) = &self.ip {
            config.smtp.ip = ip.clone();
        }
        if let Some(ip) = &self.smtp_ip {
            config.smtp.ip = ip.clone();
        }
        if let Some(port) = self.smtp_port {
            config.smtp.port = port;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config();
    cli.apply(&mut config);

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let store = Arc::new(MessageStore::new(config.store.subscriber_buffer));
    let ingest = Arc::new(IngestAdapter::new(Arc::clone(&store)));
    let query = QueryAdapter::new(Arc::clone(&store));

    let server = SmtpServer::new(config.smtp.clone(), ingest);
    let listener = server.bind()?;
    let addr = listener.local_addr()?;
    let handle = server.spawn(listener)?;

    println!("==> smtp://{addr}");

    let mut updates = query.updates();
    loop {
        match updates.recv_timeout(Duration::from_millis(500)) {
            Ok(update) => print_update(&update, cli.json)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(
                    overflowed = updates.is_overflowed(),
                    "Live update stream dropped, resubscribing"
                );
                updates = query.updates();
            }
        }
        if handle.is_finished() {
            return match handle.join() {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(anyhow::anyhow!("SMTP listener thread panicked")),
            };
        }
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::log_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailsnare.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Print one live update as a table row or a JSON line.
fn print_update(update: &LiveUpdate, json: bool) -> anyhow::Result<()> {
    use humansize::{format_size, DECIMAL};

    if json {
        println!("{}", serde_json::to_string(update)?);
        return Ok(());
    }

    match update {
        LiveUpdate::Add { message } => {
            let subject: String = message.subject.chars().take(39).collect();
            let sender: String = message.sender.chars().take(24).collect();
            println!(
                "  + {:<5} {:<8} {:<25} {:<40} {:>9}",
                message.id,
                message.created_at.format("%H:%M:%S"),
                sender,
                subject,
                format_size(message.size, DECIMAL)
            );
        }
        LiveUpdate::Remove { id } => println!("  - {id:<5} deleted"),
    }
    Ok(())
}
