use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a face image
    Register {
        /// Stable identity id (e.g., student number)
        #[arg(short, long)]
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Image file with exactly one face
        image: PathBuf,
    },
    /// Add another enrollment sample to an existing identity
    AddSample {
        #[arg(short, long)]
        id: String,
        image: PathBuf,
    },
    /// Verify a face image and record attendance
    Verify { image: PathBuf },
    /// List enrolled identities
    List {
        /// Include synthetic scale-test identities
        #[arg(long)]
        all: bool,
    },
    /// Show one identity
    Show { id: String },
    /// Remove an enrolled identity (attendance history is kept)
    Remove { id: String },
    /// Show attendance records, newest first
    Logs {
        #[command(flatten)]
        filter: LogFilter,
    },
    /// Attendance statistics
    Stats {
        #[command(flatten)]
        filter: LogFilter,
    },
    /// Export attendance records as CSV
    Export {
        #[command(flatten)]
        filter: LogFilter,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Days on which one identity was checked in
    Presence {
        id: String,
        #[command(flatten)]
        period: PeriodArg,
    },
    /// How many distinct identities were checked in
    Present {
        #[command(flatten)]
        period: PeriodArg,
    },
    /// Synthetic identities for scale testing
    Scale {
        #[command(subcommand)]
        action: ScaleAction,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ScaleAction {
    /// Generate N synthetic identities
    Generate { count: u32 },
    /// Remove all synthetic identities
    Clear,
}

#[derive(clap::Args)]
struct LogFilter {
    /// Outcome (accepted, no_match, ambiguous, liveness_failed, multi_face, no_face, ...)
    #[arg(long)]
    outcome: Option<String>,
    /// Identity id
    #[arg(long)]
    identity: Option<String>,
    /// Inclusive start, RFC 3339 (e.g., 2026-10-01T00:00:00Z)
    #[arg(long)]
    from: Option<String>,
    /// Exclusive end, RFC 3339
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    limit: Option<usize>,
}

impl LogFilter {
    fn to_json(&self) -> String {
        serde_json::json!({
            "outcome": self.outcome,
            "identity_id": self.identity,
            "from": self.from,
            "to": self.to,
            "offset": self.offset,
            "limit": self.limit,
        })
        .to_string()
    }
}

#[derive(clap::Args)]
struct PeriodArg {
    /// today, week (last 7 days), month or all; UTC
    #[arg(long, default_value = "today")]
    period: String,
    /// Inclusive start, RFC 3339; overrides --period
    #[arg(long)]
    from: Option<String>,
    /// Exclusive end, RFC 3339; overrides --period
    #[arg(long)]
    to: Option<String>,
}

impl PeriodArg {
    fn to_wire(&self) -> String {
        if self.from.is_none() && self.to.is_none() {
            return self.period.clone();
        }
        serde_json::json!({ "from": self.from, "to": self.to }).to_string()
    }
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, id: &str, display_name: &str, frame: &[u8]) -> zbus::Result<String>;
    async fn add_sample(&self, id: &str, frame: &[u8]) -> zbus::Result<u32>;
    async fn verify(&self, frame: &[u8]) -> zbus::Result<String>;
    async fn list_identities(&self, include_synthetic: bool) -> zbus::Result<String>;
    async fn get_identity(&self, id: &str) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn query_logs(&self, filter: &str) -> zbus::Result<String>;
    async fn export_logs(&self, filter: &str) -> zbus::Result<String>;
    async fn log_stats(&self, filter: &str) -> zbus::Result<String>;
    async fn presence(&self, id: &str, period: &str) -> zbus::Result<String>;
    async fn presence_summary(&self, period: &str) -> zbus::Result<String>;
    async fn generate_synthetic(&self, count: u32) -> zbus::Result<u32>;
    async fn clear_synthetic(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply for the terminal.
fn pretty(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json).context("daemon sent invalid JSON")?;
    Ok(serde_json::to_string_pretty(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(session = cli.session, "connected to D-Bus");
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Register { id, name, image } => {
            let reply = proxy.register(&id, &name, &read_image(&image)?).await?;
            println!("{}", pretty(&reply)?);
        }
        Commands::AddSample { id, image } => {
            let samples = proxy.add_sample(&id, &read_image(&image)?).await?;
            println!("{id}: {samples} samples");
        }
        Commands::Verify { image } => {
            let reply = proxy.verify(&read_image(&image)?).await?;
            let value: serde_json::Value = serde_json::from_str(&reply)?;
            let outcome = value["outcome"].as_str().unwrap_or("unknown");
            match value["identity"]["display_name"].as_str() {
                Some(name) => println!("{outcome}: {name}"),
                None => println!("{outcome}"),
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::List { all } => {
            println!("{}", pretty(&proxy.list_identities(all).await?)?);
        }
        Commands::Show { id } => {
            let reply = proxy.get_identity(&id).await?;
            if reply.is_empty() {
                bail!("no identity with id {id}");
            }
            println!("{}", pretty(&reply)?);
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("removed {id}");
            } else {
                bail!("no identity with id {id}");
            }
        }
        Commands::Logs { filter } => {
            println!("{}", pretty(&proxy.query_logs(&filter.to_json()).await?)?);
        }
        Commands::Stats { filter } => {
            println!("{}", pretty(&proxy.log_stats(&filter.to_json()).await?)?);
        }
        Commands::Export { filter, output } => {
            let csv = proxy.export_logs(&filter.to_json()).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => print!("{csv}"),
            }
        }
        Commands::Presence { id, period } => {
            let reply = proxy.presence(&id, &period.to_wire()).await?;
            let value: serde_json::Value = serde_json::from_str(&reply)?;
            let state = if value["present"].as_bool().unwrap_or(false) {
                "present"
            } else {
                "absent"
            };
            println!("{id}: {state} ({} days)", value["days_present"]);
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Present { period } => {
            println!("{}", pretty(&proxy.presence_summary(&period.to_wire()).await?)?);
        }
        Commands::Scale { action } => match action {
            ScaleAction::Generate { count } => {
                let generated = proxy.generate_synthetic(count).await?;
                println!("generated {generated} synthetic identities");
            }
            ScaleAction::Clear => {
                let removed = proxy.clear_synthetic().await?;
                println!("removed {removed} synthetic identities");
            }
        },
        Commands::Status => {
            println!("{}", pretty(&proxy.status().await?)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_arg_wire_form() {
        let named = Cli::parse_from(["rollcall", "present", "--period", "week"]);
        let Commands::Present { period } = named.command else {
            panic!("expected present");
        };
        assert_eq!(period.to_wire(), "week");

        let range = Cli::parse_from(["rollcall", "presence", "s1", "--from", "2026-10-01T00:00:00Z"]);
        let Commands::Presence { id, period } = range.command else {
            panic!("expected presence");
        };
        assert_eq!(id, "s1");
        let wire: serde_json::Value = serde_json::from_str(&period.to_wire()).unwrap();
        assert_eq!(wire["from"], "2026-10-01T00:00:00Z");
        assert!(wire["to"].is_null());
    }
}
