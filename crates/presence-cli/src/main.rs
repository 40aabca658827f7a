use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use presence_core::Template;
use presence_store::SqliteStore;
use std::path::PathBuf;

/// Enrollment and schedule commands write to the attendance database
/// directly; the daemon picks changes up on its next snapshot refresh
/// (or immediately after `presence reload`). Capture, status and reload
/// go through the daemon's D-Bus interface.
#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn register_capture(&self, template_json: &str, method: &str) -> zbus::Result<String>;
    async fn reload_templates(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance administration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a person's facial template
    Enroll {
        /// Stable person identifier
        id: i64,
        /// Display name
        name: String,
        /// Path to a JSON float array of the system template dimensionality
        template: PathBuf,
    },
    /// Remove a person (their template and schedule go with them)
    Remove {
        id: i64,
    },
    /// List persons and their enrollment state
    List,
    /// Set a person's expected start time for one weekday
    Schedule {
        id: i64,
        /// Weekday, 0 = Monday .. 6 = Sunday
        weekday: u8,
        /// Expected start time, HH:MM
        start: String,
    },
    /// Show attendance records for a day (defaults to today)
    Today {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Send a captured template to the daemon for registration
    Capture {
        /// Path to a JSON float array of the system template dimensionality
        template: PathBuf,
        /// Capture method: face, card or manual
        #[arg(long, default_value = "face")]
        method: String,
    },
    /// Show daemon status
    Status,
    /// Ask the daemon to reload the enrolled gallery now
    Reload,
}

fn db_path() -> PathBuf {
    // Same default as presenced, so both sides see one database.
    std::env::var("PRESENCE_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("presence")
                .join("attendance.db")
        })
}

fn read_template(path: &PathBuf) -> Result<Template> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading template file {}", path.display()))?;
    let template = serde_json::from_str(&raw)
        .with_context(|| format!("parsing template file {}", path.display()))?;
    Ok(template)
}

async fn open_store() -> Result<SqliteStore> {
    let path = db_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(store)
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus (is presenced running?)")?;
    Ok(AttendanceProxy::new(&conn).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { id, name, template } => {
            let template = read_template(&template)?;
            let store = open_store().await?;
            store.upsert_person(id, name.clone()).await?;
            store.enroll_template(id, &template).await?;
            println!("Enrolled {name} (person {id})");
        }
        Commands::Remove { id } => {
            let store = open_store().await?;
            if store.remove_person(id).await? {
                println!("Removed person {id}");
            } else {
                println!("No person {id}");
            }
        }
        Commands::List => {
            let store = open_store().await?;
            let persons = store.list_persons().await?;
            if persons.is_empty() {
                println!("No persons registered");
            }
            for p in persons {
                let state = if p.enrolled { "enrolled" } else { "no template" };
                println!("{:>6}  {}  [{state}]", p.id, p.name);
            }
        }
        Commands::Schedule { id, weekday, start } => {
            anyhow::ensure!(weekday <= 6, "weekday must be 0 (Monday) .. 6 (Sunday)");
            let start = NaiveTime::parse_from_str(&start, "%H:%M")
                .context("start time must be HH:MM")?;
            let store = open_store().await?;
            store.set_schedule(id, weekday, start).await?;
            println!("Schedule set for person {id}, weekday {weekday}: {start}");
        }
        Commands::Today { date } => {
            let day = date.unwrap_or_else(|| Local::now().date_naive());
            let store = open_store().await?;
            let records = store.records_for_day(day).await?;
            if records.is_empty() {
                println!("No attendance records for {day}");
            }
            for r in records {
                let exit = r
                    .exit_at
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_else(|| "--:--".to_string());
                println!(
                    "person {:>6}  in {}  out {}  late {:>3} min  [{}]",
                    r.person_id,
                    r.entry_at.format("%H:%M"),
                    exit,
                    r.lateness_minutes,
                    r.method,
                );
            }
        }
        Commands::Capture { template, method } => {
            let template = read_template(&template)?;
            let template_json = serde_json::to_string(&template)?;
            let reply = proxy()
                .await?
                .register_capture(&template_json, &method)
                .await?;
            println!("{reply}");
        }
        Commands::Status => {
            let status = proxy().await?.status().await?;
            println!("{status}");
        }
        Commands::Reload => {
            let count = proxy().await?.reload_templates().await?;
            println!("Reloaded: {count} enrolled templates");
        }
    }

    Ok(())
}
