//! Kimberlite personal-data audit CLI
//!
//! Inspect how a schema's entity types resolve to their data subjects and
//! what a payload would be audited as.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kimberlite_config::{AuditConfig, PersonalDataConfig, QuerySynthesisMode, SubjectSearchMode};
use kimberlite_personal_data::{AuditSession, Delta, PersonalDataAudit, Row, Schema};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kimberlite-audit")]
#[command(version, about = "Kimberlite personal-data audit diagnostics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show each personal-data entity's data subject, join path, and lookup
    Explain {
        /// Schema file (JSON)
        #[arg(short, long)]
        schema: PathBuf,

        /// Only explain this entity type
        #[arg(short, long)]
        entity: Option<String>,

        /// Use the greedy data-subject search
        #[arg(long)]
        greedy: bool,

        /// Render lookups with `$N` placeholders
        #[arg(long)]
        placeholders: bool,
    },

    /// Classify a payload and print the unresolved audit entries
    Classify {
        /// Schema file (JSON)
        #[arg(short, long)]
        schema: PathBuf,

        /// Entity type of the payload's top-level rows
        #[arg(short, long)]
        entity: String,

        /// Payload file: rows for `read`, deltas otherwise (JSON array)
        #[arg(short, long)]
        payload: PathBuf,

        /// Event to classify the payload as
        #[arg(long, value_enum)]
        event: Event,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Event {
    Read,
    Create,
    Update,
    Delete,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Explain {
            schema,
            entity,
            greedy,
            placeholders,
        } => {
            let mut config = load_config()?;
            if greedy {
                config.subject_search = SubjectSearchMode::Greedy;
            }
            if placeholders {
                config.query_synthesis = QuerySynthesisMode::Placeholder;
            }
            explain(&load_schema(&schema)?, config, entity.as_deref())?;
        }
        Commands::Classify {
            schema,
            entity,
            payload,
            event,
        } => {
            classify(&load_schema(&schema)?, load_config()?, &entity, &payload, event)?;
        }
    }

    Ok(())
}

fn load_config() -> Result<PersonalDataConfig> {
    let config = AuditConfig::load().context("Failed to load configuration")?;
    Ok(config.personal_data)
}

fn load_schema(path: &Path) -> Result<Schema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    Schema::from_json(&text).with_context(|| format!("Invalid schema {}", path.display()))
}

fn explain(schema: &Schema, config: PersonalDataConfig, only: Option<&str>) -> Result<()> {
    info!(search = %config.subject_search, "Explaining data subjects...");
    let audit = PersonalDataAudit::new(schema.clone(), config);

    let entities: Vec<&str> = match only {
        Some(entity) => {
            if audit.index().entity(entity).is_none() {
                bail!("Unknown entity type: {entity}");
            }
            vec![entity]
        }
        None => schema
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .filter(|name| audit.annotator().is_personal_data(name))
            .collect(),
    };

    for entity in entities {
        println!("{entity}");
        match audit.explain(entity) {
            Ok(Some(explanation)) => {
                println!("  Data subject: {} (role {})", explanation.subject, explanation.role);
                println!("  Depth: {}", explanation.depth);
                for path in &explanation.paths {
                    println!("  Path: {path}");
                }
                println!("  Lookup: {}", explanation.lookup.sql);
            }
            Ok(None) => println!("  ⚠ No data subject reachable"),
            Err(e) => println!("  ✗ {e}"),
        }
        println!();
    }

    Ok(())
}

fn classify(
    schema: &Schema,
    config: PersonalDataConfig,
    entity: &str,
    payload: &Path,
    event: Event,
) -> Result<()> {
    let text = std::fs::read_to_string(payload)
        .with_context(|| format!("Failed to read payload {}", payload.display()))?;
    let audit = PersonalDataAudit::new(schema.clone(), config);
    let mut session = audit.session();

    match event {
        Event::Read => {
            let rows: Vec<Row> = serde_json::from_str(&text).context("Payload must be an array of rows")?;
            session.after_read(entity, &rows);
        }
        Event::Create | Event::Update | Event::Delete => {
            let deltas: Vec<Delta> =
                serde_json::from_str(&text).context("Payload must be an array of deltas")?;
            match event {
                Event::Create => session.after_create(entity, &deltas),
                Event::Update => session.after_update(entity, &deltas),
                _ => session.classify_delete(entity, &deltas),
            }
        }
    }

    print_session(&session)
}

fn print_session(session: &AuditSession) -> Result<()> {
    let entries: Vec<_> = session
        .reads()
        .iter()
        .chain(session.writes().iter())
        .filter(|e| !e.attributes.is_empty())
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);

    for fault in session.faults() {
        eprintln!("✗ {fault}");
    }
    let pending: BTreeSet<_> = entries.iter().filter_map(|e| e.pending_role()).collect();
    if !pending.is_empty() {
        let roles: Vec<_> = pending.into_iter().collect();
        eprintln!("{} lookup(s) pending for roles: {}", session.cache().pending(), roles.join(", "));
    }
    Ok(())
}
