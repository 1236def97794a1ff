use anyhow::{Context, bail};
use chrono::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use palimpsest_common::SubjectId;
use palimpsest_persist::{FileRevisionStore, RevisionEntry, RevisionLog, Retention, Settings};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "palimpsest-cli", about = "CLI tool for palimpsest revision stores")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Revision store directory
    #[arg(short, long, global = true, default_value = "revisions")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print tool version and store summary
    Info,
    /// List subjects, or one subject's revisions
    List {
        /// Subject type; all types when omitted
        subject_type: Option<String>,
        /// Subject id, comma-separated for composite keys. Quote text keys
        /// that contain commas or look like integers: '"a,b"' or '"42"'
        id: Option<SubjectId>,
    },
    /// Decode and print a revision's snapshot
    Show {
        subject_type: String,
        /// Subject id, quoted like in `list`
        id: SubjectId,
        /// Revision number; the newest when omitted
        revision: Option<u64>,
        #[arg(short, long, value_enum, default_value_t = Output::Json)]
        output: Output,
    },
    /// Prune old revisions
    Truncate {
        subject_type: String,
        /// Only this subject; every subject of the type when omitted
        id: Option<SubjectId>,
        /// Revisions to keep among those old enough to prune
        #[arg(long)]
        limit: Option<usize>,
        /// Never prune revisions younger than this many seconds
        #[arg(long)]
        min_age_secs: Option<i64>,
        /// Settings file (YAML or JSON) supplying retention for the type
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Purge the history of subjects trashed at least this long ago
    EmptyTrash {
        subject_type: String,
        #[arg(long, default_value = "0")]
        max_age_secs: i64,
    },
    /// Verify every payload against the index
    Verify,
}

#[derive(Clone, Copy, ValueEnum)]
enum Output {
    Json,
    Yaml,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("palimpsest-cli v{}", env!("CARGO_PKG_VERSION"));
            let store = open(&cli.store)?;
            println!("store: {}", store.root().display());
            println!("schema: v{}", store.meta().schema_version);
            println!("entries: {}", store.len());
            for subject_type in store.subject_types() {
                println!("  {subject_type}: {} subjects", store.subjects(&subject_type).len());
            }
        }
        Commands::List { subject_type, id } => {
            let store = open(&cli.store)?;
            match (subject_type, id) {
                (None, _) => {
                    for subject_type in store.subject_types() {
                        list_subjects(&store, &subject_type);
                    }
                }
                (Some(subject_type), None) => list_subjects(&store, &subject_type),
                (Some(subject_type), Some(id)) => {
                    let log = RevisionLog::new(store);
                    for entry in log.history(&subject_type, &id)? {
                        println!("{}", describe(&entry));
                    }
                }
            }
        }
        Commands::Show {
            subject_type,
            id,
            revision,
            output,
        } => {
            let log = RevisionLog::new(open(&cli.store)?);
            let entry = match revision {
                Some(revision) => log.find_revision(&subject_type, &id, revision)?,
                None => log.last_revision(&subject_type, &id)?,
            };
            let Some(entry) = entry else {
                bail!("no such revision of {subject_type} {id}");
            };
            println!("# {}", describe(&entry));
            let doc = entry.document()?;
            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&doc)?),
            }
        }
        Commands::Truncate {
            subject_type,
            id,
            limit,
            min_age_secs,
            config,
        } => {
            let settings = match &config {
                Some(path) => Some(
                    Settings::from_path(path).with_context(|| format!("loading {}", path.display()))?,
                ),
                None => None,
            };
            let retention = retention_for(settings.as_ref(), &subject_type, limit, min_age_secs);
            if retention.is_unlimited() {
                bail!("no retention for {subject_type}: pass --limit, --min-age-secs or --config");
            }

            let mut log = RevisionLog::new(open(&cli.store)?);
            let ids = match id {
                Some(id) => vec![id],
                None => log
                    .revisions()
                    .subjects(&subject_type)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect(),
            };
            let mut removed = 0;
            for id in &ids {
                removed += log.truncate(&subject_type, id, &retention)?.len();
            }
            info!(subjects = ids.len(), removed, "truncate finished");
            println!("removed {removed} revisions from {} subjects", ids.len());
        }
        Commands::EmptyTrash {
            subject_type,
            max_age_secs,
        } => {
            let mut log = RevisionLog::new(open(&cli.store)?);
            let removed = log.empty_trash(&subject_type, Duration::seconds(max_age_secs))?;
            println!("removed {removed} revisions");
        }
        Commands::Verify => {
            let store = open(&cli.store)?;
            store.verify_integrity()?;
            println!("OK: {} entries verified", store.len());
        }
    }

    Ok(())
}

fn open(path: &Path) -> anyhow::Result<FileRevisionStore> {
    FileRevisionStore::open(path).with_context(|| format!("opening revision store {}", path.display()))
}

fn list_subjects(store: &FileRevisionStore, subject_type: &str) {
    for (id, count) in store.subjects(subject_type) {
        println!("{subject_type} {id}: {count} revisions");
    }
}

/// Command-line flags override the settings file.
fn retention_for(
    settings: Option<&Settings>,
    subject_type: &str,
    limit: Option<usize>,
    min_age_secs: Option<i64>,
) -> Retention {
    let mut retention = settings
        .map(|s| s.for_type(subject_type).retention())
        .unwrap_or_default();
    if let Some(limit) = limit {
        retention.limit = Some(limit);
    }
    if let Some(secs) = min_age_secs {
        retention.min_age = Some(Duration::seconds(secs));
    }
    retention
}

fn describe(entry: &RevisionEntry) -> String {
    let format = entry.format().map(|f| f.as_str()).unwrap_or("?");
    let mut line = format!(
        "r{} {} {} {}B",
        entry.revision,
        entry.created_at.to_rfc3339(),
        format,
        entry.payload.len()
    );
    if entry.trash {
        line.push_str(" [trash]");
    }
    for (name, value) in &entry.metadata {
        line.push_str(&format!(" {name}={value}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palimpsest_common::{Document, Value};
    use palimpsest_persist::{Format, codec};
    use std::collections::BTreeMap;

    #[test]
    fn cli_parses_commands() {
        let cli = Cli::try_parse_from(["palimpsest-cli", "--store", "/tmp/r", "show", "Post", "3,abc", "2", "-o", "yaml"])
            .unwrap();
        assert_eq!(cli.store, PathBuf::from("/tmp/r"));
        match cli.command {
            Commands::Show { id, revision, .. } => {
                assert_eq!(id, "3,abc".parse().unwrap());
                assert_eq!(revision, Some(2));
            }
            _ => panic!("expected show"),
        }
        assert!(Cli::try_parse_from(["palimpsest-cli", "show", "Post", ""]).is_err());
    }

    #[test]
    fn quoted_text_ids_reach_the_command() {
        let cli = Cli::try_parse_from(["palimpsest-cli", "show", "Tag", r#""42""#]).unwrap();
        let Commands::Show { id, .. } = cli.command else {
            panic!("expected show");
        };
        assert_eq!(id, SubjectId::from("42"));
        assert_eq!(id.to_string().parse::<SubjectId>().unwrap(), id);

        let cli = Cli::try_parse_from(["palimpsest-cli", "list", "Pair", r#"1,"x,y""#]).unwrap();
        let Commands::List { id: Some(id), .. } = cli.command else {
            panic!("expected list with an id");
        };
        assert_eq!(id.components().len(), 2);
    }

    #[test]
    fn flags_override_settings() {
        let settings = Settings::from_yaml_str("types: {Post: {limit: 5, min_age_secs: 60}}").unwrap();
        let retention = retention_for(Some(&settings), "Post", Some(2), None);
        assert_eq!(retention.limit, Some(2));
        assert_eq!(retention.min_age, Some(Duration::seconds(60)));
        assert!(retention_for(Some(&settings), "Tag", None, None).is_unlimited());
        assert!(retention_for(None, "Post", None, None).is_unlimited());
    }

    #[test]
    fn describe_lists_flags_and_metadata() {
        let doc = Document::new().with("title", "t");
        let entry = RevisionEntry {
            subject_type: "Post".into(),
            subject_id: SubjectId::from(1),
            revision: 4,
            payload: codec::encode(&doc, Format::Yaml).unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            trash: true,
            metadata: BTreeMap::from([("label".to_string(), Value::from("nightly"))]),
        };
        let line = describe(&entry);
        assert!(line.starts_with("r4 2024-01-02T03:04:05+00:00 yaml "));
        assert!(line.ends_with(" [trash] label=\"nightly\""));
    }
}
