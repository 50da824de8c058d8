use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use photocat::blob::{BlobStore, DirBlobStore, Variant};
use photocat::config::Config;
use photocat::db::{
    Database, NewPlace, PageRequest, PhotoFilter, PhotoUpdate, PlaceType, RequestContext, Visibility,
};
use photocat::ingest::Importer;
use photocat::{logging, CatalogError};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long, global = true, env = "PHOTOCAT_CONFIG")]
    config: Option<PathBuf>,

    /// Editor identity for mutations
    #[clap(short, long, global = true, env = "PHOTOCAT_EDITOR")]
    editor: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List photos matching a filter
    List {
        #[clap(long)]
        from: Option<NaiveDate>,
        #[clap(long)]
        to: Option<NaiveDate>,
        #[clap(long)]
        place: Option<i64>,
        #[clap(long)]
        person: Option<i64>,
        #[clap(long)]
        include_low_quality: bool,
        #[clap(long, default_value = "1")]
        page: u32,
        #[clap(long)]
        page_size: Option<u32>,
    },
    /// Photo detail: place chain, EXIF, faces and history
    Show { photo_id: String },
    /// Change photo fields; pass `none` to clear a field
    Edit {
        photo_id: String,
        #[clap(long)]
        not_earlier_than: Option<String>,
        #[clap(long)]
        not_later_than: Option<String>,
        #[clap(long)]
        place: Option<String>,
        #[clap(long, value_parser = parse_visibility)]
        visibility: Option<Visibility>,
    },
    /// Audit history of a photo, most recent first
    History { photo_id: String },
    /// Undo an audit entry
    Revert { entry_id: i64 },
    /// Face clusters awaiting review
    Clusters,
    /// Assign a face to a person, or unassign it
    Assign {
        face_id: i64,
        #[clap(long, conflicts_with = "unassign", required_unless_present = "unassign")]
        person: Option<i64>,
        #[clap(long)]
        unassign: bool,
    },
    /// Assign every unassigned face of a cluster to a person
    AssignCluster { cluster_id: i64, person_id: i64 },
    PersonCreate { name: String },
    Persons,
    Places,
    PlaceCreate {
        #[clap(long)]
        primary: String,
        /// Defaults to the primary name
        #[clap(long)]
        secondary: Option<String>,
        #[clap(long)]
        parent: Option<i64>,
        #[clap(long = "type", value_parser = parse_place_type)]
        place_type: PlaceType,
    },
    /// Earliest and latest dates in the collection
    Bounds,
    /// Photos most similar to a photo
    Similar {
        photo_id: String,
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// Import every image below a directory
    Import { dir: PathBuf },
    /// Write a stored variant to a file or stdout
    Fetch {
        photo_id: String,
        #[clap(long, default_value = "original", value_parser = parse_variant)]
        variant: Variant,
        #[clap(short, long)]
        out: Option<PathBuf>,
    },
}

fn parse_visibility(s: &str) -> std::result::Result<Visibility, String> {
    Visibility::parse(s).ok_or_else(|| format!("expected visible, low_quality or deleted, got {:?}", s))
}

fn parse_place_type(s: &str) -> std::result::Result<PlaceType, String> {
    PlaceType::parse(s).ok_or_else(|| format!("expected country, state, city or street, got {:?}", s))
}

fn parse_variant(s: &str) -> std::result::Result<Variant, String> {
    Variant::parse(s).ok_or_else(|| format!("expected original, thumbnail or default, got {:?}", s))
}

/// `None` leaves the field alone, `"none"` clears it.
fn nullable<T>(raw: Option<String>, parse: impl Fn(&str) -> Option<T>) -> Result<Option<Option<T>>> {
    match raw.as_deref() {
        None => Ok(None),
        Some("none") | Some("null") => Ok(Some(None)),
        Some(value) => parse(value)
            .map(|v| Some(Some(v)))
            .ok_or_else(|| CatalogError::validation(format!("cannot parse {:?}", value)).into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CatalogError>().map(CatalogError::kind) {
        Some("not_found") => 2,
        Some("validation") => 3,
        Some("conflict") => 4,
        Some("forbidden") => 5,
        Some("cancelled") => 6,
        Some("unavailable") => 7,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Database::open(&config).context("Failed to open catalog")?;
    db.initialize()?;

    let ctx: RequestContext = match cli.editor.as_deref() {
        Some(editor) => db.request_for(editor)?,
        None => db.request(),
    };

    match cli.command {
        Commands::List {
            from,
            to,
            place,
            person,
            include_low_quality,
            page,
            page_size,
        } => {
            let filter = PhotoFilter {
                date_start: from,
                date_end: to,
                place_id: place,
                person_id: person,
                include_low_quality,
            };
            print_json(&db.list_photos(&ctx, &filter, PageRequest { page, page_size })?)?;
        }
        Commands::Show { photo_id } => print_json(&db.get_photo(&ctx, &photo_id)?)?,
        Commands::Edit {
            photo_id,
            not_earlier_than,
            not_later_than,
            place,
            visibility,
        } => {
            let parse_date = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
            let update = PhotoUpdate {
                not_earlier_than: nullable(not_earlier_than, parse_date)?,
                not_later_than: nullable(not_later_than, parse_date)?,
                place_id: nullable(place, |s| s.parse().ok())?,
                visibility,
            };
            if update.is_empty() {
                anyhow::bail!("nothing to change; pass at least one field");
            }
            let entries = db.update_photo(&ctx, &photo_id, &update)?;
            print_json(&serde_json::json!({ "entries": entries }))?;
        }
        Commands::History { photo_id } => print_json(&db.history_of(&ctx, &photo_id)?)?,
        Commands::Revert { entry_id } => {
            print_json(&serde_json::json!({ "entry": db.revert(&ctx, entry_id)? }))?
        }
        Commands::Clusters => print_json(&db.unassigned_clusters(&ctx)?)?,
        Commands::Assign { face_id, person, .. } => {
            print_json(&serde_json::json!({ "entry": db.assign_face(&ctx, face_id, person)? }))?
        }
        Commands::AssignCluster { cluster_id, person_id } => {
            let entries = db.assign_cluster(&ctx, cluster_id, person_id)?;
            print_json(&serde_json::json!({ "entries": entries }))?;
        }
        Commands::PersonCreate { name } => print_json(&db.create_person(&ctx, &name)?)?,
        Commands::Persons => print_json(&db.list_persons(&ctx)?)?,
        Commands::Places => print_json(&db.list_places(&ctx)?)?,
        Commands::PlaceCreate {
            primary,
            secondary,
            parent,
            place_type,
        } => {
            let new = NewPlace {
                name_secondary: secondary.unwrap_or_else(|| primary.clone()),
                name_primary: primary,
                parent_id: parent,
                place_type,
            };
            print_json(&db.create_place(&ctx, &new)?)?;
        }
        Commands::Bounds => print_json(&db.date_bounds(&ctx)?)?,
        Commands::Similar { photo_id, limit } => print_json(&db.similar_to(&ctx, &photo_id, limit)?)?,
        Commands::Import { dir } => {
            let importer = Importer::new(&db, &config.ingest);
            print_json(&importer.import_dir(&ctx, &dir)?)?;
        }
        Commands::Fetch {
            photo_id,
            variant,
            out,
        } => {
            let blobs = DirBlobStore::new(&config.blobs.root);
            let mut reader = blobs.get(&photo_id, variant)?;
            let written = match out {
                Some(path) => {
                    let mut file =
                        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
                    io::copy(&mut reader, &mut file)?
                }
                None => io::copy(&mut reader, &mut io::stdout().lock())?,
            };
            info!("Wrote {} bytes of {:?} for {}", written, variant, photo_id);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match logging::init(&Config::log_dir()) {
        Ok(target) => debug!("Logging to {:?}", target),
        Err(e) => eprintln!("Warning: logging disabled: {:#}", e),
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<CatalogError>() {
                Some(err) if err.is_client_error() => warn!("{:#}", e),
                _ => error!("{:#}", e),
            }
            let code = exit_code(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(code)
        }
    }
}
