mod cli;

use cli::{CliError, Command, Invocation};
use galleria_core::{
    count_files, ingest, print_ingest_report, print_rows, progress, write_json, Catalog,
    ContentHash, FfmpegBackend, IngestOptions, LibraryConfig, MediaKind, MediaQuery,
    RenditionLookup, ThreadingMode,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

type CommandResult = Result<(), Box<dyn Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = Invocation::from_env().unwrap_or_else(|err| match err {
        CliError::Help => {
            println!("{}", err);
            std::process::exit(0);
        }
        _ => {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    });

    if let Err(error) = run(invocation) {
        eprintln!("error: {}", error);
        let mut source = error.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

fn run(invocation: Invocation) -> CommandResult {
    let config_path = invocation
        .config
        .unwrap_or_else(LibraryConfig::default_path);
    let config = LibraryConfig::load_or_default(&config_path)?;
    let catalog = Catalog::from_config(&config)?;

    match invocation.command {
        Command::Ingest { threading } => run_ingest(&config, &catalog, threading),
        Command::Query { filter, output } => run_query(&catalog, &filter, output.as_deref()),
        Command::Tags { hash } => run_tags(&catalog, hash.as_ref()),
        Command::Tag { tags, hashes } => {
            let added = catalog.open_existing()?.tags().add(&tags, &hashes)?;
            println!("Added {} tag assignments", added);
            Ok(())
        }
        Command::Untag { tags } => {
            let removed = catalog.open_existing()?.tags().remove(&tags)?;
            println!("Removed {} tag assignments", removed);
            Ok(())
        }
        Command::RenameTag { old, new } => {
            let stats = catalog.open_existing()?.tags().rename(&old, &new)?;
            println!(
                "Renamed {} assignments of {:?} to {:?} ({} merged)",
                stats.renamed, old, new, stats.merged
            );
            Ok(())
        }
        Command::Rotate { hash, direction } => {
            let rotation = catalog.open_existing()?.rotate(&hash, direction)?;
            println!("{} rotation is now {} degrees", hash, rotation.degrees());
            Ok(())
        }
        Command::Thumbnail { hash, size } => run_thumbnail(&catalog, &hash, size),
    }
}

fn run_ingest(
    config: &LibraryConfig,
    catalog: &Catalog,
    threading: ThreadingMode,
) -> CommandResult {
    let media_root = config.media_root();
    let progress_bar = progress::ingest_bar(count_files(&media_root), true);
    let options = IngestOptions::new(config.thumbnail_sizes(), config.commit_batch_size())
        .with_threading(threading)
        .with_workers(config.worker_threads());

    let mut store = catalog.open_store()?;
    let report = ingest(
        &media_root,
        &mut store,
        catalog.thumbnails(),
        &FfmpegBackend::default(),
        &options,
        &progress_bar,
    )?;
    progress_bar.finish_with_message("Ingest complete");

    print_ingest_report(&report, &store.counts()?);
    Ok(())
}

fn run_query(catalog: &Catalog, filter: &str, output: Option<&Path>) -> CommandResult {
    let query = MediaQuery::from_filter_string(filter)?;
    let rows = catalog.query(&query)?;
    match output {
        Some(path) => {
            write_json(&rows, &query.to_filter_string(), path)?;
            println!("{} rows written to {}", rows.len(), path.display());
        }
        None => print_rows(&rows),
    }
    Ok(())
}

fn run_tags(catalog: &Catalog, hash: Option<&ContentHash>) -> CommandResult {
    let mut store = catalog.open_existing()?;
    let tags = store.tags();
    let names = match hash {
        Some(hash) => tags.tags_for(hash)?,
        None => tags.list()?,
    };
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn run_thumbnail(catalog: &Catalog, hash: &ContentHash, size: Option<u32>) -> CommandResult {
    let size = size
        .or_else(|| catalog.default_size())
        .ok_or("no thumbnail sizes are configured")?;

    match catalog.rendition(hash, size)? {
        RenditionLookup::Ready(path) => println!("{}", path.display()),
        RenditionLookup::NotRendered(_) => {
            let path = render_from_catalog(catalog, hash, size)?;
            println!("{}", path.display());
        }
        RenditionLookup::UnknownMedia => return Err(format!("unknown media {}", hash).into()),
        RenditionLookup::UnsupportedSize => {
            return Err(format!(
                "size {} is not configured (available: {:?})",
                size,
                catalog.sizes()
            )
            .into())
        }
    }
    Ok(())
}

/// Renders a missing rendition from the first catalogued path that still exists.
fn render_from_catalog(
    catalog: &Catalog,
    hash: &ContentHash,
    size: u32,
) -> Result<PathBuf, Box<dyn Error>> {
    let store = catalog.open_existing()?;
    let content = store
        .media(hash)?
        .ok_or_else(|| format!("unknown media {}", hash))?;
    let source = store
        .paths_for(hash)?
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| format!("no path of {} is readable", hash))?;
    let kind = if content.is_video {
        MediaKind::Video
    } else {
        MediaKind::Image
    };

    let rendition = catalog
        .thumbnails()
        .ensure(hash, &source, kind, size, &FfmpegBackend::default())?;
    Ok(rendition.path)
}
