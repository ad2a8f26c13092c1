//! Command line front end for the FEF writer: loads `.json` files passed as
//! positional arguments on startup, times `.csv` files passed the same way
//! without storing them, and then serves the same three operations over
//! HTTP until told to stop.

#[macro_use]
extern crate log;

mod server;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use fef::segment::SegmentStore;
use fef::writer::{self, LoadOptions};

/// Loads FEF segments from JSON, with inline CSV expansion, and optionally
/// serves `/load`, `/unload`, `/erase`, `/stop` over HTTP.
#[derive(Parser, Debug)]
#[command(name = "fef-cli")]
struct Opt {
    /// `.json` documents to load on startup (transduced immediately); a
    /// `.csv` path instead only times the column-type inference ladder.
    files: Vec<PathBuf>,

    /// Rebuild a segment even if it was already populated by a prior run.
    #[arg(long)]
    force_reload: bool,

    /// Never compress repeated argument type tags into RLE runs.
    #[arg(long)]
    disable_rle: bool,

    /// Never expand `.csv`-valued strings into inline `Table` subtrees.
    #[arg(long)]
    disable_csv_handling: bool,

    /// Port the HTTP control plane listens on.
    #[arg(long, default_value_t = 3000)]
    http_port: u16,

    /// Dump the loaded document as JSON instead of writing FEF. The
    /// schema-free JSON/BSON dump path lives outside this crate; passing
    /// this flag logs a warning and falls back to the normal FEF load.
    #[arg(long)]
    load_as_json: bool,

    /// Dump the loaded document as BSON instead of writing FEF. Same
    /// fallback behavior as `--load-as-json`.
    #[arg(long)]
    load_as_bson: bool,
}

fn segment_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    if opt.load_as_json || opt.load_as_bson {
        warn!(
            "--load-as-json/--load-as-bson request a schema-free dump path this crate does \
             not implement; falling back to the normal FEF load"
        );
    }

    let segments_dir = fef::segment::default_dir();
    let store = SegmentStore::new(&segments_dir)?;

    let options = LoadOptions {
        disable_rle: opt.disable_rle,
        disable_csv_handling: opt.disable_csv_handling,
        force_reload: opt.force_reload,
    };

    let mut loaded_names = Vec::new();

    for path in &opt.files {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match extension {
            "json" => {
                let name = segment_name_for(path);
                let csv_prefix = path.parent().unwrap_or_else(|| Path::new("."));
                let start = Instant::now();
                let handle = writer::load(&store, path, &name, csv_prefix, &options)?;
                info!(
                    "loaded '{}' in {:?} ({} args, {} exprs)",
                    name,
                    start.elapsed(),
                    handle.argument_count,
                    handle.expression_count
                );
                loaded_names.push(name);
            }
            "csv" => {
                let start = Instant::now();
                let columns = writer::csv_dry_run(path)?;
                info!(
                    "inferred {} column(s) of '{}' in {:?}",
                    columns,
                    path.display(),
                    start.elapsed()
                );
            }
            _ => {
                warn!("unsupported, not a json or csv file: {}", path.display());
            }
        }
    }

    server::serve(store, options, opt.http_port, loaded_names).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_files_and_flags() {
        let opt = Opt::try_parse_from([
            "fef-cli",
            "a.json",
            "b.csv",
            "--disable-rle",
            "--http-port",
            "9000",
        ])
        .unwrap();
        assert_eq!(opt.files, vec![PathBuf::from("a.json"), PathBuf::from("b.csv")]);
        assert!(opt.disable_rle);
        assert!(!opt.force_reload);
        assert_eq!(opt.http_port, 9000);
    }

    #[test]
    fn defaults_http_port_to_3000() {
        let opt = Opt::try_parse_from(["fef-cli"]).unwrap();
        assert_eq!(opt.http_port, 3000);
        assert!(opt.files.is_empty());
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(Opt::try_parse_from(["fef-cli", "--not-a-flag"]).is_err());
    }

    #[test]
    fn segment_name_for_strips_extension() {
        assert_eq!(segment_name_for(Path::new("/tmp/data/dataset.json")), "dataset");
    }
}
