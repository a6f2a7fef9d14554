use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use wcvp_taxo_core::table::{build_queries, detect_id_column, detect_name_source, IdColumn};
use wcvp_taxo_core::{
    resolve, Checklist, DuplicatePolicy, NameMatcher, NameNormalizer, OutputDetail, OutputMode,
    ResolveOptions, SimilarityStrategy,
};
use wcvp_taxo_store_sqlite::{
    default_cache_path, load_checklist, ChecklistCache, IntegrityReport,
};

mod config;
mod kewmatch;
mod tables;

use config::{FileConfig, KewMatchConfig};
use kewmatch::KewNameMatch;
use tables::{read_sample_table, write_outputs, OutputPaths};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "wcvp-taxo")]
#[command(about = "Resolve sample scientific names against a WCVP checklist")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// YAML file with default options; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resolve `Genus sp.` names to the genus.
    #[arg(short = 'g', long = "resolve-genus", default_value_t = false)]
    resolve_genus: bool,

    /// Fallback for names missing from the checklist.
    #[arg(short = 's', long, value_enum)]
    similarity: Option<SimilarityArg>,

    /// What to do with names that match several checklist entries.
    #[arg(short = 'd', long, value_enum)]
    duplicates: Option<DuplicatesArg>,

    /// Write only rows whose name or family changed.
    #[arg(long, default_value_t = false)]
    only_changes: bool,

    /// Write only the id, taxon id, input name and resolved name.
    #[arg(long, default_value_t = false)]
    simple_output: bool,

    /// Checklist cache file (default: checklist path with `.sqlite3`).
    #[arg(long, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,

    /// Parse the checklist on every run.
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Add an integrity report of the checklist cache to the summary.
    #[arg(long, default_value_t = false, conflicts_with = "no_cache")]
    check_cache: bool,

    /// Directory for output tables (default: next to the sample file).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Pipe-delimited WCVP export.
    checklist: PathBuf,

    /// CSV sample sheet.
    samples: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimilarityArg {
    None,
    SimilarityGenus,
    Similarity,
    Kewmatch,
}

impl From<SimilarityArg> for SimilarityStrategy {
    fn from(value: SimilarityArg) -> Self {
        match value {
            SimilarityArg::None => Self::None,
            SimilarityArg::SimilarityGenus => Self::GenusRestrictedFuzzy,
            SimilarityArg::Similarity => Self::UnrestrictedFuzzy,
            SimilarityArg::Kewmatch => Self::RemoteNamematch,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DuplicatesArg {
    Rank,
    Divert,
    DivertTaxonOk,
    DivertSpeciesOk,
    DivertGenusOk,
}

impl From<DuplicatesArg> for DuplicatePolicy {
    fn from(value: DuplicatesArg) -> Self {
        match value {
            DuplicatesArg::Rank => Self::RankPriority,
            DuplicatesArg::Divert => Self::Divert,
            DuplicatesArg::DivertTaxonOk => Self::DivertIfSameTaxon,
            DuplicatesArg::DivertSpeciesOk => Self::DivertIfSameSpecies,
            DuplicatesArg::DivertGenusOk => Self::DivertIfSameGenus,
        }
    }
}

/// Effective run settings after layering flags over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    options: ResolveOptions,
    strip_chars: String,
    cache_path: Option<PathBuf>,
    check_cache: bool,
    kewmatch: KewMatchConfig,
}

impl Settings {
    fn merge(cli: &Cli, file: &FileConfig) -> Self {
        let output_mode = if cli.only_changes {
            OutputMode::ChangesOnly
        } else {
            file.output_mode.unwrap_or_default()
        };
        let output_detail = if cli.simple_output {
            OutputDetail::Minimal
        } else {
            file.output_detail.unwrap_or_default()
        };
        let options = ResolveOptions {
            resolve_genus_only: cli.resolve_genus || file.resolve_genus_only.unwrap_or(false),
            similarity_strategy: cli
                .similarity
                .map(SimilarityStrategy::from)
                .or(file.similarity_strategy)
                .unwrap_or_default(),
            duplicate_policy: cli
                .duplicates
                .map(DuplicatePolicy::from)
                .or(file.duplicate_policy)
                .unwrap_or_default(),
            output_mode,
            output_detail,
        };

        let cache_path = if cli.no_cache {
            None
        } else {
            Some(
                cli.cache
                    .clone()
                    .or_else(|| file.cache_path.clone())
                    .unwrap_or_else(|| default_cache_path(&cli.checklist)),
            )
        };

        Self {
            options,
            strip_chars: file.strip_chars().to_string(),
            cache_path,
            check_cache: cli.check_cache,
            kewmatch: file.kewmatch.clone(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

// Logs go to stderr; stdout carries only the JSON summary.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file_config = match &cli.config {
        Some(path) => FileConfig::from_path(path)
            .with_context(|| format!("invalid config file {}", path.display()))?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(&cli, &file_config);
    tracing::debug!(?settings, "run settings");

    let summary = run(&cli.checklist, &cli.samples, cli.out_dir.as_deref(), &settings)?;
    emit_json(summary)
}

fn run(
    checklist_path: &Path,
    samples_path: &Path,
    out_dir: Option<&Path>,
    settings: &Settings,
) -> Result<Value> {
    let table = read_sample_table(samples_path)?;
    let name_source = detect_name_source(&table)
        .with_context(|| format!("cannot resolve names in {}", samples_path.display()))?;
    let id_column = detect_id_column(&table);
    tracing::info!(
        rows = table.len(),
        name_column = %name_source.describe(&table),
        id_column = id_column.header(&table),
        "sample table loaded"
    );

    let loaded = load_checklist(checklist_path, settings.cache_path.as_deref())?;
    let from_cache = loaded.from_cache;
    let fingerprint = loaded.fingerprint;
    let normalizer = NameNormalizer::new(&settings.strip_chars);
    let checklist = Checklist::build(loaded.entries, normalizer.clone())
        .with_context(|| format!("invalid checklist {}", checklist_path.display()))?;
    if checklist.is_empty() {
        tracing::warn!(path = %checklist_path.display(), "checklist has no entries");
    }
    let cache_check = if settings.check_cache {
        settings.cache_path.as_deref().map(check_cache).transpose()?
    } else {
        None
    };

    let queries = build_queries(&table, &name_source, &id_column, &normalizer);
    let remote = (settings.options.similarity_strategy == SimilarityStrategy::RemoteNamematch)
        .then(|| KewNameMatch::new(&settings.kewmatch));
    let matcher = remote.as_ref().map(|remote| remote as &dyn NameMatcher);
    let resolution = resolve(&queries, &checklist, &settings.options, matcher);

    let paths = OutputPaths::for_samples(samples_path, out_dir, settings.options.output_mode)?;
    let written =
        write_outputs(&table, &name_source, &id_column, &resolution, &settings.options, &paths)?;

    Ok(serde_json::json!({
        "checklist": {
            "path": checklist_path.display().to_string(),
            "entries": checklist.len(),
            "from_cache": from_cache,
            "cache_path": settings.cache_path.as_ref().map(|path| path.display().to_string()),
            "fingerprint": fingerprint.digest,
            "cache_check": cache_check,
        },
        "samples": {
            "path": samples_path.display().to_string(),
            "rows": table.len(),
            "name_column": name_source.describe(&table),
            "id_column": id_column.header(&table),
            "id_generated": matches!(id_column, IdColumn::Generated { .. }),
        },
        "options": serde_json::to_value(settings.options)?,
        "stats": serde_json::to_value(resolution.stats)?,
        "outputs": serde_json::to_value(&written)?,
    }))
}

fn check_cache(path: &Path) -> Result<IntegrityReport> {
    let report = ChecklistCache::open(path)?.integrity_check()?;
    if !report.quick_check_ok || report.dangling_synonym_targets > 0 {
        tracing::warn!(
            path = %path.display(),
            quick_check = %report.quick_check_message,
            dangling_synonym_targets = report.dangling_synonym_targets,
            "checklist cache failed integrity check"
        );
    }
    Ok(report)
}
