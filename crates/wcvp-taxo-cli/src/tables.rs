//! CSV input and output tables.

use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use wcvp_taxo_core::table::{family_column, IdColumn, NameSource, SampleTable};
use wcvp_taxo_core::{
    DuplicateRow, OutputDetail, OutputMode, OutputRoute, Resolution, ResolutionResult,
    ResolveOptions, TaxonId, TaxonomicStatus,
};

const RAW_NAME_COLUMN: &str = "Ini_sci_name";

const TAXONOMIC_HEADER_PARTS: [&str; 6] =
    ["family", "genus", "species", "infraspecies", "sci_name", "scientific_name"];

// Starts with the raw name column, which is left out when the input supplies it.
const FULL_COLUMNS: [&str; 13] = [
    "Ini_sci_name",
    "sci_name_query",
    "taxon_id",
    "sci_name",
    "family",
    "genus",
    "species",
    "taxonomic_status",
    "Ini_taxon_id",
    "Ini_taxonomic_status",
    "resolution",
    "duplicate",
    "duplicate_type",
];

const MINIMAL_COLUMNS: [&str; 3] = ["taxon_id", "Ini_sci_name", "sci_name"];

const DUPLICATE_COLUMNS: [&str; 10] = [
    "sci_name_query",
    "taxon_id",
    "sci_name",
    "family",
    "genus",
    "species",
    "taxonomic_status",
    "Ini_taxon_id",
    "Ini_taxonomic_status",
    "duplicate_type",
];

/// Read a comma-separated sample sheet with a header row.
///
/// # Errors
/// Returns an error when the file is missing, is not valid CSV, or has rows of
/// uneven width.
pub fn read_sample_table(path: &Path) -> Result<SampleTable> {
    if !path.is_file() {
        return Err(anyhow!("sample file does not exist: {}", path.display()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .with_context(|| format!("failed to open sample file {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.with_context(|| format!("malformed sample row in {}", path.display()))?;
        rows.push(record.iter().map(ToString::to_string).collect());
    }

    Ok(SampleTable::new(headers, rows)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub main: PathBuf,
    pub duplicates: PathBuf,
    pub unresolved: PathBuf,
}

impl OutputPaths {
    /// Output files named from the sample file stem, placed next to it or in
    /// `out_dir`.
    ///
    /// # Errors
    /// Returns an error when the sample path has no file stem.
    pub fn for_samples(samples: &Path, out_dir: Option<&Path>, mode: OutputMode) -> Result<Self> {
        let stem = samples
            .file_stem()
            .ok_or_else(|| anyhow!("sample path has no file name: {}", samples.display()))?;
        let dir = match out_dir {
            Some(dir) => dir.to_path_buf(),
            None => samples.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let named = |suffix: &str| {
            let mut name = OsString::from(stem);
            name.push(suffix);
            dir.join(name)
        };

        let main_suffix = match mode {
            OutputMode::All => "_wcvp.csv",
            OutputMode::ChangesOnly => "_wcvp_changes.csv",
        };
        Ok(Self {
            main: named(main_suffix),
            duplicates: named("_duplicates.csv"),
            unresolved: named("_unresolved.csv"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenTable {
    pub path: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenTables {
    pub main: WrittenTable,
    pub duplicates: Option<WrittenTable>,
    pub unresolved: Option<WrittenTable>,
}

/// Output headers of the input columns. Taxonomic input columns are renamed
/// `Ini_<Column>` and the scientific name column becomes `Ini_sci_name`; any
/// header still clashing with a resolver column gains another `Ini_` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputLayout {
    input: Vec<String>,
    generated_id: Option<String>,
    id: String,
    raw_name_in_input: bool,
}

impl OutputLayout {
    fn new(table: &SampleTable, name_source: &NameSource, id_column: &IdColumn) -> Self {
        let raw_name_index = match name_source {
            NameSource::Column { index } => Some(*index),
            NameSource::SpeciesBinomial { .. } | NameSource::GenusSpecies { .. } => None,
        };
        let generated_id = match id_column {
            IdColumn::Existing { .. } => None,
            IdColumn::Generated { header } => Some(header.clone()),
        };

        let mut taken = FULL_COLUMNS
            .iter()
            .chain(DUPLICATE_COLUMNS.iter())
            .map(ToString::to_string)
            .chain(generated_id.clone())
            .collect::<BTreeSet<_>>();
        let input = table
            .headers
            .iter()
            .enumerate()
            .map(|(index, header)| {
                if raw_name_index == Some(index) {
                    return RAW_NAME_COLUMN.to_string();
                }
                let mut renamed = if is_taxonomic(header) {
                    format!("Ini_{}", capitalize(header.trim()))
                } else {
                    header.clone()
                };
                while !taken.insert(renamed.clone()) {
                    renamed = format!("Ini_{renamed}");
                }
                renamed
            })
            .collect::<Vec<_>>();

        let id = match id_column {
            IdColumn::Existing { index } => input[*index].clone(),
            IdColumn::Generated { header } => header.clone(),
        };
        Self { input, generated_id, id, raw_name_in_input: raw_name_index.is_some() }
    }

    fn input_header(&self) -> Vec<String> {
        self.input.iter().cloned().chain(self.generated_id.clone()).collect()
    }

    fn full_columns(&self) -> impl Iterator<Item = &'static str> {
        FULL_COLUMNS.into_iter().skip(usize::from(self.raw_name_in_input))
    }

    fn main_header(&self, detail: OutputDetail) -> Vec<String> {
        match detail {
            OutputDetail::Full => {
                let mut header = self.input_header();
                header.extend(self.full_columns().map(ToString::to_string));
                header
            }
            OutputDetail::Minimal => std::iter::once(self.id.clone())
                .chain(MINIMAL_COLUMNS.iter().map(ToString::to_string))
                .collect(),
        }
    }

    fn duplicate_header(&self) -> Vec<String> {
        let mut header = self.input_header();
        header.extend(DUPLICATE_COLUMNS.iter().map(ToString::to_string));
        header
    }
}

fn is_taxonomic(header: &str) -> bool {
    let header = header.trim().to_ascii_lowercase();
    TAXONOMIC_HEADER_PARTS.iter().any(|part| header.contains(part))
}

fn capitalize(header: &str) -> String {
    let mut chars = header.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

/// Write the main table, plus the duplicates and unresolved tables when they
/// have rows. `resolution.results` must be in `table` row order.
///
/// # Errors
/// Returns an error when an output file cannot be created or written.
pub fn write_outputs(
    table: &SampleTable,
    name_source: &NameSource,
    id_column: &IdColumn,
    resolution: &Resolution,
    options: &ResolveOptions,
    paths: &OutputPaths,
) -> Result<WrittenTables> {
    if let Some(parent) = paths.main.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }

    let layout = OutputLayout::new(table, name_source, id_column);
    let rows = table.rows.iter().enumerate().zip(&resolution.results).collect::<Vec<_>>();
    let generated = layout.generated_id.is_some();
    let input_values = |row_index: usize, row: &[String]| {
        let mut values = row.to_vec();
        if generated {
            values.push(id_column.value(row_index, row));
        }
        values
    };

    let family_index = family_column(table);
    let skip_raw_name = usize::from(layout.raw_name_in_input);
    let main_rows = rows
        .iter()
        .filter(|(_, result)| result.route == OutputRoute::Main)
        .filter(|((_, row), result)| match options.output_mode {
            OutputMode::All => true,
            OutputMode::ChangesOnly => is_change(result, family_index.map(|index| row[index].as_str())),
        })
        .map(|((row_index, row), result)| match options.output_detail {
            OutputDetail::Full => {
                let mut values = input_values(*row_index, row);
                values.extend(full_values(result).into_iter().skip(skip_raw_name));
                values
            }
            OutputDetail::Minimal => {
                let mut values = vec![id_column.value(*row_index, row)];
                values.extend(minimal_values(result));
                values
            }
        })
        .collect::<Vec<_>>();
    let main = write_table(&paths.main, &layout.main_header(options.output_detail), &main_rows)?;

    let row_of_query = rows
        .iter()
        .map(|((row_index, row), result)| (result.query_id.as_str(), (*row_index, row.as_slice())))
        .collect::<HashMap<_, _>>();
    let duplicate_rows = resolution
        .duplicates
        .iter()
        .filter_map(|duplicate| {
            row_of_query.get(duplicate.query_id.as_str()).map(|(row_index, row)| {
                let mut values = input_values(*row_index, row);
                values.extend(duplicate_values(duplicate));
                values
            })
        })
        .collect::<Vec<_>>();
    let duplicates = if duplicate_rows.is_empty() {
        None
    } else {
        Some(write_table(&paths.duplicates, &layout.duplicate_header(), &duplicate_rows)?)
    };

    let unresolved_rows = rows
        .iter()
        .filter(|(_, result)| result.route == OutputRoute::Unresolved)
        .map(|((row_index, row), _)| input_values(*row_index, row))
        .collect::<Vec<_>>();
    let unresolved = if unresolved_rows.is_empty() {
        None
    } else {
        Some(write_table(&paths.unresolved, &layout.input_header(), &unresolved_rows)?)
    };

    Ok(WrittenTables { main, duplicates, unresolved })
}

// Changed rows carry a taxon id and differ from the input in name or family.
fn is_change(result: &ResolutionResult, input_family: Option<&str>) -> bool {
    if result.resolved_taxon_id.is_none() {
        return false;
    }
    let name_changed = result.resolved_name.as_deref() != Some(result.raw_name.trim());
    let family_changed = input_family
        .is_some_and(|family| Some(family.trim()) != result.family.as_deref());
    name_changed || family_changed
}

fn full_values(result: &ResolutionResult) -> Vec<String> {
    vec![
        result.raw_name.clone(),
        result.matched_name.clone().unwrap_or_else(|| result.normalized_name.clone()),
        id_text(result.resolved_taxon_id.as_ref()),
        result.resolved_name.clone().unwrap_or_default(),
        result.family.clone().unwrap_or_default(),
        result.genus.clone().unwrap_or_default(),
        result.species.clone().unwrap_or_default(),
        status_text(result.taxonomic_status),
        id_text(result.initial_taxon_id.as_ref()),
        status_text(result.initial_status),
        result.resolution_kind.as_str().to_string(),
        result.duplicate_flag.to_string(),
        result.duplicate_category.map(|category| category.as_str().to_string()).unwrap_or_default(),
    ]
}

fn minimal_values(result: &ResolutionResult) -> Vec<String> {
    vec![
        id_text(result.resolved_taxon_id.as_ref()),
        result.raw_name.clone(),
        result.resolved_name.clone().unwrap_or_default(),
    ]
}

fn duplicate_values(duplicate: &DuplicateRow) -> Vec<String> {
    vec![
        duplicate.matched_name.clone(),
        duplicate.taxon_id.to_string(),
        duplicate.taxon_name.clone(),
        duplicate.family.clone(),
        duplicate.genus.clone(),
        duplicate.species.clone(),
        duplicate.taxonomic_status.as_str().to_string(),
        id_text(duplicate.initial_taxon_id.as_ref()),
        status_text(duplicate.initial_status),
        duplicate.duplicate_category.as_str().to_string(),
    ]
}

fn id_text(taxon_id: Option<&TaxonId>) -> String {
    taxon_id.map(ToString::to_string).unwrap_or_default()
}

fn status_text(status: Option<TaxonomicStatus>) -> String {
    status.map(|status| status.as_str().to_string()).unwrap_or_default()
}

fn write_table(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<WrittenTable> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    writer
        .write_record(header)
        .with_context(|| format!("failed to write header to {}", path.display()))?;
    for row in rows {
        writer
            .write_record(row)
            .with_context(|| format!("failed to write row to {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("failed to flush {}", path.display()))?;

    tracing::debug!(path = %path.display(), rows = rows.len(), "output table written");
    Ok(WrittenTable { path: path.display().to_string(), rows: rows.len() })
}
