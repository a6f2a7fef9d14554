//! Parser for pipe-delimited WCVP checklist exports.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use wcvp_taxo_core::{ChecklistEntry, TaxonId, TaxonomicStatus};

const TAXON_ID_HEADERS: [&str; 3] = ["taxon_id", "kew_id", "plant_name_id"];
const ACCEPTED_ID_HEADERS: [&str; 3] =
    ["accepted_taxon_id", "accepted_kew_id", "accepted_plant_name_id"];
const STATUS_HEADERS: [&str; 2] = ["taxonomic_status", "taxon_status"];

struct SourceColumns {
    taxon_id: usize,
    taxon_name: usize,
    family: usize,
    genus: usize,
    species: usize,
    taxonomic_status: usize,
    accepted_taxon_id: usize,
    infraspecies: Option<usize>,
    authors: Option<usize>,
    rank: Option<usize>,
}

impl SourceColumns {
    fn locate(headers: &StringRecord) -> Result<Self> {
        Ok(Self {
            taxon_id: require_column(headers, &TAXON_ID_HEADERS)?,
            taxon_name: require_column(headers, &["taxon_name"])?,
            family: require_column(headers, &["family"])?,
            genus: require_column(headers, &["genus"])?,
            species: require_column(headers, &["species"])?,
            taxonomic_status: require_column(headers, &STATUS_HEADERS)?,
            accepted_taxon_id: require_column(headers, &ACCEPTED_ID_HEADERS)?,
            infraspecies: find_column(headers, &["infraspecies"]),
            authors: find_column(headers, &["authors", "taxon_authors"]),
            rank: find_column(headers, &["rank", "taxon_rank"]),
        })
    }

    fn entry(&self, record: &StringRecord) -> ChecklistEntry {
        let text = |index: usize| record.get(index).unwrap_or_default().trim().to_string();
        let optional = |index: Option<usize>| index.map(text).filter(|value| !value.is_empty());

        ChecklistEntry {
            taxon_id: TaxonId(text(self.taxon_id)),
            taxon_name: text(self.taxon_name),
            family: text(self.family),
            genus: text(self.genus),
            species: text(self.species),
            infraspecies: optional(self.infraspecies),
            authors: optional(self.authors),
            rank: optional(self.rank),
            taxonomic_status: TaxonomicStatus::parse(&text(self.taxonomic_status)),
            accepted_taxon_id: optional(Some(self.accepted_taxon_id)).map(TaxonId),
        }
    }
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|header| header.trim().eq_ignore_ascii_case(name)))
}

fn require_column(headers: &StringRecord, names: &[&str]) -> Result<usize> {
    find_column(headers, names)
        .ok_or_else(|| anyhow!("checklist is missing required column `{}`", names[0]))
}

/// Read every row of a WCVP export in file order.
///
/// Columns beyond the ones a [`ChecklistEntry`] carries are ignored.
///
/// # Errors
/// Returns an error when the file cannot be read, a required column is
/// missing, a row has the wrong number of fields, a row lacks an id or name,
/// or a `taxon_id` repeats.
pub fn read_checklist_source(path: &Path) -> Result<Vec<ChecklistEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .with_context(|| format!("failed to open checklist {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read checklist header of {}", path.display()))?
        .clone();
    let columns = SourceColumns::locate(&headers)
        .with_context(|| format!("unsupported checklist layout in {}", path.display()))?;

    let mut entries = Vec::new();
    let mut seen_ids = HashSet::new();
    for record in reader.records() {
        let record = record
            .with_context(|| format!("malformed checklist row in {}", path.display()))?;
        let line = record.position().map_or(0, csv::Position::line);
        let entry = columns.entry(&record);

        entry.validate().with_context(|| format!("invalid checklist row at line {line}"))?;
        if !seen_ids.insert(entry.taxon_id.clone()) {
            return Err(anyhow!("duplicate taxon_id {} at line {line}", entry.taxon_id));
        }
        entries.push(entry);
    }

    tracing::debug!(path = %path.display(), entries = entries.len(), "checklist source parsed");
    Ok(entries)
}
