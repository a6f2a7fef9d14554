//! Sample sheet handling: which columns carry the scientific name, which
//! column identifies a row, and how rows become [`QueryRecord`]s.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{NameNormalizer, QueryRecord, TaxoError};

const SCI_NAME_HEADERS: [&str; 2] = ["sci_name", "scientific_name"];
const NAME_DERIVED_HEADERS: [&str; 5] =
    ["sci_name", "scientific_name", "genus", "species", "infraspecies"];
const GENERATED_ID_HEADER: &str = "ID";

/// A sample sheet held as plain strings, header row first.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SampleTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SampleTable {
    /// Build a table, checking every row against the header width.
    ///
    /// # Errors
    /// Returns [`TaxoError::Table`] when the header is empty or a row has a
    /// different number of fields than the header.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TaxoError> {
        if headers.is_empty() {
            return Err(TaxoError::Table("sample table has no columns".to_string()));
        }
        for (index, row) in rows.iter().enumerate() {
            if row.len() != headers.len() {
                return Err(TaxoError::Table(format!(
                    "row {} has {} fields, header has {}",
                    index + 1,
                    row.len(),
                    headers.len()
                )));
            }
        }
        Ok(Self { headers, rows })
    }

    /// Index of the first column whose header equals `name`, ignoring case
    /// and surrounding whitespace.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header.trim().eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Where the scientific name of a row comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NameSource {
    /// An explicit `sci_name` / `scientific_name` column.
    Column { index: usize },
    /// A species column that already holds the binomial.
    SpeciesBinomial { species: usize },
    /// Separate genus and epithet columns joined with a space.
    GenusSpecies { genus: usize, species: usize },
}

impl NameSource {
    #[must_use]
    pub fn raw_name(&self, row: &[String]) -> String {
        match *self {
            Self::Column { index } => row[index].clone(),
            Self::SpeciesBinomial { species } => row[species].clone(),
            Self::GenusSpecies { genus, species } => {
                format!("{} {}", row[genus].trim(), row[species].trim())
            }
        }
    }

    #[must_use]
    pub fn describe(&self, table: &SampleTable) -> String {
        match *self {
            Self::Column { index } => table.headers[index].clone(),
            Self::SpeciesBinomial { species } => table.headers[species].clone(),
            Self::GenusSpecies { genus, species } => {
                format!("{} + {}", table.headers[genus], table.headers[species])
            }
        }
    }
}

/// Column that identifies each row in every output table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdColumn {
    Existing { index: usize },
    Generated { header: String },
}

impl IdColumn {
    #[must_use]
    pub fn header<'a>(&'a self, table: &'a SampleTable) -> &'a str {
        match self {
            Self::Existing { index } => &table.headers[*index],
            Self::Generated { header } => header,
        }
    }

    #[must_use]
    pub fn value(&self, row_index: usize, row: &[String]) -> String {
        match self {
            Self::Existing { index } => row[*index].clone(),
            Self::Generated { .. } => row_index.to_string(),
        }
    }
}

/// Decide which column(s) hold the scientific name.
///
/// An explicit `sci_name`/`scientific_name` column wins. Otherwise the
/// rounded mean token count of the non-empty `species` values decides between
/// a binomial species column (two or more) and a bare epithet that is joined
/// with the `genus` column (one).
///
/// # Errors
/// Returns [`TaxoError::Table`] when no usable name column can be found.
pub fn detect_name_source(table: &SampleTable) -> Result<NameSource, TaxoError> {
    if let Some(index) = SCI_NAME_HEADERS.iter().find_map(|name| table.column(name)) {
        return Ok(NameSource::Column { index });
    }

    let Some(species) = table.column("species") else {
        return Err(TaxoError::Table(
            "could not identify a sci_name, scientific_name or species column".to_string(),
        ));
    };

    let token_counts = table
        .rows
        .iter()
        .map(|row| row[species].split_whitespace().count())
        .filter(|count| *count > 0)
        .collect::<Vec<_>>();
    if token_counts.is_empty() {
        return Err(TaxoError::Table(format!(
            "species column `{}` has no values",
            table.headers[species]
        )));
    }

    #[allow(clippy::cast_precision_loss)]
    let mean = token_counts.iter().sum::<usize>() as f64 / token_counts.len() as f64;
    tracing::debug!(column = %table.headers[species], mean_tokens = mean, "species column token estimate");

    if mean.round() >= 2.0 {
        return Ok(NameSource::SpeciesBinomial { species });
    }

    match table.column("genus") {
        Some(genus) => Ok(NameSource::GenusSpecies { genus, species }),
        None => Err(TaxoError::Table(format!(
            "species column `{}` holds epithets but no genus column was found",
            table.headers[species]
        ))),
    }
}

/// Pick the identifier column: the leftmost column whose values are all
/// present and distinct, skipping name-derived columns. Tables without one get
/// a generated sequential id under a header that no existing column uses.
#[must_use]
pub fn detect_id_column(table: &SampleTable) -> IdColumn {
    for (index, header) in table.headers.iter().enumerate() {
        let normalized = header.trim().to_ascii_lowercase();
        if NAME_DERIVED_HEADERS.contains(&normalized.as_str()) {
            continue;
        }

        let mut seen = BTreeSet::new();
        let unique = table.rows.iter().all(|row| {
            let value = row[index].trim();
            !value.is_empty() && seen.insert(value)
        });
        if unique && !table.rows.is_empty() {
            return IdColumn::Existing { index };
        }
    }

    IdColumn::Generated { header: unused_header(table, GENERATED_ID_HEADER) }
}

fn unused_header(table: &SampleTable, base: &str) -> String {
    if table.column(base).is_none() {
        return base.to_string();
    }
    (1..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| table.column(candidate).is_none())
        .unwrap_or_else(|| base.to_string())
}

/// Optional input family column, compared against the resolved family in
/// changes-only output.
#[must_use]
pub fn family_column(table: &SampleTable) -> Option<usize> {
    table.column("family")
}

/// Turn every row into a query record, in table order.
#[must_use]
pub fn build_queries(
    table: &SampleTable,
    source: &NameSource,
    id_column: &IdColumn,
    normalizer: &NameNormalizer,
) -> Vec<QueryRecord> {
    table
        .rows
        .iter()
        .enumerate()
        .map(|(row_index, row)| {
            QueryRecord::new(id_column.value(row_index, row), source.raw_name(row), normalizer)
        })
        .collect()
}
