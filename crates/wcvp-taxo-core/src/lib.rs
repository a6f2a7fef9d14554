use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod similarity;
pub mod table;

pub use similarity::SIMILARITY_CUTOFF;

/// Characters removed from every name before comparison.
pub const DEFAULT_STRIP_CHARS: &str = "[]()×";

const MAX_SYNONYM_HOPS: usize = 16;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TaxoError {
    #[error("checklist error: {0}")]
    Checklist(String),
    #[error("sample table error: {0}")]
    Table(String),
}

/// Failure of a single remote name lookup. Never fatal for a batch.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LookupError {
    #[error("name-match request failed: {0}")]
    Transport(String),
    #[error("name-match response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TaxonId(pub String);

impl TaxonId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaxonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaxonId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomicStatus {
    Accepted,
    Unplaced,
    Synonym,
    HomotypicSynonym,
    ArtificialHybrid,
    Other,
}

impl TaxonomicStatus {
    /// Priority used to collapse duplicates; lower wins.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Accepted => 1,
            Self::Unplaced => 2,
            Self::Synonym => 3,
            Self::HomotypicSynonym => 4,
            Self::ArtificialHybrid => 5,
            Self::Other => 6,
        }
    }

    /// WCVP spelling of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Unplaced => "Unplaced",
            Self::Synonym => "Synonym",
            Self::HomotypicSynonym => "Homotypic_Synonym",
            Self::ArtificialHybrid => "Artificial Hybrid",
            Self::Other => "Other",
        }
    }

    /// Parse a WCVP status. Case, `_`, `-` and spaces are not significant;
    /// statuses outside the known set map to [`TaxonomicStatus::Other`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let key = value
            .trim()
            .chars()
            .filter(|ch| !matches!(ch, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "accepted" => Self::Accepted,
            "unplaced" => Self::Unplaced,
            "synonym" => Self::Synonym,
            "homotypicsynonym" => Self::HomotypicSynonym,
            "artificialhybrid" => Self::ArtificialHybrid,
            _ => Self::Other,
        }
    }

    /// Only accepted and unplaced entries are valid resolution targets.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Unplaced)
    }

    #[must_use]
    pub fn is_synonym(self) -> bool {
        matches!(self, Self::Synonym | Self::HomotypicSynonym)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChecklistEntry {
    pub taxon_id: TaxonId,
    pub taxon_name: String,
    pub family: String,
    pub genus: String,
    pub species: String,
    pub infraspecies: Option<String>,
    pub authors: Option<String>,
    pub rank: Option<String>,
    pub taxonomic_status: TaxonomicStatus,
    pub accepted_taxon_id: Option<TaxonId>,
}

impl ChecklistEntry {
    /// Validate one checklist row before it is indexed.
    ///
    /// # Errors
    /// Returns [`TaxoError::Checklist`] when the id or name is blank.
    pub fn validate(&self) -> Result<(), TaxoError> {
        if self.taxon_id.0.trim().is_empty() {
            return Err(TaxoError::Checklist(format!(
                "taxon_id MUST be provided (taxon_name={})",
                self.taxon_name
            )));
        }

        if self.taxon_name.trim().is_empty() {
            return Err(TaxoError::Checklist(format!(
                "taxon_name MUST be provided (taxon_id={})",
                self.taxon_id
            )));
        }

        Ok(())
    }

    /// Accepted-name link, only meaningful for synonym kinds.
    #[must_use]
    pub fn synonym_target(&self) -> Option<&TaxonId> {
        if self.taxonomic_status.is_synonym() {
            self.accepted_taxon_id.as_ref()
        } else {
            None
        }
    }
}

/// Cleans names so that query and checklist strings compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NameNormalizer {
    strip_chars: Vec<char>,
}

impl NameNormalizer {
    #[must_use]
    pub fn new(strip_chars: &str) -> Self {
        Self { strip_chars: strip_chars.chars().filter(|ch| !ch.is_whitespace()).collect() }
    }

    /// Drop stripped characters and collapse runs of whitespace.
    #[must_use]
    pub fn clean(&self, raw: &str) -> String {
        raw.chars()
            .filter(|ch| !self.strip_chars.contains(ch))
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_STRIP_CHARS)
    }
}

/// Read-only reference checklist with name, id and genus indices.
#[derive(Debug, Clone)]
pub struct Checklist {
    entries: Vec<ChecklistEntry>,
    normalizer: NameNormalizer,
    by_name: HashMap<String, Vec<usize>>,
    by_id: HashMap<TaxonId, usize>,
    by_genus: HashMap<String, Vec<usize>>,
    name_order: Vec<String>,
}

impl Checklist {
    /// Validate and index checklist entries. Names are cleaned with
    /// `normalizer`, which the resolver reuses for queries.
    ///
    /// # Errors
    /// Returns [`TaxoError::Checklist`] when an entry is invalid or a
    /// `taxon_id` appears twice.
    pub fn build(
        entries: Vec<ChecklistEntry>,
        normalizer: NameNormalizer,
    ) -> Result<Self, TaxoError> {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_id: HashMap<TaxonId, usize> = HashMap::with_capacity(entries.len());
        let mut by_genus: HashMap<String, Vec<usize>> = HashMap::new();
        let mut name_order = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            entry.validate()?;

            if by_id.insert(entry.taxon_id.clone(), index).is_some() {
                return Err(TaxoError::Checklist(format!(
                    "taxon_id {} appears more than once",
                    entry.taxon_id
                )));
            }

            let name = normalizer.clean(&entry.taxon_name);
            let slots = by_name.entry(name.clone()).or_default();
            if slots.is_empty() {
                name_order.push(name);
            }
            slots.push(index);

            let genus = normalizer.clean(&entry.genus);
            if !genus.is_empty() {
                by_genus.entry(genus).or_default().push(index);
            }
        }

        tracing::debug!(
            entries = entries.len(),
            names = name_order.len(),
            genera = by_genus.len(),
            "checklist indexed"
        );

        Ok(Self { entries, normalizer, by_name, by_id, by_genus, name_order })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn get(&self, taxon_id: &TaxonId) -> Option<&ChecklistEntry> {
        self.by_id.get(taxon_id).map(|index| &self.entries[*index])
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    #[must_use]
    pub fn contains_genus(&self, genus: &str) -> bool {
        self.by_genus.contains_key(genus)
    }

    /// Row indices of entries whose cleaned name equals `name`, in checklist order.
    #[must_use]
    pub fn name_hits(&self, name: &str) -> &[usize] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Row indices of entries in `genus`, in checklist order.
    #[must_use]
    pub fn genus_hits(&self, genus: &str) -> &[usize] {
        self.by_genus.get(genus).map(Vec::as_slice).unwrap_or_default()
    }

    /// Distinct cleaned names, in order of first appearance.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name_order.iter().map(String::as_str)
    }

    /// Distinct cleaned names within one genus, in order of first appearance.
    #[must_use]
    pub fn genus_names(&self, genus: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.genus_hits(genus)
            .iter()
            .map(|index| self.normalizer.clean(&self.entries[*index].taxon_name))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    fn entry(&self, index: usize) -> &ChecklistEntry {
        &self.entries[index]
    }

    fn index_of(&self, taxon_id: &TaxonId) -> Option<usize> {
        self.by_id.get(taxon_id).copied()
    }
}

/// One input row to resolve.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QueryRecord {
    pub query_id: String,
    pub raw_name: String,
    pub normalized_name: String,
}

impl QueryRecord {
    #[must_use]
    pub fn new(query_id: String, raw_name: String, normalizer: &NameNormalizer) -> Self {
        let normalized_name = normalizer.clean(&raw_name);
        Self { query_id, raw_name, normalized_name }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityStrategy {
    #[default]
    None,
    GenusRestrictedFuzzy,
    UnrestrictedFuzzy,
    RemoteNamematch,
}

impl SimilarityStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GenusRestrictedFuzzy => "genus_restricted_fuzzy",
            Self::UnrestrictedFuzzy => "unrestricted_fuzzy",
            Self::RemoteNamematch => "remote_namematch",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    RankPriority,
    Divert,
    DivertIfSameTaxon,
    DivertIfSameSpecies,
    DivertIfSameGenus,
}

impl DuplicatePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RankPriority => "rank_priority",
            Self::Divert => "divert",
            Self::DivertIfSameTaxon => "divert_if_same_taxon",
            Self::DivertIfSameSpecies => "divert_if_same_species",
            Self::DivertIfSameGenus => "divert_if_same_genus",
        }
    }

    /// Whether a duplicate group of `category` is collapsed to one row
    /// instead of being diverted.
    #[must_use]
    pub fn keeps(self, category: DuplicateCategory) -> bool {
        match self {
            Self::RankPriority => true,
            Self::Divert => false,
            Self::DivertIfSameTaxon => category == DuplicateCategory::SameTaxon,
            Self::DivertIfSameSpecies => matches!(
                category,
                DuplicateCategory::SameTaxon | DuplicateCategory::SameSpecies
            ),
            Self::DivertIfSameGenus => category != DuplicateCategory::DifferentTaxa,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    All,
    ChangesOnly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputDetail {
    #[default]
    Full,
    Minimal,
}

/// Explicit per-run resolver configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolveOptions {
    pub resolve_genus_only: bool,
    pub similarity_strategy: SimilarityStrategy,
    pub duplicate_policy: DuplicatePolicy,
    pub output_mode: OutputMode,
    pub output_detail: OutputDetail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    DirectAccepted,
    ResolvedSynonym,
    GenusOnly,
    SimilarityMatch,
    Unresolved,
}

impl ResolutionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectAccepted => "direct_accepted",
            Self::ResolvedSynonym => "resolved_synonym",
            Self::GenusOnly => "genus_only",
            Self::SimilarityMatch => "similarity_match",
            Self::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCategory {
    SameTaxon,
    SameSpecies,
    SameGenus,
    DifferentTaxa,
}

impl DuplicateCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameTaxon => "same_taxon",
            Self::SameSpecies => "same_species",
            Self::SameGenus => "same_genus",
            Self::DifferentTaxa => "different_taxa",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    EmptyName,
    GenusOnlyDisabled,
    NotInChecklist,
    NoSimilarName,
    SimilarNameNotInChecklist,
    RemoteLookupFailed,
    NoAcceptedTarget,
}

impl UnresolvedReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyName => "empty_name",
            Self::GenusOnlyDisabled => "genus_only_disabled",
            Self::NotInChecklist => "not_in_checklist",
            Self::NoSimilarName => "no_similar_name",
            Self::SimilarNameNotInChecklist => "similar_name_not_in_checklist",
            Self::RemoteLookupFailed => "remote_lookup_failed",
            Self::NoAcceptedTarget => "no_accepted_target",
        }
    }
}

/// Output table a query lands in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputRoute {
    Main,
    Duplicates,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolutionResult {
    pub query_id: String,
    pub raw_name: String,
    pub normalized_name: String,
    pub matched_name: Option<String>,
    pub resolved_taxon_id: Option<TaxonId>,
    pub resolved_name: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    pub taxonomic_status: Option<TaxonomicStatus>,
    pub initial_taxon_id: Option<TaxonId>,
    pub initial_status: Option<TaxonomicStatus>,
    pub resolution_kind: ResolutionKind,
    pub duplicate_flag: bool,
    pub duplicate_category: Option<DuplicateCategory>,
    pub unresolved_reason: Option<UnresolvedReason>,
    pub route: OutputRoute,
}

impl ResolutionResult {
    fn pending(query: &QueryRecord) -> Self {
        Self {
            query_id: query.query_id.clone(),
            raw_name: query.raw_name.clone(),
            normalized_name: query.normalized_name.clone(),
            matched_name: None,
            resolved_taxon_id: None,
            resolved_name: None,
            family: None,
            genus: None,
            species: None,
            taxonomic_status: None,
            initial_taxon_id: None,
            initial_status: None,
            resolution_kind: ResolutionKind::Unresolved,
            duplicate_flag: false,
            duplicate_category: None,
            unresolved_reason: None,
            route: OutputRoute::Unresolved,
        }
    }

    fn unresolved(mut self, reason: UnresolvedReason) -> Self {
        self.resolution_kind = ResolutionKind::Unresolved;
        self.unresolved_reason = Some(reason);
        self.route = OutputRoute::Unresolved;
        self
    }

    fn rewrite_as_genus(&mut self) {
        if let Some(genus) = self.genus.as_deref() {
            self.resolved_name = Some(format!("{genus} sp."));
        }
        self.species = None;
    }
}

/// One candidate of a diverted duplicate query.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateRow {
    pub query_id: String,
    pub matched_name: String,
    pub taxon_id: TaxonId,
    pub taxon_name: String,
    pub family: String,
    pub genus: String,
    pub species: String,
    pub taxonomic_status: TaxonomicStatus,
    pub initial_taxon_id: Option<TaxonId>,
    pub initial_status: Option<TaxonomicStatus>,
    pub duplicate_category: DuplicateCategory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolutionStats {
    pub queries: usize,
    pub direct_accepted: usize,
    pub resolved_synonym: usize,
    pub genus_only: usize,
    pub similarity_match: usize,
    pub unresolved: usize,
    pub duplicate_queries: usize,
    pub diverted_queries: usize,
}

impl ResolutionStats {
    fn tally(results: &[ResolutionResult]) -> Self {
        let mut stats = Self { queries: results.len(), ..Self::default() };
        for result in results {
            if result.duplicate_flag {
                stats.duplicate_queries += 1;
            }
            if result.route == OutputRoute::Duplicates {
                stats.diverted_queries += 1;
                continue;
            }
            match result.resolution_kind {
                ResolutionKind::DirectAccepted => stats.direct_accepted += 1,
                ResolutionKind::ResolvedSynonym => stats.resolved_synonym += 1,
                ResolutionKind::GenusOnly => stats.genus_only += 1,
                ResolutionKind::SimilarityMatch => stats.similarity_match += 1,
                ResolutionKind::Unresolved => stats.unresolved += 1,
            }
        }
        stats
    }
}

/// Output of one resolver run: one result per query in input order, plus the
/// candidate rows of diverted duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub results: Vec<ResolutionResult>,
    pub duplicates: Vec<DuplicateRow>,
    pub stats: ResolutionStats,
}

impl Resolution {
    pub fn routed(&self, route: OutputRoute) -> impl Iterator<Item = &ResolutionResult> {
        self.results.iter().filter(move |result| result.route == route)
    }

    pub fn duplicates_for<'a>(&'a self, query_id: &'a str) -> impl Iterator<Item = &'a DuplicateRow> {
        self.duplicates.iter().filter(move |row| row.query_id == query_id)
    }
}

/// Remote name-matching capability used by
/// [`SimilarityStrategy::RemoteNamematch`].
pub trait NameMatcher {
    /// Best accepted spelling for `name`, if the service knows one.
    ///
    /// # Errors
    /// Returns [`LookupError`] when the service cannot be reached or its
    /// reply cannot be read; the resolver treats that name as unresolved.
    fn lookup(&self, name: &str) -> Result<Option<String>, LookupError>;
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    entry: &'a ChecklistEntry,
    initial: Option<&'a ChecklistEntry>,
    order: usize,
}

impl Candidate<'_> {
    fn priority(&self) -> u8 {
        self.initial.unwrap_or(self.entry).taxonomic_status.rank()
    }

    fn by_priority(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.priority().cmp(&rhs.priority()).then_with(|| lhs.order.cmp(&rhs.order))
    }
}

/// `Genus sp` / `Genus sp.` names.
#[must_use]
pub fn is_genus_only(name: &str) -> bool {
    matches!(name.split_whitespace().nth(1), Some("sp" | "sp."))
}

/// Resolve every query against `checklist`.
///
/// Each query yields exactly one [`ResolutionResult`]; per-record failures,
/// including failed remote lookups, become [`ResolutionKind::Unresolved`]
/// rows instead of aborting the batch.
#[must_use]
pub fn resolve(
    queries: &[QueryRecord],
    checklist: &Checklist,
    options: &ResolveOptions,
    matcher: Option<&dyn NameMatcher>,
) -> Resolution {
    if options.similarity_strategy == SimilarityStrategy::RemoteNamematch && matcher.is_none() {
        tracing::warn!("remote name matching requested without a matcher; misses stay unresolved");
    }

    let mut results = Vec::with_capacity(queries.len());
    let mut duplicates = Vec::new();
    for query in queries {
        let (result, diverted) = resolve_one(query, checklist, options, matcher);
        tracing::debug!(
            query_id = %result.query_id,
            name = %result.normalized_name,
            kind = result.resolution_kind.as_str(),
            route = ?result.route,
            "query resolved"
        );
        duplicates.extend(diverted);
        results.push(result);
    }

    let stats = ResolutionStats::tally(&results);
    tracing::info!(
        queries = stats.queries,
        direct_accepted = stats.direct_accepted,
        resolved_synonym = stats.resolved_synonym,
        genus_only = stats.genus_only,
        similarity_match = stats.similarity_match,
        unresolved = stats.unresolved,
        duplicate_queries = stats.duplicate_queries,
        diverted_queries = stats.diverted_queries,
        "resolution finished"
    );

    Resolution { results, duplicates, stats }
}

fn resolve_one(
    query: &QueryRecord,
    checklist: &Checklist,
    options: &ResolveOptions,
    matcher: Option<&dyn NameMatcher>,
) -> (ResolutionResult, Vec<DuplicateRow>) {
    let result = ResolutionResult::pending(query);
    let name = query.normalized_name.as_str();
    if name.is_empty() {
        return (result.unresolved(UnresolvedReason::EmptyName), Vec::new());
    }

    let genus_only = is_genus_only(name);
    let key = if genus_only {
        if !options.resolve_genus_only {
            return (result.unresolved(UnresolvedReason::GenusOnlyDisabled), Vec::new());
        }
        name.split_whitespace().next().unwrap_or(name)
    } else {
        name
    };

    let mut via_similarity = false;
    let matched = if checklist.contains_name(key) {
        key.to_string()
    } else if genus_only && checklist.contains_genus(key) {
        return (genus_without_entry(result, checklist, key), Vec::new());
    } else {
        match find_similar(key, checklist, options.similarity_strategy, matcher) {
            Ok(similar) => {
                via_similarity = true;
                similar
            }
            Err(reason) => return (result.unresolved(reason), Vec::new()),
        }
    };

    let mut result = result;
    result.matched_name = Some(matched.clone());

    let mut candidates = accepted_candidates(checklist, &matched);
    if candidates.is_empty() {
        return (result.unresolved(UnresolvedReason::NoAcceptedTarget), Vec::new());
    }
    candidates.sort_by(Candidate::by_priority);

    let category = (candidates.len() > 1).then(|| categorize(&candidates));
    if let Some(category) = category {
        result.duplicate_flag = true;
        result.duplicate_category = Some(category);
        if !options.duplicate_policy.keeps(category) {
            let rows = candidates
                .iter()
                .map(|candidate| duplicate_row(query, &matched, candidate, category))
                .collect();
            result.resolution_kind = ResolutionKind::Unresolved;
            result.route = OutputRoute::Duplicates;
            return (result, rows);
        }
    }

    let chosen = candidates[0];
    apply_candidate(&mut result, &chosen);
    result.resolution_kind = if genus_only {
        ResolutionKind::GenusOnly
    } else if via_similarity {
        ResolutionKind::SimilarityMatch
    } else if chosen.initial.is_some() {
        ResolutionKind::ResolvedSynonym
    } else {
        ResolutionKind::DirectAccepted
    };

    let genus_collapse = category == Some(DuplicateCategory::SameGenus)
        && options.duplicate_policy == DuplicatePolicy::DivertIfSameGenus;
    if genus_only || genus_collapse {
        result.rewrite_as_genus();
    }

    (result, Vec::new())
}

// Genus known to the checklist, but without a genus-rank entry of its own.
fn genus_without_entry(
    mut result: ResolutionResult,
    checklist: &Checklist,
    genus: &str,
) -> ResolutionResult {
    let hits = checklist.genus_hits(genus);
    let source = hits
        .iter()
        .map(|index| checklist.entry(*index))
        .find(|entry| entry.taxonomic_status.is_terminal())
        .or_else(|| hits.first().map(|index| checklist.entry(*index)));

    result.matched_name = Some(genus.to_string());
    result.family = source.map(|entry| entry.family.clone());
    result.genus = Some(source.map_or_else(|| genus.to_string(), |entry| entry.genus.clone()));
    result.resolution_kind = ResolutionKind::GenusOnly;
    result.route = OutputRoute::Main;
    result.rewrite_as_genus();
    result
}

fn find_similar(
    key: &str,
    checklist: &Checklist,
    strategy: SimilarityStrategy,
    matcher: Option<&dyn NameMatcher>,
) -> Result<String, UnresolvedReason> {
    match strategy {
        SimilarityStrategy::None => Err(UnresolvedReason::NotInChecklist),
        SimilarityStrategy::GenusRestrictedFuzzy => {
            let genus = key.split_whitespace().next().unwrap_or(key);
            if !checklist.contains_genus(genus) {
                return Err(UnresolvedReason::NoSimilarName);
            }
            let names = checklist.genus_names(genus);
            similarity::best_match(key, names.iter().map(String::as_str), SIMILARITY_CUTOFF)
                .map(|(name, _)| name.to_string())
                .ok_or(UnresolvedReason::NoSimilarName)
        }
        SimilarityStrategy::UnrestrictedFuzzy => {
            similarity::best_match(key, checklist.names(), SIMILARITY_CUTOFF)
                .map(|(name, _)| name.to_string())
                .ok_or(UnresolvedReason::NoSimilarName)
        }
        SimilarityStrategy::RemoteNamematch => {
            let Some(matcher) = matcher else {
                return Err(UnresolvedReason::RemoteLookupFailed);
            };
            match matcher.lookup(key) {
                Ok(Some(remote)) => {
                    let cleaned = checklist.normalizer().clean(&remote);
                    if checklist.contains_name(&cleaned) {
                        Ok(cleaned)
                    } else {
                        tracing::debug!(query = key, remote = %remote, "remote match is not in the checklist");
                        Err(UnresolvedReason::SimilarNameNotInChecklist)
                    }
                }
                Ok(None) => Err(UnresolvedReason::NoSimilarName),
                Err(err) => {
                    tracing::warn!(query = key, error = %err, "remote name lookup failed");
                    Err(UnresolvedReason::RemoteLookupFailed)
                }
            }
        }
    }
}

fn accepted_candidates<'a>(checklist: &'a Checklist, name: &str) -> Vec<Candidate<'a>> {
    checklist
        .name_hits(name)
        .iter()
        .filter_map(|index| {
            let hit = checklist.entry(*index);
            if hit.taxonomic_status.is_terminal() {
                return Some(Candidate { entry: hit, initial: None, order: *index });
            }
            if hit.taxonomic_status.is_synonym() {
                return follow_synonym(checklist, *index)
                    .map(|target| Candidate { entry: target, initial: Some(hit), order: *index });
            }
            None
        })
        .collect()
}

fn follow_synonym(checklist: &Checklist, start: usize) -> Option<&ChecklistEntry> {
    let mut visited = BTreeSet::from([start]);
    let mut current = checklist.entry(start);
    for _ in 0..MAX_SYNONYM_HOPS {
        let Some(target_id) = current.synonym_target() else {
            break;
        };
        let Some(target_index) = checklist.index_of(target_id) else {
            tracing::debug!(taxon_id = %current.taxon_id, target = %target_id, "synonym target missing");
            return None;
        };
        if !visited.insert(target_index) {
            tracing::debug!(taxon_id = %current.taxon_id, "synonym chain loops");
            return None;
        }
        current = checklist.entry(target_index);
        if current.taxonomic_status.is_terminal() {
            return Some(current);
        }
    }
    None
}

fn categorize(candidates: &[Candidate<'_>]) -> DuplicateCategory {
    let first = candidates[0].entry;
    if candidates.iter().all(|candidate| candidate.entry.taxon_id == first.taxon_id) {
        return DuplicateCategory::SameTaxon;
    }
    let same_genus = candidates.iter().all(|candidate| candidate.entry.genus == first.genus);
    if same_genus
        && !first.species.is_empty()
        && candidates.iter().all(|candidate| candidate.entry.species == first.species)
    {
        return DuplicateCategory::SameSpecies;
    }
    if same_genus {
        return DuplicateCategory::SameGenus;
    }
    DuplicateCategory::DifferentTaxa
}

fn apply_candidate(result: &mut ResolutionResult, candidate: &Candidate<'_>) {
    let entry = candidate.entry;
    result.resolved_taxon_id = Some(entry.taxon_id.clone());
    result.resolved_name = Some(entry.taxon_name.clone());
    result.family = Some(entry.family.clone());
    result.genus = Some(entry.genus.clone());
    result.species = (!entry.species.is_empty()).then(|| entry.species.clone());
    result.taxonomic_status = Some(entry.taxonomic_status);
    result.initial_taxon_id = candidate.initial.map(|initial| initial.taxon_id.clone());
    result.initial_status = candidate.initial.map(|initial| initial.taxonomic_status);
    result.unresolved_reason = None;
    result.route = OutputRoute::Main;
}

fn duplicate_row(
    query: &QueryRecord,
    matched: &str,
    candidate: &Candidate<'_>,
    category: DuplicateCategory,
) -> DuplicateRow {
    DuplicateRow {
        query_id: query.query_id.clone(),
        matched_name: matched.to_string(),
        taxon_id: candidate.entry.taxon_id.clone(),
        taxon_name: candidate.entry.taxon_name.clone(),
        family: candidate.entry.family.clone(),
        genus: candidate.entry.genus.clone(),
        species: candidate.entry.species.clone(),
        taxonomic_status: candidate.entry.taxonomic_status,
        initial_taxon_id: candidate.initial.map(|initial| initial.taxon_id.clone()),
        initial_status: candidate.initial.map(|initial| initial.taxonomic_status),
        duplicate_category: category,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use proptest::prelude::*;

    use super::*;

    fn mk_entry(
        taxon_id: &str,
        taxon_name: &str,
        family: &str,
        status: TaxonomicStatus,
        accepted: Option<&str>,
    ) -> ChecklistEntry {
        let mut tokens = taxon_name.split_whitespace();
        ChecklistEntry {
            taxon_id: TaxonId::from(taxon_id),
            taxon_name: taxon_name.to_string(),
            family: family.to_string(),
            genus: tokens.next().unwrap_or_default().to_string(),
            species: tokens.next().unwrap_or_default().to_string(),
            infraspecies: None,
            authors: None,
            rank: None,
            taxonomic_status: status,
            accepted_taxon_id: accepted.map(TaxonId::from),
        }
    }

    fn fixture_entries() -> Vec<ChecklistEntry> {
        use TaxonomicStatus::{Accepted, ArtificialHybrid, HomotypicSynonym, Synonym};
        vec![
            mk_entry("1", "Rosa foo", "Rosaceae", Accepted, None),
            mk_entry("2", "Rosa bar", "Rosaceae", Synonym, Some("1")),
            mk_entry("3", "Ficus ambigua", "Moraceae", Accepted, None),
            mk_entry("4", "Ficus ambigua", "Moraceae", Accepted, None),
            mk_entry("5", "Quercus", "Fagaceae", Accepted, None),
            mk_entry("6", "Quercus robur", "Fagaceae", Accepted, None),
            mk_entry("7", "Salix alba", "Salicaceae", HomotypicSynonym, Some("8")),
            mk_entry("8", "Salix albida", "Salicaceae", Synonym, Some("9")),
            mk_entry("9", "Salix vera", "Salicaceae", Accepted, None),
            mk_entry("10", "Acer dubium", "Sapindaceae", Synonym, Some("12")),
            mk_entry("11", "Acer dubium", "Sapindaceae", Synonym, Some("13")),
            mk_entry("12", "Acer campestre", "Sapindaceae", Accepted, None),
            mk_entry("13", "Acer platanoides", "Sapindaceae", Accepted, None),
            mk_entry("14", "Mixta ambigua", "Rosaceae", Synonym, Some("1")),
            mk_entry("15", "Mixta ambigua", "Fagaceae", Synonym, Some("6")),
            mk_entry("20", "Betula pendula", "Betulaceae", Accepted, None),
            mk_entry("21", "Betula alba", "Betulaceae", HomotypicSynonym, Some("20")),
            mk_entry("22", "Betula alba", "Betulaceae", Synonym, Some("20")),
            mk_entry("30", "Mentha piperita", "Lamiaceae", ArtificialHybrid, None),
            mk_entry("40", "Loopa one", "Loopaceae", Synonym, Some("41")),
            mk_entry("41", "Loopa two", "Loopaceae", Synonym, Some("40")),
            mk_entry("50", "Tilia cordata", "Malvaceae", Accepted, None),
            mk_entry("51", "Rosa canina", "Rosaceae", TaxonomicStatus::Unplaced, None),
        ]
    }

    fn fixture_checklist() -> Checklist {
        match Checklist::build(fixture_entries(), NameNormalizer::default()) {
            Ok(checklist) => checklist,
            Err(err) => panic!("fixture checklist should build: {err}"),
        }
    }

    fn queries(names: &[&str]) -> Vec<QueryRecord> {
        let normalizer = NameNormalizer::default();
        names
            .iter()
            .enumerate()
            .map(|(index, name)| QueryRecord::new(format!("q{index}"), (*name).to_string(), &normalizer))
            .collect()
    }

    fn resolve_single(name: &str, options: &ResolveOptions) -> ResolutionResult {
        let checklist = fixture_checklist();
        let resolution = resolve(&queries(&[name]), &checklist, options, None);
        match resolution.results.into_iter().next() {
            Some(result) => result,
            None => panic!("resolver returned no result for {name}"),
        }
    }

    fn with_policy(duplicate_policy: DuplicatePolicy) -> ResolveOptions {
        ResolveOptions { duplicate_policy, ..ResolveOptions::default() }
    }

    struct StubMatcher {
        answers: Vec<(&'static str, Result<Option<&'static str>, LookupError>)>,
        calls: RefCell<Vec<String>>,
    }

    impl NameMatcher for StubMatcher {
        fn lookup(&self, name: &str) -> Result<Option<String>, LookupError> {
            self.calls.borrow_mut().push(name.to_string());
            self.answers
                .iter()
                .find(|(query, _)| *query == name)
                .map_or(Ok(None), |(_, answer)| answer.clone().map(|hit| hit.map(ToString::to_string)))
        }
    }

    #[test]
    fn exact_accepted_name_resolves_directly() {
        let result = resolve_single("Rosa foo", &ResolveOptions::default());
        assert_eq!(result.resolution_kind, ResolutionKind::DirectAccepted);
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("1")));
        assert_eq!(result.route, OutputRoute::Main);
        assert!(!result.duplicate_flag);
    }

    #[test]
    fn unplaced_entries_are_valid_targets() {
        let result = resolve_single("Rosa canina", &ResolveOptions::default());
        assert_eq!(result.resolution_kind, ResolutionKind::DirectAccepted);
        assert_eq!(result.taxonomic_status, Some(TaxonomicStatus::Unplaced));
    }

    #[test]
    fn synonym_resolves_to_accepted_target() {
        let result = resolve_single("Rosa bar", &ResolveOptions::default());
        assert_eq!(result.resolution_kind, ResolutionKind::ResolvedSynonym);
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("1")));
        assert_eq!(result.resolved_name.as_deref(), Some("Rosa foo"));
        assert_eq!(result.initial_taxon_id, Some(TaxonId::from("2")));
        assert_eq!(result.initial_status, Some(TaxonomicStatus::Synonym));
    }

    #[test]
    fn synonym_chains_are_followed_to_a_terminal_entry() {
        let result = resolve_single("Salix alba", &ResolveOptions::default());
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("9")));
        assert_eq!(result.initial_status, Some(TaxonomicStatus::HomotypicSynonym));
    }

    #[test]
    fn synonym_cycles_and_hybrids_stay_unresolved() {
        let looped = resolve_single("Loopa one", &ResolveOptions::default());
        assert_eq!(looped.resolution_kind, ResolutionKind::Unresolved);
        assert_eq!(looped.unresolved_reason, Some(UnresolvedReason::NoAcceptedTarget));

        let hybrid = resolve_single("Mentha piperita", &ResolveOptions::default());
        assert_eq!(hybrid.unresolved_reason, Some(UnresolvedReason::NoAcceptedTarget));
        assert_eq!(hybrid.matched_name.as_deref(), Some("Mentha piperita"));
        assert!(hybrid.resolved_taxon_id.is_none());
    }

    #[test]
    fn rank_priority_keeps_first_seen_of_equal_status() {
        let result = resolve_single("Ficus ambigua", &ResolveOptions::default());
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("3")));
        assert!(result.duplicate_flag);
        assert_eq!(result.duplicate_category, Some(DuplicateCategory::SameSpecies));
        assert_eq!(result.route, OutputRoute::Main);
    }

    #[test]
    fn rank_priority_prefers_lower_initial_status() {
        let result = resolve_single("Betula alba", &ResolveOptions::default());
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("20")));
        assert_eq!(result.initial_taxon_id, Some(TaxonId::from("22")));
        assert_eq!(result.duplicate_category, Some(DuplicateCategory::SameTaxon));
    }

    #[test]
    fn genus_only_names_follow_the_flag() {
        let disabled = resolve_single("Quercus sp.", &ResolveOptions::default());
        assert_eq!(disabled.resolution_kind, ResolutionKind::Unresolved);
        assert_eq!(disabled.unresolved_reason, Some(UnresolvedReason::GenusOnlyDisabled));

        let options = ResolveOptions { resolve_genus_only: true, ..ResolveOptions::default() };
        let enabled = resolve_single("Quercus sp.", &options);
        assert_eq!(enabled.resolution_kind, ResolutionKind::GenusOnly);
        assert_eq!(enabled.resolved_taxon_id, Some(TaxonId::from("5")));
        assert_eq!(enabled.resolved_name.as_deref(), Some("Quercus sp."));
        assert!(enabled.species.is_none());
    }

    #[test]
    fn genus_without_genus_entry_still_resolves_genus_only() {
        let options = ResolveOptions { resolve_genus_only: true, ..ResolveOptions::default() };
        let result = resolve_single("Tilia sp", &options);
        assert_eq!(result.resolution_kind, ResolutionKind::GenusOnly);
        assert!(result.resolved_taxon_id.is_none());
        assert_eq!(result.resolved_name.as_deref(), Some("Tilia sp."));
        assert_eq!(result.family.as_deref(), Some("Malvaceae"));
        assert_eq!(result.route, OutputRoute::Main);
    }

    #[test]
    fn genus_restricted_fuzzy_fixes_typos_within_known_genera() {
        let options = ResolveOptions {
            similarity_strategy: SimilarityStrategy::GenusRestrictedFuzzy,
            ..ResolveOptions::default()
        };
        let typo = resolve_single("Rosa fooo", &options);
        assert_eq!(typo.resolution_kind, ResolutionKind::SimilarityMatch);
        assert_eq!(typo.resolved_taxon_id, Some(TaxonId::from("1")));
        assert_eq!(typo.matched_name.as_deref(), Some("Rosa foo"));

        let unknown_genus = resolve_single("Rossa foo", &options);
        assert_eq!(unknown_genus.resolution_kind, ResolutionKind::Unresolved);
        assert_eq!(unknown_genus.unresolved_reason, Some(UnresolvedReason::NoSimilarName));
    }

    #[test]
    fn unrestricted_fuzzy_searches_the_whole_checklist() {
        let options = ResolveOptions {
            similarity_strategy: SimilarityStrategy::UnrestrictedFuzzy,
            ..ResolveOptions::default()
        };
        let result = resolve_single("Rossa foo", &options);
        assert_eq!(result.resolution_kind, ResolutionKind::SimilarityMatch);
        assert_eq!(result.resolved_taxon_id, Some(TaxonId::from("1")));
    }

    #[test]
    fn missing_names_without_fallback_are_unresolved() {
        let result = resolve_single("Nonexistent plant", &ResolveOptions::default());
        assert_eq!(result.unresolved_reason, Some(UnresolvedReason::NotInChecklist));
        assert_eq!(result.route, OutputRoute::Unresolved);

        let empty = resolve_single(" () ", &ResolveOptions::default());
        assert_eq!(empty.unresolved_reason, Some(UnresolvedReason::EmptyName));
    }

    #[test]
    fn divert_policies_split_duplicate_groups_by_category() {
        let checklist = fixture_checklist();
        let batch = queries(&["Mixta ambigua", "Acer dubium", "Betula alba", "Rosa foo"]);

        let resolution =
            resolve(&batch, &checklist, &with_policy(DuplicatePolicy::DivertIfSameTaxon), None);
        let diverted = resolution
            .routed(OutputRoute::Duplicates)
            .map(|result| result.query_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(diverted, vec!["q0", "q1"]);
        assert_eq!(resolution.duplicates_for("q0").count(), 2);
        assert!(resolution
            .duplicates_for("q0")
            .all(|row| row.duplicate_category == DuplicateCategory::DifferentTaxa));
        assert_eq!(resolution.stats.diverted_queries, 2);
        assert_eq!(resolution.results[2].route, OutputRoute::Main);

        let resolution =
            resolve(&batch, &checklist, &with_policy(DuplicatePolicy::DivertIfSameGenus), None);
        let acer = &resolution.results[1];
        assert_eq!(acer.route, OutputRoute::Main);
        assert_eq!(acer.duplicate_category, Some(DuplicateCategory::SameGenus));
        assert_eq!(acer.resolved_taxon_id, Some(TaxonId::from("12")));
        assert_eq!(acer.resolved_name.as_deref(), Some("Acer sp."));
        assert!(acer.species.is_none());
        assert_eq!(resolution.routed(OutputRoute::Duplicates).count(), 1);

        let resolution = resolve(&batch, &checklist, &with_policy(DuplicatePolicy::Divert), None);
        assert_eq!(resolution.routed(OutputRoute::Duplicates).count(), 3);
        assert_eq!(resolution.duplicates.len(), 6);
    }

    #[test]
    fn divert_if_same_species_keeps_species_groups_only() {
        let checklist = fixture_checklist();
        let batch = queries(&["Mixta ambigua", "Acer dubium", "Ficus ambigua", "Betula alba"]);

        let resolution =
            resolve(&batch, &checklist, &with_policy(DuplicatePolicy::DivertIfSameSpecies), None);
        let routes = resolution.results.iter().map(|result| result.route).collect::<Vec<_>>();
        assert_eq!(
            routes,
            vec![OutputRoute::Duplicates, OutputRoute::Duplicates, OutputRoute::Main, OutputRoute::Main]
        );

        let mixta = &resolution.results[0];
        assert_eq!(mixta.duplicate_category, Some(DuplicateCategory::DifferentTaxa));
        assert_eq!(mixta.resolution_kind, ResolutionKind::Unresolved);
        let acer = &resolution.results[1];
        assert_eq!(acer.duplicate_category, Some(DuplicateCategory::SameGenus));
        assert!(acer.resolved_taxon_id.is_none());
        assert_eq!(resolution.duplicates_for("q1").count(), 2);

        let ficus = &resolution.results[2];
        assert_eq!(ficus.duplicate_category, Some(DuplicateCategory::SameSpecies));
        assert_eq!(ficus.resolved_taxon_id, Some(TaxonId::from("3")));
        assert_eq!(ficus.resolved_name.as_deref(), Some("Ficus ambigua"));
        let betula = &resolution.results[3];
        assert_eq!(betula.duplicate_category, Some(DuplicateCategory::SameTaxon));
        assert_eq!(betula.resolved_taxon_id, Some(TaxonId::from("20")));

        assert_eq!(resolution.stats.diverted_queries, 2);
        assert_eq!(resolution.stats.duplicate_queries, 4);
        assert_eq!(resolution.duplicates.len(), 4);
    }

    #[test]
    fn remote_matches_are_confirmed_against_the_checklist() {
        let checklist = fixture_checklist();
        let matcher = StubMatcher {
            answers: vec![
                ("Rosa fo", Ok(Some("Rosa foo"))),
                ("Rosa invented", Ok(Some("Rosa imaginaria"))),
                ("Rosa offline", Err(LookupError::Transport("connection refused".to_string()))),
            ],
            calls: RefCell::new(Vec::new()),
        };
        let options = ResolveOptions {
            similarity_strategy: SimilarityStrategy::RemoteNamematch,
            ..ResolveOptions::default()
        };
        let batch = queries(&["Rosa fo", "Rosa invented", "Rosa offline", "Rosa bar", "Rosa nada"]);

        let resolution = resolve(&batch, &checklist, &options, Some(&matcher));

        assert_eq!(resolution.results.len(), 5);
        assert_eq!(resolution.results[0].resolution_kind, ResolutionKind::SimilarityMatch);
        assert_eq!(
            resolution.results[1].unresolved_reason,
            Some(UnresolvedReason::SimilarNameNotInChecklist)
        );
        assert_eq!(
            resolution.results[2].unresolved_reason,
            Some(UnresolvedReason::RemoteLookupFailed)
        );
        assert_eq!(resolution.results[3].resolution_kind, ResolutionKind::ResolvedSynonym);
        assert_eq!(resolution.results[4].unresolved_reason, Some(UnresolvedReason::NoSimilarName));
        // Exact hits never reach the remote service.
        assert!(!matcher.calls.borrow().iter().any(|name| name == "Rosa bar"));
    }

    #[test]
    fn remote_strategy_without_matcher_degrades_per_record() {
        let options = ResolveOptions {
            similarity_strategy: SimilarityStrategy::RemoteNamematch,
            ..ResolveOptions::default()
        };
        let missing = resolve_single("Rosa fooo", &options);
        assert_eq!(missing.unresolved_reason, Some(UnresolvedReason::RemoteLookupFailed));
        let exact = resolve_single("Rosa foo", &options);
        assert_eq!(exact.resolution_kind, ResolutionKind::DirectAccepted);
    }

    #[test]
    fn checklist_rejects_duplicate_ids_and_blank_names() {
        let mut entries = fixture_entries();
        entries.push(mk_entry("1", "Rosa again", "Rosaceae", TaxonomicStatus::Accepted, None));
        let result = Checklist::build(entries, NameNormalizer::default());
        assert!(matches!(result, Err(TaxoError::Checklist(message)) if message.contains("more than once")));

        let blank = vec![mk_entry("99", "  ", "Rosaceae", TaxonomicStatus::Accepted, None)];
        assert!(Checklist::build(blank, NameNormalizer::default()).is_err());
    }

    #[test]
    fn checklist_names_are_cleaned_like_queries() {
        let entries = vec![mk_entry("1", "× Agropogon littoralis", "Poaceae", TaxonomicStatus::Accepted, None)];
        let checklist = match Checklist::build(entries, NameNormalizer::default()) {
            Ok(checklist) => checklist,
            Err(err) => panic!("checklist should build: {err}"),
        };
        assert!(checklist.contains_name("Agropogon littoralis"));
        let resolution =
            resolve(&queries(&["Agropogon (littoralis)"]), &checklist, &ResolveOptions::default(), None);
        assert_eq!(resolution.results[0].resolution_kind, ResolutionKind::DirectAccepted);
    }

    #[test]
    fn status_parsing_accepts_wcvp_spellings() {
        assert_eq!(TaxonomicStatus::parse("Homotypic_Synonym"), TaxonomicStatus::HomotypicSynonym);
        assert_eq!(TaxonomicStatus::parse("Artificial Hybrid"), TaxonomicStatus::ArtificialHybrid);
        assert_eq!(TaxonomicStatus::parse(" accepted "), TaxonomicStatus::Accepted);
        assert_eq!(TaxonomicStatus::parse("Misapplied"), TaxonomicStatus::Other);
        assert!(TaxonomicStatus::Unplaced.rank() < TaxonomicStatus::Synonym.rank());
    }

    #[test]
    fn resolution_json_is_stable_across_runs() {
        let checklist = fixture_checklist();
        let batch = queries(&["Ficus ambigua", "Betula alba", "Rosa bar", "Quercus sp.", "Rosa fooo"]);
        let options = ResolveOptions {
            resolve_genus_only: true,
            similarity_strategy: SimilarityStrategy::GenusRestrictedFuzzy,
            ..ResolveOptions::default()
        };

        let first = serde_json::to_string(&resolve(&batch, &checklist, &options, None));
        let second = serde_json::to_string(&resolve(&batch, &checklist, &options, None));
        match (first, second) {
            (Ok(first), Ok(second)) => assert_eq!(first, second),
            (Err(err), _) | (_, Err(err)) => panic!("resolution should serialize: {err}"),
        }
    }

    fn policy_strategy() -> impl Strategy<Value = DuplicatePolicy> {
        prop::sample::select(vec![
            DuplicatePolicy::RankPriority,
            DuplicatePolicy::Divert,
            DuplicatePolicy::DivertIfSameTaxon,
            DuplicatePolicy::DivertIfSameSpecies,
            DuplicatePolicy::DivertIfSameGenus,
        ])
    }

    fn similarity_strategy() -> impl Strategy<Value = SimilarityStrategy> {
        prop::sample::select(vec![
            SimilarityStrategy::None,
            SimilarityStrategy::GenusRestrictedFuzzy,
            SimilarityStrategy::UnrestrictedFuzzy,
            SimilarityStrategy::RemoteNamematch,
        ])
    }

    fn name_strategy() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "Rosa foo",
            "Rosa bar",
            "Rosa fooo",
            "Ficus ambigua",
            "Quercus sp.",
            "Tilia sp",
            "Salix alba",
            "Acer dubium",
            "Mixta ambigua",
            "Betula alba",
            "Mentha piperita",
            "Loopa one",
            "Nonexistent plant",
            "",
        ])
    }

    proptest! {
        #[test]
        fn property_every_query_lands_in_exactly_one_output(
            names in prop::collection::vec(name_strategy(), 0..24),
            policy in policy_strategy(),
            strategy in similarity_strategy(),
            resolve_genus_only in any::<bool>(),
        ) {
            let checklist = fixture_checklist();
            let batch = queries(&names);
            let options = ResolveOptions {
                resolve_genus_only,
                similarity_strategy: strategy,
                duplicate_policy: policy,
                ..ResolveOptions::default()
            };

            let resolution = resolve(&batch, &checklist, &options, None);
            prop_assert_eq!(resolution.results.len(), batch.len());

            let main = resolution.routed(OutputRoute::Main).count();
            let diverted = resolution.routed(OutputRoute::Duplicates).count();
            let unresolved = resolution.routed(OutputRoute::Unresolved).count();
            prop_assert_eq!(main + diverted + unresolved, batch.len());

            for (query, result) in batch.iter().zip(&resolution.results) {
                prop_assert_eq!(&query.query_id, &result.query_id);
                let rows = resolution.duplicates_for(&result.query_id).count();
                if result.route == OutputRoute::Duplicates {
                    prop_assert!(rows > 1);
                } else {
                    prop_assert_eq!(rows, 0);
                }
                if let Some(taxon_id) = &result.resolved_taxon_id {
                    let entry = checklist.get(taxon_id);
                    prop_assert!(entry.is_some_and(|entry| entry.taxonomic_status.is_terminal()));
                }
            }
        }

        #[test]
        fn property_rank_priority_is_deterministic(
            names in prop::collection::vec(name_strategy(), 0..24),
            strategy in similarity_strategy(),
        ) {
            let checklist = fixture_checklist();
            let batch = queries(&names);
            let options = ResolveOptions { similarity_strategy: strategy, ..ResolveOptions::default() };

            let first = resolve(&batch, &checklist, &options, None);
            let second = resolve(&batch, &checklist, &options, None);
            prop_assert_eq!(first, second);
        }
    }
}
