//! The Writeup Mapper stage: attach JSONL writeups to index entries by
//! fuzzy-matching competition and task names.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::AddAssign;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use ctfforge_shared::{
    ChallengeIndex, CtfForgeError, MappedTask, MappingReport, MappingSummary, Result,
    WriteupMatch, WriteupRecord,
};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::pool::map_blocking;

/// Replacement for the solution inside writeup text.
pub const REDACTED_FLAG: &str = "REDACTED_FLAG";

/// Strict-mode floor for the competition score.
const MIN_COMPETITION_SCORE: f64 = 0.85;
/// Strict-mode floor for the task score.
const MIN_TASK_SCORE: f64 = 0.8;

// ---------------------------------------------------------------------------
// Name normalization
// ---------------------------------------------------------------------------

/// Lowercase ASCII letters and digits only.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// First four-digit year (`19xx` or `20xx`) in `s`.
pub fn extract_year(s: &str) -> Option<&str> {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(19|20)\d{2}").expect("valid regex"));
    RE.find(s).map(|m| m.as_str())
}

/// Normalized `(competition, task)` from a path like
/// `writeup_content/X-MAS_2018/Endless Christmas/writeup_1.json`.
pub fn writeup_parts(writeup_path: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = writeup_path.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    let competition = normalize(parts[1]);
    let task = normalize(parts[2]);
    if competition.is_empty() || task.is_empty() {
        return None;
    }
    Some((competition, task))
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

fn longer_shorter<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a.len() > b.len() { (a, b) } else { (b, a) }
}

/// Cheap screen: exact/containment bonuses, else character-set overlap.
pub fn fast_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.len() < 8 && b.len() < 8 {
        if a == b {
            return 1.0;
        }
        if a.contains(b) || b.contains(a) {
            return 0.8;
        }
    }
    let (longer, shorter) = longer_shorter(a, b);
    if longer.contains(shorter) {
        return 0.7 + (shorter.len() as f64 / longer.len() as f64) * 0.3;
    }

    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

fn strip_name_suffix(s: &str) -> &str {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(ctf|20\d{2}|19\d{2})$").expect("valid regex"));
    match RE.find(s) {
        Some(m) => &s[..m.start()],
        None => s,
    }
}

/// Similarity of two normalized names in `[0, 1]`.
///
/// Exact match is 1.0 and containment `0.9 + 0.1 * length ratio`. Names that
/// agree once a trailing `ctf` or year is dropped score 0.95. Otherwise the
/// character sequence ratio is used when the overlap screen passes 0.3.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (longer, shorter) = longer_shorter(a, b);
    if longer.contains(shorter) {
        return 0.9 + (shorter.len() as f64 / longer.len() as f64) * 0.1;
    }

    if a.len() > 4 && b.len() > 4 {
        let (clean_a, clean_b) = (strip_name_suffix(a), strip_name_suffix(b));
        if !clean_a.is_empty()
            && !clean_b.is_empty()
            && (clean_a == clean_b || clean_a.contains(clean_b) || clean_b.contains(clean_a))
        {
            return 0.95;
        }
    }

    let fast = fast_similarity(a, b);
    if fast > 0.3 {
        return sequence_ratio(a, b);
    }
    fast
}

/// Ratcliff/Obershelp ratio `2 * M / T`, where `M` counts the characters in
/// the recursively found longest matching blocks and `T` is the total length.
///
/// Characters making up more than 1% of a `b` of 200+ characters are not used
/// to seed a match, only to extend one.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, &c) in b.iter().enumerate() {
        b2j.entry(c).or_default().push(j);
    }
    if b.len() >= 200 {
        let popular = b.len() / 100 + 1;
        b2j.retain(|_, positions| positions.len() <= popular);
    }

    let mut matched = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(&a, &b, &b2j, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }
    2.0 * matched as f64 / total as f64
}

/// Longest block `a[i..i + k] == b[j..j + k]` inside the given ranges. Ties go
/// to the smallest `i`, then the smallest `j`.
fn longest_match(
    a: &[char],
    b: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
    let mut run_at: HashMap<usize, usize> = HashMap::new();
    for i in alo..ahi {
        let mut next: HashMap<usize, usize> = HashMap::new();
        if let Some(positions) = b2j.get(&a[i]) {
            for &j in positions {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let k = j.checked_sub(1).and_then(|p| run_at.get(&p)).copied().unwrap_or(0) + 1;
                next.insert(j, k);
                if k > best_k {
                    (best_i, best_j, best_k) = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        run_at = next;
    }

    while best_i > alo && best_j > blo && a[best_i - 1] == b[best_j - 1] {
        best_i -= 1;
        best_j -= 1;
        best_k += 1;
    }
    while best_i + best_k < ahi
        && best_j + best_k < bhi
        && a[best_i + best_k] == b[best_j + best_k]
    {
        best_k += 1;
    }
    (best_i, best_j, best_k)
}

/// Zero when the lengths differ by more than half of the longer name.
fn gated_similarity(a: &str, b: &str) -> f64 {
    let longest = a.len().max(b.len());
    if a.len().abs_diff(b.len()) as f64 > longest as f64 * 0.5 {
        0.0
    } else {
        similarity(a, b)
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// How competition and task scores combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Competition >= 0.85 and task >= 0.8 required; `0.8 * comp + 0.2 * task`.
    #[default]
    Strict,
    /// No per-name floor; `0.4 * comp + 0.6 * task`.
    Weighted,
}

/// A challenge as seen by the matcher.
#[derive(Debug, Clone)]
pub struct MatchTarget {
    pub key: String,
    pub competition: String,
    pub task: String,
    pub year: Option<String>,
}

impl MatchTarget {
    /// Competition from the entry's event, task from its directory name.
    pub fn from_index(index: &ChallengeIndex) -> Vec<Self> {
        index
            .iter()
            .filter_map(|(key, entry)| {
                let dir = Path::new(&entry.path).file_name()?.to_string_lossy();
                let competition = normalize(&entry.event);
                let task = normalize(&dir);
                if competition.is_empty() || task.is_empty() {
                    return None;
                }
                Some(Self {
                    key: key.clone(),
                    year: extract_year(&competition).map(str::to_string),
                    competition,
                    task,
                })
            })
            .collect()
    }
}

/// Candidates turned down while looking for a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rejections {
    pub year: usize,
    pub competition: usize,
    pub task: usize,
}

impl AddAssign for Rejections {
    fn add_assign(&mut self, other: Self) {
        self.year += other.year;
        self.competition += other.competition;
        self.task += other.task;
    }
}

/// The winning candidate for one writeup.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub key: String,
    pub score: f64,
    pub competition_score: f64,
    pub task_score: f64,
    pub writeup_year: Option<String>,
    pub ctf_year: Option<String>,
}

/// Best-scoring target for a writeup's normalized names, if any reaches
/// `threshold`. Targets from a different year are never considered.
pub fn find_best_match(
    competition: &str,
    task: &str,
    targets: &[MatchTarget],
    threshold: f64,
    mode: MatchMode,
) -> (Option<BestMatch>, Rejections) {
    let writeup_year = extract_year(competition);
    let mut rejections = Rejections::default();
    let mut best: Option<BestMatch> = None;
    let mut best_score = 0.0;

    for target in targets {
        if let (Some(w), Some(c)) = (writeup_year, target.year.as_deref()) {
            if w != c {
                rejections.year += 1;
                continue;
            }
        }

        let competition_score = gated_similarity(competition, &target.competition);
        if mode == MatchMode::Strict && competition_score < MIN_COMPETITION_SCORE {
            rejections.competition += 1;
            continue;
        }
        let task_score = gated_similarity(task, &target.task);
        if mode == MatchMode::Strict && task_score < MIN_TASK_SCORE {
            rejections.task += 1;
            continue;
        }

        let score = match mode {
            MatchMode::Strict => competition_score * 0.8 + task_score * 0.2,
            MatchMode::Weighted => competition_score * 0.4 + task_score * 0.6,
        };
        if score > best_score && score >= threshold {
            best_score = score;
            best = Some(BestMatch {
                key: target.key.clone(),
                score,
                competition_score,
                task_score,
                writeup_year: writeup_year.map(str::to_string),
                ctf_year: target.year.clone(),
            });
        }
    }
    (best, rejections)
}

/// Strip `\` and `//`, then hide a non-blank solution.
pub fn redact_writeup(text: &str, solution: Option<&str>) -> String {
    let cleaned = text.replace('\\', "").replace("//", "");
    match solution {
        Some(solution) if !solution.trim().is_empty() => cleaned.replace(solution, REDACTED_FLAG),
        _ => cleaned,
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read a writeups JSONL file. `limit == 0` reads everything.
///
/// Blank lines are skipped, malformed lines are logged and skipped, and
/// records without a `writeup_path` are dropped.
pub fn load_writeups(path: &Path, limit: usize) -> Result<Vec<WriteupRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| CtfForgeError::io(path, e))?;
    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if limit > 0 && records.len() >= limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WriteupRecord>(line) {
            Ok(record) if record.writeup_path.as_deref().is_some_and(|p| !p.is_empty()) => {
                records.push(record);
            }
            Ok(_) => debug!(line = number + 1, "record without writeup_path"),
            Err(e) => warn!(line = number + 1, error = %e, "skipping malformed writeup line"),
        }
    }
    info!(path = %path.display(), records = records.len(), "writeups loaded");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Settings of a mapping run.
#[derive(Debug, Clone, Copy)]
pub struct MappingOptions {
    pub min_threshold: f64,
    pub workers: usize,
    pub mode: MatchMode,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self {
            min_threshold: 0.9,
            workers: 32,
            mode: MatchMode::Strict,
        }
    }
}

fn match_record(
    record: WriteupRecord,
    targets: &[MatchTarget],
    opts: &MappingOptions,
) -> (Option<(String, WriteupMatch)>, Rejections) {
    let Some(writeup_path) = record.writeup_path else {
        return (None, Rejections::default());
    };
    let Some((competition, task)) = writeup_parts(&writeup_path) else {
        return (None, Rejections::default());
    };

    let (best, rejections) =
        find_best_match(&competition, &task, targets, opts.min_threshold, opts.mode);
    let Some(best) = best else {
        return (None, rejections);
    };
    let text = record.task_writeup.as_deref().unwrap_or_default();
    let matched = WriteupMatch {
        writeup_path,
        writeup_competition: competition,
        writeup_task: task,
        match_score: best.score,
        competition_score: best.competition_score,
        task_score: best.task_score,
        writeup_year: best.writeup_year,
        ctf_year: best.ctf_year,
        task_name: record.task_name,
        task_writeup: redact_writeup(text, record.solution.as_deref()),
    };
    (Some((best.key, matched)), rejections)
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Match every record against `index` on up to `opts.workers` threads.
/// Writeups of one challenge keep their input order.
#[instrument(skip_all, fields(records = records.len(), tasks = index.len()))]
pub async fn map_writeups(
    records: Vec<WriteupRecord>,
    index: &ChallengeIndex,
    opts: &MappingOptions,
) -> Result<MappingReport> {
    let total = records.len();
    let targets = Arc::new(MatchTarget::from_index(index));
    let worker_opts = *opts;
    let results = map_blocking(records, opts.workers, move |record| {
        match_record(record, &targets, &worker_opts)
    })
    .await?;

    let mut grouped: BTreeMap<String, Vec<WriteupMatch>> = BTreeMap::new();
    let mut rejections = Rejections::default();
    let mut matched = 0;
    for (result, rejected) in results {
        rejections += rejected;
        if let Some((key, found)) = result {
            debug!(writeup = %found.writeup_path, key = %key, score = found.match_score, "matched");
            matched += 1;
            grouped.entry(key).or_default().push(found);
        }
    }
    info!(
        matched,
        year_rejections = rejections.year,
        competition_rejections = rejections.competition,
        task_rejections = rejections.task,
        "mapping complete"
    );

    let task_writeup_mapping: BTreeMap<String, MappedTask> = grouped
        .into_iter()
        .filter_map(|(key, writeups)| {
            let entry = index.get(&key)?.clone();
            Some((
                key,
                MappedTask {
                    ctf_task_info: entry,
                    writeups,
                },
            ))
        })
        .collect();

    let summary = MappingSummary {
        total_writeups_processed: total,
        matched_writeups: matched,
        writeup_match_rate: rate(matched, total),
        total_tasks_in_archive: index.len(),
        tasks_with_writeups: task_writeup_mapping.len(),
        task_coverage_rate: rate(task_writeup_mapping.len(), index.len()),
        min_threshold: opts.min_threshold,
        workers_used: opts.workers,
    };
    Ok(MappingReport {
        summary,
        task_writeup_mapping,
    })
}

/// Index keys with no writeup, sorted.
pub fn unmatched_tasks<'a>(index: &'a ChallengeIndex, report: &MappingReport) -> Vec<&'a str> {
    let matched: BTreeSet<&str> = report.task_writeup_mapping.keys().map(String::as_str).collect();
    index
        .keys()
        .map(String::as_str)
        .filter(|key| !matched.contains(key))
        .collect()
}

/// Write `report` as indented JSON.
pub fn write_report(path: &Path, report: &MappingReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| CtfForgeError::parse(format!("cannot serialize mapping: {e}")))?;
    std::fs::write(path, json).map_err(|e| CtfForgeError::io(path, e))
}
