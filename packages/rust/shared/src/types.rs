//! Core domain types shared by the forge, metadata, and writeup stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Value of the `benchmark` field in every index entry.
pub const BENCHMARK_NAME: &str = "ctf-archive";

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Challenge category as written to `challenge.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Web,
    Pwn,
    Crypto,
    Rev,
    Forensics,
    Misc,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Web,
        Category::Pwn,
        Category::Crypto,
        Category::Rev,
        Category::Forensics,
        Category::Misc,
    ];

    /// Lowercase name used in files and prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Pwn => "pwn",
            Self::Crypto => "crypto",
            Self::Rev => "rev",
            Self::Forensics => "forensics",
            Self::Misc => "misc",
        }
    }

    /// Case-insensitive match against the six category names.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(label))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskInfo
// ---------------------------------------------------------------------------

/// Everything the forge knows about one challenge directory before generation.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Directory name of the challenge.
    pub task_name: String,
    /// Absolute or archive-relative path of the challenge directory.
    pub task_path: PathBuf,
    /// Event (competition) directory name.
    pub ctf_name: String,
    /// Category from the event's `module.yml`, when known.
    pub category: Option<Category>,
    /// Cleaned `DESCRIPTION.md` text.
    pub description: String,
    /// Trimmed `REHOST.md` content.
    pub rehost_content: String,
    /// Trimmed `.init` content.
    pub init_content: String,
}

// ---------------------------------------------------------------------------
// ChallengeSpec (challenge.json)
// ---------------------------------------------------------------------------

/// The `challenge.json` document written next to each challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Connection URL of the challenge service (`box` in JSON).
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub box_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_check: Option<String>,
    /// Any additional keys the model produced.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Challenge index (metadata output)
// ---------------------------------------------------------------------------

/// One challenge in the consolidated index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Always [`BENCHMARK_NAME`].
    pub benchmark: String,
    pub event: String,
    pub challenge: String,
    /// Challenge directory path as scanned.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// `ctf_archive*.json`: index key to entry.
pub type ChallengeIndex = BTreeMap<String, IndexEntry>;

// ---------------------------------------------------------------------------
// Writeups
// ---------------------------------------------------------------------------

/// One line of the writeups JSONL dataset. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteupRecord {
    #[serde(default)]
    pub writeup_path: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub task_writeup: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
}

/// A writeup attached to an index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteupMatch {
    pub writeup_path: String,
    /// Normalized competition name parsed from the writeup path.
    pub writeup_competition: String,
    /// Normalized task name parsed from the writeup path.
    pub writeup_task: String,
    pub match_score: f64,
    pub competition_score: f64,
    pub task_score: f64,
    pub writeup_year: Option<String>,
    pub ctf_year: Option<String>,
    pub task_name: Option<String>,
    /// Writeup text with the solution redacted.
    pub task_writeup: String,
}

/// Mapping value: the challenge plus every writeup matched to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedTask {
    pub ctf_task_info: IndexEntry,
    pub writeups: Vec<WriteupMatch>,
}

/// Statistics block of `task_writeup_mapping.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSummary {
    pub total_writeups_processed: usize,
    pub matched_writeups: usize,
    pub writeup_match_rate: f64,
    pub total_tasks_in_archive: usize,
    pub tasks_with_writeups: usize,
    pub task_coverage_rate: f64,
    pub min_threshold: f64,
    pub workers_used: usize,
}

/// The complete `task_writeup_mapping.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingReport {
    pub summary: MappingSummary,
    pub task_writeup_mapping: BTreeMap<String, MappedTask>,
}

/// How matched writeups spread over challenges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteupDistribution {
    pub average: f64,
    pub min: usize,
    pub max: usize,
    /// Challenges with exactly one writeup.
    pub single: usize,
    /// Challenges with two or more.
    pub multiple: usize,
}

impl MappingReport {
    /// The `n` challenges with the most writeups. Ties keep key order.
    pub fn top_tasks(&self, n: usize) -> Vec<(&str, &MappedTask)> {
        let mut tasks: Vec<(&str, &MappedTask)> = self
            .task_writeup_mapping
            .iter()
            .map(|(key, task)| (key.as_str(), task))
            .collect();
        tasks.sort_by(|a, b| b.1.writeups.len().cmp(&a.1.writeups.len()));
        tasks.truncate(n);
        tasks
    }

    /// `None` when nothing matched.
    pub fn distribution(&self) -> Option<WriteupDistribution> {
        let counts: Vec<usize> = self
            .task_writeup_mapping
            .values()
            .map(|t| t.writeups.len())
            .collect();
        let min = *counts.iter().min()?;
        let max = *counts.iter().max()?;
        let single = counts.iter().filter(|&&c| c == 1).count();
        Some(WriteupDistribution {
            average: counts.iter().sum::<usize>() as f64 / counts.len() as f64,
            min,
            max,
            single,
            multiple: counts.len() - single,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels() {
        assert_eq!(Category::from_label("PWN"), Some(Category::Pwn));
        assert_eq!(Category::from_label(" forensics "), Some(Category::Forensics));
        assert_eq!(Category::from_label("stego"), None);
        assert_eq!(Category::Rev.to_string(), "rev");

        let json = serde_json::to_string(&Category::Crypto).unwrap();
        assert_eq!(json, "\"crypto\"");
    }

    #[test]
    fn challenge_spec_uses_box_key_and_keeps_extras() {
        let raw = r#"{
            "name": "babyrop",
            "description": "Smash it.",
            "category": "pwn",
            "files": ["babyrop"],
            "box": "nc challenge 1337",
            "internal_port": 1337,
            "compose": true,
            "server_description": "socat wrapper"
        }"#;
        let spec: ChallengeSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.box_url.as_deref(), Some("nc challenge 1337"));
        assert_eq!(spec.internal_port, Some(1337));
        assert_eq!(spec.compose, Some(true));
        assert!(spec.extra.contains_key("server_description"));

        let out = serde_json::to_value(&spec).unwrap();
        assert_eq!(out["box"], "nc challenge 1337");
        assert!(out.get("flag").is_none());
        assert_eq!(out["server_description"], "socat wrapper");
    }

    #[test]
    fn index_entry_omits_missing_category() {
        let entry = IndexEntry {
            benchmark: BENCHMARK_NAME.into(),
            event: "0ctf2017".into(),
            challenge: "diethard".into(),
            path: "ctf-archive/0ctf2017/diethard".into(),
            category: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("category").is_none());
        assert_eq!(json["benchmark"], "ctf-archive");
    }

    fn mapped(event: &str, writeups: usize) -> MappedTask {
        let entry = IndexEntry {
            benchmark: BENCHMARK_NAME.into(),
            event: event.into(),
            challenge: "task".into(),
            path: format!("ctf-archive/{event}/task"),
            category: None,
        };
        let found = WriteupMatch {
            writeup_path: format!("writeup_content/{event}/task/README.md"),
            writeup_competition: event.into(),
            writeup_task: "task".into(),
            match_score: 1.0,
            competition_score: 1.0,
            task_score: 1.0,
            writeup_year: None,
            ctf_year: None,
            task_name: None,
            task_writeup: String::new(),
        };
        MappedTask {
            ctf_task_info: entry,
            writeups: vec![found; writeups],
        }
    }

    #[test]
    fn report_rankings() {
        let summary = MappingSummary {
            total_writeups_processed: 6,
            matched_writeups: 6,
            writeup_match_rate: 1.0,
            total_tasks_in_archive: 3,
            tasks_with_writeups: 3,
            task_coverage_rate: 1.0,
            min_threshold: 0.9,
            workers_used: 1,
        };
        let mut report = MappingReport {
            summary,
            task_writeup_mapping: BTreeMap::new(),
        };
        assert!(report.distribution().is_none());

        report.task_writeup_mapping.insert("ca-a-task".into(), mapped("a", 1));
        report.task_writeup_mapping.insert("ca-b-task".into(), mapped("b", 3));
        report.task_writeup_mapping.insert("ca-c-task".into(), mapped("c", 2));

        let top: Vec<&str> = report.top_tasks(2).into_iter().map(|(k, _)| k).collect();
        assert_eq!(top, vec!["ca-b-task", "ca-c-task"]);

        let dist = report.distribution().unwrap();
        assert_eq!(dist.average, 2.0);
        assert_eq!((dist.min, dist.max), (1, 3));
        assert_eq!((dist.single, dist.multiple), (1, 2));
    }

    #[test]
    fn writeup_record_ignores_unknown_keys() {
        let line = r#"{"writeup_path": "writeup_content/x/y/README.md", "url": "https://example.org", "solution": null}"#;
        let record: WriteupRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.writeup_path.as_deref(), Some("writeup_content/x/y/README.md"));
        assert!(record.solution.is_none());
        assert!(record.task_writeup.is_none());
    }
}
