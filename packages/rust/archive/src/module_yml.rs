//! Category lookup through the event's `module.yml`.

use std::path::Path;

use ctfforge_shared::Category;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ModuleFile {
    #[serde(default)]
    challenges: Vec<ModuleChallenge>,
}

#[derive(Debug, Deserialize)]
struct ModuleChallenge {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<Value>,
}

/// Map the label in front of `" - "` in a challenge title to a category.
/// Unknown labels are `misc`.
pub fn category_for_label(label: &str) -> Category {
    match label.trim().to_uppercase().as_str() {
        "PWN" | "EXPLOIT" | "EXPLOITATION" | "BINARY" | "BINARY EXPLOITATION"
        | "VULNERABILITY" | "ROP" => Category::Pwn,
        "CRYPTO" | "CRYTPO" => Category::Crypto,
        "WEB" | "WWW" => Category::Web,
        "REV" | "REVERSE" => Category::Rev,
        "FORENSICS" | "STEGO" => Category::Forensics,
        _ => Category::Misc,
    }
}

/// Category of the challenge at `dir` according to `../module.yml`.
///
/// The entry whose `id` equals the directory name is used; its `name` must
/// look like `"PWN - Title"`. Missing file, entry, or separator gives `None`.
pub fn category_from_module_yml(dir: &Path) -> Option<Category> {
    let task = dir.file_name()?.to_string_lossy();
    let module_path = dir.parent()?.join("module.yml");
    let content = std::fs::read_to_string(&module_path).ok()?;

    let module: ModuleFile = match serde_yaml::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %module_path.display(), error = %e, "unreadable module.yml");
            return None;
        }
    };

    let entry = module
        .challenges
        .iter()
        .find(|c| c.id.as_ref().and_then(Value::as_str) == Some(task.as_ref()))?;
    let (label, _) = entry.name.as_ref()?.as_str()?.split_once(" - ")?;
    Some(category_for_label(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{temp_tree, write};

    #[test]
    fn label_mapping() {
        assert_eq!(category_for_label("pwn"), Category::Pwn);
        assert_eq!(category_for_label("Binary Exploitation"), Category::Pwn);
        assert_eq!(category_for_label("CRYTPO"), Category::Crypto);
        assert_eq!(category_for_label("www"), Category::Web);
        assert_eq!(category_for_label("Reverse"), Category::Rev);
        assert_eq!(category_for_label("STEGO"), Category::Forensics);
        assert_eq!(category_for_label("OSINT"), Category::Misc);
        assert_eq!(category_for_label("pwn/misc"), Category::Misc);
        assert_eq!(category_for_label("something new"), Category::Misc);
    }

    #[test]
    fn reads_parent_module_yml() {
        let root = temp_tree("cf-module");
        write(
            &root,
            "evt/module.yml",
            r#"
name: Some Event
challenges:
  - id: 101
    name: "WEB - numeric id"
  - id: babyrsa
    name: "Crypto - Baby RSA"
  - id: notitle
    name: "No separator here"
"#,
        );
        std::fs::create_dir_all(root.join("evt/babyrsa")).unwrap();

        assert_eq!(
            category_from_module_yml(&root.join("evt/babyrsa")),
            Some(Category::Crypto)
        );
        assert_eq!(category_from_module_yml(&root.join("evt/notitle")), None);
        assert_eq!(category_from_module_yml(&root.join("evt/absent")), None);
        assert_eq!(category_from_module_yml(&root.join("other/babyrsa")), None);

        std::fs::remove_dir_all(&root).ok();
    }
}
