//! Standard Windows hive locations and their root keys.
//!
//! Hive files are matched case-insensitively against the well-known layout
//! under the guest root. System hives mount under `\HKLM`, the default
//! profile and per-user hives under `\HKU`.
use crate::model::{ContentIndex, EntryKind};
use std::collections::BTreeMap;

/// System hives under `Windows/System32/config/` and the root key each one
/// is mounted at.
pub const SYSTEM_HIVES: [(&str, &str); 5] = [
    ("sam", "\\HKLM\\SAM"),
    ("security", "\\HKLM\\SECURITY"),
    ("software", "\\HKLM\\SOFTWARE"),
    ("system", "\\HKLM\\SYSTEM"),
    ("default", "\\HKU\\.DEFAULT"),
];

const CONFIG_DIR: [&str; 3] = ["windows", "system32", "config"];
const USER_CLASSES: [&str; 5] = ["appdata", "local", "microsoft", "windows", "usrclass.dat"];

/// One hive to load: its guest path and the key path it is mounted at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HiveSource {
    pub path: String,
    pub root_key: String,
}

impl HiveSource {
    /// Source for an explicitly named hive file. Files outside the standard
    /// layout mount under `\<file name>`.
    pub fn from_path(path: &str) -> Self {
        let root_key = root_key_for(path).unwrap_or_else(|| {
            let name = path
                .rsplit(['/', '\\'])
                .find(|c| !c.is_empty())
                .unwrap_or(path);
            format!("\\{name}")
        });
        Self {
            path: path.to_string(),
            root_key,
        }
    }
}

/// Root key for a guest path in the standard hive layout, if it is one.
pub fn root_key_for(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split(['/', '\\']).filter(|c| !c.is_empty()).collect();
    let lower: Vec<String> = parts.iter().map(|c| c.to_ascii_lowercase()).collect();

    match lower.as_slice() {
        [w, s, c, name] if [w, s, c].iter().zip(CONFIG_DIR).all(|(a, b)| *a == b) => {
            SYSTEM_HIVES
                .iter()
                .find(|(file, _)| file == name)
                .map(|(_, key)| key.to_string())
        }
        [users, _, file] if users == "users" && file == "ntuser.dat" => {
            Some(format!("\\HKU\\{}", parts[1]))
        }
        [users, _, rest @ ..]
            if users == "users"
                && rest.len() == USER_CLASSES.len()
                && rest.iter().zip(USER_CLASSES).all(|(a, b)| a == b) =>
        {
            Some(format!("\\HKU\\{}_Classes", parts[1]))
        }
        _ => None,
    }
}

/// Every hive file present in `index`, keyed by root key.
pub fn discover_hives(index: &ContentIndex) -> BTreeMap<String, HiveSource> {
    let mut found = BTreeMap::new();
    for entry in index.iter().filter(|e| e.kind == EntryKind::File) {
        if let Some(root_key) = root_key_for(&entry.path) {
            found.entry(root_key.clone()).or_insert(HiveSource {
                path: entry.path.clone(),
                root_key,
            });
        }
    }
    found
}

/// Which hives each side must load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HivePlan {
    pub old: Vec<HiveSource>,
    pub new: Vec<HiveSource>,
    /// Root keys whose hive files are byte-identical on both sides.
    pub unchanged: Vec<String>,
}

/// Plan hive loading from the two content indices.
///
/// With `skip_unchanged`, a hive whose file digest is the same on both sides
/// cannot contain changes and is left out. A hive without a digest on either
/// side is always loaded.
pub fn plan_hives(old: &ContentIndex, new: &ContentIndex, skip_unchanged: bool) -> HivePlan {
    let old_hives = discover_hives(old);
    let mut new_hives = discover_hives(new);
    let mut plan = HivePlan::default();

    for (root_key, old_source) in old_hives {
        if let Some(new_source) = new_hives.remove(&root_key) {
            let old_digest = old.get(&old_source.path).and_then(|e| e.content_digest.as_ref());
            let new_digest = new.get(&new_source.path).and_then(|e| e.content_digest.as_ref());
            if skip_unchanged && old_digest.is_some() && old_digest == new_digest {
                plan.unchanged.push(root_key);
                continue;
            }
            plan.new.push(new_source);
        }
        plan.old.push(old_source);
    }
    plan.new.extend(new_hives.into_values());
    plan.new.sort_by(|a, b| a.root_key.cmp(&b.root_key));
    plan
}
