use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub emails: BTreeSet<String>,
}

/// Named email sets backing the `allowedGroups` policy field. Persisted as
/// a JSON array at `<data>/groups.json`; kept in memory keyed by lowercase
/// name, every mutation rewrites the whole file atomically.
#[derive(Debug)]
pub struct GroupStore {
    path: PathBuf,
    groups: RwLock<HashMap<String, Group>>,
}

impl GroupStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("groups.json");
        let mut groups = HashMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed: Vec<Group> = serde_json::from_str(&content)
                .with_context(|| format!("corrupt group store {}", path.display()))?;
            for group in parsed {
                groups.insert(group.name.to_lowercase(), normalize(group));
            }
        }
        Ok(Self {
            path,
            groups: RwLock::new(groups),
        })
    }

    pub fn list(&self) -> Vec<Group> {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<Group> = groups.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get(&self, name: &str) -> Option<Group> {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        groups.get(&name.to_lowercase()).cloned()
    }

    pub fn create(&self, name: &str, emails: BTreeSet<String>) -> Result<Group> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            bail!("group name cannot be empty");
        }
        if name.contains(char::is_whitespace) {
            bail!("group name cannot contain whitespace");
        }

        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        if groups.contains_key(&name) {
            bail!("group '{}' already exists", name);
        }
        let group = normalize(Group {
            name: name.clone(),
            emails,
        });
        groups.insert(name, group.clone());
        self.persist(&groups)?;
        Ok(group)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        if groups.remove(&name.to_lowercase()).is_none() {
            return Ok(false);
        }
        self.persist(&groups)?;
        Ok(true)
    }

    pub fn add_emails(&self, name: &str, emails: &BTreeSet<String>) -> Result<Option<Group>> {
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        let Some(group) = groups.get_mut(&name.to_lowercase()) else {
            return Ok(None);
        };
        group.emails.extend(emails.iter().map(|e| e.to_lowercase()));
        let updated = group.clone();
        self.persist(&groups)?;
        Ok(Some(updated))
    }

    pub fn remove_emails(&self, name: &str, emails: &BTreeSet<String>) -> Result<Option<Group>> {
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        let Some(group) = groups.get_mut(&name.to_lowercase()) else {
            return Ok(None);
        };
        for email in emails {
            group.emails.remove(&email.to_lowercase());
        }
        let updated = group.clone();
        self.persist(&groups)?;
        Ok(Some(updated))
    }

    /// Union of member emails across the named groups; unknown names are
    /// silently ignored.
    pub fn resolve(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        let mut members = BTreeSet::new();
        for name in names {
            if let Some(group) = groups.get(&name.to_lowercase()) {
                members.extend(group.emails.iter().cloned());
            }
        }
        members
    }

    fn persist(&self, groups: &HashMap<String, Group>) -> Result<()> {
        let mut list: Vec<&Group> = groups.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let content = serde_json::to_string_pretty(&list)?;

        let parent = self
            .path
            .parent()
            .context("group store has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .context("failed to create temp file for group store")?;
        tmp.write_all(content.as_bytes())
            .context("failed to write group store")?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn normalize(group: Group) -> Group {
    Group {
        name: group.name.to_lowercase(),
        emails: group.emails.iter().map(|e| e.to_lowercase()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emails(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn members_are_case_folded() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupStore::load(dir.path()).unwrap();

        let group = store.create("Admins", emails(&["Alice@X.com", "bob@x.com"])).unwrap();
        assert_eq!(group.name, "admins");
        assert!(group.emails.contains("alice@x.com"));

        assert_eq!(store.get("ADMINS").unwrap().name, "admins");
        let err = store.create("admins", emails(&[])).unwrap_err().to_string();
        assert!(err.contains("already exists"));
    }

    #[test]
    fn resolve_unions_and_ignores_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupStore::load(dir.path()).unwrap();
        store.create("admins", emails(&["a@x.com"])).unwrap();
        store.create("devs", emails(&["b@x.com", "a@x.com"])).unwrap();

        let resolved = store.resolve(&emails(&["Admins", "devs", "ghosts"]));
        assert_eq!(resolved, emails(&["a@x.com", "b@x.com"]));
    }

    #[test]
    fn mutations_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GroupStore::load(dir.path()).unwrap();
            store.create("admins", emails(&["a@x.com"])).unwrap();
            store.add_emails("admins", &emails(&["B@X.com"])).unwrap();
            store.remove_emails("admins", &emails(&["a@x.com"])).unwrap();
        }
        let store = GroupStore::load(dir.path()).unwrap();
        let group = store.get("admins").unwrap();
        assert_eq!(group.emails, emails(&["b@x.com"]));

        assert!(store.add_emails("ghosts", &emails(&["x@x.com"])).unwrap().is_none());
        assert!(store.delete("admins").unwrap());
        assert!(!store.delete("admins").unwrap());
    }
}
