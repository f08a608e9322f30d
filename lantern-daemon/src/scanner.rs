//! Node directory scanning.
//!
//! The daemon polls the node directory and diffs it against the previous
//! scan. Regular files become content changes (keyed on modification
//! time), subdirectories become child nodes. Hidden entries are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

/// One difference between two scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Child { name: String, added: bool },
    Content { name: String, added: bool },
}

impl Change {
    pub fn name(&self) -> &str {
        match self {
            Change::Child { name, .. } | Change::Content { name, .. } => name,
        }
    }
}

/// Remembers what the last scan saw.
#[derive(Debug)]
pub struct DirectoryScanner {
    root: PathBuf,
    files: BTreeMap<String, SystemTime>,
    children: BTreeSet<String>,
}

impl DirectoryScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: BTreeMap::new(),
            children: BTreeSet::new(),
        }
    }

    /// Scan the directory and return what changed, children first, each
    /// group in name order. The first scan reports everything as added.
    pub fn scan(&mut self) -> io::Result<Vec<Change>> {
        let mut files = BTreeMap::new();
        let mut children = BTreeSet::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            // Entries can vanish between read_dir and metadata.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                children.insert(name);
            } else if metadata.is_file() {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.insert(name, modified);
            }
        }

        let mut changes = Vec::new();

        for name in self.children.difference(&children) {
            changes.push(Change::Child {
                name: name.clone(),
                added: false,
            });
        }
        for name in children.difference(&self.children) {
            changes.push(Change::Child {
                name: name.clone(),
                added: true,
            });
        }

        for name in self.files.keys() {
            if !files.contains_key(name) {
                changes.push(Change::Content {
                    name: name.clone(),
                    added: false,
                });
            }
        }
        for (name, modified) in &files {
            if self.files.get(name) != Some(modified) {
                changes.push(Change::Content {
                    name: name.clone(),
                    added: true,
                });
            }
        }

        self.files = files;
        self.children = children;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_scan_reports_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"b").unwrap();
        fs::write(dir.path().join("a.png"), b"a").unwrap();
        fs::write(dir.path().join(".swp"), b"").unwrap();
        fs::create_dir(dir.path().join("kid")).unwrap();

        let mut scanner = DirectoryScanner::new(dir.path());
        let changes = scanner.scan().unwrap();
        assert_eq!(
            changes,
            vec![
                Change::Child {
                    name: "kid".to_string(),
                    added: true
                },
                Change::Content {
                    name: "a.png".to_string(),
                    added: true
                },
                Change::Content {
                    name: "b.png".to_string(),
                    added: true
                },
            ]
        );
        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn test_removal_and_modification() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("node.lua");
        fs::write(&file, b"x = 1").unwrap();
        fs::write(dir.path().join("gone.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("kid")).unwrap();

        let mut scanner = DirectoryScanner::new(dir.path());
        scanner.scan().unwrap();

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::remove_dir(dir.path().join("kid")).unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let changes = scanner.scan().unwrap();
        assert_eq!(
            changes,
            vec![
                Change::Child {
                    name: "kid".to_string(),
                    added: false
                },
                Change::Content {
                    name: "gone.txt".to_string(),
                    added: false
                },
                Change::Content {
                    name: "node.lua".to_string(),
                    added: true
                },
            ]
        );
    }

    #[test]
    fn test_missing_directory_errors() {
        let mut scanner = DirectoryScanner::new("/nonexistent/lantern/node");
        assert!(scanner.scan().is_err());
    }
}
