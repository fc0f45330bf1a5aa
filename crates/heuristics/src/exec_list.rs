#![forbid(unsafe_code)]

use config::Heuristics;

/// One named heuristics command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecListEntry {
    pub name: String,
    pub command: String,
}

impl ExecListEntry {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Ordered list of heuristics commands.
///
/// Names are not required to be unique; every entry is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecList {
    entries: Vec<ExecListEntry>,
}

impl ExecList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, command: impl Into<String>) -> &ExecListEntry {
        self.entries.push(ExecListEntry::new(name, command));
        &self.entries[self.entries.len() - 1]
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecListEntry> {
        self.entries.iter()
    }

    pub fn find_name(&self, name: &str) -> Option<&ExecListEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Same entries regardless of order: every name in `self` pairs off
    /// with exactly one entry of `other` carrying the same command.
    pub fn same_entries(&self, other: &ExecList) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let mut remaining: Vec<&ExecListEntry> = other.entries.iter().collect();
        for entry in &self.entries {
            let Some(pos) = remaining.iter().position(|e| e.name == entry.name) else {
                return false;
            };
            if remaining[pos].command != entry.command {
                return false;
            }
            remaining.swap_remove(pos);
        }

        remaining.is_empty()
    }
}

impl<'a> IntoIterator for &'a ExecList {
    type Item = &'a ExecListEntry;
    type IntoIter = std::slice::Iter<'a, ExecListEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<ExecListEntry> for ExecList {
    fn from_iter<T: IntoIterator<Item = ExecListEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<&Heuristics> for ExecList {
    fn from(heuristics: &Heuristics) -> Self {
        heuristics
            .effective_exec()
            .map(|(name, command)| ExecListEntry::new(name, command))
            .collect()
    }
}
