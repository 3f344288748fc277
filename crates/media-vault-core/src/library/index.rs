use std::collections::HashMap;

use crate::storage::models::{MediaId, MediaRecord, ProjectId};

/// In-memory view of the active project's media, in association order.
///
/// Mutations are applied here first and rolled back from a snapshot if the
/// catalog write that follows them fails.
#[derive(Debug, Clone, Default)]
pub struct MediaIndex {
    project: Option<ProjectId>,
    records: HashMap<MediaId, MediaRecord>,
    order: Vec<MediaId>,
}

impl MediaIndex {
    pub fn load(project: ProjectId, records: Vec<MediaRecord>) -> Self {
        let mut index = Self {
            project: Some(project),
            ..Self::default()
        };
        for record in records {
            index.upsert(record);
        }
        index
    }

    pub fn project(&self) -> Option<&ProjectId> {
        self.project.as_ref()
    }

    pub fn is_active(&self, project: &ProjectId) -> bool {
        self.project.as_ref() == Some(project)
    }

    pub fn get(&self, id: &MediaId) -> Option<&MediaRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &MediaId) -> bool {
        self.records.contains_key(id)
    }

    /// Insert a new record at the end, or replace an existing one in place.
    pub fn upsert(&mut self, record: MediaRecord) {
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    /// Apply `f` to the record if it is indexed.
    pub fn update<F>(&mut self, id: &MediaId, f: F) -> bool
    where
        F: FnOnce(&mut MediaRecord),
    {
        match self.records.get_mut(id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MediaId) -> Option<MediaRecord> {
        let removed = self.records.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(removed)
    }

    pub fn ids(&self) -> Vec<MediaId> {
        self.order.clone()
    }

    pub fn records(&self) -> Vec<MediaRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use crate::storage::models::{MediaProperties, StorageBackend};
    use chrono::Utc;

    fn record(id: &str) -> MediaRecord {
        MediaRecord {
            id: MediaId::from(id),
            backend: StorageBackend::ContentAddressed {
                hash: hash_bytes(id.as_bytes()),
            },
            file_name: format!("{}.mp4", id),
            file_size: 10,
            mime_type: "video/mp4".to_string(),
            properties: MediaProperties::default(),
            thumbnail_id: None,
            broken_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_keeps_insertion_order_across_updates() {
        let mut index = MediaIndex::load(ProjectId::from("p"), vec![record("a"), record("b")]);
        index.upsert(record("c"));
        let mut renamed = record("a");
        renamed.file_name = "renamed.mp4".to_string();
        index.upsert(renamed);

        let names: Vec<String> = index.records().into_iter().map(|r| r.file_name).collect();
        assert_eq!(names, vec!["renamed.mp4", "b.mp4", "c.mp4"]);
        assert!(index.is_active(&ProjectId::from("p")));
    }

    #[test]
    fn test_snapshot_restores_removed_record() {
        let mut index = MediaIndex::load(ProjectId::from("p"), vec![record("a"), record("b")]);
        let snapshot = index.clone();

        assert!(index.remove(&MediaId::from("a")).is_some());
        assert!(index.remove(&MediaId::from("a")).is_none());
        assert_eq!(index.len(), 1);

        index = snapshot;
        assert_eq!(index.ids(), vec![MediaId::from("a"), MediaId::from("b")]);
    }
}
