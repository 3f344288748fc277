use std::sync::Arc;
use tracing::{debug, info, warn};

use super::batch::{run_isolated, BatchReport};
use super::MediaLibrary;
use crate::error::Result;
use crate::storage::models::{MediaId, ProjectId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub media_id: MediaId,
    /// The project held the media and no longer does.
    pub association_removed: bool,
    /// No project referenced the media any more, so the record is gone.
    pub purged: bool,
    /// The last reference to the stored bytes was dropped and they were deleted.
    pub content_deleted: bool,
}

impl MediaLibrary {
    /// Remove a media item from the active project.
    pub async fn remove_media(&self, id: &MediaId) -> Result<RemovalOutcome> {
        let project = self.require_project()?;
        self.remove_from_project(&project, id).await
    }

    pub async fn remove_from_project(
        &self,
        project: &ProjectId,
        id: &MediaId,
    ) -> Result<RemovalOutcome> {
        let outcome = self.remove_one(project, id).await?;
        if outcome.association_removed {
            self.notify_removed(project, std::slice::from_ref(id));
        }
        Ok(outcome)
    }

    /// Removal without observer notification.
    async fn remove_one(&self, project: &ProjectId, id: &MediaId) -> Result<RemovalOutcome> {
        let record = self.catalog.media(id)?;
        let active = self.index()?.is_active(project);

        let (association_removed, purged) = self.mutate(
            |index| {
                if active {
                    index.remove(id);
                }
            },
            |db| {
                if !db.remove_association(project, id)? {
                    return Ok((false, false));
                }
                if db.count_associations(id)? > 0 {
                    return Ok((true, false));
                }
                db.delete_thumbnail(id)?;
                db.delete_media(id)?;
                Ok((true, true))
            },
        )?;

        if !association_removed {
            debug!("{} was not in project {}", id, project);
        }

        let mut content_deleted = false;
        if purged {
            self.thumbnails.invalidate(id);
            if let Err(err) = self.proxies.remove(id).await {
                warn!("{}: could not remove proxy: {}", id, err);
            }
            // Handle-backed media never touch the user's file.
            if let Some(hash) = record.content_hash() {
                content_deleted = self.content.release(hash).await?.deleted;
            }
            info!(
                "Purged {} ({}){}",
                id,
                record.file_name,
                if content_deleted { ", content deleted" } else { "" }
            );
        }

        Ok(RemovalOutcome {
            media_id: id.clone(),
            association_removed,
            purged,
            content_deleted,
        })
    }

    /// Remove several media from the active project, each on its own.
    /// Observers hear about every removed id once, after the batch.
    pub async fn remove_batch(&self, ids: &[MediaId]) -> Result<BatchReport<RemovalOutcome>> {
        let project = self.require_project()?;
        let reporter = Arc::clone(&self.reporter);
        let target = &project;
        let result = run_isolated(
            ids.to_vec(),
            reporter.as_ref(),
            |id: &MediaId| id.to_string(),
            move |id| async move { self.remove_one(target, &id).await },
        )
        .await;

        let removed: Vec<MediaId> = match &result {
            Ok(report) => report
                .succeeded
                .iter()
                .filter(|outcome| outcome.association_removed)
                .map(|outcome| outcome.media_id.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        self.notify_removed(&project, &removed);
        result
    }
}
