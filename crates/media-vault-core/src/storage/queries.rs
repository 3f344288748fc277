use super::models::*;
use super::sqlite::Database;
use crate::access::ExternalHandle;
use crate::error::AccessErrorKind;
use crate::hasher::ContentHash;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Result, Row};
use tracing::debug;

const MEDIA_COLUMNS: &str = "m.id, m.backend, m.external_path, m.content_hash, m.file_name, \
     m.file_size, m.mime_type, m.duration, m.width, m.height, m.fps, m.video_codec, \
     m.audio_codec, m.audio_codec_supported, m.bitrate, m.channels, m.sample_rate, \
     m.thumbnail_id, m.broken_reason, m.created_at, m.updated_at";

fn media_from_row(row: &Row<'_>) -> Result<MediaRecord> {
    let backend_kind: String = row.get(1)?;
    let backend = match backend_kind.as_str() {
        "handle" => {
            let path: String = row.get(2)?;
            StorageBackend::HandleBacked {
                external_handle: ExternalHandle::new(path),
            }
        }
        "content" => StorageBackend::ContentAddressed { hash: row.get(3)? },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown storage backend '{}'", other).into(),
            ))
        }
    };

    let broken: Option<String> = row.get(18)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        backend,
        file_name: row.get(4)?,
        file_size: row.get::<_, i64>(5)? as u64,
        mime_type: row.get(6)?,
        properties: MediaProperties {
            duration: row.get(7)?,
            width: row.get(8)?,
            height: row.get(9)?,
            fps: row.get(10)?,
            video_codec: row.get(11)?,
            audio_codec: row.get(12)?,
            audio_codec_supported: row.get(13)?,
            bitrate: row.get::<_, Option<i64>>(14)?.map(|b| b as u64),
            channels: row.get(15)?,
            sample_rate: row.get(16)?,
        },
        thumbnail_id: row.get(17)?,
        broken_reason: broken.as_deref().and_then(AccessErrorKind::parse),
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn content_from_row(row: &Row<'_>) -> Result<ContentRecord> {
    Ok(ContentRecord {
        hash: row.get(0)?,
        ref_count: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

impl Database {
    // ── Content ──────────────────────────────────────────────────

    /// Add one reference, creating the record at 1 for novel content.
    /// Returns the new count.
    pub fn increment_content(&self, hash: &ContentHash, size: u64) -> Result<i64> {
        let now = Utc::now();
        self.connection().query_row(
            "INSERT INTO content (hash, ref_count, size, created_at, updated_at) \
             VALUES (?1, 1, ?2, ?3, ?3) \
             ON CONFLICT(hash) DO UPDATE SET \
                 ref_count = ref_count + 1, \
                 updated_at = excluded.updated_at \
             RETURNING ref_count",
            params![hash, size as i64, now],
            |row| row.get(0),
        )
    }

    /// Drop one reference. `None` when there is no record or the count is
    /// already zero; the count is never taken below zero.
    pub fn decrement_content(&self, hash: &ContentHash) -> Result<Option<i64>> {
        self.connection()
            .query_row(
                "UPDATE content SET ref_count = ref_count - 1, updated_at = ?2 \
                 WHERE hash = ?1 AND ref_count > 0 \
                 RETURNING ref_count",
                params![hash, Utc::now()],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn get_content(&self, hash: &ContentHash) -> Result<Option<ContentRecord>> {
        self.connection()
            .query_row(
                "SELECT hash, ref_count, size, created_at, updated_at \
                 FROM content WHERE hash = ?1",
                params![hash],
                content_from_row,
            )
            .optional()
    }

    pub fn delete_content_record(&self, hash: &ContentHash) -> Result<bool> {
        let deleted = self
            .connection()
            .execute("DELETE FROM content WHERE hash = ?1", params![hash])?;
        Ok(deleted > 0)
    }

    pub fn set_content_ref_count(&self, hash: &ContentHash, ref_count: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE content SET ref_count = ?2, updated_at = ?3 WHERE hash = ?1",
            params![hash, ref_count, Utc::now()],
        )?;
        Ok(())
    }

    pub fn list_content(&self) -> Result<Vec<ContentRecord>> {
        let mut stmt = self.connection().prepare(
            "SELECT hash, ref_count, size, created_at, updated_at FROM content ORDER BY hash",
        )?;
        let records = stmt
            .query_map([], content_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Number of media records pointing at this content.
    pub fn count_media_with_hash(&self, hash: &ContentHash) -> Result<i64> {
        self.connection().query_row(
            "SELECT COUNT(*) FROM media WHERE content_hash = ?1",
            params![hash],
            |row| row.get(0),
        )
    }

    // ── Media ────────────────────────────────────────────────────

    pub fn insert_media(&self, record: &MediaRecord) -> Result<()> {
        let (external_path, content_hash) = match &record.backend {
            StorageBackend::HandleBacked { external_handle } => (
                Some(external_handle.path().to_string_lossy().into_owned()),
                None,
            ),
            StorageBackend::ContentAddressed { hash } => (None, Some(hash.clone())),
        };
        let props = &record.properties;
        self.connection().execute(
            "INSERT INTO media \
             (id, backend, external_path, content_hash, file_name, file_size, mime_type, \
              duration, width, height, fps, video_codec, audio_codec, audio_codec_supported, \
              bitrate, channels, sample_rate, thumbnail_id, broken_reason, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21)",
            params![
                record.id,
                record.backend.as_str(),
                external_path,
                content_hash,
                record.file_name,
                record.file_size as i64,
                record.mime_type,
                props.duration,
                props.width,
                props.height,
                props.fps,
                props.video_codec,
                props.audio_codec,
                props.audio_codec_supported,
                props.bitrate.map(|b| b as i64),
                props.channels,
                props.sample_rate,
                record.thumbnail_id,
                record.broken_reason.map(|kind| kind.as_str()),
                record.created_at,
                record.updated_at,
            ],
        )?;
        debug!("Inserted media {} ({})", record.id, record.file_name);
        Ok(())
    }

    pub fn get_media(&self, id: &MediaId) -> Result<Option<MediaRecord>> {
        let sql = format!("SELECT {} FROM media m WHERE m.id = ?1", MEDIA_COLUMNS);
        self.connection()
            .query_row(&sql, params![id], media_from_row)
            .optional()
    }

    pub fn list_all_media(&self) -> Result<Vec<MediaRecord>> {
        let sql = format!(
            "SELECT {} FROM media m ORDER BY m.created_at, m.id",
            MEDIA_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let records = stmt
            .query_map([], media_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn list_project_media(&self, project: &ProjectId) -> Result<Vec<MediaRecord>> {
        let sql = format!(
            "SELECT {} FROM media m \
             JOIN project_media pm ON pm.media_id = m.id \
             WHERE pm.project_id = ?1 \
             ORDER BY pm.added_at, m.id",
            MEDIA_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let records = stmt
            .query_map(params![project], media_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Existing media in the project with the same name and size.
    pub fn find_duplicate_in_project(
        &self,
        project: &ProjectId,
        file_name: &str,
        file_size: u64,
    ) -> Result<Option<MediaRecord>> {
        let sql = format!(
            "SELECT {} FROM media m \
             JOIN project_media pm ON pm.media_id = m.id \
             WHERE pm.project_id = ?1 AND m.file_name = ?2 AND m.file_size = ?3 \
             ORDER BY pm.added_at LIMIT 1",
            MEDIA_COLUMNS
        );
        self.connection()
            .query_row(
                &sql,
                params![project, file_name, file_size as i64],
                media_from_row,
            )
            .optional()
    }

    /// Point a handle-backed record at a new file. Clears any broken flag.
    pub fn update_media_source(
        &self,
        id: &MediaId,
        handle: &ExternalHandle,
        file_name: &str,
        mime_type: &str,
        file_size: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.connection().execute(
            "UPDATE media SET external_path = ?2, file_name = ?3, mime_type = ?4, \
             file_size = ?5, broken_reason = NULL, updated_at = ?6 \
             WHERE id = ?1 AND backend = 'handle'",
            params![
                id,
                handle.path().to_string_lossy(),
                file_name,
                mime_type,
                file_size as i64,
                updated_at
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn set_media_thumbnail(
        &self,
        id: &MediaId,
        thumbnail_id: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.connection().execute(
            "UPDATE media SET thumbnail_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, thumbnail_id, updated_at],
        )?;
        Ok(updated > 0)
    }

    pub fn set_media_broken(
        &self,
        id: &MediaId,
        reason: Option<AccessErrorKind>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.connection().execute(
            "UPDATE media SET broken_reason = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, reason.map(|kind| kind.as_str()), updated_at],
        )?;
        Ok(updated > 0)
    }

    /// Deletes the record; its thumbnail and associations cascade.
    pub fn delete_media(&self, id: &MediaId) -> Result<bool> {
        let deleted = self
            .connection()
            .execute("DELETE FROM media WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ── Project associations ─────────────────────────────────────

    /// Returns false when the association already existed.
    pub fn add_association(&self, project: &ProjectId, media: &MediaId) -> Result<bool> {
        let inserted = self.connection().execute(
            "INSERT OR IGNORE INTO project_media (project_id, media_id, added_at) \
             VALUES (?1, ?2, ?3)",
            params![project, media, Utc::now()],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_association(&self, project: &ProjectId, media: &MediaId) -> Result<bool> {
        let removed = self.connection().execute(
            "DELETE FROM project_media WHERE project_id = ?1 AND media_id = ?2",
            params![project, media],
        )?;
        Ok(removed > 0)
    }

    pub fn has_association(&self, project: &ProjectId, media: &MediaId) -> Result<bool> {
        self.connection().query_row(
            "SELECT EXISTS(SELECT 1 FROM project_media WHERE project_id = ?1 AND media_id = ?2)",
            params![project, media],
            |row| row.get(0),
        )
    }

    pub fn count_associations(&self, media: &MediaId) -> Result<i64> {
        self.connection().query_row(
            "SELECT COUNT(*) FROM project_media WHERE media_id = ?1",
            params![media],
            |row| row.get(0),
        )
    }

    pub fn projects_for_media(&self, media: &MediaId) -> Result<Vec<ProjectId>> {
        let mut stmt = self.connection().prepare(
            "SELECT project_id FROM project_media WHERE media_id = ?1 ORDER BY project_id",
        )?;
        let projects = stmt
            .query_map(params![media], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn list_associations(&self, project: &ProjectId) -> Result<Vec<Association>> {
        let mut stmt = self.connection().prepare(
            "SELECT project_id, media_id, added_at FROM project_media \
             WHERE project_id = ?1 ORDER BY added_at, media_id",
        )?;
        let associations = stmt
            .query_map(params![project], |row| {
                Ok(Association {
                    project_id: row.get(0)?,
                    media_id: row.get(1)?,
                    added_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(associations)
    }

    // ── Thumbnails ───────────────────────────────────────────────

    /// Insert or replace the single thumbnail owned by a media record.
    pub fn upsert_thumbnail(&self, thumbnail: &ThumbnailRecord) -> Result<()> {
        self.connection().execute(
            "INSERT INTO thumbnail (id, media_id, image, width, height, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(media_id) DO UPDATE SET \
                 id = excluded.id, \
                 image = excluded.image, \
                 width = excluded.width, \
                 height = excluded.height, \
                 created_at = excluded.created_at",
            params![
                thumbnail.id,
                thumbnail.media_id,
                thumbnail.image,
                thumbnail.width,
                thumbnail.height,
                thumbnail.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_thumbnail(&self, media: &MediaId) -> Result<Option<ThumbnailRecord>> {
        self.connection()
            .query_row(
                "SELECT id, media_id, image, width, height, created_at \
                 FROM thumbnail WHERE media_id = ?1",
                params![media],
                |row| {
                    Ok(ThumbnailRecord {
                        id: row.get(0)?,
                        media_id: row.get(1)?,
                        image: row.get(2)?,
                        width: row.get(3)?,
                        height: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
    }

    pub fn delete_thumbnail(&self, media: &MediaId) -> Result<bool> {
        let deleted = self
            .connection()
            .execute("DELETE FROM thumbnail WHERE media_id = ?1", params![media])?;
        Ok(deleted > 0)
    }

    // ── Statistics ───────────────────────────────────────────────

    pub fn library_stats(&self) -> Result<LibraryStats> {
        let (media_count, handle_backed, content_addressed, broken, logical_bytes): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = self.connection().query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(backend = 'handle'), 0), \
                    COALESCE(SUM(backend = 'content'), 0), \
                    COALESCE(SUM(broken_reason IS NOT NULL), 0), \
                    COALESCE(SUM(CASE WHEN backend = 'content' THEN file_size ELSE 0 END), 0) \
             FROM media",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let project_count: i64 = self.connection().query_row(
            "SELECT COUNT(DISTINCT project_id) FROM project_media",
            [],
            |row| row.get(0),
        )?;

        let (content_entries, total_refs, stored_bytes): (i64, i64, i64) =
            self.connection().query_row(
                "SELECT COUNT(*), COALESCE(SUM(ref_count), 0), COALESCE(SUM(size), 0) \
                 FROM content",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        Ok(LibraryStats {
            media_count: media_count as u64,
            handle_backed: handle_backed as u64,
            content_addressed: content_addressed as u64,
            broken: broken as u64,
            project_count: project_count as u64,
            content_entries: content_entries as u64,
            total_refs: total_refs as u64,
            stored_bytes: stored_bytes as u64,
            logical_bytes: logical_bytes as u64,
        })
    }
}
