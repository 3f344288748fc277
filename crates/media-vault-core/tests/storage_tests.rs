use chrono::Utc;
use media_vault_core::hasher::hash_bytes;
use media_vault_core::storage::models::*;
use media_vault_core::storage::Database;
use media_vault_core::{AccessErrorKind, ExternalHandle};

fn make_content_record(id: &str, name: &str, size: u64, data: &[u8]) -> MediaRecord {
    MediaRecord {
        id: MediaId::from(id),
        backend: StorageBackend::ContentAddressed {
            hash: hash_bytes(data),
        },
        file_name: name.to_string(),
        file_size: size,
        mime_type: "video/mp4".to_string(),
        properties: MediaProperties {
            duration: Some(12.5),
            width: Some(1920),
            height: Some(1080),
            fps: Some(25.0),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            ..MediaProperties::default()
        },
        thumbnail_id: None,
        broken_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn make_handle_record(id: &str, path: &str) -> MediaRecord {
    MediaRecord {
        id: MediaId::from(id),
        backend: StorageBackend::HandleBacked {
            external_handle: ExternalHandle::new(path),
        },
        file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
        file_size: 2048,
        mime_type: "audio/wav".to_string(),
        properties: MediaProperties {
            channels: Some(2),
            sample_rate: Some(48_000),
            ..MediaProperties::default()
        },
        thumbnail_id: None,
        broken_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn test_schema_version_is_set() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.schema_version().unwrap(), 1);
}

#[test]
fn test_content_refcount_lifecycle() {
    let db = Database::open_in_memory().unwrap();
    let hash = hash_bytes(b"clip");

    assert_eq!(db.increment_content(&hash, 4).unwrap(), 1);
    assert_eq!(db.increment_content(&hash, 4).unwrap(), 2);
    assert_eq!(db.decrement_content(&hash).unwrap(), Some(1));
    assert_eq!(db.decrement_content(&hash).unwrap(), Some(0));

    // Never goes negative; the caller decides what an underflow means.
    assert_eq!(db.decrement_content(&hash).unwrap(), None);
    assert_eq!(db.get_content(&hash).unwrap().unwrap().ref_count, 0);

    assert!(db.delete_content_record(&hash).unwrap());
    assert!(db.get_content(&hash).unwrap().is_none());
    assert_eq!(db.decrement_content(&hash).unwrap(), None);
}

#[test]
fn test_insert_and_query_media() {
    let db = Database::open_in_memory().unwrap();
    let video = make_content_record("m1", "clip.mp4", 4096, b"clip");
    let audio = make_handle_record("m2", "/home/user/voice.wav");
    db.insert_media(&video).unwrap();
    db.insert_media(&audio).unwrap();

    let loaded = db.get_media(&video.id).unwrap().unwrap();
    assert_eq!(loaded.backend, video.backend);
    assert_eq!(loaded.properties, video.properties);
    assert_eq!(loaded.kind(), Some(MediaKind::Video));

    let loaded = db.get_media(&audio.id).unwrap().unwrap();
    assert_eq!(
        loaded.external_handle().unwrap().path(),
        std::path::Path::new("/home/user/voice.wav")
    );
    assert_eq!(loaded.properties.sample_rate, Some(48_000));

    assert_eq!(db.list_all_media().unwrap().len(), 2);
    assert_eq!(db.count_media_with_hash(&hash_bytes(b"clip")).unwrap(), 1);
}

#[test]
fn test_associations_and_duplicate_lookup() {
    let db = Database::open_in_memory().unwrap();
    let project_a = ProjectId::from("project-a");
    let project_b = ProjectId::from("project-b");
    let media = make_content_record("m1", "clip.mp4", 4096, b"clip");
    db.insert_media(&media).unwrap();

    assert!(db.add_association(&project_a, &media.id).unwrap());
    assert!(!db.add_association(&project_a, &media.id).unwrap());
    assert!(db.add_association(&project_b, &media.id).unwrap());
    assert_eq!(db.count_associations(&media.id).unwrap(), 2);
    assert!(db.has_association(&project_a, &media.id).unwrap());
    let listed = db.list_associations(&project_b).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].media_id, media.id);

    let found = db
        .find_duplicate_in_project(&project_a, "clip.mp4", 4096)
        .unwrap();
    assert_eq!(found.map(|m| m.id), Some(media.id.clone()));
    assert!(db
        .find_duplicate_in_project(&project_a, "clip.mp4", 4095)
        .unwrap()
        .is_none());
    assert!(db
        .find_duplicate_in_project(&ProjectId::from("other"), "clip.mp4", 4096)
        .unwrap()
        .is_none());

    assert!(db.remove_association(&project_a, &media.id).unwrap());
    assert!(!db.remove_association(&project_a, &media.id).unwrap());
    assert!(!db.has_association(&project_a, &media.id).unwrap());
    assert_eq!(db.projects_for_media(&media.id).unwrap(), vec![project_b.clone()]);
    assert_eq!(db.list_project_media(&project_b).unwrap().len(), 1);
    assert!(db.list_project_media(&project_a).unwrap().is_empty());
}

#[test]
fn test_deleting_media_cascades() {
    let db = Database::open_in_memory().unwrap();
    let project = ProjectId::from("p");
    let media = make_content_record("m1", "clip.mp4", 4096, b"clip");
    db.insert_media(&media).unwrap();
    db.add_association(&project, &media.id).unwrap();
    db.upsert_thumbnail(&ThumbnailRecord {
        id: "t1".to_string(),
        media_id: media.id.clone(),
        image: vec![1, 2, 3],
        width: 320,
        height: 180,
        created_at: Utc::now(),
    })
    .unwrap();

    assert!(db.delete_media(&media.id).unwrap());
    assert!(db.get_thumbnail(&media.id).unwrap().is_none());
    assert_eq!(db.count_associations(&media.id).unwrap(), 0);
    assert!(!db.delete_media(&media.id).unwrap());
}

#[test]
fn test_thumbnail_upsert_replaces() {
    let db = Database::open_in_memory().unwrap();
    let media = make_handle_record("m1", "/footage/a.wav");
    db.insert_media(&media).unwrap();

    for (id, image) in [("t1", vec![1u8]), ("t2", vec![2u8, 2])] {
        db.upsert_thumbnail(&ThumbnailRecord {
            id: id.to_string(),
            media_id: media.id.clone(),
            image,
            width: 16,
            height: 9,
            created_at: Utc::now(),
        })
        .unwrap();
    }

    let thumbnail = db.get_thumbnail(&media.id).unwrap().unwrap();
    assert_eq!(thumbnail.id, "t2");
    assert_eq!(thumbnail.image, vec![2, 2]);
    assert!(db.delete_thumbnail(&media.id).unwrap());
    assert!(!db.delete_thumbnail(&media.id).unwrap());
}

#[test]
fn test_relink_and_broken_flag() {
    let db = Database::open_in_memory().unwrap();
    let handle_media = make_handle_record("m1", "/old/place/a.wav");
    let content_media = make_content_record("m2", "clip.mp4", 4096, b"clip");
    db.insert_media(&handle_media).unwrap();
    db.insert_media(&content_media).unwrap();

    db.set_media_broken(&handle_media.id, Some(AccessErrorKind::FileMissing), Utc::now())
        .unwrap();
    let broken = db.get_media(&handle_media.id).unwrap().unwrap();
    assert_eq!(broken.broken_reason, Some(AccessErrorKind::FileMissing));
    assert!(broken.is_broken());

    let moved = ExternalHandle::new("/new/place/b.wav");
    assert!(db
        .update_media_source(&handle_media.id, &moved, "b.wav", "audio/wav", 4096, Utc::now())
        .unwrap());
    let relinked = db.get_media(&handle_media.id).unwrap().unwrap();
    assert_eq!(relinked.file_name, "b.wav");
    assert_eq!(relinked.mime_type, "audio/wav");
    assert_eq!(relinked.file_size, 4096);
    assert!(relinked.broken_reason.is_none());
    assert_eq!(relinked.external_handle(), Some(&moved));

    // Content-addressed media have no external source to replace.
    assert!(!db
        .update_media_source(&content_media.id, &moved, "b.wav", "audio/wav", 4096, Utc::now())
        .unwrap());
}

#[test]
fn test_transaction_rolls_back_on_error() {
    let db = Database::open_in_memory().unwrap();
    let media = make_content_record("m1", "clip.mp4", 4096, b"clip");

    let result: Result<(), rusqlite::Error> = db.in_transaction(|db| {
        db.insert_media(&media)?;
        db.insert_media(&media)?;
        Ok(())
    });
    assert!(result.is_err());
    assert!(db.get_media(&media.id).unwrap().is_none());
}

#[test]
fn test_library_stats() {
    let db = Database::open_in_memory().unwrap();
    let project = ProjectId::from("p");
    let a = make_content_record("m1", "a.mp4", 100, b"same");
    let b = make_content_record("m2", "b.mp4", 100, b"same");
    let c = make_handle_record("m3", "/x/c.wav");
    for media in [&a, &b, &c] {
        db.insert_media(media).unwrap();
        db.add_association(&project, &media.id).unwrap();
    }
    let hash = hash_bytes(b"same");
    db.increment_content(&hash, 100).unwrap();
    db.increment_content(&hash, 100).unwrap();

    let stats = db.library_stats().unwrap();
    assert_eq!(stats.media_count, 3);
    assert_eq!(stats.handle_backed, 1);
    assert_eq!(stats.content_addressed, 2);
    assert_eq!(stats.project_count, 1);
    assert_eq!(stats.content_entries, 1);
    assert_eq!(stats.total_refs, 2);
    assert_eq!(stats.stored_bytes, 100);
    assert_eq!(stats.logical_bytes, 200);
    assert_eq!(stats.dedup_savings(), 100);
}
