//! Integration tests for notesync
//!
//! These tests drive complete synchronization runs through the public
//! `Synchronizer` API against in-memory fakes of the local store and the
//! remote service.

use notesync_sync::{SyncEvent, SyncPhase};
use notesync_tests::test_utils::{
    chunk, linked_notebook, note, notebook, resource, saved_search, tag, RemoteCall, SyncHarness,
    FAKE_PNG, SERVER_TIME,
};
use notesync_types::{
    AuthMode, ConcurrencyLimit, Error, ItemKind, Note, Notebook, SavedSearch,
    StopSynchronizationError, SyncChunk, SyncScope, Tag, INK_NOTE_MIME_TYPE,
};
use proptest::prelude::*;
use rstest::rstest;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Notebook, tag and two notes, the second one tagged
fn basic_account_chunk() -> SyncChunk {
    let mut tagged = note("n2", 4, "Groceries", "nb1");
    tagged.tag_guids = vec!["t1".to_string()];
    SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Personal")],
        tags: vec![tag("t1", 2, "todo")],
        searches: vec![saved_search("s1", 2, "diary")],
        notes: vec![note("n1", 3, "Diary", "nb1"), tagged],
        ..chunk(4)
    }
}

#[tokio::test]
async fn test_first_sync_downloads_everything() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());

    let run = harness.sync().await;
    let result = run.result?;

    assert!(result.user_account_download.full_sync);
    assert_eq!(result.user_account_download.download_notes_status.total_new, 2);
    assert_eq!(result.sync_state.update_count(&SyncScope::UserOwn), 4);
    assert!(result.stop_synchronization_error.is_none());

    let store = &harness.local_store;
    let nb1 = store.get::<Notebook>("nb1").ok_or("notebook missing")?;
    let t1 = store.get::<Tag>("t1").ok_or("tag missing")?;
    let n2 = store.get::<Note>("n2").ok_or("note missing")?;
    assert_eq!(n2.content.as_deref(), Some("<en-note>Groceries</en-note>"));
    assert_eq!(n2.notebook_local_id, Some(nb1.local_id));
    assert_eq!(n2.tag_local_ids, vec![t1.local_id]);
    assert!(!n2.locally_modified);
    assert!(store.get::<SavedSearch>("s1").is_some());

    assert!(run
        .events
        .iter()
        .any(|event| matches!(event, SyncEvent::Completed(_))));
    Ok(())
}

#[tokio::test]
async fn test_second_sync_is_idempotent() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    harness.sync().await.result?;

    let puts = harness.local_store.put_count();
    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    assert!(!result.user_account_download.full_sync);
    assert!(harness.note_store.chunk_requests().is_empty());
    assert_eq!(harness.note_store.note_downloads(), 0);
    assert_eq!(harness.local_store.put_count(), puts);
    assert_eq!(result.send_status.total_attempted_to_send_notes, 0);
    Ok(())
}

#[tokio::test]
async fn test_expunge_wins_over_update_in_same_batch() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    harness.sync().await.result?;

    harness.note_store.push_chunk(SyncChunk {
        notes: vec![note("n1", 5, "Diary, edited", "nb1")],
        expunged_notes: vec!["n1".to_string()],
        ..chunk(5)
    });
    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    let notes = &result.user_account_download.download_notes_status;
    assert_eq!(notes.total_expunged, 1);
    assert_eq!(notes.total_updated, 0);
    assert!(harness.local_store.get::<Note>("n1").is_none());
    assert!(harness.local_store.get::<Note>("n2").is_some());
    assert_eq!(harness.note_store.note_downloads(), 0);
    assert_eq!(result.sync_state.update_count(&SyncScope::UserOwn), 5);
    Ok(())
}

#[tokio::test]
async fn test_interrupted_download_resumes_from_cached_chunks() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 100, "Archive")],
        ..chunk(100)
    });
    harness.note_store.push_chunk(SyncChunk {
        notes: vec![note("n1", 250, "Letter", "nb1")],
        ..chunk(250)
    });
    harness
        .note_store
        .fail_chunk_after(100, Error::network("connection reset"));

    let first = harness.sync().await;
    assert!(matches!(first.result, Err(Error::Network { .. })));
    assert!(first
        .events
        .iter()
        .any(|event| matches!(event, SyncEvent::Failed(_))));
    assert_eq!(harness.note_store.chunk_requests(), vec![0, 100]);

    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    assert_eq!(harness.note_store.chunk_requests(), vec![100]);
    assert_eq!(result.sync_state.update_count(&SyncScope::UserOwn), 250);
    let n1 = harness.local_store.get::<Note>("n1").ok_or("note missing")?;
    let nb1 = harness
        .local_store
        .get::<Notebook>("nb1")
        .ok_or("notebook missing")?;
    assert_eq!(n1.notebook_local_id, Some(nb1.local_id));

    // The resumed run must be indistinguishable from one that never failed.
    let uninterrupted = SyncHarness::new()?;
    uninterrupted.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 100, "Archive")],
        ..chunk(100)
    });
    uninterrupted.note_store.push_chunk(SyncChunk {
        notes: vec![note("n1", 250, "Letter", "nb1")],
        ..chunk(250)
    });
    let expected = uninterrupted.sync().await.result?;

    assert_eq!(result.user_account_download, expected.user_account_download);
    let counters = &result.user_account_download.sync_chunks_data_counters;
    assert_eq!(counters.notebooks.total, 1);
    assert_eq!(counters.notebooks.added, 1);
    assert_eq!(result.user_account_download.download_notes_status.total_new, 1);
    assert_eq!(result.sync_state, expected.sync_state);
    assert_eq!(result.send_status, expected.send_status);
    assert_eq!(
        harness.local_store.all::<Note>().len(),
        uninterrupted.local_store.all::<Note>().len()
    );
    assert_eq!(
        harness.local_store.all::<Notebook>().len(),
        uninterrupted.local_store.all::<Notebook>().len()
    );
    assert_eq!(harness.note_store.update_count(), uninterrupted.note_store.update_count());
    Ok(())
}

#[rstest]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn test_note_downloads_respect_concurrency_limit(#[case] limit: usize) -> TestResult {
    let mut harness = SyncHarness::new()?;
    harness.options.max_concurrent_note_downloads = ConcurrencyLimit::new(limit)?;
    harness
        .note_store
        .set_download_delay(Duration::from_millis(10));
    let notes = (1..=12)
        .map(|i| note(&format!("n{}", i), i + 1, &format!("Note {}", i), "nb1"))
        .collect();
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Bulk")],
        notes,
        ..chunk(13)
    });

    let result = harness.sync().await.result?;

    let gauge = harness.note_store.note_download_gauge();
    assert!(gauge.peak() <= limit, "peak {} above limit {}", gauge.peak(), limit);
    assert_eq!(gauge.total(), 12);
    assert_eq!(result.user_account_download.download_notes_status.total_new, 12);
    assert_eq!(harness.local_store.all::<Note>().len(), 12);
    Ok(())
}

#[tokio::test]
async fn test_note_download_limit_above_processing_batch_is_honored() -> TestResult {
    let mut harness = SyncHarness::new()?;
    harness.options.max_concurrent_note_downloads = ConcurrencyLimit::new(100)?;
    harness
        .note_store
        .set_download_delay(Duration::from_millis(50));
    let notes = (1..=80)
        .map(|i| note(&format!("n{}", i), i + 1, &format!("Note {}", i), "nb1"))
        .collect();
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Bulk")],
        notes,
        ..chunk(81)
    });

    let result = harness.sync().await.result?;

    let gauge = harness.note_store.note_download_gauge();
    assert!(gauge.peak() > 32, "peak {} capped below the limit", gauge.peak());
    assert!(gauge.peak() <= 100);
    assert_eq!(gauge.total(), 80);
    assert_eq!(result.user_account_download.download_notes_status.total_new, 80);
    Ok(())
}

#[tokio::test]
async fn test_notebook_name_reused_after_remote_rename() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb2", 1, "Work")],
        notes: vec![note("n1", 2, "Minutes", "nb2")],
        ..chunk(2)
    });
    harness.sync().await.result?;
    let slot = harness
        .local_store
        .get::<Notebook>("nb2")
        .ok_or("notebook missing")?
        .local_id;

    // Another client renamed nb2 and created nb1 under the freed name.
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 3, "Work"), notebook("nb2", 4, "Old")],
        ..chunk(4)
    });
    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    let store = &harness.local_store;
    assert_eq!(store.all::<Notebook>().len(), 2);
    let nb2 = store.get::<Notebook>("nb2").ok_or("renamed notebook missing")?;
    assert_eq!(nb2.local_id, slot);
    assert_eq!(nb2.name, "Old");
    assert!(!nb2.locally_modified);
    let nb1 = store.get::<Notebook>("nb1").ok_or("new notebook missing")?;
    assert_ne!(nb1.local_id, slot);
    assert_eq!(nb1.name, "Work");

    let n1 = store.get::<Note>("n1").ok_or("note missing")?;
    assert_eq!(n1.notebook_local_id, Some(slot));
    assert_eq!(n1.notebook_guid.as_deref(), Some("nb2"));

    assert_eq!(result.send_status.total_attempted_to_send_notebooks, 0);
    assert!(!harness
        .note_store
        .calls()
        .iter()
        .any(|call| matches!(call, RemoteCall::Create(ItemKind::Notebook, _))));
    Ok(())
}

#[tokio::test]
async fn test_notebook_name_collision_renames_local_notebook_in_place() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb2", 1, "Work")],
        notes: vec![note("n1", 2, "Minutes", "nb2")],
        ..chunk(2)
    });
    harness.sync().await.result?;
    let slot = harness
        .local_store
        .get::<Notebook>("nb2")
        .ok_or("notebook missing")?
        .local_id;

    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 3, "Work")],
        ..chunk(3)
    });
    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    let store = &harness.local_store;
    assert_eq!(store.all::<Notebook>().len(), 2);
    let mine = store.get::<Notebook>("nb2").ok_or("local notebook lost its guid")?;
    assert_eq!(mine.local_id, slot);
    assert_eq!(mine.name, "Work - conflicting");
    let n1 = store.get::<Note>("n1").ok_or("note missing")?;
    assert_eq!(n1.notebook_local_id, Some(slot));

    // The rename goes out as an update of the existing remote notebook.
    assert_eq!(result.send_status.total_successfully_sent_notebooks, 1);
    let calls = harness.note_store.calls();
    assert!(calls.contains(&RemoteCall::Update(ItemKind::Notebook, "nb2".to_string())));
    assert!(!calls
        .iter()
        .any(|call| matches!(call, RemoteCall::Create(ItemKind::Notebook, _))));
    Ok(())
}

#[tokio::test]
async fn test_locally_modified_note_is_preserved_as_conflicting_copy() -> TestResult {
    let harness = SyncHarness::new()?;
    let mut mine = note("n1", 40, "Plans", "nb1");
    mine.content = Some("<en-note>my plans</en-note>".to_string());
    mine.locally_modified = true;
    let my_local_id = harness.local_store.insert(mine);

    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 49, "Work")],
        notes: vec![note("n1", 50, "Plans (remote)", "nb1")],
        ..chunk(50)
    });

    let result = harness.sync().await.result?;

    let notes = harness.local_store.all::<Note>();
    assert_eq!(notes.len(), 2);

    let theirs = harness.local_store.get::<Note>("n1").ok_or("remote note missing")?;
    assert_eq!(theirs.local_id, my_local_id);
    assert_eq!(theirs.usn, Some(50));
    assert_eq!(theirs.title, "Plans (remote)");
    assert!(!theirs.locally_modified);

    let copy = notes
        .iter()
        .find(|note| note.conflict_source_note_guid.as_deref() == Some("n1"))
        .ok_or("conflicting copy missing")?;
    assert_ne!(copy.local_id, my_local_id);
    assert_eq!(copy.content.as_deref(), Some("<en-note>my plans</en-note>"));
    assert!(copy.title.starts_with("Plans"));

    // The copy is new to the remote service and gets uploaded.
    assert_eq!(result.send_status.total_successfully_sent_notes, 1);
    assert!(copy.guid.as_deref().is_some_and(|guid| guid != "n1"));
    Ok(())
}

#[tokio::test]
async fn test_send_conflict_requests_another_pass() -> TestResult {
    let mut harness = SyncHarness::new()?;
    harness.options.max_sync_repeats = 1;
    let mut mine = note("n1", 5, "Shared draft", "nb1");
    mine.locally_modified = true;
    harness.local_store.insert(mine);

    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 4, "Drafts")],
        notes: vec![note("n1", 5, "Shared draft", "nb1")],
        ..chunk(5)
    });
    harness.note_store.reject_updates_of("n1");

    let result = harness.sync().await.result?;

    let send = &result.send_status;
    assert!(send.need_to_repeat_incremental_sync);
    assert_eq!(result.repeats, 1);
    assert_eq!(send.failed_to_send_notes.len(), 2);
    assert!(send
        .failed_to_send_notes
        .iter()
        .all(|failure| matches!(failure.error, Error::Conflict { .. })));
    assert!(harness
        .note_store
        .calls()
        .contains(&RemoteCall::GetNote("n1".to_string())));

    let local = harness.local_store.get::<Note>("n1").ok_or("note missing")?;
    assert!(local.locally_modified);
    Ok(())
}

#[tokio::test]
async fn test_new_local_items_are_sent_with_references() -> TestResult {
    let harness = SyncHarness::new()?;
    let parent = Tag {
        name: "projects".to_string(),
        locally_modified: true,
        ..Default::default()
    };
    let child = Tag {
        name: "garden".to_string(),
        parent_local_id: Some(parent.local_id),
        locally_modified: true,
        ..Default::default()
    };
    let book = Notebook {
        name: "Outdoors".to_string(),
        locally_modified: true,
        ..Default::default()
    };
    let entry = Note {
        title: "Seeds to buy".to_string(),
        content: Some("<en-note>tomatoes</en-note>".to_string()),
        notebook_local_id: Some(book.local_id),
        tag_local_ids: vec![child.local_id],
        locally_modified: true,
        ..Default::default()
    };
    let child_id = harness.local_store.insert(child);
    let parent_id = harness.local_store.insert(parent);
    let book_id = harness.local_store.insert(book);
    let entry_id = harness.local_store.insert(entry);

    let result = harness.sync().await.result?;

    let send = &result.send_status;
    assert_eq!(send.total_successfully_sent_tags, 2);
    assert_eq!(send.total_successfully_sent_notebooks, 1);
    assert_eq!(send.total_successfully_sent_notes, 1);
    assert!(!send.need_to_repeat_incremental_sync);

    let creates: Vec<_> = harness
        .note_store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RemoteCall::Create(kind, name) => Some((kind, name)),
            _ => None,
        })
        .collect();
    assert_eq!(
        creates,
        vec![
            (ItemKind::Tag, "projects".to_string()),
            (ItemKind::Tag, "garden".to_string()),
            (ItemKind::Notebook, "Outdoors".to_string()),
            (ItemKind::Note, "Seeds to buy".to_string()),
        ]
    );

    let store = &harness.local_store;
    let parent = store.get_local::<Tag>(parent_id).ok_or("parent missing")?;
    let child = store.get_local::<Tag>(child_id).ok_or("child missing")?;
    let book = store.get_local::<Notebook>(book_id).ok_or("notebook missing")?;
    let entry = store.get_local::<Note>(entry_id).ok_or("note missing")?;
    assert_eq!(child.parent_guid, parent.guid);
    assert!(!entry.locally_modified);
    let remote = harness
        .note_store
        .remote_note(entry.guid.as_deref().ok_or("note has no guid")?)
        .ok_or("note not on the server")?;
    assert_eq!(remote.notebook_guid, book.guid);
    assert_eq!(remote.tag_guids, child.guid.into_iter().collect::<Vec<_>>());

    // USNs 1 to 4 were all ours, so the watermark moved without a download.
    harness.note_store.clear_calls();
    let again = harness.sync().await.result?;
    assert!(harness.note_store.chunk_requests().is_empty());
    assert_eq!(again.sync_state.update_count(&SyncScope::UserOwn), 4);
    Ok(())
}

#[tokio::test]
async fn test_note_is_held_back_until_its_notebook_is_sent() -> TestResult {
    let harness = SyncHarness::new()?;
    let label = Tag {
        name: "baking".to_string(),
        locally_modified: true,
        ..Default::default()
    };
    let book = Notebook {
        name: "Recipes".to_string(),
        locally_modified: true,
        ..Default::default()
    };
    let entry = Note {
        title: "Sourdough".to_string(),
        content: Some("<en-note>flour, water</en-note>".to_string()),
        notebook_local_id: Some(book.local_id),
        tag_local_ids: vec![label.local_id],
        locally_modified: true,
        ..Default::default()
    };
    let label_id = harness.local_store.insert(label);
    let book_id = harness.local_store.insert(book);
    let entry_id = harness.local_store.insert(entry);
    harness.note_store.fail_create_of(
        ItemKind::Notebook,
        "Recipes",
        Error::remote("notebook quota exceeded"),
    );

    let result = harness.sync().await.result?;

    let send = &result.send_status;
    assert_eq!(send.total_successfully_sent_tags, 1);
    assert_eq!(send.failed_to_send_notebooks.len(), 1);
    assert_eq!(send.total_attempted_to_send_notes, 1);
    assert_eq!(send.total_successfully_sent_notes, 0);
    assert_eq!(send.failed_to_send_notes.len(), 1);
    assert!(!harness
        .note_store
        .calls()
        .contains(&RemoteCall::Create(ItemKind::Note, "Sourdough".to_string())));
    let entry = harness.local_store.get_local::<Note>(entry_id).ok_or("note missing")?;
    assert!(entry.locally_modified);
    assert!(entry.guid.is_none());

    // Once the notebook exists remotely the note follows with both references.
    let again = harness.sync().await.result?;
    assert_eq!(again.send_status.total_successfully_sent_notebooks, 1);
    assert_eq!(again.send_status.total_successfully_sent_notes, 1);

    let store = &harness.local_store;
    let label = store.get_local::<Tag>(label_id).ok_or("tag missing")?;
    let book = store.get_local::<Notebook>(book_id).ok_or("notebook missing")?;
    let entry = store.get_local::<Note>(entry_id).ok_or("note missing")?;
    let remote = harness
        .note_store
        .remote_note(entry.guid.as_deref().ok_or("note has no guid")?)
        .ok_or("note not on the server")?;
    assert!(book.guid.is_some());
    assert_eq!(remote.notebook_guid, book.guid);
    assert_eq!(remote.tag_guids, label.guid.into_iter().collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_remote_changes_require_download() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Inbox")],
        ..chunk(1)
    });
    harness.sync().await.result?;

    harness.local_store.insert(Notebook {
        name: "Later".to_string(),
        locally_modified: true,
        ..Default::default()
    });
    // Another client writes USN 2 before our notebook gets USN 3.
    harness.note_store.interleave_foreign_changes(1);

    let result = harness.sync().await.result?;

    assert_eq!(result.send_status.total_successfully_sent_notebooks, 1);
    assert!(result.send_status.need_to_repeat_incremental_sync);
    assert_eq!(result.repeats, 1);
    assert_eq!(result.sync_state.update_count(&SyncScope::UserOwn), 3);
    Ok(())
}

#[tokio::test]
async fn test_full_sync_expunges_stale_local_data() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.local_store.insert(notebook("old-nb", 3, "Old"));
    harness.local_store.insert(note("old-note", 4, "Gone", "old-nb"));
    harness.local_store.insert(Notebook {
        locally_modified: true,
        ..notebook("edited-nb", 5, "Edited")
    });
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("kept", 10, "Kept")],
        ..chunk(10)
    });

    let result = harness.sync().await.result?;

    let stale = &result.user_account_download.stale_data_expunge_status;
    assert_eq!(stale.expunged, 2);
    assert_eq!(stale.detached, 1);
    assert!(stale.failures.is_empty());

    let store = &harness.local_store;
    assert!(store.get::<Notebook>("old-nb").is_none());
    assert!(store.get::<Note>("old-note").is_none());
    assert!(store.get::<Notebook>("kept").is_some());

    // The detached notebook is re-created under a new guid.
    let edited = store
        .all::<Notebook>()
        .into_iter()
        .find(|notebook| notebook.name == "Edited")
        .ok_or("edited notebook missing")?;
    assert!(edited.guid.as_deref().is_some_and(|guid| guid != "edited-nb"));
    assert_eq!(result.send_status.total_successfully_sent_notebooks, 1);
    Ok(())
}

#[tokio::test]
async fn test_server_requested_full_sync_restarts_from_zero() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    harness.sync().await.result?;

    harness
        .note_store
        .set_full_sync_before(SERVER_TIME + 1);
    harness.note_store.clear_calls();
    let result = harness.sync().await.result?;

    assert!(result.user_account_download.full_sync);
    assert_eq!(harness.note_store.chunk_requests(), vec![0]);
    assert_eq!(harness.local_store.all::<Note>().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_linked_notebook_failure_is_isolated() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        linked_notebooks: vec![
            linked_notebook("ln-ok", 1, "Team"),
            linked_notebook("ln-down", 2, "Family"),
        ],
        ..chunk(2)
    });
    let team = harness.linked_notebook_store("ln-ok");
    team.push_chunk(SyncChunk {
        notebooks: vec![notebook("team-nb", 7, "Team notes")],
        notes: vec![note("team-note", 8, "Standup", "team-nb")],
        ..chunk(8)
    });

    let run = harness.sync().await;
    let result = run.result?;

    assert!(result.linked_notebook_errors.contains_key("ln-down"));
    assert!(result.linked_notebook_downloads.contains_key("ln-ok"));
    assert_eq!(
        result
            .sync_state
            .update_count(&SyncScope::LinkedNotebook("ln-ok".to_string())),
        8
    );
    assert_eq!(
        result
            .sync_state
            .update_count(&SyncScope::LinkedNotebook("ln-down".to_string())),
        0
    );

    let shared = harness
        .local_store
        .get::<Note>("team-note")
        .ok_or("linked note missing")?;
    assert_eq!(shared.linked_notebook_guid.as_deref(), Some("ln-ok"));
    assert!(run.events.iter().any(|event| matches!(
        event,
        SyncEvent::ScopeFailed { scope: SyncScope::LinkedNotebook(guid), .. } if guid == "ln-down"
    )));
    Ok(())
}

#[tokio::test]
async fn test_expunged_linked_notebook_data_is_removed() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        linked_notebooks: vec![linked_notebook("ln-1", 1, "Team")],
        ..chunk(1)
    });
    let team = harness.linked_notebook_store("ln-1");
    team.push_chunk(SyncChunk {
        notebooks: vec![notebook("team-nb", 3, "Team notes")],
        notes: vec![note("team-note", 4, "Standup", "team-nb")],
        ..chunk(4)
    });
    harness.sync().await.result?;
    assert!(harness.local_store.get::<Note>("team-note").is_some());

    harness.note_store.push_chunk(SyncChunk {
        expunged_linked_notebooks: vec!["ln-1".to_string()],
        ..chunk(2)
    });
    let result = harness.sync().await.result?;

    assert!(harness.local_store.get::<Note>("team-note").is_none());
    assert!(harness.local_store.get::<Notebook>("team-nb").is_none());
    assert!(result.linked_notebook_downloads.is_empty());
    assert_eq!(harness.auth.cleared_linked_notebooks(), vec!["ln-1".to_string()]);
    assert_eq!(
        result
            .sync_state
            .update_count(&SyncScope::LinkedNotebook("ln-1".to_string())),
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_stops_and_next_run_resumes() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Inbox")],
        notes: vec![
            note("n1", 2, "One", "nb1"),
            note("n2", 3, "Two", "nb1"),
            note("n3", 4, "Three", "nb1"),
        ],
        ..chunk(4)
    });
    harness.note_store.fail_note(
        "n2",
        Error::RateLimitReached {
            duration_secs: Some(30),
        },
    );

    let run = harness.sync().await;
    let stopped = run.result?;

    let stop = Some(StopSynchronizationError::RateLimitReached {
        duration_secs: Some(30),
    });
    assert_eq!(stopped.stop_synchronization_error, stop);
    assert_eq!(stopped.sync_state.update_count(&SyncScope::UserOwn), 0);
    assert_eq!(stopped.send_status.total_attempted_to_send_notes, 0);
    assert!(harness.local_store.get::<Note>("n2").is_none());
    assert!(run
        .events
        .iter()
        .any(|event| matches!(event, SyncEvent::Stopped(_))));

    harness.note_store.clear_note_failures();
    harness.note_store.clear_calls();
    let resumed = harness.sync().await.result?;

    assert!(resumed.stop_synchronization_error.is_none());
    // The cached chunk already reached the account's update count.
    assert!(harness.note_store.chunk_requests().is_empty());
    assert!(harness.local_store.get::<Note>("n2").is_some());
    assert_eq!(harness.local_store.all::<Note>().len(), 3);
    assert_eq!(resumed.sync_state.update_count(&SyncScope::UserOwn), 4);
    Ok(())
}

#[tokio::test]
async fn test_expired_cached_authentication_is_retried() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    harness
        .note_store
        .fail_next_sync_state(Error::AuthenticationExpired);

    let result = harness.sync().await.result?;

    assert!(result.stop_synchronization_error.is_none());
    assert_eq!(harness.auth.modes(), vec![AuthMode::Cache, AuthMode::NoCache]);
    assert_eq!(harness.auth.cleared_users(), vec![42]);
    assert_eq!(harness.auth.cleared_all(), 1);
    assert_eq!(harness.local_store.all::<Note>().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_protocol_version_mismatch_fails_before_download() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    harness.user_store.set_version_supported(false);

    let run = harness.sync().await;

    assert!(matches!(run.result, Err(Error::ProtocolVersion { .. })));
    assert!(harness.note_store.calls().is_empty());
    assert!(run
        .events
        .iter()
        .any(|event| matches!(event, SyncEvent::Failed(_))));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_sync_reports_cancellation() -> TestResult {
    let harness = SyncHarness::new()?;
    harness.note_store.push_chunk(basic_account_chunk());
    let canceler = CancellationToken::new();
    canceler.cancel();

    let run = harness.sync_with(canceler).await;

    assert!(matches!(run.result, Err(Error::Cancelled)));
    assert!(harness.local_store.all::<Note>().is_empty());
    assert!(run
        .events
        .iter()
        .any(|event| matches!(event, SyncEvent::PhaseChanged(SyncPhase::Cancelled))));
    Ok(())
}

#[tokio::test]
async fn test_thumbnails_and_ink_images_are_downloaded() -> TestResult {
    let mut harness = SyncHarness::new()?;
    let ink_dir = harness.temp_dir.path().join("ink");
    harness.options = harness
        .options
        .clone()
        .with_note_thumbnails(true)
        .with_ink_note_images_storage_dir(&ink_dir);

    let mut sketch = note("n1", 3, "Sketch", "nb1");
    sketch.resources = vec![resource("r1", 2, "n1", INK_NOTE_MIME_TYPE)];
    harness.note_store.push_chunk(SyncChunk {
        notebooks: vec![notebook("nb1", 1, "Drawings")],
        notes: vec![sketch],
        ..chunk(3)
    });

    harness.sync().await.result?;

    let stored = harness.local_store.get::<Note>("n1").ok_or("note missing")?;
    assert_eq!(stored.thumbnail.as_deref(), Some(FAKE_PNG));
    assert_eq!(stored.resources.len(), 1);
    assert_eq!(stored.resources[0].note_local_id, Some(stored.local_id));
    assert!(stored.resources[0].data.is_some());

    let image = tokio::fs::read(ink_dir.join("r1.png")).await?;
    assert_eq!(image, FAKE_PNG);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_interrupted_download_converges(chunks in 2usize..5, interrupted_after in 1usize..4) {
        let interrupted_after = interrupted_after.min(chunks - 1);
        tokio_test::block_on(async {
            let harness = SyncHarness::new().expect("harness");
            for i in 1..=chunks {
                let usn = (i * 10) as i32;
                harness.note_store.push_chunk(SyncChunk {
                    notebooks: vec![notebook(&format!("nb{}", i), usn, &format!("Book {}", i))],
                    ..chunk(usn)
                });
            }
            harness
                .note_store
                .fail_chunk_after((interrupted_after * 10) as i32, Error::network("dropped"));

            let first = harness.sync().await;
            prop_assert!(first.result.is_err());

            harness.note_store.clear_calls();
            let result = harness.sync().await.result.expect("resumed sync");

            prop_assert!(!harness.note_store.chunk_requests().contains(&0));
            prop_assert_eq!(harness.local_store.all::<Notebook>().len(), chunks);
            prop_assert_eq!(
                result.sync_state.update_count(&SyncScope::UserOwn),
                (chunks * 10) as i32
            );
            Ok(())
        })?;
    }
}
