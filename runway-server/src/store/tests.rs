use chrono::Utc;
use serde_json::json;

use runway_core::RunState;

use super::*;

fn store() -> ControlStore {
    ControlStore::open_in_memory().expect("should create in-memory store")
}

fn new_run(id: &str) -> NewRun {
    NewRun {
        id: id.to_string(),
        title: format!("Run {id}"),
        prompt: "add a link to the footer".to_string(),
        route: Some("/codex".to_string()),
        created_by: None,
        parent_run_id: None,
    }
}

#[test]
fn test_schema_version_is_set() {
    let store = store();
    let conn = store.conn.lock().expect("mutex poisoned");
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .expect("should query version");
    assert_eq!(version, SCHEMA_VERSION);
}

#[test]
fn test_migrations_are_idempotent_on_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("runway.db");
    {
        let _store = ControlStore::open(&path).expect("first open should succeed");
    }
    {
        let _store = ControlStore::open(&path).expect("second open should succeed");
    }
}

#[test]
fn test_rejects_newer_schema_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("runway.db");
    {
        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .expect("set version");
    }
    match ControlStore::open(&path) {
        Ok(_) => panic!("should reject newer schema version"),
        Err(e) => assert!(e.to_string().contains("newer than supported")),
    }
}

#[test]
fn test_insert_and_get_run() {
    let store = store();
    let run = store
        .with_tx::<_, StoreError, _>(|tx| tx.insert_run(&new_run("R1"), Utc::now()))
        .expect("insert");
    assert_eq!(run.id, "R1");
    assert_eq!(run.status, RunState::Queued);
    assert!(run.slot_id.is_none());

    let loaded = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_run("R1"))
        .expect("get")
        .expect("run exists");
    assert_eq!(loaded, run);

    let missing = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_run("nope"))
        .expect("get");
    assert!(missing.is_none());
}

#[test]
fn test_rollback_on_error_discards_writes() {
    let store = store();
    let result: Result<(), StoreError> = store.with_tx(|tx| {
        tx.insert_run(&new_run("R1"), Utc::now())?;
        Err(StoreError::Storage("forced failure".to_string()))
    });
    assert!(result.is_err());

    let missing = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_run("R1"))
        .expect("get");
    assert!(missing.is_none(), "rolled-back insert should not persist");
}

#[test]
fn test_list_runs_filters_by_status_and_route() {
    let store = store();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            let now = Utc::now();
            tx.insert_run(&new_run("R1"), now)?;
            tx.insert_run(&new_run("R2"), now)?;
            let mut other = new_run("R3");
            other.route = Some("/settings".to_string());
            tx.insert_run(&other, now)?;
            tx.update_run_status("R2", RunState::Planning, now)?;
            Ok(())
        })
        .expect("setup");

    let (queued, total) = store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.list_runs(&RunFilter {
                statuses: vec![RunState::Queued],
                route: None,
                limit: 50,
                offset: 0,
            })
        })
        .expect("list");
    assert_eq!(total, 2);
    assert!(queued.iter().all(|run| run.status == RunState::Queued));

    let (by_route, total) = store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.list_runs(&RunFilter {
                statuses: vec![],
                route: Some("/codex".to_string()),
                limit: 50,
                offset: 0,
            })
        })
        .expect("list");
    assert_eq!(total, 2);
    assert!(by_route.iter().all(|run| run.route.as_deref() == Some("/codex")));
}

#[test]
fn test_run_context_round_trip() {
    let store = store();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.insert_run(&new_run("R1"), Utc::now())?;
            tx.insert_run_context(&RunContextRow {
                run_id: "R1".to_string(),
                route: Some("/codex".to_string()),
                page_title: Some("Codex".to_string()),
                element_hint: None,
                note: Some("footer link".to_string()),
                metadata: Some(json!({"trace_id": "t-1"})),
            })
        })
        .expect("setup");

    let context = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_run_context("R1"))
        .expect("get")
        .expect("context exists");
    assert_eq!(context.metadata, Some(json!({"trace_id": "t-1"})));
    assert_eq!(context.note.as_deref(), Some("footer link"));
}

#[test]
fn test_event_payload_normalization_and_ordering() {
    let store = store();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            let now = Utc::now();
            tx.insert_run(&new_run("R1"), now)?;
            tx.append_run_event(
                AppendRunEvent::new("R1", "run_created")
                    .status(None, Some(RunState::Queued))
                    .payload(json!({"source": "api"})),
                now,
            )?;
            tx.append_run_event(
                AppendRunEvent::new("R1", "status_transition")
                    .status(Some(RunState::Queued), Some(RunState::Planning))
                    .trace(Some("t-9")),
                now,
            )?;
            Ok(())
        })
        .expect("setup");

    let events = store
        .with_tx::<_, StoreError, _>(|tx| tx.list_run_events("R1", 200))
        .expect("list");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "run_created");
    assert_eq!(
        events[0].payload.as_ref().unwrap()["schema_version"],
        json!(EVENT_SCHEMA_VERSION)
    );
    assert_eq!(events[1].payload.as_ref().unwrap()["trace_id"], json!("t-9"));
    assert!(events[0].id < events[1].id);
}

#[test]
fn test_audit_entries_carry_payload_hash() {
    let store = store();
    let payload = json!({"slot_id": "preview-1", "run_id": "R1"});
    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.append_audit(
                Some("reviewer-7"),
                "worktree.assign",
                &payload,
                AuditKeys {
                    run_id: Some("R1"),
                    slot_id: Some("preview-1"),
                    commit_sha: None,
                    trace_id: Some("t-1"),
                },
                Utc::now(),
            )
        })
        .expect("append");

    let (action, hash, actor): (String, String, Option<String>) = {
        let conn = store.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT action, payload_hash, actor FROM audit_log",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("audit row")
    };
    assert_eq!(action, "worktree.assign");
    assert_eq!(hash, payload_hash(&payload));
    assert_eq!(hash.len(), 64);
    assert_eq!(actor.as_deref(), Some("reviewer-7"));
}

#[test]
fn test_payload_hash_is_stable_across_key_order() {
    let a = json!({"a": 1, "b": 2});
    let b = json!({"b": 2, "a": 1});
    assert_eq!(payload_hash(&a), payload_hash(&b));
}

#[test]
fn test_slot_lease_cycle() {
    let store = store();
    let now = Utc::now();
    let expiry = now + chrono::Duration::seconds(1800);

    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.ensure_slot_lease_row("preview-1")?;
            tx.ensure_slot_lease_row("preview-1")?; // idempotent
            tx.mark_slot_leased("preview-1", "R1", now, expiry)?;
            Ok(())
        })
        .expect("lease");

    let lease = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_slot_lease("preview-1"))
        .expect("get")
        .expect("lease exists");
    assert_eq!(lease.lease_state, "leased");
    assert_eq!(lease.run_id.as_deref(), Some("R1"));
    assert!(lease.is_active(now));
    assert!(!lease.is_stale(now));

    store
        .with_tx::<_, StoreError, _>(|tx| tx.mark_slot_released("preview-1", now))
        .expect("release");
    let lease = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_slot_lease("preview-1"))
        .expect("get")
        .expect("lease exists");
    assert_eq!(lease.lease_state, "released");
    assert!(lease.run_id.is_none());
}

#[test]
fn test_stale_lease_detection() {
    let store = store();
    let now = Utc::now();
    let past = now - chrono::Duration::seconds(10);

    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.mark_slot_leased("preview-1", "R1", past, past)
        })
        .expect("lease");

    let lease = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_slot_lease("preview-1"))
        .expect("get")
        .expect("lease exists");
    assert!(!lease.is_active(now));
    assert!(lease.is_stale(now));
}

#[test]
fn test_binding_upsert_and_release() {
    let store = store();
    let now = Utc::now();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.upsert_active_binding(
                "preview-1",
                "R1",
                "codex/run-R1",
                "/srv/runway/worktrees/preview-1",
                "assigned",
                now,
            )
        })
        .expect("bind");

    let binding = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
        .expect("get")
        .expect("binding exists");
    assert!(binding.is_active());
    assert_eq!(binding.last_action, "assigned");

    store
        .with_tx::<_, StoreError, _>(|tx| tx.mark_binding_released("preview-1", now))
        .expect("release");
    let binding = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
        .expect("get")
        .expect("binding exists");
    assert!(!binding.is_active());
    assert_eq!(binding.last_action, "cleaned_up");
    assert!(binding.run_id.is_none());
    assert!(binding.released_at.is_some());
}

#[test]
fn test_preview_db_reset_provenance_round_trip() {
    let store = store();
    let now = Utc::now();
    let id = store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.insert_preview_db_reset(
                "R1",
                "preview-1",
                "app_preview_1",
                "seed",
                Some("v1"),
                None,
                "applied",
                &json!({"steps": [{"name": "drop_and_recreate", "ok": true}]}),
                now,
                Some(now),
            )
        })
        .expect("insert");

    let row = store
        .with_tx::<_, StoreError, _>(|tx| tx.get_preview_db_reset(id))
        .expect("get")
        .expect("row exists");
    assert_eq!(row.db_name, "app_preview_1");
    assert_eq!(row.reset_status, "applied");
    assert_eq!(row.details.as_ref().unwrap()["steps"][0]["ok"], json!(true));
}

#[test]
fn test_release_upsert_stamps_deployed_at_once() {
    let store = store();
    let now = Utc::now();

    let release = store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.upsert_release("abc123", "abc123", "deployed", None, now)
        })
        .expect("upsert");
    assert_eq!(release.status, "deployed");
    let first_deployed_at = release.deployed_at.expect("deployed_at set");

    let later = now + chrono::Duration::seconds(60);
    let replaced = store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.upsert_release("abc123", "abc123", "replaced", None, later)
        })
        .expect("upsert");
    assert_eq!(replaced.status, "replaced");
    assert_eq!(replaced.deployed_at, Some(first_deployed_at));
}

#[test]
fn test_latest_deployed_release() {
    let store = store();
    let now = Utc::now();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.upsert_release("sha-old", "sha-old", "deployed", None, now)?;
            tx.upsert_release("sha-old", "sha-old", "replaced", None, now)?;
            tx.upsert_release("sha-new", "sha-new", "deployed", None, now)?;
            Ok(())
        })
        .expect("setup");

    let latest = store
        .with_tx::<_, StoreError, _>(|tx| tx.latest_deployed_release())
        .expect("get")
        .expect("release exists");
    assert_eq!(latest.release_id, "sha-new");
}

#[test]
fn test_approvals_round_trip() {
    let store = store();
    let now = Utc::now();
    store
        .with_tx::<_, StoreError, _>(|tx| {
            tx.insert_approval("R1", Some("alex"), "approved", None, None, now)?;
            tx.insert_approval(
                "R1",
                Some("sam"),
                "rejected",
                Some("touches auth"),
                Some("POLICY_REJECTED"),
                now,
            )?;
            Ok(())
        })
        .expect("setup");

    let approvals = store
        .with_tx::<_, StoreError, _>(|tx| tx.list_approvals("R1"))
        .expect("list");
    assert_eq!(approvals.len(), 2);
    assert_eq!(approvals[0].decision, "approved");
    assert_eq!(
        approvals[1].failure_reason_code.as_deref(),
        Some("POLICY_REJECTED")
    );
}

#[test]
fn test_ensure_slot_rows_seeds_pool() {
    let store = store();
    let slots = vec![
        "preview-1".to_string(),
        "preview-2".to_string(),
        "preview-3".to_string(),
    ];
    store.ensure_slot_rows(&slots).expect("seed");
    store.ensure_slot_rows(&slots).expect("seed again");

    let leases = store
        .with_tx::<_, StoreError, _>(|tx| tx.slot_leases_in_order(&slots))
        .expect("list");
    assert_eq!(leases.len(), 3);
    assert!(leases.iter().all(|lease| lease.lease_state == "released"));
}
