use crux_core::testing::AppTester;
use shared::capabilities::{HttpHeaders, HttpResponse, HttpResult};
use shared::{
    App, Effect, EntryDraft, EntryId, Event, FlushState, Model, OpId, ServerEntry, UnixTimeMs,
    UserId,
};

fn session_event() -> Event {
    Event::SessionStarted {
        user_id: UserId::new("user-1"),
        auth_token: "jwt-token".into(),
        api_base: "https://journal.example.com".into(),
    }
}

fn create_entry(content: &str) -> Event {
    Event::EntryCreateRequested(Box::new(EntryDraft {
        content: content.into(),
        tags: vec!["daily".into()],
        ..EntryDraft::default()
    }))
}

fn insert_success(id: &str, content: &str) -> Box<HttpResult> {
    let entry = ServerEntry {
        id: EntryId::new(id),
        user_id: UserId::new("user-1"),
        title: None,
        content_text: content.into(),
        mood_id: None,
        mood_intensity: None,
        prompt_id: None,
        tags: vec!["daily".into()],
        entry_date: UnixTimeMs::now().utc_date(),
        is_favorite: false,
        created_at: String::new(),
        updated_at: String::new(),
    };
    Box::new(Ok(HttpResponse {
        status: 201,
        headers: HttpHeaders::new(),
        body: serde_json::to_vec(&entry).unwrap(),
    }))
}

fn boot(app: &AppTester<App, Effect>) -> Model {
    let mut model = Model::default();
    let _ = app.update(session_event(), &mut model);
    let _ = app.update(
        Event::StoreRestoreLoaded {
            result: Box::new(Ok(None)),
        },
        &mut model,
    );
    model
}

fn queued_ids(model: &Model) -> Vec<OpId> {
    model
        .offline_store
        .outbox
        .iter()
        .map(|e| e.op_id.clone())
        .collect()
}

#[test]
fn full_offline_to_online_flow() {
    let app = AppTester::<App, _>::default();
    let mut model = boot(&app);

    // 1. Create an entry while offline: it queues, nothing goes out.
    assert!(!model.network_online, "no connectivity signal means offline");
    let update = app.update(create_entry("written in airplane mode"), &mut model);

    assert_eq!(model.offline_store.outbox.len(), 1);
    let effects: Vec<Effect> = update.effects.into_iter().collect();
    assert!(
        !effects.iter().any(|e| matches!(e, Effect::Http(_))),
        "no HTTP requests while offline"
    );
    assert!(
        effects.iter().any(|e| matches!(e, Effect::Kv(_))),
        "the queue is persisted on enqueue"
    );

    let op_id = queued_ids(&model)[0].clone();

    // 2. Connectivity returns: the rising edge starts a flush pass.
    let update = app.update(Event::NetworkStatusChanged { online: true }, &mut model);
    assert!(model.flush.is_flushing());
    let effects: Vec<Effect> = update.effects.into_iter().collect();
    assert!(
        effects.iter().any(|e| matches!(e, Effect::Http(_))),
        "going online triggers the insert"
    );

    // 3. The remote store acknowledges the write.
    let update = app.update(
        Event::EntryInsertResponse {
            op_id,
            result: insert_success("server-1", "written in airplane mode"),
        },
        &mut model,
    );

    // 4. The entry left the queue exactly once and lives server-side now.
    assert_eq!(model.flush, FlushState::Idle);
    assert!(model.offline_store.outbox.is_empty());
    assert_eq!(model.entries.len(), 1);
    assert_eq!(model.entries[0].id.as_str(), "server-1");

    let report = model.last_flush.expect("pass must report its counts");
    assert_eq!((report.succeeded, report.failed), (1, 0));

    // 5. The empty queue was re-persisted and the embeddings side effect was
    // emitted without blocking the commit.
    let effects: Vec<Effect> = update.effects.into_iter().collect();
    assert!(effects.iter().any(|e| matches!(e, Effect::Kv(_))));
    assert!(effects.iter().any(|e| matches!(e, Effect::Http(_))));
}

#[test]
fn idempotency_key_is_stable_across_attempts() {
    let app = AppTester::<App, _>::default();
    let mut model = boot(&app);

    let _ = app.update(create_entry("retry me"), &mut model);
    let before = model.offline_store.outbox.iter().next().unwrap().idempotency_key.clone();

    let _ = app.update(Event::NetworkStatusChanged { online: true }, &mut model);
    let op_id = queued_ids(&model)[0].clone();
    let _ = app.update(
        Event::EntryInsertResponse {
            op_id,
            result: Box::new(Ok(HttpResponse {
                status: 503,
                headers: HttpHeaders::new(),
                body: Vec::new(),
            })),
        },
        &mut model,
    );

    let after = model.offline_store.outbox.iter().next().unwrap();
    assert_eq!(after.idempotency_key, before);
    assert_eq!(after.attempt_count, 1);
}

#[test]
fn restart_restores_queue_in_original_order() {
    let app = AppTester::<App, _>::default();

    // First session: three entries queue up offline, each persisted.
    let mut first = boot(&app);
    let _ = app.update(create_entry("monday"), &mut first);
    let _ = app.update(create_entry("tuesday"), &mut first);
    let _ = app.update(create_entry("wednesday"), &mut first);
    let expected = queued_ids(&first);
    assert_eq!(expected.len(), 3);

    // What the shell would have written to device storage.
    let snapshot = first.offline_store.encode().unwrap();

    // Second session: a fresh process restores the snapshot.
    let mut second = Model::default();
    let _ = app.update(session_event(), &mut second);
    let _ = app.update(
        Event::StoreRestoreLoaded {
            result: Box::new(Ok(Some(snapshot))),
        },
        &mut second,
    );

    assert_eq!(queued_ids(&second), expected);
    let contents: Vec<String> = second
        .offline_store
        .outbox
        .iter()
        .map(|e| e.write.content.clone())
        .collect();
    assert_eq!(contents, vec!["monday", "tuesday", "wednesday"]);
}

#[test]
fn restart_during_flush_requeues_the_in_flight_write() {
    let app = AppTester::<App, _>::default();

    let mut first = boot(&app);
    let _ = app.update(create_entry("interrupted"), &mut first);
    // Going online puts the entry in flight; the process dies before any
    // response arrives.
    let _ = app.update(Event::NetworkStatusChanged { online: true }, &mut first);
    assert!(first.flush.is_flushing());
    let snapshot = first.offline_store.encode().unwrap();

    let mut second = Model::default();
    let _ = app.update(session_event(), &mut second);
    let _ = app.update(
        Event::StoreRestoreLoaded {
            result: Box::new(Ok(Some(snapshot))),
        },
        &mut second,
    );

    // The unacknowledged attempt is eligible again immediately.
    assert_eq!(
        second.offline_store.outbox.ready_ids(UnixTimeMs::now()).len(),
        1
    );
    assert_eq!(second.flush, FlushState::Idle);
}

#[test]
fn restore_on_an_online_device_flushes_at_startup() {
    let app = AppTester::<App, _>::default();

    let mut first = boot(&app);
    let _ = app.update(create_entry("from last night"), &mut first);
    let snapshot = first.offline_store.encode().unwrap();

    let mut second = Model::default();
    let _ = app.update(session_event(), &mut second);
    let _ = app.update(Event::NetworkStatusChanged { online: true }, &mut second);

    let update = app.update(
        Event::StoreRestoreLoaded {
            result: Box::new(Ok(Some(snapshot))),
        },
        &mut second,
    );

    assert!(second.flush.is_flushing());
    let effects: Vec<Effect> = update.effects.into_iter().collect();
    assert!(
        effects.iter().any(|e| matches!(e, Effect::Http(_))),
        "restored writes are delivered without waiting for a new edge"
    );
}
