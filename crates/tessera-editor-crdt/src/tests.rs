//! Multi-peer scenarios exercising the engine end to end.

use loro::LoroDoc;
use serde_json::json;
use tessera_editor_core::{
    Backing, ComponentSchema, ContentType, FormatMap, LocalValue, NodeId, Origin, Registry,
    Selection, SlotPosition, StateInit,
};
use web_time::Duration;

use crate::bridge::SharedNode;
use crate::{
    CollabConfig, CollabEngine, DeletedItem, HistoryScope, ManualClock, MemoryLoader,
    PLACEHOLDER, RootKey, SyncError, TransactionFilters, TransactionInfo,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Registry {
    Registry::new()
        .with_component("page", ContentType::BlockComponent)
        .with_component("image", ContentType::InlineComponent)
        .with_component("chart", ContentType::BlockComponent)
        .with_formatter("bold")
        .with_formatter("italic")
        .with_attribute("align")
}

fn schema(name: &str) -> ComponentSchema {
    registry()
        .schema(name)
        .cloned()
        .expect("registered component")
}

fn all_content() -> Vec<ContentType> {
    vec![
        ContentType::Text,
        ContentType::InlineComponent,
        ContentType::BlockComponent,
    ]
}

fn peer_with(id: u64, config: CollabConfig, registry: Registry) -> (CollabEngine, ManualClock) {
    init_tracing();
    let clock = ManualClock::new();
    let engine = CollabEngine::with_peer_id(id, config, registry)
        .unwrap()
        .with_clock(clock.clone());
    (engine, clock)
}

fn peer(id: u64) -> (CollabEngine, ManualClock) {
    peer_with(id, CollabConfig::default(), registry())
}

/// Publish a `page` root with a `body` slot and a `title` scalar.
fn publish_page(engine: &mut CollabEngine) -> NodeId {
    let model = engine.model_mut();
    let body = model.create_slot(all_content(), Backing::Sync);
    let state = model.build_state(StateInit::map([
        ("body", StateInit::Slot(body)),
        ("title", StateInit::from(json!("Untitled"))),
    ]));
    let root = model.create_component(&schema("page"), Backing::Sync, state);
    engine.create_root(root).unwrap();
    body
}

fn join(engine: &mut CollabEngine, from: &mut CollabEngine) -> NodeId {
    let snapshot = from.export_snapshot(&RootKey::Main).unwrap();
    let root = engine.join(&snapshot).unwrap();
    engine.model().component_slots(root)[0]
}

fn sync(from: &mut CollabEngine, to: &mut CollabEngine) {
    let since = to.version(&RootKey::Main).unwrap();
    if let Some(update) = from.export_updates_since(&RootKey::Main, &since).unwrap() {
        to.apply_update(&RootKey::Main, &update).unwrap();
    }
}

fn text(engine: &CollabEngine, slot: NodeId) -> String {
    engine.model().slot(slot).unwrap().text()
}

fn insert(engine: &mut CollabEngine, slot: NodeId, at: usize, s: &str) {
    engine
        .model_mut()
        .insert_text(Origin::LOCAL, slot, at, s, FormatMap::new())
        .unwrap();
    engine.flush().unwrap();
}

fn shared_text(engine: &CollabEngine, slot: NodeId) -> String {
    let id = engine.shared_id(slot).unwrap();
    engine.doc().get_text(id).to_string()
}

fn root_state_entry(engine: &CollabEngine, key: &str) -> LocalValue {
    let root = engine.model().root().unwrap();
    let LocalValue::Map(state) = engine.model().component(root).unwrap().state() else {
        panic!("page state is a map");
    };
    engine.model().map(*state).unwrap().get(key).cloned().unwrap()
}

#[test]
fn test_publish_and_join_roundtrip() {
    let (mut a, _) = peer(1);
    let body = publish_page(&mut a);

    let model = a.model_mut();
    model
        .insert_text(Origin::LOCAL, body, 0, "hello", FormatMap::new())
        .unwrap();
    model
        .format(
            Origin::LOCAL,
            body,
            0,
            2,
            FormatMap::from([("bold".into(), json!(true))]),
        )
        .unwrap();
    model
        .set_attribute(Origin::LOCAL, body, "align", json!("center"))
        .unwrap();
    let image_state = model.build_state(StateInit::map([("src", StateInit::from(json!("a.png")))]));
    let image = model.create_component(&schema("image"), Backing::Sync, image_state);
    model
        .insert_component(Origin::LOCAL, body, 5, image, FormatMap::new())
        .unwrap();
    a.flush().unwrap();

    assert_eq!(a.local_json(), a.shared_json());

    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    assert_eq!(b.local_json(), a.local_json());
    assert_eq!(b.shared_json(), a.shared_json());
    assert_eq!(text(&b, b_body), "hello\u{FFFC}");
    assert_eq!(
        b.model().slot(b_body).unwrap().attribute("align"),
        Some(&json!("center"))
    );
}

#[test]
fn test_concurrent_edits_converge() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "mid");
    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);

    insert(&mut a, a_body, 0, "A");
    insert(&mut b, b_body, 3, "B");
    sync(&mut a, &mut b);
    sync(&mut b, &mut a);

    assert_eq!(text(&a, a_body), "AmidB");
    assert_eq!(text(&b, b_body), "AmidB");
    assert_eq!(a.local_json(), b.local_json());
    assert_eq!(a.local_json(), a.shared_json());
    assert_eq!(b.local_json(), b.shared_json());
}

#[test]
fn test_own_commits_are_not_replayed() {
    let (mut a, _) = peer(1);
    let body = publish_page(&mut a);
    a.model_mut().take_notifications();

    insert(&mut a, body, 0, "hi");
    assert_eq!(text(&a, body), "hi");
    assert_eq!(shared_text(&a, body), "hi");
    // only the local edit notified; the echo was skipped
    assert_eq!(a.model_mut().take_notifications().len(), 1);
}

#[test]
fn test_remote_insert_shifts_selection() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "hello");
    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);

    b.model_mut()
        .set_selection(Some(Selection::collapsed(SlotPosition::new(b_body, 3))));

    insert(&mut a, a_body, 0, "XX");
    sync(&mut a, &mut b);
    assert_eq!(b.model().selection().unwrap().head.offset, 5);

    insert(&mut a, a_body, 7, "!");
    sync(&mut a, &mut b);
    assert_eq!(b.model().selection().unwrap().head.offset, 5);
    assert_eq!(text(&b, b_body), "XXhello!");
}

#[test]
fn test_remote_delete_shifts_selection() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "hello");
    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);

    b.model_mut().set_selection(Some(Selection {
        anchor: SlotPosition::new(b_body, 1),
        head: SlotPosition::new(b_body, 4),
    }));

    a.model_mut().delete(Origin::LOCAL, a_body, 0, 2).unwrap();
    a.flush().unwrap();
    sync(&mut a, &mut b);

    assert_eq!(text(&b, b_body), "llo");
    let selection = b.model().selection().unwrap();
    assert_eq!(selection.anchor.offset, 0);
    assert_eq!(selection.head.offset, 2);
}

#[test]
fn test_unknown_format_keys_dropped_on_replay() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    let narrow = Registry::new()
        .with_component("page", ContentType::BlockComponent)
        .with_formatter("bold");
    let (mut b, _) = peer_with(2, CollabConfig::default(), narrow);
    let b_body = join(&mut b, &mut a);

    let both = FormatMap::from([("bold".into(), json!(true)), ("italic".into(), json!(true))]);
    a.model_mut()
        .insert_text(Origin::LOCAL, a_body, 0, "hi", both)
        .unwrap();
    a.flush().unwrap();
    sync(&mut a, &mut b);

    assert_eq!(text(&b, b_body), "hi");
    let bold = FormatMap::from([("bold".into(), json!(true))]);
    assert_eq!(b.model().slot(b_body).unwrap().formats_at(0), Some(&bold));

    a.model_mut()
        .format(
            Origin::LOCAL,
            a_body,
            0,
            2,
            FormatMap::from([("italic".into(), serde_json::Value::Null)]),
        )
        .unwrap();
    a.flush().unwrap();
    sync(&mut a, &mut b);
    assert_eq!(b.model().slot(b_body).unwrap().formats_at(0), Some(&bold));
}

#[test]
fn test_typed_zero_width_space_survives_sync() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "a\u{200B}b");
    assert_eq!(shared_text(&a, a_body), "a\u{200B}b");

    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    assert_eq!(text(&b, b_body), "a\u{200B}b");

    insert(&mut a, a_body, 3, "X");
    sync(&mut a, &mut b);
    assert_eq!(text(&a, a_body), "a\u{200B}bX");
    assert_eq!(text(&b, b_body), "a\u{200B}bX");
    assert_eq!(a.local_json(), b.local_json());
}

#[test]
fn test_offsets_are_utf16_units() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "😀b");
    assert_eq!(a.model().slot_len(a_body), 3);

    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    assert_eq!(b.model().slot_len(b_body), 3);
    b.model_mut()
        .set_selection(Some(Selection::collapsed(SlotPosition::new(b_body, 3))));

    insert(&mut a, a_body, 2, "X");
    sync(&mut a, &mut b);
    assert_eq!(shared_text(&a, a_body), "😀Xb");
    assert_eq!(text(&b, b_body), "😀Xb");
    assert_eq!(b.model().selection().unwrap().head.offset, 4);

    b.model_mut().delete(Origin::LOCAL, b_body, 0, 2).unwrap();
    b.flush().unwrap();
    sync(&mut b, &mut a);
    assert_eq!(text(&a, a_body), "Xb");
    assert_eq!(a.model().slot_len(a_body), 2);
}

#[test]
fn test_back_and_forward() {
    let (mut a, clock) = peer(1);
    let body = publish_page(&mut a);
    insert(&mut a, body, 0, "hello");
    clock.advance(Duration::from_secs(1));

    a.model_mut()
        .set_selection(Some(Selection::collapsed(SlotPosition::new(body, 5))));
    insert(&mut a, body, 5, " world");
    assert_eq!(a.history().len(), 2);

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "hello");
    assert_eq!(a.model().selection().unwrap().head, SlotPosition::new(body, 5));

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "");
    assert_eq!(shared_text(&a, body), PLACEHOLDER.to_string());
    assert!(!a.back().unwrap());

    assert!(a.forward().unwrap());
    assert_eq!(text(&a, body), "hello");
    assert!(a.can_forward());
    assert_eq!(a.local_json(), a.shared_json());
}

#[test]
fn test_edits_within_window_undo_together() {
    let (mut a, clock) = peer(1);
    let body = publish_page(&mut a);
    insert(&mut a, body, 0, "a");
    clock.advance(Duration::from_millis(100));
    insert(&mut a, body, 1, "b");
    assert_eq!(a.history().len(), 1);

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "");
}

#[test]
fn test_back_restores_selection_past_interleaved_remote_edit() {
    let (mut a, clock) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "hello");
    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    clock.advance(Duration::from_secs(1));

    a.model_mut()
        .set_selection(Some(Selection::collapsed(SlotPosition::new(a_body, 5))));
    insert(&mut a, a_body, 5, " world");
    insert(&mut b, b_body, 0, "XY");
    sync(&mut b, &mut a);

    assert!(a.back().unwrap());
    assert_eq!(text(&a, a_body), "XYhello");
    assert_eq!(
        a.model().selection().unwrap().head,
        SlotPosition::new(a_body, 7)
    );
}

#[test]
fn test_long_coalesced_group_undoes_whole_entries() {
    let config = CollabConfig {
        stack_size: 1,
        ..CollabConfig::default()
    };
    let (mut a, clock) = peer_with(1, config, registry());
    let body = publish_page(&mut a);
    for i in 0..70 {
        insert(&mut a, body, i, "x");
        clock.advance(Duration::from_millis(10));
    }
    // the open entry was split once it reached its step budget, and the
    // stack kept only the newest one
    assert_eq!(a.history().len(), 1);

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "x".repeat(64));
    assert!(!a.can_back());
    assert_eq!(a.local_json(), a.shared_json());
}

#[test]
fn test_back_and_forward_span_main_and_sub_document() {
    let config = CollabConfig {
        history_scope: HistoryScope::MultiRoot,
        ..CollabConfig::default()
    };
    let (a, _) = peer_with(1, config, registry());
    let mut a = a.with_loader(MemoryLoader::new("a/"));
    let notes = publish_page_with_notes(&mut a);
    let LocalValue::Slot(body) = root_state_entry(&a, "body") else {
        panic!("body is a slot");
    };

    let model = a.model_mut();
    model
        .insert_text(Origin::LOCAL, body, 0, "main", FormatMap::new())
        .unwrap();
    model
        .insert_text(Origin::LOCAL, notes, 0, "aside", FormatMap::new())
        .unwrap();
    a.flush().unwrap();
    assert_eq!(a.history().len(), 1);

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "");
    assert_eq!(text(&a, notes), "");
    assert_eq!(
        a.sub_doc("a/1").unwrap().get_text("content").to_string(),
        PLACEHOLDER.to_string()
    );

    assert!(a.forward().unwrap());
    assert_eq!(text(&a, body), "main");
    assert_eq!(text(&a, notes), "aside");
    assert_eq!(a.local_json(), a.shared_json());
}

#[test]
fn test_back_skips_interleaved_remote_edit() {
    let (mut a, clock) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "hello");
    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    clock.advance(Duration::from_secs(1));

    insert(&mut a, a_body, 5, " world");
    insert(&mut b, b_body, 0, "X");
    sync(&mut b, &mut a);
    assert_eq!(text(&a, a_body), "Xhello world");

    assert!(a.back().unwrap());
    assert_eq!(text(&a, a_body), "Xhello");
    sync(&mut a, &mut b);
    assert_eq!(text(&b, b_body), "Xhello");
    assert_eq!(a.local_json(), b.local_json());
}

#[test]
fn test_history_stack_is_bounded() {
    let config = CollabConfig {
        stack_size: 2,
        ..CollabConfig::default()
    };
    let (mut a, clock) = peer_with(1, config, registry());
    let body = publish_page(&mut a);
    for (i, s) in ["a", "b", "c"].iter().enumerate() {
        insert(&mut a, body, i, s);
        clock.advance(Duration::from_secs(1));
    }
    assert_eq!(a.history().len(), 2);

    assert!(a.back().unwrap());
    assert!(a.back().unwrap());
    assert!(!a.back().unwrap());
    assert_eq!(text(&a, body), "a");
}

#[test]
fn test_untracked_and_filtered_edits_stay_out_of_history() {
    let (mut a, _) = peer(1);
    let body = publish_page(&mut a);
    a.model_mut()
        .insert_text(Origin::UNTRACKED, body, 0, "quiet", FormatMap::new())
        .unwrap();
    a.flush().unwrap();
    assert!(!a.can_back());
    assert_eq!(shared_text(&a, body), "quiet");

    let filters = TransactionFilters {
        should_capture_transaction: Some(Box::new(|info: &TransactionInfo<'_>| {
            info.changes.len() > 1
        })),
        ..TransactionFilters::default()
    };
    let (b, _) = peer(2);
    let mut b = b.with_filters(filters);
    let body = publish_page(&mut b);
    insert(&mut b, body, 0, "x");
    assert!(!b.can_back());
    assert_eq!(shared_text(&b, body), "x");
}

#[test]
fn test_empty_slot_holds_one_placeholder() {
    let (mut a, _) = peer(1);
    let body = publish_page(&mut a);
    assert_eq!(shared_text(&a, body), PLACEHOLDER.to_string());
    assert_eq!(a.model().slot_len(body), 0);

    insert(&mut a, body, 0, "ab");
    assert_eq!(shared_text(&a, body), "ab");

    a.model_mut().delete(Origin::LOCAL, body, 0, 2).unwrap();
    a.flush().unwrap();
    assert_eq!(shared_text(&a, body), PLACEHOLDER.to_string());

    let (mut b, _) = peer(2);
    let b_body = join(&mut b, &mut a);
    assert_eq!(b.model().slot_len(b_body), 0);
    insert(&mut b, b_body, 0, "c");
    sync(&mut b, &mut a);
    assert_eq!(text(&a, body), "c");
    assert_eq!(shared_text(&a, body), "c");
}

#[test]
fn test_unknown_component_leaves_slot_intact() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "hello");

    let narrow = Registry::new()
        .with_component("page", ContentType::BlockComponent)
        .with_formatter("bold");
    let (mut b, _) = peer_with(2, CollabConfig::default(), narrow);
    let b_body = join(&mut b, &mut a);

    let model = a.model_mut();
    let chart_state = model.build_state(StateInit::empty_map());
    let chart = model.create_component(&schema("chart"), Backing::Sync, chart_state);
    model
        .insert_component(Origin::LOCAL, a_body, 5, chart, FormatMap::new())
        .unwrap();
    a.flush().unwrap();

    let since = b.version(&RootKey::Main).unwrap();
    let update = a
        .export_updates_since(&RootKey::Main, &since)
        .unwrap()
        .unwrap();
    let err = b.apply_update(&RootKey::Main, &update).unwrap_err();
    assert!(matches!(err, SyncError::UnknownComponent(name) if name == "chart"));
    assert_eq!(text(&b, b_body), "hello");
    assert!(b.model().slot(b_body).unwrap().components().is_empty());
}

#[test]
fn test_depth_limit_rejects_deep_join() {
    let (mut a, _) = peer(1);
    let body = publish_page(&mut a);
    let model = a.model_mut();
    let image_state = model.build_state(StateInit::empty_map());
    let image = model.create_component(&schema("image"), Backing::Sync, image_state);
    model
        .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
        .unwrap();
    a.flush().unwrap();

    let config = CollabConfig {
        max_depth: 2,
        ..CollabConfig::default()
    };
    let (mut b, _) = peer_with(2, config, registry());
    let snapshot = a.export_snapshot(&RootKey::Main).unwrap();
    assert!(matches!(b.join(&snapshot), Err(SyncError::DepthExceeded(2))));
}

#[test]
fn test_async_slot_without_loader_is_unsupported() {
    let (mut a, _) = peer(1);
    let model = a.model_mut();
    let notes = model.create_slot(
        all_content(),
        Backing::Async {
            metadata: json!({"kind": "notes"}),
        },
    );
    let state = model.build_state(StateInit::map([("notes", StateInit::Slot(notes))]));
    let root = model.create_component(&schema("page"), Backing::Sync, state);
    assert!(matches!(
        a.create_root(root),
        Err(SyncError::UnsupportedSubModel("slot"))
    ));
}

/// Page whose `notes` slot lives in its own sub-document.
fn publish_page_with_notes(engine: &mut CollabEngine) -> NodeId {
    let model = engine.model_mut();
    let body = model.create_slot(all_content(), Backing::Sync);
    let notes = model.create_slot(
        all_content(),
        Backing::Async {
            metadata: json!({"kind": "notes"}),
        },
    );
    let state = model.build_state(StateInit::map([
        ("body", StateInit::Slot(body)),
        ("notes", StateInit::Slot(notes)),
    ]));
    let root = model.create_component(&schema("page"), Backing::Sync, state);
    engine.create_root(root).unwrap();
    notes
}

#[test]
fn test_async_slot_loads_published_sub_document() {
    let (a, _) = peer(1);
    let mut a = a.with_loader(MemoryLoader::new("a/"));
    let notes = publish_page_with_notes(&mut a);
    insert(&mut a, notes, 0, "remember");
    assert!(a.sub_doc("a/1").is_some());
    assert_eq!(a.local_json(), a.shared_json());

    let mut loader = MemoryLoader::new("b/");
    loader.publish("a/1", a.export_snapshot(&RootKey::sub("a/1")).unwrap());
    let (b, _) = peer(2);
    let mut b = b.with_loader(loader);
    let snapshot = a.export_snapshot(&RootKey::Main).unwrap();
    b.join(&snapshot).unwrap();

    assert!(b.pending_sub_models().is_empty());
    assert_eq!(b.local_json(), a.local_json());
    let LocalValue::Slot(b_notes) = root_state_entry(&b, "notes") else {
        panic!("notes is a slot");
    };
    assert_eq!(text(&b, b_notes), "remember");
}

#[test]
fn test_pending_sub_document_resolves_later() {
    let (a, _) = peer(1);
    let mut a = a.with_loader(MemoryLoader::new("a/"));
    let notes = publish_page_with_notes(&mut a);
    insert(&mut a, notes, 0, "later");

    let (b, _) = peer(2);
    let mut b = b.with_loader(MemoryLoader::new("b/").deferred());
    let snapshot = a.export_snapshot(&RootKey::Main).unwrap();
    b.join(&snapshot).unwrap();
    assert_eq!(b.pending_sub_models(), vec!["a/1"]);
    let LocalValue::Slot(b_notes) = root_state_entry(&b, "notes") else {
        panic!("notes is a slot");
    };
    assert_eq!(b.model().slot_len(b_notes), 0);
    assert_eq!(b.local_json(), b.shared_json());

    let sub = LoroDoc::new();
    sub.import(&a.export_snapshot(&RootKey::sub("a/1")).unwrap())
        .unwrap();
    b.resolve_sub_model("a/1", sub).unwrap();
    assert!(b.pending_sub_models().is_empty());
    assert_eq!(text(&b, b_notes), "later");
    assert_eq!(b.local_json(), a.local_json());

    let err = b.resolve_sub_model("a/1", LoroDoc::new()).unwrap_err();
    assert!(matches!(err, SyncError::UnknownRoot(_)));
}

#[test]
fn test_state_map_and_list_sync() {
    let (mut a, _) = peer(1);
    let model = a.model_mut();
    let state = model.build_state(StateInit::map([
        ("title", StateInit::from(json!("Draft"))),
        ("tags", StateInit::list([StateInit::from(json!("x"))])),
    ]));
    let root = model.create_component(&schema("page"), Backing::Sync, state);
    a.create_root(root).unwrap();
    let (mut b, _) = peer(2);
    let snapshot = a.export_snapshot(&RootKey::Main).unwrap();
    b.join(&snapshot).unwrap();

    let LocalValue::List(tags) = root_state_entry(&a, "tags") else {
        panic!("tags is a list");
    };
    let LocalValue::Map(state) = a.model().component(root).unwrap().state().clone() else {
        panic!("page state is a map");
    };
    let model = a.model_mut();
    model
        .list_splice(
            Origin::LOCAL,
            tags,
            1,
            0,
            vec![LocalValue::Scalar(json!("y"))],
        )
        .unwrap();
    model
        .map_set(
            Origin::LOCAL,
            state,
            "title",
            LocalValue::Scalar(json!("Final")),
        )
        .unwrap();
    a.flush().unwrap();
    sync(&mut a, &mut b);

    assert_eq!(b.local_json()["state"]["tags"], json!(["x", "y"]));
    assert_eq!(b.local_json()["state"]["title"], json!("Final"));
    assert_eq!(b.local_json(), a.local_json());

    let LocalValue::List(b_tags) = root_state_entry(&b, "tags") else {
        panic!("tags is a list");
    };
    b.model_mut()
        .list_splice(Origin::LOCAL, b_tags, 0, 1, Vec::new())
        .unwrap();
    b.flush().unwrap();
    sync(&mut b, &mut a);
    assert_eq!(a.local_json()["state"]["tags"], json!(["y"]));
}

#[test]
fn test_deleted_embed_map_dropped_only_when_filtered() {
    let embed_count = |engine: &CollabEngine, slot: NodeId| match &engine
        .bridge
        .lookup_local(slot)
        .unwrap()
        .node
    {
        SharedNode::Slot(handles) => handles.embeds.len(),
        _ => panic!("slot binding"),
    };

    for dropping in [false, true] {
        let (a, _) = peer(1);
        let mut a = a.with_filters(TransactionFilters {
            should_filter_deleted_item: Some(Box::new(move |item: &DeletedItem<'_>| {
                dropping && item.name == "image"
            })),
            ..TransactionFilters::default()
        });
        let body = publish_page(&mut a);
        let model = a.model_mut();
        let image_state = model.build_state(StateInit::empty_map());
        let image = model.create_component(&schema("image"), Backing::Sync, image_state);
        model
            .insert_component(Origin::LOCAL, body, 0, image, FormatMap::new())
            .unwrap();
        a.flush().unwrap();
        assert_eq!(embed_count(&a, body), 1);

        a.model_mut().delete(Origin::LOCAL, body, 0, 1).unwrap();
        a.flush().unwrap();
        assert_eq!(embed_count(&a, body), usize::from(!dropping));
        assert!(a.model().component(image).is_none());
        assert_eq!(a.local_json(), a.shared_json());
    }
}

#[test]
fn test_back_brings_deleted_embed_back() {
    let (mut a, clock) = peer(1);
    let body = publish_page(&mut a);
    insert(&mut a, body, 0, "ab");
    let model = a.model_mut();
    let image_state = model.build_state(StateInit::map([("src", StateInit::from(json!("a.png")))]));
    let image = model.create_component(&schema("image"), Backing::Sync, image_state);
    model
        .insert_component(Origin::LOCAL, body, 1, image, FormatMap::new())
        .unwrap();
    a.flush().unwrap();
    clock.advance(Duration::from_secs(1));

    a.model_mut().delete(Origin::LOCAL, body, 1, 1).unwrap();
    a.flush().unwrap();
    assert_eq!(text(&a, body), "ab");

    assert!(a.back().unwrap());
    assert_eq!(text(&a, body), "a\u{FFFC}b");
    let (offset, restored) = a.model().slot(body).unwrap().components()[0];
    assert_eq!(offset, 1);
    assert_eq!(a.model().component(restored).unwrap().name(), "image");
    assert_eq!(a.local_json(), a.shared_json());
}

#[test]
fn test_up_to_date_peer_gets_no_update() {
    let (mut a, _) = peer(1);
    let a_body = publish_page(&mut a);
    insert(&mut a, a_body, 0, "x");
    let (mut b, _) = peer(2);
    join(&mut b, &mut a);
    let since = b.version(&RootKey::Main).unwrap();
    assert!(a
        .export_updates_since(&RootKey::Main, &since)
        .unwrap()
        .is_none());
}
