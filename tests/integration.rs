//! Integration tests for rowwire-client.
//!
//! These tests drive whole sessions through the public API: rows in,
//! materialized values out.

use std::cell::RefCell;
use std::rc::Rc;

use rowwire_client::stream::StreamValue;
use rowwire_client::value::{Callable, Object, TemporaryReferenceSet};
use rowwire_client::{
    pump, ChunkPoll, ChunkStatus, Manifest, RootHandle, RowwireError, SessionBuilder,
    StaticModuleLoader, TransportSink, Value,
};
use serde_json::json;

fn session() -> (RootHandle, TransportSink) {
    SessionBuilder::new().build()
}

fn root_json(root: &RootHandle) -> serde_json::Value {
    match root.poll() {
        ChunkPoll::Ready(value) => value.to_json(),
        other => panic!("root not ready: {:?}", other),
    }
}

fn exports(entries: &[(&str, Value)]) -> Value {
    let object = Object::new();
    for (name, value) in entries {
        object.insert(*name, value.clone());
    }
    Value::Object(object)
}

// ==================== References ====================

/// A forward reference blocks the root until its row arrives.
#[test]
fn test_forward_reference_blocks_root() {
    let (root, sink) = session();

    sink.push_bytes(b"0:{\"a\":\"$1\",\"b\":2}\n").unwrap();
    assert_eq!(root.status(), ChunkStatus::Blocked);
    assert!(root.poll().is_pending());

    sink.push_bytes(b"1:{\"v\":1}\n").unwrap();
    assert_eq!(root.status(), ChunkStatus::Fulfilled);
    assert_eq!(root_json(&root), json!({ "a": { "v": 1 }, "b": 2 }));
}

/// Dependency order and reverse order produce the same graph.
#[test]
fn test_arrival_order_does_not_matter() {
    let rows: [&[u8]; 3] = [
        b"0:{\"list\":[\"$1\",\"$2\"],\"n\":null}\n",
        b"1:{\"name\":\"one\",\"next\":\"$2\"}\n",
        b"2:[true,false]\n",
    ];

    let (forward, sink) = session();
    for row in rows {
        sink.push_bytes(row).unwrap();
    }
    let (reverse, sink) = session();
    for row in rows.iter().rev() {
        sink.push_bytes(row).unwrap();
    }

    assert_eq!(root_json(&forward), root_json(&reverse));
    assert_eq!(
        root_json(&forward),
        json!({ "list": [{ "name": "one", "next": [true, false] }, [true, false]], "n": null })
    );
}

/// Paths walk into the referenced value.
#[test]
fn test_reference_with_path() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"x\":\"$1:inner:1\"}\n1:{\"inner\":[\"a\",\"b\"]}\n")
        .unwrap();
    assert_eq!(root_json(&root), json!({ "x": "b" }));
}

/// A value that refers to itself resolves to itself.
#[test]
fn test_self_cycle() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"name\":\"loop\",\"self\":\"$0\"}\n").unwrap();

    let value = root.poll().ready().unwrap();
    assert!(value.get("self").same_value(&value));
    assert_eq!(value.to_json(), json!({ "name": "loop", "self": "[Circular]" }));
}

/// Two chunks pointing at each other both complete.
#[test]
fn test_cycle_across_chunks() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"child\":\"$1\"}\n").unwrap();
    assert_eq!(root.status(), ChunkStatus::Blocked);
    sink.push_bytes(b"1:{\"parent\":\"$0\"}\n").unwrap();

    let value = root.poll().ready().unwrap();
    let child = value.get("child");
    assert!(child.get("parent").same_value(&value));
}

/// A ring of chunks delivered back to front closes on the root.
#[test]
fn test_cycle_ring_in_reverse_order() {
    const RING: u32 = 6;
    let (root, sink) = session();
    for id in (0..RING).rev() {
        let row = format!("{:x}:{{\"id\":{},\"next\":\"${:x}\"}}\n", id, id, (id + 1) % RING);
        sink.push_bytes(row.as_bytes()).unwrap();
    }

    let value = root.poll().ready().unwrap();
    let mut node = value.clone();
    for id in 0..RING {
        assert_eq!(node.get("id").to_json(), json!(id));
        node = node.get("next");
    }
    assert!(node.same_value(&value));
    for id in 0..RING {
        assert_eq!(root.session().get_chunk(id).status(), ChunkStatus::Fulfilled);
    }
}

/// Lazy wrappers resolve on demand.
#[test]
fn test_lazy_and_promise_wrappers() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"lazy\":\"$L1\",\"later\":\"$@2\"}\n1:[1,2]\n")
        .unwrap();

    let value = root.poll().ready().unwrap();
    assert_eq!(value.get("lazy").resolve().ready().unwrap().to_json(), json!([1, 2]));
    let later = value.get("later");
    assert!(later.resolve().is_pending());

    sink.push_bytes(b"2:\"now\"\n").unwrap();
    assert_eq!(later.resolve().ready().unwrap().as_str(), Some("now"));
}

// ==================== Value encodings ====================

#[test]
fn test_special_values() {
    let (root, sink) = session();
    sink.push_bytes(
        br#"0:["$$x","$","$I","$-Infinity","$-0","$NaN","$u","$D2024-01-02T03:04:05.000Z","$n123456789012345678901234567890","$Sfoo","$Y","$Ef(){}"]
"#,
    )
    .unwrap();

    let value = root.poll().ready().unwrap();
    let items = value.as_array().unwrap().to_vec();
    assert_eq!(items[0].as_str(), Some("$x"));
    assert_eq!(items[1].as_str(), Some("$"));
    assert_eq!(items[2].as_f64(), Some(f64::INFINITY));
    assert_eq!(items[3].as_f64(), Some(f64::NEG_INFINITY));
    let negative_zero = items[4].as_f64().unwrap();
    assert!(negative_zero == 0.0 && negative_zero.is_sign_negative());
    assert!(items[5].as_f64().unwrap().is_nan());
    assert!(items[6].is_undefined());
    match &items[7] {
        Value::Date(Some(date)) => assert_eq!(date.to_rfc3339(), "2024-01-02T03:04:05+00:00"),
        other => panic!("expected a date, got {:?}", other),
    }
    match &items[8] {
        Value::BigInt(n) => assert_eq!(n.as_str(), "123456789012345678901234567890"),
        other => panic!("expected a bigint, got {:?}", other),
    }
    assert!(matches!(&items[9], Value::Symbol(name) if &**name == "foo"));
    assert!(matches!(items[10], Value::Omitted));
    assert!(matches!(&items[11], Value::Function(src) if &**src == "f(){}"));
}

/// `$u` in an object removes the key.
#[test]
fn test_undefined_field_is_dropped() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"a\":1,\"b\":\"$u\",\"c\":3}\n").unwrap();

    let value = root.poll().ready().unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object.keys(), vec!["a".to_string(), "c".to_string()]);
}

#[test]
fn test_map_set_and_iterator() {
    let (root, sink) = session();
    sink.push_bytes(
        b"1:[[\"k\",\"v\"],[2,\"two\"]]\n2:[1,2,2]\n3:[\"x\",\"y\"]\n0:{\"m\":\"$Q1\",\"s\":\"$W2\",\"i\":\"$i3\"}\n",
    )
    .unwrap();

    let value = root.poll().ready().unwrap();
    let map = value.get("m");
    let map = map.as_map().unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&Value::from("k")).and_then(|v| v.as_str().map(str::to_string)), Some("v".into()));
    assert_eq!(map.get(&Value::from(2.0)).and_then(|v| v.as_str().map(str::to_string)), Some("two".into()));

    let set = value.get("s");
    assert_eq!(set.as_set().unwrap().len(), 2);

    match value.get("i") {
        Value::Iterator(iter) => {
            assert_eq!(iter.next_value().and_then(|v| v.as_str().map(str::to_string)), Some("x".into()));
            assert_eq!(iter.remaining(), 1);
        }
        other => panic!("expected an iterator, got {:?}", other),
    }
}

/// Composite builders wait for a model that has not arrived.
#[test]
fn test_outlined_map_waits_for_model() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"m\":\"$Q1\"}\n").unwrap();
    assert_eq!(root.status(), ChunkStatus::Blocked);

    sink.push_bytes(b"1:[[\"a\",1]]\n").unwrap();
    let value = root.poll().ready().unwrap();
    assert_eq!(value.get("m").as_map().unwrap().len(), 1);
}

#[test]
fn test_text_and_binary_rows() {
    let (root, sink) = session();
    let mut data = Vec::new();
    data.extend_from_slice(b"1:T5,hello");
    data.extend_from_slice(b"2:o3,");
    data.extend_from_slice(&[1, 2, 255]);
    data.extend_from_slice(b"3:S4,");
    data.extend_from_slice(&(-2i16).to_le_bytes());
    data.extend_from_slice(&7i16.to_le_bytes());
    data.extend_from_slice(b"0:[\"$1\",\"$2\",\"$3\"]\n");
    sink.push_bytes(&data).unwrap();

    let value = root.poll().ready().unwrap();
    assert_eq!(value.get("0").as_str(), Some("hello"));
    match value.get("1") {
        Value::Binary(bytes) => assert_eq!(bytes.as_bytes(), &[1, 2, 255]),
        other => panic!("expected bytes, got {:?}", other),
    }
    match value.get("2") {
        Value::Binary(shorts) => assert_eq!(shorts.to_i16(), vec![-2, 7]),
        other => panic!("expected int16 array, got {:?}", other),
    }
}

#[test]
fn test_blob_and_form_data() {
    let (root, sink) = session();
    sink.push_bytes(
        b"1:[\"text/plain\",\"ab\",\"cd\"]\n2:[[\"q\",\"1\"],[\"q\",\"2\"]]\n0:{\"blob\":\"$B1\",\"form\":\"$K2\"}\n",
    )
    .unwrap();

    let value = root.poll().ready().unwrap();
    match value.get("blob") {
        Value::Blob(blob) => {
            assert_eq!(blob.mime_type(), "text/plain");
            assert_eq!(&blob.bytes()[..], b"abcd");
        }
        other => panic!("expected a blob, got {:?}", other),
    }
    match value.get("form") {
        Value::FormData(form) => assert_eq!(form.get_all("q").len(), 2),
        other => panic!("expected form data, got {:?}", other),
    }
}

#[test]
fn test_outlined_error_value() {
    let (root, sink) = session();
    sink.push_bytes(b"1:{\"message\":\"nope\",\"digest\":\"d1\"}\n0:\"$Z1\"\n")
        .unwrap();

    match root.poll().ready().unwrap() {
        Value::Error(err) => {
            assert_eq!(err.message, "nope");
            assert_eq!(err.digest.as_deref(), Some("d1"));
            assert_eq!(err.environment.as_deref(), Some("Server"));
        }
        other => panic!("expected an error value, got {:?}", other),
    }
}

#[test]
fn test_prototype_reference() {
    let (root, sink) = session();
    sink.push_bytes(b"1:{\"kind\":\"base\"}\n0:{\"__proto__\":\"$P1\",\"own\":1}\n")
        .unwrap();

    let value = root.poll().ready().unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object.keys(), vec!["own".to_string()]);
    assert_eq!(object.prototype().unwrap().get("kind").as_str(), Some("base"));
}

#[test]
fn test_temporary_references() {
    let set = TemporaryReferenceSet::new();
    set.insert("$1", Value::from("kept"));
    let (root, sink) = SessionBuilder::new().temporary_references(set).build();
    sink.push_bytes(b"0:{\"t\":\"$T1\"}\n").unwrap();
    assert_eq!(root.poll().ready().unwrap().get("t").as_str(), Some("kept"));

    let (root, sink) = session();
    sink.push_bytes(b"0:\"$T1\"\n").unwrap();
    assert!(matches!(
        root.poll(),
        ChunkPoll::Failed(RowwireError::MissingTemporaryReferences)
    ));
}

// ==================== Errors ====================

/// An error row rejects its dependents but not unrelated chunks.
#[test]
fn test_rejection_isolation() {
    let (root, sink) = session();
    sink.push_bytes(
        b"0:[\"$1\",\"$2\"]\n1:{\"dep\":\"$3\"}\n2:\"ok\"\n4:\"unrelated\"\n3:E{\"message\":\"bad\",\"digest\":\"x\"}\n",
    )
    .unwrap();

    match root.poll() {
        ChunkPoll::Failed(RowwireError::Remote(err)) => {
            assert_eq!(err.message, "bad");
            assert_eq!(err.digest.as_deref(), Some("x"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    let session = root.session();
    assert_eq!(session.get_chunk(1).status(), ChunkStatus::Rejected);
    assert!(session.get_chunk(2).poll().is_ready());
    assert_eq!(
        session.get_chunk(4).poll().ready().and_then(|v| v.as_str().map(str::to_string)),
        Some("unrelated".into())
    );
    assert!(!session.is_closed());
}

#[test]
fn test_error_row_without_message() {
    let (root, sink) = session();
    sink.push_bytes(b"0:E{}\n").unwrap();
    match root.poll() {
        ChunkPoll::Failed(RowwireError::Remote(err)) => {
            assert_eq!(err.message, rowwire_client::error::DEFAULT_REMOTE_MESSAGE)
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
}

/// Closing rejects every outstanding chunk with the same reason, and rows
/// after the close are ignored.
#[test]
fn test_close_fans_out() {
    let (root, sink) = session();
    sink.push_bytes(b"0:[\"$1\",\"$2\",\"$3\"]\n3:\"done\"\n").unwrap();
    let session = root.session().clone();

    sink.end();

    assert!(session.is_closed());
    for id in [0, 1, 2] {
        assert!(
            matches!(session.get_chunk(id).poll(), ChunkPoll::Failed(RowwireError::ConnectionClosed)),
            "chunk {} should be rejected",
            id
        );
    }
    assert!(session.get_chunk(3).poll().is_ready());

    sink.push_bytes(b"1:\"late\"\n").unwrap();
    assert_eq!(session.get_chunk(1).status(), ChunkStatus::Rejected);
    assert!(matches!(
        session.get_chunk(9).poll(),
        ChunkPoll::Failed(RowwireError::ConnectionClosed)
    ));
}

#[test]
fn test_transport_failure_reason_propagates() {
    let (root, sink) = session();
    sink.push_bytes(b"0:\"$1\"\n").unwrap();
    sink.fail(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into());

    match root.poll() {
        ChunkPoll::Failed(RowwireError::Io(err)) => assert!(err.to_string().contains("reset")),
        other => panic!("expected an I/O error, got {:?}", other),
    }
}

/// Framing errors close the whole session.
#[test]
fn test_split_text_row_is_fatal() {
    let (root, sink) = session();
    let result = sink.push_text("0:{\"a\":");
    assert!(matches!(result, Err(RowwireError::Protocol(_))));
    assert!(root.session().is_closed());
    assert!(matches!(root.poll(), ChunkPoll::Failed(RowwireError::Protocol(_))));
}

#[test]
fn test_text_mode_whole_rows() {
    let (root, sink) = session();
    sink.push_text("1:T3,abc").unwrap();
    sink.push_text("0:{\"s\":\"$1\"}\n").unwrap();
    assert_eq!(root_json(&root), json!({ "s": "abc" }));
}

#[test]
fn test_row_length_limit() {
    let (root, sink) = SessionBuilder::new().max_row_length(8).build();
    let result = sink.push_bytes(b"0:\"this row is too long\"\n");
    assert!(matches!(result, Err(RowwireError::Protocol(_))));
    assert_eq!(root.status(), ChunkStatus::Rejected);
}

#[test]
fn test_row_length_limit_in_text_mode() {
    let (root, sink) = SessionBuilder::new().max_row_length(8).build();
    let result = sink.push_text("0:\"this row is too long\"\n");
    assert!(matches!(result, Err(RowwireError::Protocol(_))));
    assert!(root.session().is_closed());
    assert_eq!(root.status(), ChunkStatus::Rejected);
}

/// Rows framed before a bad preamble in the same fragment still apply.
#[test]
fn test_rows_before_framing_error_are_kept() {
    let (root, sink) = session();
    let result = sink.push_bytes(b"0:{\"a\":1}\nG:1\n");
    assert!(matches!(result, Err(RowwireError::Protocol(_))));
    assert!(root.session().is_closed());
    assert_eq!(root.status(), ChunkStatus::Fulfilled);
    assert_eq!(root_json(&root), json!({ "a": 1 }));

    let (root, sink) = session();
    assert!(sink.push_text("0:[1]\n1:{\"b\"").is_err());
    assert_eq!(root_json(&root), json!([1]));
}

// ==================== Halt ====================

#[tokio::test]
async fn test_halted_chunk_never_completes() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"x\":\"$1\"}\n1:\n").unwrap();

    let halted = root.session().get_chunk(1);
    assert_eq!(halted.status(), ChunkStatus::Halted);
    assert_eq!(root.status(), ChunkStatus::Blocked);
    assert!(matches!(halted.settled().await, Err(RowwireError::Incomplete)));

    // Data for a halted id does not revive it.
    sink.push_bytes(b"1:\"late\"\n").unwrap();
    assert_eq!(halted.status(), ChunkStatus::Halted);
}

// ==================== Streams ====================

/// Items arrive in row order even when one waits on a later row.
#[tokio::test]
async fn test_stream_preserves_order_across_forward_reference() {
    let (root, sink) = session();
    sink.push_bytes(b"0:R\n0:\"a\"\n0:\"$5\"\n0:C\n").unwrap();

    let stream = match root.poll().ready() {
        Some(Value::Stream(StreamValue::Readable(stream))) => stream,
        other => panic!("expected a readable stream, got {:?}", other),
    };
    assert_eq!(stream.next().await.unwrap().unwrap().as_str(), Some("a"));
    assert!(!stream.is_finished());

    sink.push_bytes(b"5:\"b\"\n").unwrap();
    let rest = stream.collect().await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].as_str(), Some("b"));
    assert!(stream.is_finished());
}

#[tokio::test]
async fn test_stream_errors_on_close() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"s\":\"$1\"}\n1:r\n1:T2,hi").unwrap();

    let value = root.poll().ready().unwrap();
    let stream = match value.get("s") {
        Value::Stream(StreamValue::Readable(stream)) => stream,
        other => panic!("expected a readable stream, got {:?}", other),
    };
    sink.end();

    assert!(matches!(stream.next().await, Err(RowwireError::ConnectionClosed)));
}

#[tokio::test]
async fn test_async_iterator() {
    let (root, sink) = session();
    sink.push_bytes(b"0:x\n0:1\n0:{\"two\":\"$2\"}\n0:C\"end\"\n2:2\n")
        .unwrap();

    let iterator = match root.poll().ready() {
        Some(Value::Stream(stream)) => stream.iterator().unwrap(),
        other => panic!("expected an iterator, got {:?}", other),
    };
    let items = iterator.collect().await.unwrap();
    let json: Vec<_> = items.iter().map(Value::to_json).collect();
    assert_eq!(json, vec![json!(1), json!({ "two": 2 })]);
}

#[tokio::test]
async fn test_async_iterable_is_replayable() {
    let (root, sink) = session();
    sink.push_bytes(b"0:X\n0:\"a\"\n").unwrap();

    let stream = match root.poll().ready() {
        Some(Value::Stream(stream)) => stream,
        other => panic!("expected an iterable, got {:?}", other),
    };
    let first = stream.iterator().unwrap();
    assert_eq!(first.next().await.unwrap().unwrap().as_str(), Some("a"));
    let pending = first.next_chunk();

    sink.push_bytes(b"0:\"b\"\n0:C\n").unwrap();
    assert!(pending.poll().is_ready());

    let second = stream.iterator().unwrap();
    let all = second.collect().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(first.next().await.unwrap().is_none());
}

// ==================== Modules ====================

fn module_manifest() -> Manifest {
    Manifest::from_json(
        r#"{
            "moduleMap": {
                "app/button.js": { "Button": { "specifier": "/c/button.js", "name": "Button" } }
            },
            "moduleLoading": { "prefix": "/static/" }
        }"#,
    )
    .unwrap()
}

#[test]
fn test_module_reference_waits_for_load() {
    let loader = Rc::new(StaticModuleLoader::new());
    let load = loader.register_deferred("/c/button.js");
    let (root, sink) = SessionBuilder::new()
        .manifest(module_manifest())
        .module_loader(loader.clone())
        .build();

    sink.push_bytes(b"1:I[\"app/button.js\",\"Button\"]\n2:I[\"app/button.js\",\"Button\"]\n0:[\"$1\",\"$2\"]\n")
        .unwrap();
    assert_eq!(root.status(), ChunkStatus::Blocked);
    assert_eq!(loader.preload_count(), 1);

    load.resolve(exports(&[("Button", Value::from("button-component"))]));

    assert_eq!(root_json(&root), json!(["button-component", "button-component"]));
}

#[test]
fn test_missing_module_rejects_only_its_chunk() {
    let (root, sink) = SessionBuilder::new().manifest(module_manifest()).build();
    sink.push_bytes(b"1:I[\"app/missing.js\",\"\"]\n2:\"fine\"\n0:{\"m\":\"$1\"}\n")
        .unwrap();

    assert!(matches!(
        root.poll(),
        ChunkPoll::Failed(RowwireError::ModuleNotFound(path)) if path == "app/missing.js"
    ));
    assert!(root.session().get_chunk(2).poll().is_ready());
    assert!(!root.session().is_closed());
}

#[test]
fn test_failed_module_load() {
    let loader = Rc::new(StaticModuleLoader::new());
    let load = loader.register_deferred("/c/button.js");
    let (root, sink) = SessionBuilder::new()
        .manifest(module_manifest())
        .module_loader(loader)
        .build();
    sink.push_bytes(b"0:I[\"app/button.js\",\"Button\"]\n").unwrap();

    load.reject(RowwireError::ModuleLoad("network".to_string()));
    assert!(matches!(root.poll(), ChunkPoll::Failed(RowwireError::ModuleLoad(_))));
}

// ==================== Remote procedures ====================

#[tokio::test]
async fn test_server_reference_uses_remote_call() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = calls.clone();
    let (root, sink) = SessionBuilder::new()
        .on_remote_call(move |id, args| {
            seen.borrow_mut().push((id.to_string(), args.len()));
            Ok(Value::from("called"))
        })
        .build();
    sink.push_bytes(b"1:{\"id\":\"act#1\",\"bound\":[\"x\"]}\n0:{\"act\":\"$F1\"}\n")
        .unwrap();

    let value = root.poll().ready().unwrap();
    let Value::ServerReference(action) = value.get("act") else {
        panic!("expected a server reference");
    };
    assert_eq!(action.id(), "act#1");

    let result = action.call(vec![Value::from("y")]).await.unwrap();
    assert_eq!(result.as_str(), Some("called"));
    assert_eq!(*calls.borrow(), vec![("act#1".to_string(), 2)]);
}

#[tokio::test]
async fn test_server_reference_through_server_map() {
    let manifest = Manifest::from_json(
        r#"{ "serverMap": { "act#1": { "specifier": "/s/actions.js", "name": "save" } } }"#,
    )
    .unwrap();
    let loader = Rc::new(StaticModuleLoader::new());
    let save = Callable::new(|args| Ok(Value::from(args.len() as f64)));
    loader.register("/s/actions.js", exports(&[("save", Value::Callable(save))]));
    let (root, sink) = SessionBuilder::new()
        .manifest(manifest)
        .module_loader(loader)
        .build();

    sink.push_bytes(b"0:{\"act\":\"$F1\"}\n").unwrap();
    assert_eq!(root.status(), ChunkStatus::Blocked);
    sink.push_bytes(b"2:[1,2]\n1:{\"id\":\"act#1\",\"bound\":\"$@2\"}\n")
        .unwrap();

    let value = root.poll().ready().unwrap();
    let Value::ServerReference(action) = value.get("act") else {
        panic!("expected a server reference");
    };
    assert!(action.target().is_some());
    let result = action.call(vec![Value::Null]).await.unwrap();
    assert_eq!(result.as_f64(), Some(3.0));
}

#[test]
fn test_unknown_server_reference() {
    let manifest = Manifest::from_json(r#"{ "serverMap": {} }"#).unwrap();
    let (root, sink) = SessionBuilder::new().manifest(manifest).build();
    sink.push_bytes(b"1:{\"id\":\"gone\",\"bound\":null}\n0:\"$F1\"\n").unwrap();
    assert!(matches!(
        root.poll(),
        ChunkPoll::Failed(RowwireError::ServerReferenceNotFound(id)) if id == "gone"
    ));
}

// ==================== Side channels ====================

#[test]
fn test_console_replay_keeps_order() {
    let logged = Rc::new(RefCell::new(Vec::new()));
    let log = logged.clone();
    let (_root, sink) = SessionBuilder::new()
        .replay_logs(true)
        .on_console(move |args| log.borrow_mut().push(args.to_json()))
        .build();

    sink.push_bytes(b"0:W[\"log\",\"first\",\"$5\"]\n0:W[\"log\",\"second\"]\n").unwrap();
    assert!(logged.borrow().is_empty());

    sink.push_bytes(b"5:{\"n\":5}\n").unwrap();
    assert_eq!(
        *logged.borrow(),
        vec![json!(["log", "first", { "n": 5 }]), json!(["log", "second"])]
    );
}

#[test]
fn test_console_rows_ignored_without_replay() {
    let logged = Rc::new(RefCell::new(0));
    let log = logged.clone();
    let (_root, sink) = SessionBuilder::new()
        .on_console(move |_| *log.borrow_mut() += 1)
        .build();
    sink.push_bytes(b"0:W[\"log\",\"x\"]\n").unwrap();
    assert_eq!(*logged.borrow(), 0);
}

#[test]
fn test_hints_time_origin_and_debug_info() {
    let hints = Rc::new(RefCell::new(Vec::new()));
    let seen = hints.clone();
    let (root, sink) = SessionBuilder::new()
        .on_hint(move |code, model| seen.borrow_mut().push((code.to_string(), model.clone())))
        .build();

    sink.push_bytes(b"0:HL[\"/style.css\",\"style\"]\n0:N1700000000000.5\n3:D{\"name\":\"Widget\"}\n3:D{\"name\":\"Inner\"}\n3:J{\"start\":1}\n")
        .unwrap();

    assert_eq!(*hints.borrow(), vec![("L".to_string(), json!(["/style.css", "style"]))]);
    let session = root.session();
    assert_eq!(session.time_origin(), Some(1_700_000_000_000.5));
    assert_eq!(session.debug_info(3).len(), 2);
    assert_eq!(session.io_info(3), vec![json!({ "start": 1 })]);
    assert_eq!(root.status(), ChunkStatus::Pending);
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_release_fails_outstanding_values() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"x\":\"$L1\"}\n").unwrap();
    let lazy = root.poll().ready().unwrap().get("x");
    let chunk = lazy.as_chunk().unwrap().clone();

    root.release();

    assert!(sink.is_released());
    assert!(sink.push_bytes(b"1:\"late\"\n").is_ok());
    assert!(matches!(chunk.settled().await, Err(RowwireError::SessionReleased)));
}

#[tokio::test]
async fn test_root_value_future() {
    let (root, sink) = session();
    sink.push_bytes(b"0:{\"a\":\"$1\"}\n").unwrap();
    let pending = root.value();
    sink.push_bytes(b"1:42\n").unwrap();
    assert_eq!(pending.await.unwrap().to_json(), json!({ "a": 42 }));
}

// ==================== Transport ====================

#[tokio::test]
async fn test_pump_reads_to_end() {
    let (root, sink) = session();
    let data: &[u8] = b"1:\"x\"\n0:[\"$1\",\"$2\"]\n2:T3,abc";

    pump(&sink, data).await.unwrap();

    assert_eq!(root.value().await.unwrap().to_json(), json!(["x", "abc"]));
    assert!(root.session().is_closed());
}

#[tokio::test]
async fn test_pump_over_duplex_in_pieces() {
    use tokio::io::AsyncWriteExt;

    let (root, sink) = session();
    let (mut writer, reader) = tokio::io::duplex(8);
    let data = b"0:{\"greeting\":\"$1\"}\n1:T5,hello".to_vec();

    let write = async move {
        for piece in data.chunks(3) {
            writer.write_all(piece).await.unwrap();
            tokio::task::yield_now().await;
        }
    };
    let (read, _, value) = tokio::join!(pump(&sink, reader), write, root.value());

    read.unwrap();
    assert_eq!(value.unwrap().to_json(), json!({ "greeting": "hello" }));
}

#[test]
fn test_open_with_closure_transport() {
    let root = rowwire_client::open(
        |sink: TransportSink| {
            sink.push_bytes(b"0:\"ready\"\n").unwrap();
        },
        Manifest::default(),
        Default::default(),
    );
    assert_eq!(root.poll().ready().unwrap().as_str(), Some("ready"));
}
