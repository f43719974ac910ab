//! Integration tests for imports, calls and snippets

mod common;

use common::{bridge, fixture_module, fixture_path};
use futures::executor::block_on;
use futures::future::join_all;
use ncp_python::{
    BridgeError, CallArguments, ErrorKind, Handle, HostValue, ObjectHandle, KWARGS_MARKER,
};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

const MODULE: &str = "bridgetest.py";

fn args(values: Vec<HostValue>) -> CallArguments {
    CallArguments::positional(values)
}

#[test]
fn test_basic_calls() {
    let py = bridge();
    let module = fixture_module(MODULE);

    assert_eq!(
        py.call_sync(module, "hello", CallArguments::new()).unwrap(),
        HostValue::from("hello world")
    );
    assert_eq!(
        py.call_sync(module, "calc", args(vec![true.into(), 2.into(), 3.into()]))
            .unwrap(),
        HostValue::Int(5)
    );
    assert_eq!(
        py.call_sync(module, "calc", args(vec![false.into(), 2.into(), 3.into()]))
            .unwrap(),
        HostValue::Int(6)
    );
    assert_eq!(
        py.call_sync(module, "concatenate", args(vec!["aaa".into(), "bbb".into()]))
            .unwrap(),
        HostValue::from("aaabbb")
    );
    assert_eq!(
        py.call_sync(module, "check", args(vec![42.into()])).unwrap(),
        HostValue::Bool(true)
    );
    assert_eq!(
        py.call_sync(module, "check", args(vec![43.into()])).unwrap(),
        HostValue::Bool(false)
    );
}

#[test]
fn test_round_trip_identity() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let values = vec![
        HostValue::Undefined,
        HostValue::Null,
        HostValue::Bool(true),
        HostValue::Int(-7),
        HostValue::Float(2.5),
        HostValue::Float(4.0),
        HostValue::from("text"),
        HostValue::from(json!({
            "a": 1,
            "b": [1, 2, "rrr"],
            "c": {"test": 34, "array": ["a", "b"], "none": null}
        })),
        HostValue::Array(vec![HostValue::Undefined, HostValue::Null]),
    ];

    for value in values {
        let back = py
            .call_sync(module, "echo", args(vec![value.clone()]))
            .unwrap();
        assert_eq!(back, value);
    }
}

#[test]
fn test_absent_states_are_distinct_inside_python() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let undefined = py
        .call_sync(module, "kind", args(vec![HostValue::Undefined]))
        .unwrap();
    let null = py
        .call_sync(module, "kind", args(vec![HostValue::Null]))
        .unwrap();

    assert_eq!(undefined, HostValue::from("Undefined"));
    assert_eq!(null, HostValue::from("NoneType"));
}

#[test]
fn test_numeric_kinds_survive_containers() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let value = HostValue::Array(vec![HostValue::Int(1), HostValue::Float(1.0)]);
    let kinds = py
        .eval_sync(module, "[type(v).__name__ for v in echo([1, 1.0])]")
        .unwrap();
    assert_eq!(
        kinds,
        HostValue::Array(vec![HostValue::from("int"), HostValue::from("float")])
    );
    assert_eq!(
        py.call_sync(module, "echo", args(vec![value.clone()])).unwrap(),
        value
    );
}

#[test]
fn test_return_shapes() {
    let py = bridge();
    let module = fixture_module(MODULE);

    assert_eq!(
        py.call_sync(module, "createtuple", CallArguments::new())
            .unwrap(),
        HostValue::Tuple(vec!["aaa".into(), 1.into(), 2.3.into()])
    );

    let result = py
        .call_sync(
            module,
            "undefined",
            args(vec![HostValue::Undefined, HostValue::Null]),
        )
        .unwrap();
    let items = result.as_slice().unwrap();
    assert_eq!(items[0], HostValue::Undefined);
    assert_eq!(items[1], HostValue::Null);

    let set = items[2].as_slice().unwrap();
    assert_eq!(set.len(), 3);
    assert!(set.contains(&HostValue::Int(1)));
    assert!(set.contains(&HostValue::Int(2)));
    assert!(set.contains(&HostValue::from("www")));
}

#[test]
fn test_mergedict() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let first = HostValue::from(json!({"a": 1, "b": [1, 2, "rrr"], "c": {"test": 34}}));
    let second = HostValue::from(json!({"aa": {"test": 56, "4": ["a", {"a": 3}]}}));

    let merged = py
        .call_sync(module, "mergedict", args(vec![first, second]))
        .unwrap();
    let expected = HostValue::from(json!({
        "a": 1,
        "b": [1, 2, "rrr"],
        "c": {"test": 34},
        "aa": {"test": 56, "4": ["a", {"a": 3}]}
    }));
    assert_eq!(merged, expected);
}

#[test]
fn test_arity_messages() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let one_missing = py
        .call_sync(module, "dump", args(vec!["a".into()]))
        .unwrap_err();
    assert_eq!(one_missing.kind(), ErrorKind::ArgumentFailure);
    assert!(one_missing
        .to_string()
        .contains("missing 1 required positional argument: 'b'"));

    let two_missing = py
        .call_sync(module, "dump", CallArguments::new())
        .unwrap_err();
    assert_eq!(two_missing.kind(), ErrorKind::ArgumentFailure);
    assert!(two_missing
        .to_string()
        .contains("missing 2 required positional arguments: 'a' and 'b'"));
}

#[test]
fn test_runtime_error_carries_message_and_traceback() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let err = py
        .call_sync(module, "error", CallArguments::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert_eq!(err.to_string(), "ValueError: something went wrong");
    assert!(err.traceback().is_some());
    assert!(err.full_message().starts_with("ValueError: something went wrong\n"));
}

#[test]
fn test_unknown_member_and_class() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let err = py
        .call_sync(module, "nothing_here", CallArguments::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LookupFailure);
    assert!(err.to_string().contains("'nothing_here'"));
    assert!(err.to_string().contains("module 'bridgetest'"));

    let err = py
        .create_sync(module, "Calculator2", CallArguments::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LookupFailure);
}

#[test]
fn test_invalid_handles() {
    let py = bridge();

    let err = py
        .call_sync(ObjectHandle::from_raw(u64::MAX), "error", CallArguments::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandleFailure);

    let err = py
        .call_wire_sync(vec!["test".into(), "error".into()])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandleFailure);

    let err = block_on(py.call_wire(vec!["test".into(), "error".into()])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandleFailure);
}

#[test]
fn test_wrong_argument_shapes_fail_before_entry() {
    let py = bridge();
    let function = HostValue::Function(ncp_python::HostFunctionRef::from_fn(|_| {
        Ok(HostValue::Null)
    }));

    let err = py.call_wire_sync(vec![function]).unwrap_err();
    assert!(matches!(err, BridgeError::WrongArguments));
    assert_eq!(err.to_string(), "Wrong type of arguments");
}

#[test]
fn test_unknown_type_does_not_execute() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let before = py.eval_sync(module, "len(calls)").unwrap();
    let err = py
        .call_sync(
            module,
            "record",
            args(vec![HostValue::Unsupported("symbol".to_string())]),
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownType(_)));
    assert!(err.to_string().starts_with("Invalid parameter: unknown type"));

    // Nested unsupported values are rejected just the same
    let nested = HostValue::object([(
        "inner",
        HostValue::Array(vec![HostValue::Unsupported("bigint".to_string())]),
    )]);
    assert!(py.call_sync(module, "record", args(vec![nested])).is_err());

    assert_eq!(py.eval_sync(module, "len(calls)").unwrap(), before);
}

#[test]
fn test_import_yields_distinct_handles_unless_deduplicated() {
    let py = bridge();
    let path = fixture_path(MODULE);

    let first = py.import_sync(&path, false).unwrap();
    let second = py.import_sync(&path, false).unwrap();
    assert_ne!(first, second);

    let reused = py.import_sync(&path, true).unwrap();
    let again = py.import_sync(&path, true).unwrap();
    assert_eq!(reused, again);

    // Every handle reaches the same module
    assert_eq!(
        py.call_sync(first, "check", args(vec![42.into()])).unwrap(),
        HostValue::Bool(true)
    );
}

#[test]
fn test_import_failures() {
    let py = bridge();

    let err = py
        .import_sync(&fixture_path("ncp_missing_module.py"), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImportFailure);
    assert!(err.to_string().starts_with("Cannot load module"));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ncp_syntax_error.py");
    fs::write(&path, "def broken(:\n    pass\n").unwrap();
    let err = block_on(py.import(&path.to_string_lossy(), false)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImportFailure);
    assert!(err.to_string().contains("SyntaxError"));
}

#[test]
fn test_keyword_arguments_change_behavior() {
    let py = bridge();
    let module = fixture_module(MODULE);
    let vector = HostValue::from(json!([1.0, 2.0]));
    let other = HostValue::from(json!([10.0, 20.0]));

    let plain = py
        .create_sync(module, "Calculator", args(vec![vector.clone()]))
        .unwrap();
    let scaled = py
        .create_sync(
            module,
            "Calculator",
            CallArguments::from_wire(vec![
                vector,
                HostValue::from(json!({"factor": 2, KWARGS_MARKER: true})),
            ])
            .unwrap(),
        )
        .unwrap();

    let plain = py
        .call_sync(plain, "multiply", args(vec![2.into(), other.clone()]))
        .unwrap();
    let scaled = py
        .call_sync(scaled, "multiply", args(vec![2.into(), other]))
        .unwrap();

    assert_eq!(plain, HostValue::from(json!([12.0, 24.0])));
    assert_eq!(scaled, HostValue::from(json!([24.0, 48.0])));
}

#[test]
fn test_keyword_marker_never_reaches_callee() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let result = py
        .call_wire_sync(vec![
            HostValue::Handle(Handle::from(module)),
            "received".into(),
            1.into(),
            HostValue::from(json!({"value": 2, KWARGS_MARKER: true})),
        ])
        .unwrap();
    assert_eq!(
        result,
        HostValue::from(json!({"args": [1], "kwargs": {"value": 2}}))
    );

    // Without the marker the object is an ordinary positional mapping
    let result = py
        .call_sync(
            module,
            "received",
            args(vec![HostValue::from(json!({"value": 2}))]),
        )
        .unwrap();
    assert_eq!(
        result,
        HostValue::from(json!({"args": [{"value": 2}], "kwargs": {}}))
    );
}

#[test]
fn test_object_handles() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let calculator = py
        .create_sync(
            module,
            "Calculator",
            args(vec![HostValue::from(json!([1.4, 5.5, 1.2, 4.4]))]),
        )
        .unwrap();
    let result = py
        .call_sync(
            calculator,
            "multiply",
            args(vec![2.into(), HostValue::from(json!([10.4, 50.5, 10.2, 40.4]))]),
        )
        .unwrap();

    let expected = [13.2, 61.5, 12.6, 49.2];
    let values: Vec<f64> = result
        .as_slice()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    for (value, expected) in values.iter().zip(expected) {
        assert!((value - expected).abs() < 1e-9);
    }

    // The instance can be handed back as an argument
    let kind = py
        .call_sync(module, "kind", args(vec![Handle::from(calculator).into()]))
        .unwrap();
    assert_eq!(kind, HostValue::from("Calculator"));

    assert!(py.release(calculator).unwrap());
    assert!(!py.release(calculator).unwrap());
    let err = py
        .call_sync(calculator, "multiply", CallArguments::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandleFailure);
}

#[test]
fn test_exec_and_eval() {
    let py = bridge();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ncp_snippets.py");
    fs::write(&path, "base = 10\n").unwrap();
    let module = py.import_sync(&path.to_string_lossy(), false).unwrap();

    assert_eq!(
        py.exec_sync(module, "base = base + 5\nextra = [base] * 2")
            .unwrap(),
        HostValue::Undefined
    );
    assert_eq!(py.eval_sync(module, "base").unwrap(), HostValue::Int(15));
    assert_eq!(
        py.eval_sync(module, "extra").unwrap(),
        HostValue::from(json!([15, 15]))
    );
    assert_eq!(
        block_on(py.exec(module, "base = 1")).unwrap(),
        HostValue::Undefined
    );
    assert_eq!(
        block_on(py.eval(module, "base * 3")).unwrap(),
        HostValue::Int(3)
    );

    let err = py.eval_sync(module, "undefined_name + 1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert!(err.to_string().starts_with("NameError"));
}

#[test]
fn test_eval_on_object_binds_self() {
    let py = bridge();
    let module = fixture_module(MODULE);
    let calculator = py
        .create_sync(
            module,
            "Calculator",
            CallArguments::new()
                .arg(HostValue::from(json!([1, 2])))
                .kwarg("factor", 3),
        )
        .unwrap();

    assert_eq!(
        py.eval_sync(calculator, "self.factor * len(self.vector)")
            .unwrap(),
        HostValue::Int(6)
    );
}

#[test]
fn test_async_variants() {
    let py = bridge();
    let path = fixture_path(MODULE);

    let module = block_on(py.import(&path, true)).unwrap();
    let calculator = py
        .create(
            module,
            "Calculator",
            args(vec![HostValue::from(json!([1, 2]))]),
        )
        .wait()
        .unwrap();
    let result = py
        .call(calculator, "multiply", args(vec![1.into(), HostValue::from(json!([1, 1]))]))
        .wait()
        .unwrap();
    assert_eq!(result, HostValue::from(json!([2, 3])));

    let err = py
        .call(module, "dump", args(vec!["a".into()]))
        .wait()
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("missing 1 required positional argument: 'b'"));

    let err = py.create(module, "Calculator2", CallArguments::new()).wait();
    assert!(matches!(err, Err(BridgeError::Lookup { .. })));
}

#[test]
fn test_many_concurrent_async_calls() {
    let py = bridge();
    let module = fixture_module(MODULE);

    let pending: Vec<_> = (0..32)
        .map(|i| py.call(module, "calc", args(vec![true.into(), i.into(), 1.into()])))
        .collect();
    let results = block_on(join_all(pending));

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), HostValue::Int(i as i64 + 1));
    }
}

#[test]
fn test_reimport_resets_module_state() {
    let py = bridge();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ncp_counter.py");
    fs::write(
        &path,
        "counter = 5\n\ndef next_value():\n    global counter\n    counter += 1\n    return counter\n",
    )
    .unwrap();
    let path = path.to_string_lossy().into_owned();
    let module = py.import_sync(&path, false).unwrap();

    let next = || py.call_sync(module, "next_value", CallArguments::new()).unwrap();
    assert_eq!(next(), HostValue::Int(6));
    assert_eq!(next(), HostValue::Int(7));
    assert_eq!(next(), HostValue::Int(8));

    let reloaded = py.reimport(&dir.path().to_string_lossy()).unwrap();
    assert!(reloaded >= 1);

    assert_eq!(next(), HostValue::Int(6));
    assert_eq!(next(), HostValue::Int(7));

    // A file path works the same way, and the handle never changed
    py.reimport(&path).unwrap();
    assert_eq!(next(), HostValue::Int(6));
    assert_eq!(py.import_sync(&path, true).unwrap(), module);
}

#[test]
fn test_reimport_relative_directory() {
    let py = bridge();
    let dir = TempDir::new_in(".").unwrap();
    assert!(dir.path().is_relative());
    fs::write(
        dir.path().join("ncp_relative_counter.py"),
        "counter = 5\n\ndef next_value():\n    global counter\n    counter += 1\n    return counter\n",
    )
    .unwrap();

    let path = dir.path().join("ncp_relative_counter.py");
    let module = py.import_sync(&path.to_string_lossy(), false).unwrap();
    let next = || py.call_sync(module, "next_value", CallArguments::new()).unwrap();
    assert_eq!(next(), HostValue::Int(6));
    assert_eq!(next(), HostValue::Int(7));

    assert_eq!(py.reimport(&dir.path().to_string_lossy()).unwrap(), 1);
    assert_eq!(next(), HostValue::Int(6));

    // A relative file path without its suffix names the same module
    let stem = dir.path().join("ncp_relative_counter");
    assert_eq!(py.reimport(&stem.to_string_lossy()).unwrap(), 1);
    assert_eq!(next(), HostValue::Int(6));
}

#[test]
fn test_same_stem_in_two_directories() {
    let py = bridge();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    for (dir, tag) in [(&first, "a"), (&second, "b")] {
        fs::write(
            dir.path().join("ncp_twin.py"),
            format!("counter = 0\n\ndef who():\n    global counter\n    counter += 1\n    return '{}' * counter\n", tag),
        )
        .unwrap();
    }

    let import = |dir: &TempDir| {
        py.import_sync(&dir.path().join("ncp_twin.py").to_string_lossy(), false)
            .unwrap()
    };
    let a = import(&first);
    let b = import(&second);

    let who = |module| py.call_sync(module, "who", CallArguments::new()).unwrap();
    assert_eq!(who(a), HostValue::from("a"));
    assert_eq!(who(b), HostValue::from("b"));
    assert_eq!(who(b), HostValue::from("bb"));

    // The directly loaded twin reimports like any other module
    assert_eq!(py.reimport(&second.path().to_string_lossy()).unwrap(), 1);
    assert_eq!(who(b), HostValue::from("b"));
    assert_eq!(who(a), HostValue::from("aa"));
}

#[test]
fn test_add_import_path() {
    let py = bridge();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("ncp_extra_path.py"), "def answer():\n    return 42\n").unwrap();

    py.add_import_path(dir.path()).unwrap();
    py.add_import_path(dir.path()).unwrap();

    let dir_text = dir.path().to_string_lossy().into_owned();
    let paths = py.import_paths();
    assert_eq!(paths.iter().filter(|p| **p == dir_text).count(), 1);

    let module = py.import_sync("ncp_extra_path", false).unwrap();
    assert_eq!(
        py.call_sync(module, "answer", CallArguments::new()).unwrap(),
        HostValue::Int(42)
    );
}

#[test]
fn test_pin_executable() {
    let py = bridge();
    let sys = py.import_sync("sys", true).unwrap();
    let HostValue::String(executable) = py.eval_sync(sys, "executable").unwrap() else {
        panic!("sys.executable is text");
    };

    py.pin_executable(&executable).unwrap();
    assert_eq!(
        py.executable().map(|p| p.to_string_lossy().into_owned()),
        Some(executable.clone())
    );

    let pinned = py
        .eval_sync(
            sys,
            "__import__('os').fsdecode(\
             __import__('multiprocessing.spawn', fromlist=['spawn']).get_executable())",
        )
        .unwrap();
    assert_eq!(pinned, HostValue::String(executable));
}
