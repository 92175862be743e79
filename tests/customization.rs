//! Pipeline customization and its survival across property re-derivation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use daq_props::mock::{mock_transport, MockDevice};
use daq_props::property::{CHECKS_STAGE, VALIDATE_STAGE};
use daq_props::{
    Change, HookPoint, Instrument, InstrumentOptions, LimitsValidator, NodeDecl, NodeExt,
    PropertyConfig, PropertyError, Stage, Value, ValueKind,
};

/// Driver with a checked `feat` property and two flags.
fn to_custom() -> NodeDecl {
    let flag = |cmd: &str| {
        PropertyConfig::new()
            .with_getter(cmd)
            .with_kind(ValueKind::Bool)
            .with_caching(false)
    };
    let mut decl = NodeDecl::new();
    decl.declare("aux", flag("AUX?")).unwrap();
    decl.declare("aux2", flag("AUX2?")).unwrap();
    decl.declare(
        "feat",
        PropertyConfig::new()
            .with_getter("FEAT?")
            .with_kind(ValueKind::Bool)
            .with_checks("{aux} == true")
            .with_caching(false),
    )
    .unwrap();
    decl
}

/// Pre-read stage counting its calls and requiring `aux2`.
fn counting_stage(calls: &Arc<AtomicUsize>) -> Stage {
    let calls = calls.clone();
    Stage::pre_read(move |property, node| {
        calls.fetch_add(1, Ordering::SeqCst);
        if node.read("aux2")? != Value::Bool(true) {
            return Err(PropertyError::validation(property.name(), "aux2 is off"));
        }
        Ok(())
    })
}

fn connect(decl: NodeDecl) -> (Arc<Instrument>, MockDevice) {
    let (transport, device) = mock_transport();
    device.set_register("AUX", "1");
    device.set_register("AUX2", "1");
    device.set_register("FEAT", "1");
    (Instrument::new(decl, transport, InstrumentOptions::default()), device)
}

/// Run the three scenarios shared by every customization test and return
/// the call counts observed after each one.
fn scenario(decl: NodeDecl, calls: &Arc<AtomicUsize>) -> [usize; 3] {
    let (driver, device) = connect(decl);

    assert_eq!(driver.read("feat").unwrap(), Value::Bool(true));
    let first = calls.load(Ordering::SeqCst);

    device.set_register("AUX2", "0");
    assert!(driver.read("feat").unwrap_err().is_validation());
    let second = calls.load(Ordering::SeqCst);

    device.set_register("AUX2", "1");
    device.set_register("AUX", "0");
    let _ = driver.read("feat");
    let third = calls.load(Ordering::SeqCst);

    [first, second, third]
}

fn customized(change: impl FnOnce(Stage) -> Change) -> (NodeDecl, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut decl = to_custom();
    decl.customize("feat", HookPoint::PreRead, change(counting_stage(&calls)))
        .unwrap();
    (decl, calls)
}

// =============================================================================
// Customizing
// =============================================================================

#[test]
fn test_customizing_append() {
    let (decl, calls) = customized(|stage| Change::append("custom", stage));
    assert_eq!(
        decl.property("feat").unwrap().composer(HookPoint::PreRead).names(),
        vec![CHECKS_STAGE, "custom"]
    );
    // Failing checks stop the chain before the custom stage
    assert_eq!(scenario(decl, &calls), [1, 2, 2]);
}

#[test]
fn test_customizing_prepend() {
    let (decl, calls) = customized(|stage| Change::prepend("custom", stage));
    assert_eq!(scenario(decl, &calls), [1, 2, 3]);
}

#[test]
fn test_customizing_add_after() {
    let (decl, calls) = customized(|stage| Change::add_after(CHECKS_STAGE, "custom", stage));
    assert_eq!(scenario(decl, &calls), [1, 2, 2]);
}

#[test]
fn test_customizing_add_before() {
    let (decl, calls) = customized(|stage| Change::add_before(CHECKS_STAGE, "custom", stage));
    assert_eq!(scenario(decl, &calls), [1, 2, 3]);
}

#[test]
fn test_customizing_replace() {
    let (decl, calls) = customized(|stage| Change::replace(CHECKS_STAGE, stage));
    let (driver, device) = connect(decl);

    // The aux check is gone
    device.set_register("AUX", "0");
    assert_eq!(driver.read("feat").unwrap(), Value::Bool(true));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    device.set_register("AUX2", "0");
    assert!(driver.read("feat").is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_customizing_unknown_anchor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut decl = to_custom();
    let err = decl
        .customize(
            "feat",
            HookPoint::PreRead,
            Change::add_after("missing", "custom", counting_stage(&calls)),
        )
        .unwrap_err();
    assert!(err.is_structural());
    assert!(decl.property("feat").unwrap().customs().is_empty());
}

#[test]
fn test_override_whole_hook() {
    let mut decl = to_custom();
    decl.customize(
        "feat",
        HookPoint::PostRead,
        Change::Override(Stage::post_read(|_, _, _| Ok(Value::Int(42)))),
    )
    .unwrap();
    let (driver, _device) = connect(decl);
    assert_eq!(driver.read("feat").unwrap(), Value::Int(42));
}

#[test]
fn test_read_and_write_overrides() {
    let mut decl = without_checks(to_custom());
    decl.override_read("feat", |_, node| node.read("aux")).unwrap();
    decl.override_write("aux", |_, _, value| Ok(Value::from(format!("ack {}", value))))
        .unwrap();
    assert!(decl.property("aux").unwrap().is_writable());
    let (driver, device) = connect(decl);

    device.set_register("FEAT", "0");
    assert_eq!(driver.read("feat").unwrap(), Value::Bool(true));
    device.set_register("AUX", "0");
    assert_eq!(driver.read("feat").unwrap(), Value::Bool(false));

    driver.write("aux", true).unwrap();
    assert!(device.writes().is_empty());
}

// =============================================================================
// Copying custom behaviors
// =============================================================================

fn without_checks(mut decl: NodeDecl) -> NodeDecl {
    decl.set_property("feat", |config| config.checks = None).unwrap();
    decl
}

#[test]
fn test_copying_custom_behavior_append() {
    let (decl, calls) = customized(|stage| Change::append("custom", stage));
    assert_eq!(scenario(without_checks(decl), &calls), [1, 2, 3]);
}

#[test]
fn test_copying_custom_behavior_add_after() {
    let (decl, calls) = customized(|stage| Change::add_after(CHECKS_STAGE, "custom", stage));
    let decl = without_checks(decl);
    assert_eq!(
        decl.property("feat").unwrap().composer(HookPoint::PreRead).names(),
        vec!["custom"]
    );
    assert_eq!(scenario(decl, &calls), [1, 2, 3]);
}

#[test]
fn test_copying_custom_behavior_replace() {
    let (decl, calls) = customized(|stage| Change::replace(CHECKS_STAGE, stage));
    let decl = without_checks(decl);
    assert_eq!(scenario(decl, &calls), [1, 2, 3]);
}

#[test]
fn test_copying_keeps_surviving_anchor() {
    let (mut decl, calls) = customized(|stage| Change::add_after(CHECKS_STAGE, "custom", stage));
    decl.set_property("feat", |config| config.retries = 2).unwrap();
    assert_eq!(
        decl.property("feat").unwrap().composer(HookPoint::PreRead).names(),
        vec![CHECKS_STAGE, "custom"]
    );
    assert_eq!(scenario(decl, &calls), [1, 2, 2]);
}

/// Settable voltage with a write check and limits, its pre-write chain
/// extended with three recording stages.
fn recorded_setpoint() -> (NodeDecl, Arc<Mutex<Vec<&'static str>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: &'static str| {
        let log = log.clone();
        Stage::pre_write(move |_, _, value| {
            log.lock().unwrap().push(tag);
            Ok(value)
        })
    };

    let mut decl = NodeDecl::new();
    decl.declare(
        "volt",
        PropertyConfig::new()
            .with_getter("VOLT?")
            .with_setter("VOLT {value}")
            .with_kind(ValueKind::Float)
            .with_split_checks(None, Some("value >= 0"))
            .with_limits(LimitsValidator::float(Some(0.0), Some(10.0), None)),
    )
    .unwrap();
    for change in [
        Change::add_after(CHECKS_STAGE, "a", record("a")),
        Change::add_before(VALIDATE_STAGE, "b", record("b")),
        Change::prepend("c", record("c")),
    ] {
        decl.customize("volt", HookPoint::PreWrite, change).unwrap();
    }
    (decl, log)
}

fn pre_write_names(decl: &NodeDecl) -> Vec<String> {
    let volt = decl.property("volt").unwrap();
    volt.composer(HookPoint::PreWrite)
        .names()
        .into_iter()
        .map(String::from)
        .collect()
}

#[test]
fn test_copying_reproduces_call_order() {
    let (mut decl, log) = recorded_setpoint();
    let before = pre_write_names(&decl);
    assert_eq!(before, vec!["c", CHECKS_STAGE, "a", "b", VALIDATE_STAGE]);

    decl.set_property("volt", |config| config.retries = 3).unwrap();
    assert_eq!(pre_write_names(&decl), before);
    assert_eq!(decl.property("volt").unwrap().retries(), 3);

    let (transport, device) = mock_transport();
    let driver = Instrument::new(decl, transport, InstrumentOptions::default());
    driver.write("volt", 1.0).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b"]);
    assert_eq!(device.writes(), vec!["VOLT 1"]);

    // Checks still run between "c" and "a"
    assert!(driver.write("volt", -1.0).unwrap_err().is_validation());
    assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b", "c"]);
}

#[test]
fn test_copying_add_before_without_anchor_appends_once() {
    let (mut decl, log) = recorded_setpoint();
    decl.set_property("volt", |config| config.limits = None).unwrap();

    let names = pre_write_names(&decl);
    assert_eq!(names, vec!["c", CHECKS_STAGE, "a", "b"]);
    assert_eq!(names.iter().filter(|name| name.as_str() == "b").count(), 1);

    let (transport, device) = mock_transport();
    let driver = Instrument::new(decl, transport, InstrumentOptions::default());
    // Out of the former limits, accepted now
    driver.write("volt", 20.0).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b"]);
    assert_eq!(device.writes(), vec!["VOLT 20"]);
}

#[test]
fn test_removed_builtin_stays_removed() {
    let mut decl = to_custom();
    decl.customize("feat", HookPoint::PreRead, Change::remove(CHECKS_STAGE))
        .unwrap();
    decl.set_property("feat", |config| config.retries = 2).unwrap();

    let feat = decl.property("feat").unwrap();
    assert_eq!(feat.retries(), 2);
    assert!(feat.composer(HookPoint::PreRead).is_empty());
}

#[test]
fn test_read_override_survives_derivation() {
    let mut decl = to_custom();
    decl.override_read("feat", |_, _| Ok(Value::from("overridden")))
        .unwrap();
    decl.set_property("feat", |config| config.kind = None).unwrap();

    let (driver, device) = connect(decl);
    assert_eq!(driver.read("feat").unwrap(), Value::from("overridden"));
    assert!(!device.queries().contains(&"FEAT?".to_string()));
}

#[test]
fn test_specialized_declaration_leaves_base_untouched() {
    let base = to_custom();
    let mut specialized = base.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    specialized
        .customize("feat", HookPoint::PreRead, Change::append("custom", counting_stage(&calls)))
        .unwrap();

    assert!(Arc::ptr_eq(
        &base.property("aux").unwrap(),
        &specialized.property("aux").unwrap()
    ));
    assert!(!Arc::ptr_eq(
        &base.property("feat").unwrap(),
        &specialized.property("feat").unwrap()
    ));
    assert_eq!(
        base.property("feat").unwrap().composer(HookPoint::PreRead).names(),
        vec![CHECKS_STAGE]
    );

    let (driver, _device) = connect(base);
    driver.read("feat").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
