//! Node tree: routing to the root, shared lock, channels, path addressing
//! and cache operations.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use daq_props::node::{NodeCore, RoutingArgs};
use daq_props::{
    CacheScope, ChannelDecl, ChannelId, LimitsValidator, Node, NodeDecl, NodeExt, Property,
    PropertyConfig, PropertyError, Result, StructuralError, Value,
};
use serde_json::json;

// =============================================================================
// Recording root node
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Call {
    kind: &'static str,
    token: String,
    routing: RoutingArgs,
}

/// Root node storing written values under their setter token and recording
/// every device operation.
struct DummyParent {
    core: NodeCore,
    registers: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<Call>>,
    reopens: AtomicUsize,
}

impl DummyParent {
    fn new(decl: NodeDecl) -> Arc<Self> {
        let decl = Arc::new(decl);
        Arc::new_cyclic(|this: &Weak<DummyParent>| {
            let this: Weak<dyn Node> = this.clone();
            DummyParent {
                core: NodeCore::new_root(decl, this, true),
                registers: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                reopens: AtomicUsize::new(0),
            }
        })
    }

    fn record(&self, kind: &'static str, token: &str, routing: RoutingArgs) {
        self.calls.lock().push(Call {
            kind,
            token: token.to_string(),
            routing,
        });
    }

    fn last_call(&self) -> Option<Call> {
        self.calls.lock().last().cloned()
    }

    fn calls(&self, kind: &str) -> Vec<Call> {
        self.calls.lock().iter().filter(|c| c.kind == kind).cloned().collect()
    }
}

impl Node for DummyParent {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_node(&self) -> &dyn Node {
        self
    }

    fn parent(&self) -> Option<Arc<dyn Node>> {
        None
    }

    fn resolve_read(&self, _property: &Property, token: &str, routing: RoutingArgs) -> Result<Value> {
        self.record("read", token, routing);
        Ok(self.registers.lock().get(token).cloned().unwrap_or_default())
    }

    fn resolve_write(
        &self,
        _property: &Property,
        token: &str,
        value: &Value,
        routing: RoutingArgs,
    ) -> Result<Value> {
        self.record("write", token, routing);
        self.registers.lock().insert(token.to_string(), value.clone());
        Ok(Value::Null)
    }

    fn resolve_check(
        &self,
        _property: &Property,
        _value: &Value,
        _internal: &Value,
        _response: &Value,
        routing: RoutingArgs,
    ) -> Result<(bool, Option<String>)> {
        self.record("check", "", routing);
        Ok((true, None))
    }

    fn reopen_connection(&self) -> Result<()> {
        self.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rw(token: &str) -> PropertyConfig {
    PropertyConfig::new().with_getter(token).with_setter(token)
}

fn routing(pairs: &[(&str, Value)]) -> RoutingArgs {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// =============================================================================
// Subsystems
// =============================================================================

fn with_subsystem() -> NodeDecl {
    let mut inner = NodeDecl::new();
    inner.declare("deep", rw("DEEP")).unwrap();
    let mut ss = NodeDecl::new().with_doc("Output stage");
    ss.declare("test", rw("TEST")).unwrap();
    ss.add_subsystem("inner", inner);
    let mut decl = NodeDecl::new();
    decl.declare("state", rw("STATE")).unwrap();
    decl.add_subsystem("ss", ss);
    decl
}

#[test]
fn test_subsystem_routing_is_unchanged() {
    let parent = DummyParent::new(with_subsystem());
    let ss = parent.subsystem("ss").unwrap();
    assert_eq!(ss.name(), "ss");
    assert_eq!(ss.declaration().doc(), Some("Output stage"));

    ss.write("test", 1).unwrap();
    assert_eq!(parent.calls("write")[0].routing, RoutingArgs::new());
    assert_eq!(parent.calls("check")[0].routing, RoutingArgs::new());

    parent.write("ss.inner.deep", 2).unwrap();
    assert_eq!(parent.last_call().map(|c| c.kind), Some("check"));
    assert_eq!(parent.calls("write")[1].token, "DEEP");
}

#[test]
fn test_subsystem_shares_lock_and_reopens_parent() {
    let parent = DummyParent::new(with_subsystem());
    let ss = parent.subsystem("ss").unwrap();
    let inner = ss.subsystem("inner").unwrap();
    assert!(Arc::ptr_eq(ss.lock(), parent.lock()));
    assert!(Arc::ptr_eq(inner.lock(), parent.lock()));

    inner.reopen_connection().unwrap();
    assert_eq!(parent.reopens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_subsystem_and_parent_of_root() {
    let parent = DummyParent::new(with_subsystem());
    assert!(matches!(
        parent.read("nope.test").unwrap_err(),
        PropertyError::Structural(StructuralError::UnknownSubsystem(_))
    ));
    assert!(matches!(
        parent.read(".state").unwrap_err(),
        PropertyError::Structural(StructuralError::InvalidPath(_))
    ));
    assert!(parent.read("").unwrap_err().is_structural());
}

// =============================================================================
// Channels
// =============================================================================

fn with_channels(ch: ChannelDecl) -> NodeDecl {
    let mut decl = NodeDecl::new();
    decl.add_channel("ch", ch).unwrap();
    decl
}

fn channel_node() -> NodeDecl {
    let mut node = NodeDecl::new();
    node.declare("volt", rw("CH{id}:VOLT")).unwrap();
    node
}

#[test]
fn test_channel_read_adds_id() {
    let parent = DummyParent::new(with_channels(
        ChannelDecl::new(channel_node()).with_query(|_| Ok(vec![ChannelId::from(1)])),
    ));
    let ch = parent.channel("ch").unwrap().get(1);
    assert_eq!(ch.id(), &ChannelId::Index(1));
    assert_eq!(ch.container(), "ch");

    ch.read("volt").unwrap();
    let call = parent.last_call().unwrap();
    assert_eq!(call.kind, "read");
    assert_eq!(call.token, "CH{id}:VOLT");
    assert_eq!(
        call.routing,
        routing(&[("id", Value::Int(1)), ("ch", Value::Int(1))])
    );
}

#[test]
fn test_channel_write_and_check_add_id() {
    let parent = DummyParent::new(with_channels(ChannelDecl::new(channel_node()).with_ids(["a"])));
    let ch = parent.channel("ch").unwrap().get("a");

    ch.write("volt", 1).unwrap();
    let expected = routing(&[("id", Value::from("a")), ("ch", Value::from("a"))]);
    assert_eq!(parent.calls("write")[0].routing, expected);
    assert_eq!(parent.calls("check")[0].routing, expected);
}

#[test]
fn test_channel_lock_and_reopen() {
    let parent = DummyParent::new(with_channels(ChannelDecl::new(channel_node()).with_ids([1])));
    let ch = parent.channel("ch").unwrap().get(1);
    assert!(Arc::ptr_eq(ch.lock(), parent.lock()));

    ch.reopen_connection().unwrap();
    assert_eq!(parent.reopens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_channel_instances_are_stable() {
    let parent = DummyParent::new(with_channels(
        ChannelDecl::new(channel_node()).with_ids(["a"]).with_alias(0, "a"),
    ));
    let container = parent.channel("ch").unwrap();

    let first = container.get("a");
    assert!(Arc::ptr_eq(&first, &container.get("a")));
    assert!(Arc::ptr_eq(&first, &container.get(0)));
    assert_eq!(container.canonical(&ChannelId::from(0)), ChannelId::from("a"));
    assert_eq!(container.instantiated().len(), 1);
}

#[test]
fn test_listing_aliases_returns_a_copy() {
    let parent = DummyParent::new(with_channels(
        ChannelDecl::new(channel_node()).with_ids(["a"]).with_alias(0, "a"),
    ));
    let container = parent.channel("ch").unwrap();
    let mut aliases = container.aliases();
    assert_eq!(aliases, container.aliases());

    aliases.insert(ChannelId::from(5), ChannelId::from("b"));
    assert_eq!(container.aliases().len(), 1);
}

#[test]
fn test_iteration_yields_each_channel_once() {
    let parent = DummyParent::new(with_channels(
        ChannelDecl::new(channel_node())
            .with_ids([ChannelId::from("a"), ChannelId::from(0), ChannelId::from("b")])
            .with_alias(0, "a"),
    ));
    let container = parent.channel("ch").unwrap();
    let ids: Vec<ChannelId> = container.iter().unwrap().map(|ch| ch.id().clone()).collect();
    assert_eq!(ids, vec![ChannelId::from("a"), ChannelId::from("b")]);
}

#[test]
fn test_available_ids_are_queried_each_time() {
    let mut decl = NodeDecl::new();
    decl.declare("count", rw("COUNT")).unwrap();
    decl.add_channel(
        "ch",
        ChannelDecl::new(channel_node()).with_query(|node| {
            let count = node.read("count")?.as_i64().unwrap_or(0);
            Ok((1..=count).map(ChannelId::from).collect())
        }),
    )
    .unwrap();
    let parent = DummyParent::new(decl);

    parent.write("count", 2).unwrap();
    assert_eq!(parent.channel("ch").unwrap().available().unwrap().len(), 2);
    parent.write("count", 3).unwrap();
    assert_eq!(parent.channel("ch").unwrap().iter().unwrap().count(), 3);
}

#[test]
fn test_nested_channels_keep_innermost_id() {
    let mut outer = NodeDecl::new();
    outer
        .add_channel("sub", ChannelDecl::new(channel_node()).with_ids([7]))
        .unwrap();
    let parent = DummyParent::new(with_channels(ChannelDecl::new(outer).with_ids([1])));

    let sub = parent.channel("ch").unwrap().get(1).channel("sub").unwrap().get(7);
    sub.read("volt").unwrap();
    assert_eq!(
        parent.last_call().unwrap().routing,
        routing(&[
            ("id", Value::Int(7)),
            ("sub", Value::Int(7)),
            ("ch", Value::Int(1)),
        ])
    );
}

#[test]
fn test_detached_channel_reports_structural_error() {
    let parent = DummyParent::new(with_channels(ChannelDecl::new(channel_node()).with_ids([1])));
    let ch = parent.channel("ch").unwrap().get(1);
    drop(parent);

    assert!(matches!(
        ch.read("volt").unwrap_err(),
        PropertyError::Structural(StructuralError::DetachedNode)
    ));
}

// =============================================================================
// Aliases
// =============================================================================

fn alias_tester() -> Arc<DummyParent> {
    let mut sub = NodeDecl::new();
    sub.add_alias("rw_alias", ".state", true).unwrap();
    let mut decl = NodeDecl::new();
    decl.declare("state", rw("STATE")).unwrap();
    decl.add_alias("r_alias", "state", false).unwrap();
    decl.add_subsystem("sub", sub);
    let parent = DummyParent::new(decl);
    parent.registers.lock().insert("STATE".into(), Value::Bool(false));
    parent
}

#[test]
fn test_alias_on_same_level() {
    let tester = alias_tester();
    assert_eq!(tester.read("r_alias").unwrap(), Value::Bool(false));
    tester.write("state", true).unwrap();
    assert_eq!(tester.read("r_alias").unwrap(), Value::Bool(true));

    assert!(matches!(
        tester.write("r_alias", false).unwrap_err(),
        PropertyError::NotWritable(_)
    ));
}

#[test]
fn test_alias_on_parent() {
    let tester = alias_tester();
    assert_eq!(tester.read("sub.rw_alias").unwrap(), Value::Bool(false));
    tester.write("state", true).unwrap();
    assert_eq!(tester.read("sub.rw_alias").unwrap(), Value::Bool(true));

    tester.write("sub.rw_alias", false).unwrap();
    assert_eq!(tester.read("state").unwrap(), Value::Bool(false));
    // Only the target caches
    let snapshot = tester.check_cache(&CacheScope::all()).unwrap();
    assert_eq!(json!(snapshot), json!({"values": {"state": false}, "subsystems": {"sub": {"values": {}}}}));
}

// =============================================================================
// Cache operations
// =============================================================================

struct CacheTest {
    root: Arc<DummyParent>,
}

impl CacheTest {
    fn setup() -> Self {
        let mut ss = NodeDecl::new();
        ss.declare("test", rw("SS:TEST")).unwrap();
        let mut ch = NodeDecl::new();
        ch.declare("aux", rw("AUX")).unwrap();

        let mut decl = NodeDecl::new();
        decl.declare("test1", rw("TEST1")).unwrap();
        decl.declare("test2", rw("TEST2")).unwrap();
        decl.add_subsystem("ss", ss);
        decl.add_channel(
            "ch",
            ChannelDecl::new(ch).with_query(|_| Ok(vec![ChannelId::from(1), ChannelId::from(2)])),
        )
        .unwrap();

        let root = DummyParent::new(decl);
        root.cache().insert("test1", Value::Int(1));
        root.cache().insert("test2", Value::Int(2));
        root.subsystem("ss").unwrap().cache().insert("test", Value::Int(1));
        let container = root.channel("ch").unwrap();
        container.get(1).cache().insert("aux", Value::Int(1));
        container.get(2).cache().insert("aux", Value::Int(2));
        Self { root }
    }

    fn root_values(&self) -> serde_json::Value {
        json!(self.root.cache().snapshot())
    }

    fn ss_values(&self) -> serde_json::Value {
        json!(self.root.subsystem("ss").unwrap().cache().snapshot())
    }

    fn ch_values(&self, id: i64) -> serde_json::Value {
        json!(self.root.channel("ch").unwrap().get(id).cache().snapshot())
    }
}

#[test]
fn test_clear_all_caches() {
    let t = CacheTest::setup();
    t.root.clear_cache(&CacheScope::all()).unwrap();
    assert_eq!(t.root_values(), json!({}));
    assert_eq!(t.ss_values(), json!({}));
    assert_eq!(t.ch_values(1), json!({}));
    assert_eq!(t.ch_values(2), json!({}));
}

#[test]
fn test_clear_save_subsystems() {
    let t = CacheTest::setup();
    t.root.clear_cache(&CacheScope::all().without_subsystems()).unwrap();
    assert_eq!(t.root_values(), json!({}));
    assert_eq!(t.ss_values(), json!({"test": 1}));
    assert_eq!(t.ch_values(1), json!({}));
    assert_eq!(t.ch_values(2), json!({}));
}

#[test]
fn test_clear_save_channels() {
    let t = CacheTest::setup();
    t.root.clear_cache(&CacheScope::all().without_channels()).unwrap();
    assert_eq!(t.root_values(), json!({}));
    assert_eq!(t.ss_values(), json!({}));
    assert_eq!(t.ch_values(1), json!({"aux": 1}));
    assert_eq!(t.ch_values(2), json!({"aux": 2}));
}

#[test]
fn test_clear_by_property() {
    let t = CacheTest::setup();
    t.root
        .clear_cache(&CacheScope::properties(["test1", "ch.aux", "ss.test"]))
        .unwrap();
    assert_eq!(t.root_values(), json!({"test2": 2}));
    assert_eq!(t.ss_values(), json!({}));
    assert_eq!(t.ch_values(1), json!({}));
    assert_eq!(t.ch_values(2), json!({}));
}

#[test]
fn test_clear_by_property_from_subsystem() {
    let t = CacheTest::setup();
    let ss = t.root.subsystem("ss").unwrap();
    ss.clear_cache(&CacheScope::properties([".test1", "test", ".ch.aux"]))
        .unwrap();
    assert_eq!(t.root_values(), json!({"test2": 2}));
    assert_eq!(t.ss_values(), json!({}));
    assert_eq!(t.ch_values(1), json!({}));
    assert_eq!(t.ch_values(2), json!({}));
}

#[test]
fn test_check_cache_all_caches() {
    let t = CacheTest::setup();
    let snapshot = t.root.check_cache(&CacheScope::all()).unwrap();
    assert_eq!(
        json!(snapshot),
        json!({
            "values": {"test1": 1, "test2": 2},
            "subsystems": {"ss": {"values": {"test": 1}}},
            "channels": {"ch": {"1": {"values": {"aux": 1}}, "2": {"values": {"aux": 2}}}}
        })
    );
}

#[test]
fn test_check_cache_save_subsystems() {
    let t = CacheTest::setup();
    let snapshot = t.root.check_cache(&CacheScope::all().without_subsystems()).unwrap();
    assert_eq!(
        json!(snapshot),
        json!({
            "values": {"test1": 1, "test2": 2},
            "channels": {"ch": {"1": {"values": {"aux": 1}}, "2": {"values": {"aux": 2}}}}
        })
    );
}

#[test]
fn test_check_cache_save_channels() {
    let t = CacheTest::setup();
    let snapshot = t.root.check_cache(&CacheScope::all().without_channels()).unwrap();
    assert_eq!(
        json!(snapshot),
        json!({
            "values": {"test1": 1, "test2": 2},
            "subsystems": {"ss": {"values": {"test": 1}}}
        })
    );
}

#[test]
fn test_check_cache_by_property() {
    let t = CacheTest::setup();
    let snapshot = t
        .root
        .check_cache(&CacheScope::properties(["test1", "ss.test", "ch.aux"]))
        .unwrap();
    assert_eq!(
        json!(snapshot),
        json!({
            "values": {"test1": 1},
            "subsystems": {"ss": {"values": {"test": 1}}},
            "channels": {"ch": {"1": {"values": {"aux": 1}}, "2": {"values": {"aux": 2}}}}
        })
    );
    assert!(t
        .root
        .subsystem("ss")
        .unwrap()
        .check_cache(&CacheScope::properties([".test1"]))
        .unwrap_err()
        .is_structural());
}

#[test]
fn test_cache_answers_reads() {
    let t = CacheTest::setup();
    assert_eq!(t.root.read("test1").unwrap(), Value::Int(1));
    // Channels are addressed through their container, not by path
    assert!(t.root.read("ch.aux").unwrap_err().is_structural());
    assert!(t.root.calls("read").is_empty());
}

// =============================================================================
// Limits
// =============================================================================

#[test]
fn test_limits_are_memoized() {
    let fetched = Arc::new(AtomicUsize::new(0));
    let counter = fetched.clone();
    let mut decl = NodeDecl::new();
    decl.add_limits("test", move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(LimitsValidator::int(Some(0), Some(10 + n), None))
    });
    let root = DummyParent::new(decl);

    assert_eq!(root.declared_limits(), vec!["test"]);
    let first = root.get_limits("test").unwrap();
    assert_eq!(root.get_limits("test").unwrap(), first);
    assert_eq!(fetched.load(Ordering::SeqCst), 1);

    root.discard_limits(Some(&["test".to_string()]));
    assert_ne!(root.get_limits("test").unwrap(), first);
    assert_eq!(fetched.load(Ordering::SeqCst), 2);

    assert!(matches!(
        root.get_limits("other").unwrap_err(),
        PropertyError::Structural(StructuralError::UnknownLimits(_))
    ));
}
