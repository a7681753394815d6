use crate::config::Config;
use crate::inspector::client::Inspector;
use crate::inspector::protocol::{CallFrame, RemoteObject, ScopeKind};
use crate::stack;
use aivory_core::capture::{CapturedValue, StackFrame, TypeTag, ANONYMOUS_FRAME};
use aivory_core::MAX_STACK_FRAMES;
use futures_util::future::{BoxFuture, FutureExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Host-language globals that leak into scope property lists and carry no
/// user signal.
const SKIPPED_GLOBALS: &[&str] = &[
    "process",
    "console",
    "global",
    "module",
    "exports",
    "require",
    "__filename",
    "__dirname",
    "Buffer",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "clearImmediate",
    "queueMicrotask",
    "performance",
    "fetch",
    "arguments",
    "this",
];

static ARRAY_LENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Array\((\d+)\)").expect("array length regex"));

/// Capture limits in force for one harvest.
#[derive(Debug, Clone, Copy)]
pub struct HarvestLimits {
    pub max_capture_depth: usize,
    pub max_string_length: usize,
    pub max_collection_size: usize,
    pub scope_depth: u8,
}

impl From<&Config> for HarvestLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_capture_depth: config.max_capture_depth,
            max_string_length: config.max_string_length,
            max_collection_size: config.max_collection_size,
            scope_depth: config.scope_depth,
        }
    }
}

/// A snapshot of call frames and reachable values taken while the host is
/// paused. Frame 0 locals keep their bare names; deeper frames are prefixed
/// `frame{N}.`.
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    pub locals: BTreeMap<String, CapturedValue>,
    pub stack_trace: Vec<StackFrame>,
}

/// Walk the paused call frames and materialize a bounded value tree. Call
/// frames and scope objects are only valid while the host is paused, so this
/// must complete before the session resumes. Protocol failures degrade to a
/// partial (or empty) harvest, never an error.
pub async fn harvest_call_frames(
    inspector: &dyn Inspector,
    frames: &[CallFrame],
    limits: &HarvestLimits,
) -> Harvest {
    let mut harvest = Harvest::default();

    for (index, frame) in frames.iter().take(MAX_STACK_FRAMES).enumerate() {
        harvest.stack_trace.push(to_stack_frame(frame));

        if index >= limits.max_capture_depth {
            continue;
        }
        for scope in &frame.scope_chain {
            if !scope_selected(scope.kind, limits.scope_depth) {
                continue;
            }
            let Some(object_id) = scope.object.object_id.as_deref() else {
                continue;
            };
            let properties = match inspector.get_properties(object_id).await {
                Ok(properties) => properties,
                Err(err) => {
                    debug!("scope_properties_error: frame={index} {err}");
                    continue;
                }
            };
            for descriptor in properties {
                if skip_property(&descriptor.name) {
                    continue;
                }
                let Some(object) = descriptor.value else {
                    continue;
                };
                let captured =
                    capture_value(inspector, descriptor.name.clone(), &object, 0, limits).await;
                let key = if index == 0 {
                    descriptor.name
                } else {
                    format!("frame{index}.{}", descriptor.name)
                };
                // Innermost scope wins on shadowed names.
                harvest.locals.entry(key).or_insert(captured);
            }
        }
    }

    harvest
}

/// Which scope kinds are harvested at a given `scope_depth` setting.
fn scope_selected(kind: ScopeKind, scope_depth: u8) -> bool {
    match kind {
        ScopeKind::Local | ScopeKind::Catch | ScopeKind::Block => true,
        ScopeKind::Closure => scope_depth >= 1,
        ScopeKind::Global => false,
        _ => scope_depth >= 2,
    }
}

fn skip_property(name: &str) -> bool {
    name.starts_with("__") || name == "constructor" || SKIPPED_GLOBALS.contains(&name)
}

fn to_stack_frame(frame: &CallFrame) -> StackFrame {
    let (class_name, method_name) = if frame.function_name.trim().is_empty() {
        (None, ANONYMOUS_FRAME.to_string())
    } else {
        stack::split_method(&frame.function_name)
    };

    let is_native = frame.url.starts_with("native ");
    let path = frame.url.strip_prefix("native ").unwrap_or(&frame.url);
    let file_path = if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    };
    let file_name = file_path
        .as_deref()
        .and_then(|p| p.rsplit(|ch| ch == '/' || ch == '\\').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    StackFrame {
        method_name,
        class_name,
        file_name,
        file_path,
        // Wire locations are 0-indexed.
        line_number: frame.location.line_number + 1,
        column_number: frame.location.column_number,
        is_native,
        source_available: !is_native && stack::source_available(path),
    }
}

fn capture_value<'a>(
    inspector: &'a dyn Inspector,
    name: String,
    object: &'a RemoteObject,
    depth: usize,
    limits: &'a HarvestLimits,
) -> BoxFuture<'a, CapturedValue> {
    async move {
        match object.object_type.as_str() {
            "undefined" => CapturedValue::leaf(name, TypeTag::Undefined, "undefined"),
            "boolean" => leaf_from(name, TypeTag::Boolean, object, limits),
            "number" => leaf_from(name, TypeTag::Number, object, limits),
            "bigint" => leaf_from(name, TypeTag::Bigint, object, limits),
            "symbol" => leaf_from(name, TypeTag::Symbol, object, limits),
            "function" => leaf_from(name, TypeTag::Function, object, limits),
            "string" => {
                let raw = object
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| object.description.clone())
                    .unwrap_or_default();
                let (value, truncated) = bounded(raw, limits);
                CapturedValue {
                    is_truncated: truncated,
                    ..CapturedValue::leaf(name, TypeTag::String, value)
                }
            }
            "object" => capture_object(inspector, name, object, depth, limits).await,
            other => {
                debug!("unhandled_value_type: {other}");
                leaf_from(name, TypeTag::Object(other.to_string()), object, limits)
            }
        }
    }
    .boxed()
}

async fn capture_object(
    inspector: &dyn Inspector,
    name: String,
    object: &RemoteObject,
    depth: usize,
    limits: &HarvestLimits,
) -> CapturedValue {
    match object.subtype.as_deref() {
        Some("null") => CapturedValue {
            is_null: true,
            ..CapturedValue::leaf(name, TypeTag::Null, "null")
        },
        Some("array") => capture_array(inspector, name, object, depth, limits).await,
        Some("map") => leaf_from(name, TypeTag::Map, object, limits),
        Some("set") => leaf_from(name, TypeTag::Set, object, limits),
        Some("error") => leaf_from(name, TypeTag::Error, object, limits),
        Some("date") => leaf_from(name, TypeTag::Date, object, limits),
        Some("regexp") => leaf_from(name, TypeTag::Regexp, object, limits),
        _ => capture_plain_object(inspector, name, object, depth, limits).await,
    }
}

async fn capture_array(
    inspector: &dyn Inspector,
    name: String,
    object: &RemoteObject,
    depth: usize,
    limits: &HarvestLimits,
) -> CapturedValue {
    let length = object
        .description
        .as_deref()
        .and_then(|desc| ARRAY_LENGTH.captures(desc))
        .and_then(|caps| caps[1].parse::<usize>().ok());

    let mut captured = leaf_from(name, TypeTag::Array, object, limits);
    captured.array_length = length;

    let within_cap = length.is_some_and(|len| len <= limits.max_collection_size);
    if !within_cap || !container_may_expand(depth, limits) {
        return captured;
    }
    let Some(object_id) = object.object_id.as_deref() else {
        return captured;
    };
    let properties = match inspector.get_properties(object_id).await {
        Ok(properties) => properties,
        Err(err) => {
            debug!("array_properties_error: {err}");
            return captured;
        }
    };

    let mut indexed: Vec<(usize, RemoteObject)> = properties
        .into_iter()
        .filter_map(|descriptor| {
            let index: usize = descriptor.name.parse().ok()?;
            Some((index, descriptor.value?))
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);

    let mut elements = Vec::with_capacity(indexed.len());
    for (index, element) in &indexed {
        elements.push(
            capture_value(inspector, index.to_string(), element, depth + 1, limits).await,
        );
    }
    captured.array_elements = Some(elements);
    captured
}

async fn capture_plain_object(
    inspector: &dyn Inspector,
    name: String,
    object: &RemoteObject,
    depth: usize,
    limits: &HarvestLimits,
) -> CapturedValue {
    let class = object
        .class_name
        .clone()
        .unwrap_or_else(|| "Object".to_string());
    let mut captured = leaf_from(name, TypeTag::Object(class), object, limits);

    if !container_may_expand(depth, limits) {
        return captured;
    }
    let Some(object_id) = object.object_id.as_deref() else {
        return captured;
    };
    let properties = match inspector.get_properties(object_id).await {
        Ok(properties) => properties,
        Err(err) => {
            debug!("object_properties_error: {err}");
            return captured;
        }
    };

    let mut children = BTreeMap::new();
    for descriptor in properties {
        if descriptor.name.starts_with("__") || descriptor.name == "constructor" {
            continue;
        }
        let Some(value) = descriptor.value else {
            continue;
        };
        let child =
            capture_value(inspector, descriptor.name.clone(), &value, depth + 1, limits).await;
        children.insert(descriptor.name, child);
    }
    if !children.is_empty() {
        captured.children = Some(children);
    }
    captured
}

/// Containers stop expanding one level before the depth cap; their children
/// land exactly at the cap.
fn container_may_expand(depth: usize, limits: &HarvestLimits) -> bool {
    depth < limits.max_capture_depth.saturating_sub(1)
}

fn leaf_from(
    name: String,
    type_tag: TypeTag,
    object: &RemoteObject,
    limits: &HarvestLimits,
) -> CapturedValue {
    let raw = object
        .description
        .clone()
        .or_else(|| object.value.as_ref().map(print_json))
        .unwrap_or_default();
    let (value, truncated) = bounded(raw, limits);
    CapturedValue {
        is_truncated: truncated,
        ..CapturedValue::leaf(name, type_tag, value)
    }
}

fn print_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bounded(raw: String, limits: &HarvestLimits) -> (String, bool) {
    if raw.chars().count() <= limits.max_string_length {
        return (raw, false);
    }
    (raw.chars().take(limits.max_string_length).collect(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::mock::{
        array_object, boolean_object, null_object, number_object, plain_object, property,
        string_object, undefined_object, MockInspector,
    };
    use crate::inspector::protocol::{Location, Scope};

    fn limits() -> HarvestLimits {
        HarvestLimits {
            max_capture_depth: 10,
            max_string_length: 1000,
            max_collection_size: 100,
            scope_depth: 0,
        }
    }

    fn frame(index: usize, function_name: &str, url: &str, scopes: Vec<Scope>) -> CallFrame {
        CallFrame {
            call_frame_id: format!("frame-{index}"),
            function_name: function_name.to_string(),
            url: url.to_string(),
            location: Location {
                script_id: "1".to_string(),
                line_number: 41,
                column_number: 10,
            },
            scope_chain: scopes,
        }
    }

    fn local_scope(object_id: &str) -> Scope {
        Scope {
            kind: ScopeKind::Local,
            object: RemoteObject {
                object_type: "object".to_string(),
                object_id: Some(object_id.to_string()),
                ..RemoteObject::default()
            },
        }
    }

    fn closure_scope(object_id: &str) -> Scope {
        Scope {
            kind: ScopeKind::Closure,
            object: RemoteObject {
                object_type: "object".to_string(),
                object_id: Some(object_id.to_string()),
                ..RemoteObject::default()
            },
        }
    }

    #[tokio::test]
    async fn harvests_primitives_with_bare_names_in_frame_zero() {
        let mock = MockInspector::new();
        mock.add_object(
            "scope-0",
            vec![
                property("x", number_object("42")),
                property("y", string_object("hello")),
                property("ok", boolean_object(true)),
                property("missing", undefined_object()),
                property("empty", null_object()),
            ],
        );
        let frames = vec![frame(
            0,
            "handleOrder",
            "file:///srv/app/orders.js",
            vec![local_scope("scope-0")],
        )];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        assert_eq!(harvest.locals["x"].value, "42");
        assert_eq!(harvest.locals["x"].type_tag, TypeTag::Number);
        assert_eq!(harvest.locals["y"].value, "hello");
        assert_eq!(harvest.locals["y"].type_tag, TypeTag::String);
        assert_eq!(harvest.locals["ok"].value, "true");
        assert_eq!(harvest.locals["missing"].type_tag, TypeTag::Undefined);
        assert!(harvest.locals["empty"].is_null);
        assert_eq!(harvest.stack_trace[0].method_name, "handleOrder");
        assert_eq!(harvest.stack_trace[0].line_number, 42);
    }

    #[tokio::test]
    async fn deeper_frames_are_prefixed() {
        let mock = MockInspector::new();
        mock.add_object("scope-0", vec![property("x", number_object("1"))]);
        mock.add_object("scope-1", vec![property("x", number_object("2"))]);
        let frames = vec![
            frame(0, "inner", "file:///srv/a.js", vec![local_scope("scope-0")]),
            frame(1, "outer", "file:///srv/a.js", vec![local_scope("scope-1")]),
        ];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        assert_eq!(harvest.locals["x"].value, "1");
        assert_eq!(harvest.locals["frame1.x"].value, "2");
    }

    #[tokio::test]
    async fn skip_list_filters_runtime_noise() {
        let mock = MockInspector::new();
        mock.add_object(
            "scope-0",
            vec![
                property("process", plain_object("process", "obj-p")),
                property("console", plain_object("Console", "obj-c")),
                property("__secret", number_object("1")),
                property("constructor", number_object("2")),
                property("kept", number_object("3")),
            ],
        );
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        assert_eq!(harvest.locals.len(), 1);
        assert_eq!(harvest.locals["kept"].value, "3");
    }

    #[tokio::test]
    async fn closure_scope_needs_scope_depth_one() {
        let mock = MockInspector::new();
        mock.add_object("closure-0", vec![property("captured", number_object("9"))]);
        let frames = vec![frame(
            0,
            "f",
            "file:///srv/a.js",
            vec![closure_scope("closure-0")],
        )];

        let shallow = harvest_call_frames(&mock, &frames, &limits()).await;
        assert!(shallow.locals.is_empty());

        let deeper = HarvestLimits {
            scope_depth: 1,
            ..limits()
        };
        let harvest = harvest_call_frames(&mock, &frames, &deeper).await;
        assert_eq!(harvest.locals["captured"].value, "9");
    }

    #[tokio::test]
    async fn long_strings_are_truncated_and_flagged() {
        let mock = MockInspector::new();
        let long = "a".repeat(2000);
        mock.add_object("scope-0", vec![property("blob", string_object(&long))]);
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let tight = HarvestLimits {
            max_string_length: 100,
            ..limits()
        };
        let harvest = harvest_call_frames(&mock, &frames, &tight).await;

        let blob = &harvest.locals["blob"];
        assert_eq!(blob.value.len(), 100);
        assert!(blob.is_truncated);
    }

    #[tokio::test]
    async fn special_object_subtypes_keep_their_tags() {
        use crate::inspector::mock::error_object;
        let mock = MockInspector::new();
        mock.add_object(
            "scope-0",
            vec![
                property("cause", error_object("RangeError: out of range")),
                property(
                    "when",
                    RemoteObject {
                        object_type: "object".to_string(),
                        subtype: Some("date".to_string()),
                        description: Some("2026-08-02T10:00:00.000Z".to_string()),
                        ..RemoteObject::default()
                    },
                ),
                property(
                    "pattern",
                    RemoteObject {
                        object_type: "object".to_string(),
                        subtype: Some("regexp".to_string()),
                        description: Some("/foo+/g".to_string()),
                        ..RemoteObject::default()
                    },
                ),
            ],
        );
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        assert_eq!(harvest.locals["cause"].type_tag, TypeTag::Error);
        assert_eq!(harvest.locals["cause"].value, "RangeError: out of range");
        assert_eq!(harvest.locals["when"].type_tag, TypeTag::Date);
        assert_eq!(harvest.locals["pattern"].type_tag, TypeTag::Regexp);
        assert_eq!(harvest.locals["pattern"].value, "/foo+/g");
    }

    #[tokio::test]
    async fn small_arrays_expand_large_arrays_do_not() {
        let mock = MockInspector::new();
        mock.add_object(
            "scope-0",
            vec![
                property("small", array_object(3, "arr-small")),
                property("big", array_object(500, "arr-big")),
            ],
        );
        mock.add_object(
            "arr-small",
            vec![
                property("0", number_object("10")),
                property("1", number_object("20")),
                property("2", number_object("30")),
                property("length", number_object("3")),
            ],
        );
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        let small = &harvest.locals["small"];
        assert_eq!(small.array_length, Some(3));
        let elements = small.array_elements.as_ref().expect("elements");
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[1].value, "20");

        let big = &harvest.locals["big"];
        assert_eq!(big.array_length, Some(500));
        assert!(big.array_elements.is_none());
    }

    #[tokio::test]
    async fn object_expansion_respects_depth_cap() {
        let mock = MockInspector::new();
        mock.add_object("scope-0", vec![property("order", plain_object("Order", "obj-0"))]);
        mock.add_object("obj-0", vec![property("customer", plain_object("Customer", "obj-1"))]);
        mock.add_object("obj-1", vec![property("address", plain_object("Address", "obj-2"))]);
        mock.add_object("obj-2", vec![property("street", string_object("Main St"))]);
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let tight = HarvestLimits {
            max_capture_depth: 3,
            ..limits()
        };
        let harvest = harvest_call_frames(&mock, &frames, &tight).await;

        let order = &harvest.locals["order"];
        assert_eq!(order.type_tag, TypeTag::Object("Order".to_string()));
        let customer = &order.children.as_ref().expect("children")["customer"];
        let address = &customer.children.as_ref().expect("children")["address"];
        // Depth cap reached: the address object stays unexpanded.
        assert!(address.children.is_none());
    }

    #[tokio::test]
    async fn protocol_failure_yields_empty_harvest_with_frames() {
        let mock = MockInspector::new();
        mock.fail_properties();
        let frames = vec![frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")])];

        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;

        assert!(harvest.locals.is_empty());
        assert_eq!(harvest.stack_trace.len(), 1);
    }

    #[tokio::test]
    async fn frames_past_capture_depth_contribute_no_locals() {
        let mock = MockInspector::new();
        mock.add_object("scope-0", vec![property("a", number_object("1"))]);
        mock.add_object("scope-1", vec![property("b", number_object("2"))]);
        let frames = vec![
            frame(0, "f", "file:///srv/a.js", vec![local_scope("scope-0")]),
            frame(1, "g", "file:///srv/a.js", vec![local_scope("scope-1")]),
        ];

        let tight = HarvestLimits {
            max_capture_depth: 1,
            ..limits()
        };
        let harvest = harvest_call_frames(&mock, &frames, &tight).await;

        assert!(harvest.locals.contains_key("a"));
        assert!(!harvest.locals.contains_key("frame1.b"));
        assert_eq!(harvest.stack_trace.len(), 2);
    }

    #[tokio::test]
    async fn native_frames_are_tagged() {
        let mock = MockInspector::new();
        let frames = vec![frame(0, "f", "native array.js", Vec::new())];
        let harvest = harvest_call_frames(&mock, &frames, &limits()).await;
        assert!(harvest.stack_trace[0].is_native);
        assert!(!harvest.stack_trace[0].source_available);
    }
}
