//! Small V8 helpers shared by the snapshot builder and the instance worker.

use deno_core::v8;

/// Compile and run a classic script under `filename`.
///
/// `line_offset` shifts reported line numbers, e.g. `-1` for a source that
/// was wrapped with one leading line. Failures are left pending on the
/// caller's `TryCatch`.
pub(crate) fn run_script<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
    filename: &str,
    line_offset: i32,
) -> Option<v8::Local<'s, v8::Value>> {
    let source = v8::String::new(scope, source)?;
    let name = v8::String::new(scope, filename)?;
    let origin = v8::ScriptOrigin::new(
        scope,
        name.into(),
        line_offset,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    );
    let script = v8::Script::compile(scope, source, Some(&origin))?;
    script.run(scope)
}

/// Read `name` from `object`.
pub(crate) fn get_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<v8::Object>,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = v8::String::new(scope, name)?;
    object.get(scope, key.into())
}

/// `JSON.stringify` then parse into serde. `undefined`, functions and
/// values that fail to stringify (cycles) come back as `None`.
pub(crate) fn to_json(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Option<serde_json::Value> {
    if value.is_undefined() || value.is_function() {
        return None;
    }
    let text = v8::json::stringify(scope, value)?;
    serde_json::from_str(&text.to_rust_string_lossy(scope)).ok()
}

/// Human readable text for a thrown value or rejection reason.
pub(crate) fn describe_value(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_native_error() {
        if let Ok(object) = v8::Local::<v8::Object>::try_from(value) {
            if let Some(stack) = get_property(scope, object, "stack").filter(|s| s.is_string()) {
                return stack.to_rust_string_lossy(scope);
            }
        }
    }
    if value.is_string() {
        return value.to_rust_string_lossy(scope);
    }
    match to_json(scope, value) {
        Some(json) => json.to_string(),
        None => value.to_rust_string_lossy(scope),
    }
}
