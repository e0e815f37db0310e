//! Turns whatever the dispatch function produced into a [`Verdicts`] list.
//!
//! - the call threw or was terminated: one `exception` entry
//! - the call returned something other than an array: no verdicts
//! - an empty array: no verdicts, without touching the elements
//! - otherwise each element in order; settled promises are replaced by their
//!   value, pending ones are dropped, rejected ones become `exception` entries
//! - an element `JSON.stringify` throws on also becomes an `exception` entry

use deno_core::v8;
use serde_json::Value;

use crate::exception::format_exception;
use crate::script::{describe_value, to_json};
use crate::types::{OOM_MESSAGE, TIMEOUT_MESSAGE, Verdict, Verdicts};
use crate::watchdog::InstanceFlags;

pub(crate) fn normalize(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    result: Option<v8::Local<v8::Value>>,
    flags: &InstanceFlags,
) -> Verdicts {
    let result = match result {
        Some(result) if !terminated(tc) => result,
        _ => return failed(tc, flags),
    };

    let Ok(array) = v8::Local::<v8::Array>::try_from(result) else {
        return Verdicts::empty();
    };
    let length = array.length();
    if length == 0 {
        return Verdicts::empty();
    }

    let mut entries = Vec::with_capacity(length as usize);
    for index in 0..length {
        let Some(element) = array.get_index(tc, index) else {
            tc.reset();
            continue;
        };
        let value = match v8::Local::<v8::Promise>::try_from(element) {
            Ok(promise) => match promise.state() {
                v8::PromiseState::Pending => continue,
                v8::PromiseState::Fulfilled => promise.result(tc),
                v8::PromiseState::Rejected => {
                    let reason = promise.result(tc);
                    let message = describe_value(tc, reason);
                    entries.push(Verdict::exception(message).to_value());
                    continue;
                }
            },
            Err(_) => element,
        };
        if value.is_null_or_undefined() {
            continue;
        }
        match to_json(tc, value) {
            Some(Value::Null) => {}
            None if tc.has_caught() => {
                let message = format_exception(tc);
                tc.reset();
                tracing::warn!("Plugin verdict is not serializable: {}", message);
                entries.push(Verdict::exception(message).to_value());
            }
            None => {}
            Some(json) => entries.push(json),
        }
    }
    Verdicts::from(entries)
}

/// The call did not complete. Clears a watchdog termination so the
/// instance stays usable; an OOM termination is left in place.
fn failed(tc: &mut v8::TryCatch<v8::HandleScope>, flags: &InstanceFlags) -> Verdicts {
    if flags.out_of_memory() {
        tracing::warn!("Plugin call aborted: heap out of memory");
        return Verdicts::exception(OOM_MESSAGE);
    }
    if terminated(tc) && flags.timed_out() {
        tc.cancel_terminate_execution();
        return Verdicts::exception(TIMEOUT_MESSAGE);
    }

    let message = format_exception(tc);
    if terminated(tc) {
        tc.cancel_terminate_execution();
    }
    Verdicts::exception(message)
}

/// A termination raised inside the microtask checkpoint may surface on the
/// isolate rather than on the try-catch.
pub(crate) fn terminated(tc: &mut v8::TryCatch<v8::HandleScope>) -> bool {
    tc.has_terminated() || tc.is_execution_terminating()
}
