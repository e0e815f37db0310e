//! Deno ops backing the builtin library.
//!
//! Ops are the bridge between JavaScript and Rust. They are captured by the
//! builtins at snapshot time (`Deno.core.ops`) and read their services from
//! `OpState`, where every runtime stores a [`SandboxServices`].

use deno_core::OpState;
use deno_core::op2;
use serde::Serialize;

use crate::http::{self, HttpResponse, OutboundRequest};
use crate::services::SandboxServices;

deno_core::extension!(
    rasp_sandbox,
    ops = [
        op_rasp_log,
        op_rasp_tokenize,
        op_rasp_request,
        op_rasp_request_async,
    ],
);

/// Plugin console output.
#[op2(fast)]
pub fn op_rasp_log(state: &mut OpState, #[string] msg: &str) {
    let msg = msg.trim_end_matches('\n');
    match state.try_borrow::<SandboxServices>() {
        Some(services) => services.log(msg),
        None => tracing::info!(target: "rasp::plugin", "{}", msg),
    }
}

/// Token offsets for `input`, in UTF-16 units so JS can `substring` them.
#[op2]
#[serde]
pub fn op_rasp_tokenize(state: &mut OpState, #[string] input: &str, #[string] mode: &str) -> Vec<i32> {
    let Some(tokenizer) = state
        .try_borrow::<SandboxServices>()
        .and_then(|services| services.tokenizer.clone())
    else {
        return Vec::new();
    };
    let offsets = tokenizer.tokenize(input, mode);
    byte_offsets_to_utf16(input, &offsets)
}

#[derive(Debug, Default, Serialize)]
pub struct RequestOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<HttpResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RequestFailure>,
}

#[derive(Debug, Serialize)]
pub struct RequestFailure {
    message: String,
}

impl RequestOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            response: None,
            error: Some(RequestFailure {
                message: message.into(),
            }),
        }
    }
}

/// Synchronous request; the builtin wraps the outcome in a promise.
#[op2]
#[serde]
pub fn op_rasp_request(state: &mut OpState, #[serde] request: OutboundRequest) -> RequestOutcome {
    let Some(client) = state
        .try_borrow::<SandboxServices>()
        .and_then(|services| services.http.clone())
    else {
        return RequestOutcome::failed("http client unavailable");
    };

    match client.send(&request) {
        Ok(response) => RequestOutcome {
            response: Some(response),
            error: None,
        },
        Err(e) => RequestOutcome::failed(e.to_string()),
    }
}

/// Fire-and-forget request. `false` when it could not be queued.
#[op2]
pub fn op_rasp_request_async(state: &mut OpState, #[serde] request: OutboundRequest) -> bool {
    let Some(services) = state.try_borrow::<SandboxServices>() else {
        return false;
    };
    match (&services.dispatcher, &services.http) {
        (Some(dispatcher), Some(client)) => http::queue_request(dispatcher, client.clone(), request),
        _ => false,
    }
}

/// Map UTF-8 byte offsets into UTF-16 code unit offsets of `input`.
///
/// Offsets inside a multi-byte character map to its start; out of range
/// offsets are clamped.
pub(crate) fn byte_offsets_to_utf16(input: &str, offsets: &[i32]) -> Vec<i32> {
    let mut table = vec![0i32; input.len() + 1];
    let mut units = 0i32;
    for (start, ch) in input.char_indices() {
        for slot in &mut table[start..start + ch.len_utf8()] {
            *slot = units;
        }
        units += ch.len_utf16() as i32;
    }
    table[input.len()] = units;

    offsets
        .iter()
        .map(|&offset| match usize::try_from(offset) {
            Ok(offset) => table.get(offset).copied().unwrap_or(units),
            Err(_) => 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_offsets_unchanged() {
        assert_eq!(byte_offsets_to_utf16("a bb ccc", &[0, 1, 2, 4]), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_multibyte_offsets() {
        // "é" is two UTF-8 bytes and one UTF-16 unit, "😀" is four and two.
        let input = "é x 😀 y";
        let bytes: Vec<i32> = vec![0, 2, 3, 4, 5, 9, 10, 11];
        assert_eq!(
            byte_offsets_to_utf16(input, &bytes),
            vec![0, 1, 2, 3, 4, 6, 7, 8]
        );
    }

    #[test]
    fn test_out_of_range_offsets_clamped() {
        assert_eq!(byte_offsets_to_utf16("abc", &[-1, 99]), vec![0, 3]);
    }
}
