//! 📡 Bulk codec: the format whisperer for the `_bulk` endpoint, both directions.
//!
//! Outbound, each [`BulkOperation`] becomes the sacred NDJSON pair:
//!
//! ```text
//! {"index":{"_index":"books20240301","_id":"A"}}
//! {"title":"Dune"}
//! ```
//!
//! Updates wrap the body in `{"doc": ...}`. Deletes are a single action line, no body.
//! Inbound, the response `items` array is decoded back into [`BulkItemResult`]s,
//! positionally aligned with what we sent.
//!
//! Also here, because it is the same "parse what ES said" flavour of work: the alias
//! response decoder.

use anyhow::{Context, Result};
use serde_json::{Value, json};

use super::generation::ApiGeneration;
use crate::backends::{AliasMap, BulkItemResult};
use crate::common::{BulkOperation, OpKind};
use crate::errors::BulkTransportError;

/// 🧹 Bulk bodies are line-delimited. A pretty-printed document would split into many
/// lines and the bulk API would reject the whole request, so multi-line JSON gets compacted.
fn single_line(body: &str) -> Result<String> {
    if !body.contains('\n') {
        return Ok(body.to_string());
    }
    let the_value: Value = serde_json::from_str(body)
        .context("💀 document body spans multiple lines and is not valid JSON; it cannot ride in a bulk request")?;
    Ok(the_value.to_string())
}

/// 🏗️ Render the full NDJSON body for one batch. Trailing newline included; the bulk API
/// insists on it the way a cat insists on the one chair you are sitting in.
pub(crate) fn encode_bulk_body<G: ApiGeneration>(
    generation: &G,
    index: &str,
    operations: &[BulkOperation],
) -> Result<String> {
    let mut the_payload = String::new();
    for op in operations {
        let the_action_line = json!({ op.kind.as_str(): generation.action_metadata(index, &op.id) });
        the_payload.push_str(&the_action_line.to_string());
        the_payload.push('\n');

        match (op.kind, op.body.as_deref()) {
            (OpKind::Delete, _) => {}
            (OpKind::Index, Some(body)) => {
                the_payload.push_str(&single_line(body)?);
                the_payload.push('\n');
            }
            (OpKind::Update, Some(body)) => {
                the_payload.push_str("{\"doc\":");
                the_payload.push_str(&single_line(body)?);
                the_payload.push_str("}\n");
            }
            (kind, None) => anyhow::bail!(
                "💀 a '{}' operation for id '{}' arrived without a body",
                kind.as_str(),
                op.id
            ),
        }
    }
    Ok(the_payload)
}

// -- 💬 ES errors come as {"type": "...", "reason": "..."} objects. Old proxies sometimes send plain strings.
fn describe_item_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(details) => {
            let kind = details.get("type").and_then(Value::as_str).unwrap_or("error");
            let reason = details.get("reason").and_then(Value::as_str).unwrap_or("no reason given");
            format!("{kind}: {reason}")
        }
        other => other.to_string(),
    }
}

/// 📬 Decode a `_bulk` response body. Item count must match what we sent; a mismatch
/// means we cannot attribute outcomes, so the batch is treated as a transport failure.
pub(crate) fn decode_bulk_response(
    operations: &[BulkOperation],
    body: &str,
) -> std::result::Result<Vec<BulkItemResult>, BulkTransportError> {
    let the_response: Value = serde_json::from_str(body)
        .map_err(|err| BulkTransportError::fatal(format!("bulk response is not JSON: {err}")))?;
    let the_items = the_response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BulkTransportError::fatal("bulk response has no 'items' array"))?;

    if the_items.len() != operations.len() {
        return Err(BulkTransportError::fatal(format!(
            "bulk response has {} items for {} operations",
            the_items.len(),
            operations.len()
        )));
    }

    let mut the_results = Vec::with_capacity(the_items.len());
    for (op, item) in operations.iter().zip(the_items) {
        // -- 📦 each item is {"<op>": {...}}, a one-key object. Take whatever the key is.
        let the_details = item
            .as_object()
            .and_then(|obj| obj.values().next())
            .ok_or_else(|| BulkTransportError::fatal(format!("malformed bulk item for id '{}'", op.id)))?;
        let status = the_details
            .get("status")
            .and_then(Value::as_u64)
            .map_or(0, |s| s as u16);
        let the_result = match the_details.get("error") {
            Some(error) if !error.is_null() => {
                BulkItemResult::failed(op.kind, &op.id, status, describe_item_error(error))
            }
            _ => BulkItemResult::ok(op.kind, &op.id, status),
        };
        the_results.push(the_result);
    }
    Ok(the_results)
}

/// 🗺️ Decode `GET /_alias/...` and `GET /{index}/_alias` responses.
///
/// Shape: `{"books1": {"aliases": {"books": {}, "recent": {"filter": {...}}}}}`.
pub(crate) fn decode_aliases(body: &str) -> Result<AliasMap> {
    let the_response: Value =
        serde_json::from_str(body).context("💀 alias response is not JSON. The cluster is speaking in tongues.")?;
    let mut the_map = AliasMap::new();
    let Some(indices) = the_response.as_object() else {
        return Ok(the_map);
    };
    for (index_name, entry) in indices {
        let Some(aliases) = entry.get("aliases").and_then(Value::as_object) else {
            continue;
        };
        let the_aliases = aliases
            .iter()
            .map(|(alias, definition)| (alias.clone(), definition.get("filter").cloned()))
            .collect();
        the_map.insert(index_name.clone(), the_aliases);
    }
    Ok(the_map)
}
