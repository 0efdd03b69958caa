use core::RESULT_SIZE_BUDGET_BYTES;
use serde_json::{json, Value};

const TRUNCATION_MARKER: &str = "…[truncated]";

/// Fits `result` under `RESULT_SIZE_BUDGET_BYTES`, in two fallback
/// levels (§4.1 `markJobCompleted`):
///
/// 1. If the serialized result already fits, return it unchanged.
/// 2. Otherwise shrink each document's `content` field until the whole
///    payload fits, marking it `truncated: true`.
/// 3. If it still doesn't fit (pathological: huge non-content fields),
///    drop to a status-only shape so the terminal transition is never
///    lost even when the result itself is unstorable.
pub fn fit_result_to_budget(result: Value) -> Value {
    let full = serde_json::to_vec(&result).unwrap_or_default();
    if full.len() <= RESULT_SIZE_BUDGET_BYTES {
        return result;
    }

    let original_size = full.len();
    let truncated = truncate_docs(&result, original_size);
    let truncated_bytes = serde_json::to_vec(&truncated).unwrap_or_default();
    if truncated_bytes.len() <= RESULT_SIZE_BUDGET_BYTES {
        return truncated;
    }

    json!({
        "success": result.get("success").and_then(Value::as_bool).unwrap_or(true),
        "message": "result exceeded storage budget and was dropped",
        "truncated": true,
        "originalSize": original_size,
    })
}

fn truncate_docs(result: &Value, original_size: usize) -> Value {
    let Some(docs) = result.get("docs").and_then(Value::as_array) else {
        return result.clone();
    };

    // Evenly split what's left of the budget across documents after
    // accounting for the envelope and per-doc metadata overhead.
    let overhead_estimate = 512 * docs.len().max(1);
    let available = RESULT_SIZE_BUDGET_BYTES.saturating_sub(overhead_estimate);
    let per_doc_budget = (available / docs.len().max(1)).max(256);

    let shrunk: Vec<Value> = docs
        .iter()
        .map(|doc| shrink_doc(doc, per_doc_budget))
        .collect();

    let mut out = result.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("docs".to_string(), Value::Array(shrunk));
        obj.insert("truncated".to_string(), Value::Bool(true));
        obj.insert("originalSize".to_string(), json!(original_size));
    }
    out
}

fn shrink_doc(doc: &Value, budget: usize) -> Value {
    let Some(content) = doc.get("content").and_then(Value::as_str) else {
        return doc.clone();
    };
    if content.len() <= budget {
        return doc.clone();
    }

    let original_content_length = content.len();
    let keep = budget.saturating_sub(TRUNCATION_MARKER.len());
    let cut = floor_char_boundary(content, keep);
    let mut shortened = content[..cut].to_string();
    shortened.push_str(TRUNCATION_MARKER);

    let mut out = doc.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("content".to_string(), Value::String(shortened));
        obj.insert("contentTruncated".to_string(), Value::Bool(true));
        obj.insert("originalContentLength".to_string(), json!(original_content_length));
    }
    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_small_results_untouched() {
        let small = json!({"success": true, "docs": [{"content": "hello"}]});
        assert_eq!(fit_result_to_budget(small.clone()), small);
    }

    #[test]
    fn truncates_oversized_content() {
        let big_content = "x".repeat(RESULT_SIZE_BUDGET_BYTES + 1000);
        let result = json!({"success": true, "docs": [{"content": big_content}]});
        let out = fit_result_to_budget(result);
        let bytes = serde_json::to_vec(&out).unwrap();
        assert!(bytes.len() <= RESULT_SIZE_BUDGET_BYTES);
        assert_eq!(out["docs"][0]["contentTruncated"], json!(true));
        assert_eq!(out["truncated"], json!(true));
    }
}
