//! Structural JSON body comparison
//!
//! Key order and whitespace never matter. Numbers compare by value, so `1.0`
//! and `1` are equal.

use serde_json::{Map, Number, Value};

/// Compare two JSON documents, returning one line per difference.
///
/// Bodies that do not parse as JSON are reported as a single difference.
#[must_use]
pub fn compare_json(request: &[u8], record: &[u8]) -> Vec<String> {
    let parsed = (
        serde_json::from_slice::<Value>(request),
        serde_json::from_slice::<Value>(record),
    );
    match parsed {
        (Ok(request), Ok(record)) => {
            let mut differences = Vec::new();
            compare_values("$", &request, &record, &mut differences);
            differences
        }
        (Err(e), _) => vec![format!("Request body is not valid json: {e}")],
        (_, Err(e)) => vec![format!("Record body is not valid json: {e}")],
    }
}

fn compare_values(path: &str, request: &Value, record: &Value, differences: &mut Vec<String>) {
    match (request, record) {
        (Value::Object(request), Value::Object(record)) => {
            compare_objects(path, request, record, differences);
        }
        (Value::Array(request), Value::Array(record)) => {
            if request.len() != record.len() {
                differences.push(format!(
                    "{path}: array length differs, request <{}>, record <{}>",
                    request.len(),
                    record.len()
                ));
                return;
            }
            for (index, (left, right)) in request.iter().zip(record).enumerate() {
                compare_values(&format!("{path}[{index}]"), left, right, differences);
            }
        }
        (Value::Number(left), Value::Number(right)) => {
            if !numbers_equal(left, right) {
                differences.push(format!(
                    "{path}: values differ, request <{left}>, record <{right}>"
                ));
            }
        }
        (left, right) => {
            if left != right {
                differences.push(format!(
                    "{path}: values differ, request <{left}>, record <{right}>"
                ));
            }
        }
    }
}

fn compare_objects(
    path: &str,
    request: &Map<String, Value>,
    record: &Map<String, Value>,
    differences: &mut Vec<String>,
) {
    for (key, left) in request {
        let child = format!("{path}.{key}");
        match record.get(key) {
            Some(right) => compare_values(&child, left, right, differences),
            None => differences.push(format!("{child}: is absent in record, value <{left}>")),
        }
    }
    for (key, right) in record {
        if !request.contains_key(key) {
            differences.push(format!("{path}.{key}: is absent in request, value <{right}>"));
        }
    }
}

fn numbers_equal(left: &Number, right: &Number) -> bool {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (left.as_u64(), right.as_u64()) {
        return a == b;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
