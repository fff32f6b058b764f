//! Offer query encoding
//!
//! Translates the textual predicate used in configs and on the command line
//! into the JSON filter accepted by the `/bundles` endpoint:
//!
//! ```text
//! num_gpus=1 gpu_name=RTX_3090 disk_space>=16 rentable=True
//!   -> {"num_gpus": {"eq": 1}, "gpu_name": {"eq": "RTX 3090"},
//!       "disk_space": {"gte": 16}, "rentable": {"eq": true}}
//! ```
//!
//! A value of `any` (or `?`, `*`) removes the clause, including a default
//! filter on the same field. Strings use `_` for spaces.

use crate::config::PricingMode;
use crate::error::{Result, VastError};
use serde_json::{Map, Value, json};

fn operator_name(op: &str) -> Option<&'static str> {
    Some(match op {
        ">=" => "gte",
        ">" => "gt",
        "<=" => "lte",
        "<" => "lt",
        "!=" => "neq",
        "=" | "==" => "eq",
        "in" => "in",
        "notin" => "notin",
        _ => return None,
    })
}

fn field_alias(field: &str) -> &str {
    match field {
        "cuda_vers" => "cuda_max_good",
        "display_active" => "gpu_display_active",
        "reliability" => "reliability2",
        "dlperf_usd" => "dlperf_per_dphtotal",
        "dph" => "dph_total",
        "flops_usd" => "flops_per_dphtotal",
        other => other,
    }
}

/// Config units (GB, days) to API units (MB, seconds)
fn field_multiplier(field: &str) -> Option<f64> {
    match field {
        "cpu_ram" | "gpu_ram" => Some(1000.0),
        "duration" => Some(24.0 * 60.0 * 60.0),
        _ => None,
    }
}

/// Filters applied unless `--no-default` is given
pub fn default_filters() -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert("verified".into(), json!({"eq": true}));
    filters.insert("external".into(), json!({"eq": false}));
    filters.insert("rentable".into(), json!({"eq": true}));
    filters
}

/// Parse a textual predicate into `{field: {op: value}}`
///
/// Fields set to `any` map to `null`; [`merge_filters`] drops them.
pub fn parse_query(query: &str) -> Result<Map<String, Value>> {
    let mut filters = Map::new();
    let chars: Vec<char> = query.chars().collect();
    let mut pos = 0;

    let skip_spaces = |pos: &mut usize| {
        while *pos < chars.len() && chars[*pos].is_whitespace() {
            *pos += 1;
        }
    };

    loop {
        skip_spaces(&mut pos);
        if pos >= chars.len() {
            break;
        }

        let start = pos;
        while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
            pos += 1;
        }
        let field: String = chars[start..pos].iter().collect();
        if field.is_empty() {
            return Err(VastError::config(format!(
                "invalid query near \"{}\"",
                chars[start..].iter().collect::<String>()
            )));
        }

        skip_spaces(&mut pos);
        let op_start = pos;
        while pos < chars.len() && matches!(chars[pos], '=' | '<' | '>' | '!') {
            pos += 1;
        }
        let mut op: String = chars[op_start..pos].iter().collect();
        if op.is_empty() {
            // word operators: `in`, `notin`
            let word_start = pos;
            while pos < chars.len() && chars[pos].is_ascii_alphabetic() {
                pos += 1;
            }
            op = chars[word_start..pos].iter().collect();
        }
        let op_name = operator_name(&op).ok_or_else(|| {
            VastError::config(format!("unknown operator \"{}\" for field \"{}\"", op, field))
        })?;

        skip_spaces(&mut pos);
        let value_start = pos;
        if pos < chars.len() && chars[pos] == '[' {
            while pos < chars.len() && chars[pos] != ']' {
                pos += 1;
            }
            pos = (pos + 1).min(chars.len());
        } else {
            while pos < chars.len() && !chars[pos].is_whitespace() {
                pos += 1;
            }
        }
        let raw_value: String = chars[value_start..pos].iter().collect();
        if raw_value.is_empty() {
            return Err(VastError::config(format!("missing value for \"{}\"", field)));
        }

        let field = field_alias(&field).to_string();
        if matches!(raw_value.as_str(), "any" | "?" | "*") {
            filters.insert(field, Value::Null);
            continue;
        }

        let value = if raw_value.starts_with('[') {
            let items = raw_value
                .trim_matches(|c| c == '[' || c == ']')
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| convert_value(&field, s))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        } else {
            convert_value(&field, &raw_value)?
        };

        let clause = filters
            .entry(field)
            .or_insert_with(|| Value::Object(Map::new()));
        if !clause.is_object() {
            *clause = Value::Object(Map::new());
        }
        if let Value::Object(ops) = clause {
            ops.insert(op_name.to_string(), value);
        }
    }

    Ok(filters)
}

/// Overlay parsed clauses on `base`, removing fields set to `any`
pub fn merge_filters(base: &mut Map<String, Value>, parsed: Map<String, Value>) {
    for (field, clause) in parsed {
        if clause.is_null() {
            base.remove(&field);
        } else {
            base.insert(field, clause);
        }
    }
}

fn convert_value(field: &str, raw: &str) -> Result<Value> {
    match raw {
        "true" | "True" => return Ok(Value::Bool(true)),
        "false" | "False" => return Ok(Value::Bool(false)),
        _ => {}
    }

    if let Some(multiplier) = field_multiplier(field) {
        let n: f64 = raw
            .parse()
            .map_err(|_| VastError::config(format!("\"{}\" expects a number", field)))?;
        return Ok(json!(n * multiplier));
    }

    if let Ok(n) = raw.parse::<i64>() {
        return Ok(json!(n));
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Ok(json!(n));
    }

    Ok(Value::String(raw.replace('_', " ")))
}

/// Parse `"score-,dph_total"` into `[["score","desc"],["dph_total","asc"]]`
pub fn parse_order(order: &str) -> Value {
    let keys = order
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|key| {
            let (name, direction) = match key.strip_suffix('-') {
                Some(name) => (name, "desc"),
                None => (key.strip_suffix('+').unwrap_or(key), "asc"),
            };
            json!([field_alias(name), direction])
        })
        .collect();
    Value::Array(keys)
}

/// Full search document sent to the provider
pub fn build_search(
    query: &str,
    pricing: PricingMode,
    order: &str,
    storage_gb: f64,
    no_default: bool,
) -> Result<Value> {
    let mut search = if no_default {
        Map::new()
    } else {
        default_filters()
    };
    merge_filters(&mut search, parse_query(query)?);
    search.insert("order".into(), parse_order(order));
    search.insert("type".into(), json!(pricing.as_str()));
    search.insert("allocated_storage".into(), json!(storage_gb));
    Ok(Value::Object(search))
}
