//! Built-in filters and `is` tests.

use std::sync::LazyLock;

use regex::Regex;

use crate::{error::EvalError, value::Value};

static STRIP_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid striptags pattern"));
static URLIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<]+").expect("valid urlize pattern"));

type FilterResult = Result<Value, EvalError>;

#[inline]
fn arg(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index)
}

fn arg_int(args: &[Value], index: usize, default: i64) -> i64 {
    arg(args, index).and_then(Value::as_i64).unwrap_or(default)
}

fn arg_bool(args: &[Value], index: usize) -> bool {
    arg(args, index).is_some_and(Value::is_truthy)
}

fn arg_string(args: &[Value], index: usize, default: &str) -> String {
    arg(args, index).map_or_else(|| default.to_string(), Value::to_string)
}

fn non_negative(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Sequence view for filters: arrays as-is, everything else is not a sequence.
fn as_array(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) => Some(items),
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Map(_) => None,
    }
}

/// Dotted attribute lookup used by `sort`, `selectattr` and friends.
pub(crate) fn lookup_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let next = match current {
            Value::Map(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_) => {
                None
            }
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_whitespace() || c == '-' {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect()
    })
}

fn truncate(s: &str, args: &[Value]) -> String {
    let length = non_negative(arg_int(args, 0, 255));
    let killwords = arg_bool(args, 1);
    let end = arg_string(args, 2, "...");

    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= length {
        return s.to_string();
    }
    let end_len = end.chars().count();
    if length <= end_len {
        return end;
    }
    let cut = length.saturating_sub(end_len);
    let chunk: String = chars.iter().take(cut).collect();
    if killwords {
        return chunk + &end;
    }
    match chunk.rfind(' ') {
        Some(idx) if idx > 0 => format!("{}{}", chunk.get(..idx).unwrap_or_default(), end),
        _ => chunk + &end,
    }
}

fn center(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_string();
    }
    let pad = width.saturating_sub(len);
    let left = pad / 2;
    let right = pad.saturating_sub(left);
    format!("{}{}{}", " ".repeat(left), s, " ".repeat(right))
}

fn indent(s: &str, width: usize) -> String {
    let prefix = " ".repeat(width);
    s.split('\n')
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn round(value: &Value, precision: i64) -> Value {
    let n = value.as_f64().unwrap_or(0.0);
    let exp = i32::try_from(precision).unwrap_or(0);
    let factor = 10f64.powi(exp);
    Value::Float((n * factor).round() / factor)
}

fn length(value: &Value) -> Value {
    let len = match value {
        Value::Array(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::String(s) => s.chars().count(),
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => 0,
    };
    Value::from(len)
}

fn first_or_last(value: &Value, last: bool) -> Value {
    if let Some(items) = as_array(value) {
        let item = if last { items.last() } else { items.first() };
        return item.cloned().unwrap_or_default();
    }
    let s = value.to_string();
    let c = if last { s.chars().last() } else { s.chars().next() };
    Value::String(c.map(String::from).unwrap_or_default())
}

fn to_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        Value::Map(map) => {
            let mut keys: Vec<Value> = map.keys().map(|k| Value::from(k.as_str())).collect();
            keys.sort_by(|a, b| a.compare(b, false));
            Value::Array(keys)
        }
        Value::Null => Value::Array(Vec::new()),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_) => Value::Array(
            value
                .to_string()
                .chars()
                .map(|c| Value::String(c.to_string()))
                .collect(),
        ),
    }
}

fn replace(value: &Value, args: &[Value]) -> Value {
    let s = value.to_string();
    let from = arg_string(args, 0, "");
    let to = arg_string(args, 1, "");
    let count = arg_int(args, 2, -1);
    let out = match usize::try_from(count) {
        Ok(n) => s.replacen(&from, &to, n),
        Err(_) => s.replace(&from, &to),
    };
    Value::String(out)
}

fn reverse(value: &Value) -> Value {
    match as_array(value) {
        Some(items) => Value::Array(items.iter().rev().cloned().collect()),
        None => Value::String(value.to_string().chars().rev().collect()),
    }
}

fn default(value: &Value, args: &[Value]) -> Value {
    let fallback = arg(args, 0).cloned().unwrap_or_else(|| Value::from(""));
    let boolean = arg_bool(args, 1);
    let empty = match value {
        Value::Null => true,
        Value::Array(items) => boolean && items.is_empty(),
        Value::Map(map) => boolean && map.is_empty(),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) => boolean && !value.is_truthy(),
        Value::String(s) => s.is_empty(),
    };
    if empty { fallback } else { value.clone() }
}

fn strip_tags(value: &Value, preserve_whitespace: bool) -> Value {
    let s = value.to_string();
    let stripped = STRIP_TAGS.replace_all(&s, "");
    if preserve_whitespace {
        Value::String(stripped.into_owned())
    } else {
        Value::String(stripped.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

fn urlize(value: &Value) -> Value {
    let s = value.to_string();
    Value::String(
        URLIZE
            .replace_all(&s, |caps: &regex::Captures<'_>| {
                let url = caps.get(0).map_or("", |m| m.as_str());
                format!("<a href=\"{}\">{}</a>", url, url)
            })
            .into_owned(),
    )
}

fn urlencode(value: &Value) -> Value {
    let s = value.to_string();
    Value::String(url::form_urlencoded::byte_serialize(s.as_bytes()).collect())
}

fn sum(value: &Value) -> Value {
    let total: f64 = value
        .iter_items()
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0))
        .sum();
    Value::Float(total)
}

fn batch(value: &Value, args: &[Value]) -> Value {
    let size = non_negative(arg_int(args, 0, 1)).max(1);
    let fill = arg(args, 1);
    let items = value.iter_items();
    Value::Array(
        items
            .chunks(size)
            .map(|chunk| {
                let mut row = chunk.to_vec();
                if let Some(fill) = fill {
                    row.resize(size, fill.clone());
                }
                Value::Array(row)
            })
            .collect(),
    )
}

fn slice(value: &Value, args: &[Value]) -> Value {
    let parts = non_negative(arg_int(args, 0, 1)).max(1);
    let items = value.iter_items();
    if items.is_empty() {
        return Value::Array(Vec::new());
    }
    let chunk_size = items.len().div_ceil(parts).max(1);
    Value::Array(
        items
            .chunks(chunk_size)
            .map(|chunk| Value::Array(chunk.to_vec()))
            .collect(),
    )
}

fn sort(value: &Value, args: &[Value]) -> Value {
    let reverse = arg_bool(args, 0);
    let case_sensitive = arg_bool(args, 1);
    let attribute = arg(args, 2).map(Value::to_string);

    let mut items = value.iter_items();
    items.sort_by(|a, b| {
        let ordering = match &attribute {
            Some(path) => lookup_path(a, path).compare(&lookup_path(b, path), case_sensitive),
            None => a.compare(b, case_sensitive),
        };
        if reverse { ordering.reverse() } else { ordering }
    });
    Value::Array(items)
}

fn dictsort(value: &Value, args: &[Value]) -> Value {
    let Value::Map(map) = value else {
        return Value::Array(Vec::new());
    };
    // Accepts both `dictsort(case_sensitive, by, reverse)` and
    // `dictsort(by, case_sensitive, reverse)`.
    let (case_sensitive, by) = match arg(args, 0) {
        Some(Value::Bool(case_sensitive)) => (*case_sensitive, arg_string(args, 1, "key")),
        _ => (arg_bool(args, 1), arg_string(args, 0, "key")),
    };
    let reverse = arg_bool(args, 2);
    let by_value = by.eq_ignore_ascii_case("value");

    let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
    pairs.sort_by(|(ka, va), (kb, vb)| {
        let ordering = if by_value {
            va.compare(vb, case_sensitive)
        } else {
            Value::from(ka.as_str()).compare(&Value::from(kb.as_str()), case_sensitive)
        };
        if reverse { ordering.reverse() } else { ordering }
    });
    Value::Array(
        pairs
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::from(k.as_str()), v.clone()]))
            .collect(),
    )
}

fn select(value: &Value, args: &[Value], keep: bool) -> FilterResult {
    let test = arg(args, 0).map(Value::to_string);
    let test_args = args.get(1..).unwrap_or_default();
    let mut out = Vec::new();
    for item in value.iter_items() {
        let passed = match &test {
            Some(name) => apply_test(name, &item, test_args)?,
            None => item.is_truthy(),
        };
        if passed == keep {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn select_attr(value: &Value, args: &[Value], keep: bool) -> FilterResult {
    let path = arg_string(args, 0, "");
    let test = arg(args, 1).map(Value::to_string);
    let test_args = args.get(2..).unwrap_or_default();
    let mut out = Vec::new();
    for item in value.iter_items() {
        let attribute = lookup_path(&item, &path);
        let passed = match &test {
            Some(name) => apply_test(name, &attribute, test_args)?,
            None => attribute.is_truthy(),
        };
        if passed == keep {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

#[cfg(feature = "serde")]
fn dump(value: &Value) -> FilterResult {
    serde_json::to_string(value)
        .map(Value::String)
        .map_err(|e| EvalError::Filter {
            name: "dump".to_string(),
            message: e.to_string(),
        })
}

#[cfg(not(feature = "serde"))]
fn dump(value: &Value) -> FilterResult {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Null => out.push_str("null"),
            Value::String(s) => out.push_str(&format!("{:?}", s)),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            Value::Map(map) => {
                out.push('{');
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&format!("{:?}:", key));
                    write(item, out);
                }
                out.push('}');
            }
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => out.push_str(&value.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    Ok(Value::String(out))
}

/// Runs the built-in filter `name`, or returns `None` if there is no such
/// filter. Names are case-insensitive.
pub(crate) fn apply_builtin(name: &str, value: &Value, args: &[Value]) -> Option<FilterResult> {
    let result = match name.to_ascii_lowercase().as_str() {
        "lower" => Value::String(value.to_string().to_lowercase()),
        "upper" => Value::String(value.to_string().to_uppercase()),
        "string" => Value::String(value.to_string()),
        "trim" => Value::String(value.to_string().trim().to_string()),
        "title" => Value::String(title_case(value.to_string().trim())),
        "capitalize" => Value::String(capitalize(value.to_string().trim())),
        "abs" => Value::Float(value.as_f64().unwrap_or(0.0).abs()),
        "int" => Value::Int(value.as_i64().unwrap_or_else(|| arg_int(args, 0, 0))),
        "float" => Value::Float(value.as_f64().unwrap_or(0.0)),
        "length" | "count" => length(value),
        "first" => first_or_last(value, false),
        "last" => first_or_last(value, true),
        "join" => {
            let sep = arg_string(args, 0, "");
            Value::String(
                value
                    .iter_items()
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(&sep),
            )
        }
        "list" => to_list(value),
        "replace" => replace(value, args),
        "reverse" => reverse(value),
        "round" => round(value, arg_int(args, 0, 0)),
        "default" | "d" => default(value, args),
        "escape" | "e" | "forceescape" => {
            Value::String(html_escape::encode_quoted_attribute(&value.to_string()).into_owned())
        }
        "safe" => value.clone(),
        "dump" => return Some(dump(value)),
        "wordcount" => Value::from(value.to_string().split_whitespace().count()),
        "nl2br" => Value::String(value.to_string().replace('\n', "<br />\n")),
        "urlencode" => urlencode(value),
        "urlize" => urlize(value),
        "striptags" => strip_tags(value, arg_bool(args, 0)),
        "truncate" => Value::String(truncate(&value.to_string(), args)),
        "center" => Value::String(center(&value.to_string(), non_negative(arg_int(args, 0, 80)))),
        "indent" => Value::String(indent(&value.to_string(), non_negative(arg_int(args, 0, 4)))),
        "sum" => sum(value),
        "batch" => batch(value, args),
        "slice" => slice(value, args),
        "sort" => sort(value, args),
        "dictsort" => dictsort(value, args),
        "select" => return Some(select(value, args, true)),
        "reject" => return Some(select(value, args, false)),
        "selectattr" => return Some(select_attr(value, args, true)),
        "rejectattr" => return Some(select_attr(value, args, false)),
        _ => return None,
    };
    Some(Ok(result))
}

/// Evaluates the `is` test `name` against `value`.
///
/// A null value counts as undefined; the evaluator does not distinguish a
/// missing binding from one explicitly set to null.
pub(crate) fn apply_test(name: &str, value: &Value, args: &[Value]) -> Result<bool, EvalError> {
    let int = || value.as_i64().unwrap_or(0);
    let passed = match name.to_ascii_lowercase().as_str() {
        "defined" => !value.is_null(),
        "undefined" | "none" | "null" => value.is_null(),
        "string" => matches!(value, Value::String(_)),
        "number" => value.is_number(),
        "boolean" | "bool" => matches!(value, Value::Bool(_)),
        "iterable" => matches!(value, Value::Array(_) | Value::Map(_) | Value::String(_)),
        "sequence" => matches!(value, Value::Array(_) | Value::String(_)),
        "mapping" => matches!(value, Value::Map(_)),
        "callable" => false,
        "odd" => int().rem_euclid(2) == 1,
        "even" => int().rem_euclid(2) == 0,
        "divisibleby" => match arg_int(args, 0, 0) {
            0 => false,
            d => int().checked_rem(d) == Some(0),
        },
        "lower" => {
            let s = value.to_string();
            s == s.to_lowercase()
        }
        "upper" => {
            let s = value.to_string();
            s == s.to_uppercase()
        }
        "equalto" | "eq" => arg(args, 0).is_some_and(|other| value.loose_eq(other)),
        "sameas" => arg(args, 0) == Some(value),
        "true" => matches!(value, Value::Bool(true)),
        "false" => matches!(value, Value::Bool(false)),
        other => {
            return Err(EvalError::Filter {
                name: "is".to_string(),
                message: format!("unknown test '{}'", other),
            });
        }
    };
    Ok(passed)
}

/// `range([start,] stop[, step])`, the one built-in function.
pub(crate) fn range(args: &[Value]) -> Result<Value, EvalError> {
    let ints: Vec<i64> = args.iter().map(|v| v.as_i64().unwrap_or(0)).collect();
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step, ..] => (*start, *stop, *step),
        [] => {
            return Err(EvalError::Filter {
                name: "range".to_string(),
                message: "expected at least one argument".to_string(),
            });
        }
    };
    if step == 0 {
        return Err(EvalError::Filter {
            name: "range".to_string(),
            message: "step must not be zero".to_string(),
        });
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        out.push(Value::Int(current));
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(name: &str, value: impl Into<Value>, args: &[Value]) -> Value {
        apply_builtin(name, &value.into(), args).unwrap().unwrap()
    }

    fn strs(items: &[&str]) -> Value {
        Value::from(items.to_vec())
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_filters() {
        assert_eq!(apply("upper", "abc", &[]), Value::from("ABC"));
        assert_eq!(apply("trim", "  x ", &[]), Value::from("x"));
        assert_eq!(apply("title", "  hello wORLD  ", &[]), Value::from("Hello World"));
        assert_eq!(apply("capitalize", "hELLO", &[]), Value::from("Hello"));
        assert_eq!(
            apply("replace", "hello world", &["world".into(), "go".into()]),
            Value::from("hello go")
        );
        assert_eq!(
            apply("replace", "aaa", &["a".into(), "b".into(), 2.into()]),
            Value::from("bba")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escape_and_urlencode() {
        assert_eq!(apply("escape", "<b>x</b>", &[]), Value::from("&lt;b&gt;x&lt;/b&gt;"));
        assert_eq!(apply("urlencode", "a b&c", &[]), Value::from("a+b%26c"));
        assert_eq!(
            apply("striptags", "<p>a\n  <b>b</b></p>", &[]),
            Value::from("a b")
        );
        assert_eq!(
            apply("urlize", "see https://x.io now", &[]),
            Value::from("see <a href=\"https://x.io\">https://x.io</a> now")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_truncate() {
        let phrase = "alpha beta gamma";
        assert_eq!(
            apply("truncate", phrase, &[8.into(), false.into(), "...".into()]),
            Value::from("alpha...")
        );
        assert_eq!(apply("truncate", phrase, &[8.into(), true.into()]), Value::from("alpha..."));
        assert_eq!(apply("truncate", phrase, &[]), Value::from(phrase));
        assert_eq!(apply("truncate", phrase, &[2.into()]), Value::from("..."));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sequence_filters() {
        let nums = Value::from(vec![1, 2, 3]);
        assert_eq!(apply("join", nums.clone(), &["-".into()]), Value::from("1-2-3"));
        assert_eq!(apply("sum", nums.clone(), &[]).render(), "6");
        assert_eq!(apply("length", nums.clone(), &[]), Value::Int(3));
        assert_eq!(apply("first", nums.clone(), &[]), Value::Int(1));
        assert_eq!(apply("last", "xyz", &[]), Value::from("z"));
        assert_eq!(apply("reverse", nums, &[]), Value::from(vec![3, 2, 1]));
        assert_eq!(apply("sort", strs(&["b", "a", "C"]), &[]), strs(&["a", "b", "C"]));
        assert_eq!(apply("sort", strs(&["b", "a", "C"]), &[true.into()]), strs(&["C", "b", "a"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sort_by_attribute() {
        let people = Value::Array(vec![
            [("name", "b"), ("age", "30")].into_iter().collect(),
            [("name", "a"), ("age", "4")].into_iter().collect(),
        ]);
        let sorted = apply("sort", people, &[false.into(), false.into(), "name".into()]);
        assert_eq!(lookup_path(&sorted, "0.name"), Value::from("a"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_batch_and_slice() {
        let items = Value::from(vec![1, 2, 3, 4, 5]);
        assert_eq!(
            apply("batch", items.clone(), &[2.into(), 0.into()]),
            Value::Array(vec![
                Value::from(vec![1, 2]),
                Value::from(vec![3, 4]),
                Value::from(vec![5, 0]),
            ])
        );
        assert_eq!(
            apply("slice", items, &[2.into()]),
            Value::Array(vec![Value::from(vec![1, 2, 3]), Value::from(vec![4, 5])])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_default() {
        assert_eq!(apply("default", Value::Null, &["fallback".into()]), Value::from("fallback"));
        assert_eq!(apply("d", "", &["x".into()]), Value::from("x"));
        assert_eq!(apply("default", 0, &["x".into()]), Value::Int(0));
        assert_eq!(apply("default", 0, &["x".into(), true.into()]), Value::from("x"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dictsort() {
        let map: Value = [("b", 1), ("a", 2)].into_iter().collect();
        let sorted = apply("dictsort", map.clone(), &[]);
        assert_eq!(lookup_path(&sorted, "0.0"), Value::from("a"));
        let by_value = apply("dictsort", map, &["value".into()]);
        assert_eq!(lookup_path(&by_value, "0.0"), Value::from("b"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_select_and_reject() {
        let nums = Value::from(vec![1, 2, 3, 4]);
        assert_eq!(apply("select", nums.clone(), &["odd".into()]), Value::from(vec![1, 3]));
        assert_eq!(apply("reject", nums, &["odd".into()]), Value::from(vec![2, 4]));
        let err = apply_builtin("select", &Value::from(vec![1]), &["prime".into()]).unwrap();
        assert!(err.is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_filter_is_none() {
        assert!(apply_builtin("shout", &Value::Null, &[]).is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tests() {
        assert!(apply_test("divisibleby", &Value::Int(9), &[3.into()]).unwrap());
        assert!(!apply_test("divisibleby", &Value::Int(9), &[0.into()]).unwrap());
        assert!(apply_test("odd", &Value::Int(-3), &[]).unwrap());
        assert!(apply_test("none", &Value::Null, &[]).unwrap());
        assert!(apply_test("equalto", &Value::Float(2.0), &[2.into()]).unwrap());
        assert!(apply_test("prime", &Value::Int(2), &[]).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_range() {
        assert_eq!(range(&[3.into()]).unwrap(), Value::from(vec![0, 1, 2]));
        assert_eq!(range(&[5.into(), 0.into(), (-2).into()]).unwrap(), Value::from(vec![5, 3, 1]));
        assert!(range(&[1.into(), 2.into(), 0.into()]).is_err());
    }
}
