//! Dotted-path resolution and masking over `serde_json::Value` trees.
//!
//! Paths look like `results[0].geometry.bounds.northeast.lat`: segments are
//! separated by `.` and may carry `[n]` array indices. Object keys may
//! themselves contain dots (`"lat.x"`), so resolution backtracks over
//! progressively longer dot-joined key candidates until the rest of the path
//! resolves.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// Replaces the value at every resolvable path with `mask`.
///
/// Returns how many paths were masked. Paths that do not resolve, or that
/// resolve to an array element rather than an object property, are skipped.
pub fn scrub_paths<S: AsRef<str>>(root: &mut Value, paths: &[S], mask: &str) -> usize {
    let mut masked = 0;
    for path in paths {
        if set_value(root, path.as_ref(), Value::String(mask.to_string())) {
            masked += 1;
        }
    }
    masked
}

/// Masks every property named in `names` at any depth below `node`.
///
/// A matching property is replaced wholesale, objects and arrays included,
/// and its former contents are not searched further.
pub fn scrub_names<S: AsRef<str>>(node: &mut Value, names: &[S], mask: &str) {
    match node {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if names.iter().any(|name| name.as_ref() == key.as_str()) {
                    *value = Value::String(mask.to_string());
                } else {
                    scrub_names(value, names, mask);
                }
            }
        },
        Value::Array(items) => {
            for item in items {
                scrub_names(item, names, mask);
            }
        },
        _ => {},
    }
}

/// Returns the value at `path`, if it resolves.
pub fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let steps = resolve(root, &segments(path))?;
    steps.iter().try_fold(root, |node, step| match step {
        Step::Key(key) => node.get(key.as_str()),
        Step::Index(index) => node.get(*index),
    })
}

/// Overwrites the property at `path` with `value`.
///
/// Returns false when the path does not resolve or ends in an array index.
pub fn set_value(root: &mut Value, path: &str, value: Value) -> bool {
    let Some(steps) = resolve(root, &segments(path)) else {
        return false;
    };
    let Some((Step::Key(last), parents)) = steps.split_last() else {
        return false;
    };

    let mut node = root;
    for step in parents {
        let next = match step {
            Step::Key(key) => node.get_mut(key.as_str()),
            Step::Index(index) => node.get_mut(*index),
        };
        match next {
            Some(child) => node = child,
            None => return false,
        }
    }

    match node.as_object_mut().and_then(|map| map.get_mut(last.as_str())) {
        Some(slot) => {
            *slot = value;
            true
        },
        None => false,
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.strip_prefix("$.").unwrap_or(path).split('.').collect()
}

fn resolve(node: &Value, segments: &[&str]) -> Option<Vec<Step>> {
    if segments.is_empty() {
        return Some(Vec::new());
    }

    for take in 1..=segments.len() {
        let candidate = segments[..take].join(".");
        let (key, indices) = split_indices(&candidate);

        let mut steps = Vec::with_capacity(indices.len() + 1);
        let mut current = node;

        if !key.is_empty() {
            let Some(child) = current.as_object().and_then(|map| map.get(key)) else {
                continue;
            };
            steps.push(Step::Key(key.to_string()));
            current = child;
        } else if indices.is_empty() {
            continue;
        }

        let mut indexed = true;
        for index in indices {
            match current.as_array().and_then(|items| items.get(index)) {
                Some(item) => {
                    steps.push(Step::Index(index));
                    current = item;
                },
                None => {
                    indexed = false;
                    break;
                },
            }
        }
        if !indexed {
            continue;
        }

        if let Some(rest) = resolve(current, &segments[take..]) {
            steps.extend(rest);
            return Some(steps);
        }
    }

    None
}

/// Splits `name[0][1]` into `("name", [0, 1])`.
///
/// Anything that is not a well-formed trailing index list is treated as part
/// of the key.
fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let mut indices = Vec::new();
    let mut rest = segment;

    while let Some(stripped) = rest.strip_suffix(']') {
        let Some(open) = stripped.rfind('[') else {
            break;
        };
        let Ok(index) = stripped[open + 1..].parse::<usize>() else {
            break;
        };
        indices.push(index);
        rest = &stripped[..open];
    }

    indices.reverse();
    (rest, indices)
}
