//! Embedded script modules
//!
//! The built-in module whitelist available to every app through `import`.
//! These resolve BEFORE app files on purpose: tenant code must never shadow
//! a utility module with its own file. Document this loudly wherever module
//! resolution is discussed.
//!
//! Modules: util (collection helpers), uuid, datetime, validator, markdown,
//! schema (shape validation), html (escape/strip helpers).

use pulldown_cmark::{html, Parser};
use rhai::{Array, Dynamic, Map, Module, Shared};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Names resolvable as embedded modules, in resolution order
pub const EMBEDDED_MODULES: &[&str] = &[
    "util",
    "uuid",
    "datetime",
    "validator",
    "markdown",
    "schema",
    "html",
];

/// Fetch an embedded module by name. Built once and shared.
pub fn embedded(name: &str) -> Option<Shared<Module>> {
    static CACHE: OnceLock<BTreeMap<&'static str, Shared<Module>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        let mut map = BTreeMap::new();
        map.insert("util", Shared::new(util_module()));
        map.insert("uuid", Shared::new(uuid_module()));
        map.insert("datetime", Shared::new(datetime_module()));
        map.insert("validator", Shared::new(validator_module()));
        map.insert("markdown", Shared::new(markdown_module()));
        map.insert("schema", Shared::new(schema_module()));
        map.insert("html", Shared::new(html_module()));
        map
    });
    cache.get(name).cloned()
}

fn util_module() -> Module {
    let mut m = Module::new();

    m.set_native_fn("unique", |arr: Array| {
        let mut out = Array::new();
        for item in arr {
            if !out.iter().any(|o| dynamic_eq(o, &item)) {
                out.push(item);
            }
        }
        Ok(out)
    });

    m.set_native_fn("flatten", |arr: Array| {
        let mut out = Array::new();
        for item in arr {
            match item.clone().try_cast::<Array>() {
                Some(inner) => out.extend(inner),
                None => out.push(item),
            }
        }
        Ok(out)
    });

    m.set_native_fn("chunk", |arr: Array, size: i64| {
        let size = size.max(1) as usize;
        let mut out = Array::new();
        for chunk in arr.chunks(size) {
            out.push(Dynamic::from_array(chunk.to_vec()));
        }
        Ok(out)
    });

    m.set_native_fn("pick", |map: Map, keys: Array| {
        let mut out = Map::new();
        for key in keys {
            let key = key.to_string();
            if let Some(v) = map.get(key.as_str()) {
                out.insert(key.into(), v.clone());
            }
        }
        Ok(out)
    });

    m.set_native_fn("omit", |map: Map, keys: Array| {
        let drop: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
        let mut out = Map::new();
        for (k, v) in map {
            if !drop.iter().any(|d| d.as_str() == k.as_str()) {
                out.insert(k, v);
            }
        }
        Ok(out)
    });

    m.set_native_fn("merge", |a: Map, b: Map| {
        let mut out = a;
        for (k, v) in b {
            out.insert(k, v);
        }
        Ok(out)
    });

    m.set_native_fn("get_path", |map: Map, path: &str| {
        let mut current = Dynamic::from_map(map);
        for seg in path.split('.') {
            let Some(next) = current
                .read_lock::<Map>()
                .and_then(|m| m.get(seg).cloned())
            else {
                return Ok(Dynamic::UNIT);
            };
            current = next;
        }
        Ok(current)
    });

    m
}

fn dynamic_eq(a: &Dynamic, b: &Dynamic) -> bool {
    // Structural equality via JSON; adequate for de-dup on data values
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn uuid_module() -> Module {
    let mut m = Module::new();
    m.set_native_fn("v4", || Ok(uuid::Uuid::new_v4().to_string()));
    m.set_native_fn("nil", || Ok(uuid::Uuid::nil().to_string()));
    m.set_native_fn("is_valid", |s: &str| Ok(uuid::Uuid::parse_str(s).is_ok()));
    m
}

fn datetime_module() -> Module {
    use chrono::{DateTime, TimeZone, Utc};
    let mut m = Module::new();

    m.set_native_fn("now", || Ok(Utc::now().to_rfc3339()));
    m.set_native_fn("timestamp", || Ok(Utc::now().timestamp_millis()));
    m.set_native_fn("format", |millis: i64, fmt: &str| {
        let dt = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(dt.format(fmt).to_string())
    });
    m.set_native_fn("parse", |s: &str| {
        Ok(DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(-1))
    });
    m.set_native_fn("add_days", |millis: i64, days: i64| {
        Ok(millis + days * 86_400_000)
    });
    m
}

fn validator_module() -> Module {
    let mut m = Module::new();

    m.set_native_fn("is_email", |s: &str| {
        let Some((local, domain)) = s.split_once('@') else {
            return Ok(false);
        };
        Ok(!local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
    });
    m.set_native_fn("is_url", |s: &str| Ok(reqwest::Url::parse(s).is_ok()));
    m.set_native_fn("is_uuid", |s: &str| Ok(uuid::Uuid::parse_str(s).is_ok()));
    m.set_native_fn("is_numeric", |s: &str| {
        Ok(!s.is_empty() && s.parse::<f64>().is_ok())
    });
    m.set_native_fn("is_alphanumeric", |s: &str| {
        Ok(!s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
    });
    m
}

fn markdown_module() -> Module {
    let mut m = Module::new();
    m.set_native_fn("render", |md: &str| {
        let parser = Parser::new(md);
        let mut out = String::new();
        html::push_html(&mut out, parser);
        Ok(out)
    });
    m
}

fn schema_module() -> Module {
    let mut m = Module::new();

    // validate(value, schema) -> array of error strings (empty = valid).
    // Schema is a flat map of field -> expected type name, with a trailing
    // "?" marking the field optional.
    m.set_native_fn("validate", |value: Map, schema: Map| {
        let mut errors = Array::new();
        for (field, expected) in &schema {
            let expected = expected.to_string();
            let (type_name, optional) = match expected.strip_suffix('?') {
                Some(t) => (t.to_string(), true),
                None => (expected, false),
            };
            match value.get(field.as_str()) {
                None => {
                    if !optional {
                        errors.push(format!("{field}: missing").into());
                    }
                }
                Some(v) => {
                    if !type_matches(v, &type_name) {
                        errors.push(
                            format!("{field}: got {}, expected {type_name}", v.type_name()).into(),
                        );
                    }
                }
            }
        }
        Ok(errors)
    });

    m.set_native_fn("check", |value: Map, schema: Map| {
        let mut ok = true;
        for (field, expected) in &schema {
            let expected = expected.to_string();
            let (type_name, optional) = match expected.strip_suffix('?') {
                Some(t) => (t.to_string(), true),
                None => (expected, false),
            };
            match value.get(field.as_str()) {
                None if optional => {}
                None => ok = false,
                Some(v) if type_matches(v, &type_name) => {}
                Some(_) => ok = false,
            }
        }
        Ok(ok)
    });

    m
}

fn type_matches(v: &Dynamic, type_name: &str) -> bool {
    match type_name {
        "string" => v.is_string(),
        "int" => v.is_int(),
        "float" => v.is_float(),
        "number" => v.is_int() || v.is_float(),
        "bool" => v.is_bool(),
        "array" => v.is_array(),
        "map" | "object" => v.is_map(),
        _ => false,
    }
}

fn html_module() -> Module {
    let mut m = Module::new();

    m.set_native_fn("escape", |s: &str| {
        Ok(s.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('"', "&quot;")
            .replace('\'', "&#39;"))
    });

    m.set_native_fn("unescape", |s: &str| {
        Ok(s.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&"))
    });

    // Strip tags, keeping text content
    m.set_native_fn("strip_tags", |s: &str| Ok(strip_tags(s)));
    m.set_native_fn("text", |s: &str| {
        let stripped = strip_tags(s);
        Ok(stripped.split_whitespace().collect::<Vec<_>>().join(" "))
    });

    m
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    fn eval_with(module: &str, script: &str) -> Dynamic {
        let mut engine = Engine::new();
        engine.set_module_resolver(crate::script::resolver::FaztResolver::new());
        engine
            .eval(&format!("import \"{module}\" as m; {script}"))
            .unwrap()
    }

    #[test]
    fn all_embedded_modules_exist() {
        for name in EMBEDDED_MODULES {
            assert!(embedded(name).is_some(), "missing module {name}");
        }
        assert!(embedded("lodash").is_none());
    }

    #[test]
    fn util_unique_and_chunk() {
        let out = eval_with("util", "m::unique([1, 2, 2, 3])");
        assert_eq!(out.into_typed_array::<i64>().unwrap(), vec![1, 2, 3]);

        let out = eval_with("util", "m::chunk([1, 2, 3], 2).len()");
        assert_eq!(out.as_int().unwrap(), 2);
    }

    #[test]
    fn util_get_path_walks_maps() {
        let out = eval_with("util", r#"m::get_path(#{a: #{b: 42}}, "a.b")"#);
        assert_eq!(out.as_int().unwrap(), 42);
        let out = eval_with("util", r#"m::get_path(#{a: 1}, "a.b.c")"#);
        assert!(out.is_unit());
    }

    #[test]
    fn uuid_generates_valid() {
        let out = eval_with("uuid", "let id = m::v4(); m::is_valid(id)");
        assert!(out.as_bool().unwrap());
    }

    #[test]
    fn validator_checks_emails() {
        assert!(eval_with("validator", r#"m::is_email("a@b.co")"#).as_bool().unwrap());
        assert!(!eval_with("validator", r#"m::is_email("nope")"#).as_bool().unwrap());
    }

    #[test]
    fn markdown_renders() {
        let out = eval_with("markdown", r##"m::render("# hi")"##);
        assert!(out.into_string().unwrap().contains("<h1>hi</h1>"));
    }

    #[test]
    fn schema_validation_reports_fields() {
        let out = eval_with(
            "schema",
            r#"m::validate(#{name: 1}, #{name: "string", age: "int?"})"#,
        );
        let errors = out.into_typed_array::<String>().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("name"));
    }

    #[test]
    fn html_escape_and_strip() {
        let out = eval_with("html", r#"m::escape("<b>&</b>")"#);
        assert_eq!(out.into_string().unwrap(), "&lt;b&gt;&amp;&lt;/b&gt;");
        let out = eval_with("html", r#"m::strip_tags("<p>hello <b>world</b></p>")"#);
        assert_eq!(out.into_string().unwrap(), "hello world");
    }
}
