//! HTML views.
//!
//! Templates are plain HTML with `{{ dotted.path }}` placeholders filled from
//! a JSON context. Values are HTML-escaped. Whitespace at the start and end of
//! every line is removed before rendering, so the output is a single line.
//!
//! A views directory can override any template; the built-in defaults cover
//! the landing page and every error view the pipeline renders.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors that can occur while rendering a view.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("view '{0}' not found")]
    NotFound(String),

    #[error("view '{template}' references missing value '{path}'")]
    MissingValue { template: String, path: String },

    #[error("view '{template}' has an unterminated placeholder")]
    Unterminated { template: String },

    #[error("failed to read view: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders a named view against a JSON context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, name: &str, context: &Value) -> Result<String, RenderError>;
}

const BUILTIN: &[(&str, &str)] = &[
    ("index", include_str!("../../views/index.html")),
    ("errors/400", include_str!("../../views/errors/400.html")),
    ("errors/404", include_str!("../../views/errors/404.html")),
    ("errors/500", include_str!("../../views/errors/500.html")),
    ("errors/other", include_str!("../../views/errors/other.html")),
    ("errors/generic", include_str!("../../views/errors/generic.html")),
];

/// File-backed views with built-in fallbacks.
pub struct Views {
    dir: Option<PathBuf>,
    cache: Option<RwLock<HashMap<String, Arc<str>>>>,
}

impl Views {
    /// `cache` keeps every shrunk template after its first use. Production
    /// turns it on; development re-reads files so edits show up immediately.
    pub fn new(dir: Option<PathBuf>, cache: bool) -> Self {
        Self {
            dir,
            cache: cache.then(|| RwLock::new(HashMap::new())),
        }
    }

    fn source(&self, name: &str) -> Result<Arc<str>, RenderError> {
        if let Some(cache) = &self.cache
            && let Ok(cached) = cache.read()
            && let Some(source) = cached.get(name)
        {
            return Ok(source.clone());
        }

        let source: Arc<str> = shrink(&self.load(name)?).into();
        if let Some(cache) = &self.cache
            && let Ok(mut cached) = cache.write()
        {
            cached.insert(name.to_string(), source.clone());
        }
        Ok(source)
    }

    fn load(&self, name: &str) -> Result<String, RenderError> {
        let valid = !name.is_empty()
            && name
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(RenderError::NotFound(name.to_string()));
        }

        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.html", name));
            match std::fs::read_to_string(&path) {
                Ok(source) => return Ok(source),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        BUILTIN
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, source)| source.to_string())
            .ok_or_else(|| RenderError::NotFound(name.to_string()))
    }
}

impl TemplateEngine for Views {
    fn render(&self, name: &str, context: &Value) -> Result<String, RenderError> {
        let source = self.source(name)?;
        substitute(name, &source, context)
    }
}

/// Strip leading and trailing whitespace from every line and join the lines.
pub fn shrink(source: &str) -> String {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn substitute(name: &str, source: &str, context: &Value) -> Result<String, RenderError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| RenderError::Unterminated {
            template: name.to_string(),
        })?;
        let path = after[..end].trim();
        let value = lookup(context, path).ok_or_else(|| RenderError::MissingValue {
            template: name.to_string(),
            path: path.to_string(),
        })?;
        escape_into(&mut out, &display(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}
