//! Source pre-transform applied once per job before dispatch.
//!
//! The transform normalizes module specifiers for the unit runtime. Any failure
//! degrades to the untransformed source.

use crate::config::types::{Result, SandboxError};

pub trait SourceTransform: Send + Sync {
    fn transform(&self, source: &str) -> Result<String>;
}

/// Run `transform`, falling back to the original source on error.
pub fn apply_or_original(transform: &dyn SourceTransform, source: &str) -> String {
    match transform.transform(source) {
        Ok(transformed) => transformed,
        Err(e) => {
            log::warn!("source transform failed, using original source: {}", e);
            source.to_string()
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl SourceTransform for IdentityTransform {
    fn transform(&self, source: &str) -> Result<String> {
        Ok(source.to_string())
    }
}

const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "fs/promises",
    "http", "http2", "https", "inspector", "module", "net", "os", "path", "path/posix",
    "path/win32", "perf_hooks", "process", "punycode", "querystring", "readline", "repl",
    "stream", "stream/promises", "stream/web", "string_decoder", "sys", "timers",
    "timers/promises", "tls", "trace_events", "tty", "url", "util", "util/types", "v8", "vm",
    "wasi", "worker_threads", "zlib",
];

const SAFE_PREFIXES: &[&str] = &["./", "../", "/", "http:", "https:", "npm:", "node:", "jsr:", "data:", "file:"];

const SPECIFIER_KEYWORDS: &[&str] = &["from", "import", "require"];

/// Prefixes bare specifiers with `node:` (core modules) or `npm:` (everything
/// else) in static imports, re-exports, dynamic `import()` and `require()`.
/// String and comment contents are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportPrefixTransform;

impl ImportPrefixTransform {
    fn prefix_for(specifier: &str) -> Option<&'static str> {
        if specifier.is_empty() || SAFE_PREFIXES.iter().any(|p| specifier.starts_with(p)) {
            return None;
        }
        if NODE_BUILTINS.contains(&specifier) {
            Some("node:")
        } else {
            Some("npm:")
        }
    }
}

impl SourceTransform for ImportPrefixTransform {
    fn transform(&self, source: &str) -> Result<String> {
        let bytes = source.as_bytes();
        let mut out = String::with_capacity(source.len() + 16);
        let mut i = 0;
        let mut copied = 0;
        let mut pending_keyword = false;

        while i < bytes.len() {
            match bytes[i] {
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    i = bytes[i..]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map_or(bytes.len(), |n| i + n);
                    pending_keyword = false;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let end = source[i + 2..].find("*/").ok_or_else(|| {
                        SandboxError::Config("unterminated block comment".to_string())
                    })?;
                    i += end + 4;
                }
                quote @ (b'\'' | b'"' | b'`') => {
                    let end = string_end(bytes, i, quote)?;
                    if pending_keyword && quote != b'`' {
                        let specifier = &source[i + 1..end];
                        if let Some(prefix) = Self::prefix_for(specifier) {
                            out.push_str(&source[copied..i + 1]);
                            out.push_str(prefix);
                            copied = i + 1;
                        }
                    }
                    pending_keyword = false;
                    i = end + 1;
                }
                b if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => {
                    let start = i;
                    while i < bytes.len()
                        && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                    {
                        i += 1;
                    }
                    let preceded_by_dot = start > 0 && bytes[start - 1] == b'.';
                    pending_keyword = !preceded_by_dot && SPECIFIER_KEYWORDS.contains(&&source[start..i]);
                }
                b if b.is_ascii_whitespace() || b == b'(' => i += 1,
                _ => {
                    pending_keyword = false;
                    i += 1;
                }
            }
        }

        out.push_str(&source[copied..]);
        Ok(out)
    }
}

fn string_end(bytes: &[u8], start: usize, quote: u8) -> Result<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' if quote != b'`' => break,
            b if b == quote => return Ok(i),
            _ => i += 1,
        }
    }
    Err(SandboxError::Config(format!(
        "unterminated string literal starting at byte {}",
        start
    )))
}
