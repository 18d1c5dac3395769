//! Read-time rendering of event log message templates.
//!
//! Event logs persist a message key and positional arguments; the rendered
//! text is produced only when the log is read, by whichever renderer the
//! caller injects.

use serde_json::Value;

/// Resolves a message key and its positional arguments to display text.
pub trait MessageRenderer: Send + Sync {
    fn render(&self, key: &str, args: &[Value]) -> String;
}

impl<F> MessageRenderer for F
where
    F: Fn(&str, &[Value]) -> String + Send + Sync,
{
    fn render(&self, key: &str, args: &[Value]) -> String {
        self(key, args)
    }
}

/// Treats the key itself as a format string and substitutes `%v`, `%s`,
/// `%d` and `%f` verbs with the arguments in order. `%%` is a literal percent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionalRenderer;

impl MessageRenderer for PositionalRenderer {
    fn render(&self, key: &str, args: &[Value]) -> String {
        let mut out = String::with_capacity(key.len());
        let mut args = args.iter();
        let mut chars = key.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                Some(verb @ ('v' | 's' | 'd' | 'f')) => {
                    chars.next();
                    match args.next() {
                        Some(arg) => out.push_str(&display_arg(arg)),
                        None => {
                            out.push('%');
                            out.push(verb);
                        }
                    }
                }
                _ => out.push('%'),
            }
        }
        out
    }
}

/// Plain-text form of a template argument. Strings are not quoted.
pub fn display_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
