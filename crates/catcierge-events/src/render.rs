use anyhow::Result;
use thiserror::Error;
use tracing::warn;

/// Template rendering failures. These never change machine state: the
/// caller logs and omits the rendering.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown template variable \"{0}\"")]
    UnknownVar(String),

    #[error("variable \"{var}\" not terminated on line {line}")]
    Unterminated { var: String, line: usize },
}

/// Variable lookup behind the renderer. The decision engine provides the
/// full vocabulary; tests provide fixed tables.
pub trait VarSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Expand `%name%` placeholders. `%%` is a literal percent. Unknown or
/// unterminated variables fail the whole rendering; there is no partial
/// output.
pub fn render(vars: &dyn VarSource, template: &str) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut line = 1usize;
    let mut it = template.chars().peekable();

    while let Some(c) = it.next() {
        if c == '\n' {
            line += 1;
        }
        if c != '%' {
            out.push(c);
            continue;
        }

        if it.peek() == Some(&'%') {
            it.next();
            out.push('%');
            continue;
        }

        let mut name = String::new();
        loop {
            match it.next() {
                Some('%') => break,
                Some('\n') | None => {
                    return Err(RenderError::Unterminated { var: name, line });
                }
                Some(ch) => name.push(ch),
            }
        }

        match vars.var(&name) {
            Some(v) => out.push_str(&v),
            None => return Err(RenderError::UnknownVar(name)),
        }
    }

    Ok(out)
}

/// Render a timestamp with the template time-format language: `@` stands in
/// for the strftime `%`, and `@f` keeps its traditional microsecond meaning.
/// Returns `None` for format strings strftime cannot parse.
pub fn format_time<Tz>(t: &chrono::DateTime<Tz>, fmt: &str) -> Option<String>
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    use chrono::format::{Item, StrftimeItems};

    let fmt = fmt.replace('@', "%").replace("%f", "%6f");
    let items: Vec<Item> = StrftimeItems::new(&fmt).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return None;
    }
    Some(t.format_with_items(items.into_iter()).to_string())
}

/// Default timestamp rendering, microsecond precision.
pub const DEFAULT_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S.%f";

#[derive(Debug, Clone, Default)]
pub struct TemplateSettings {
    /// Events this template is generated for; `all` or `*` match any.
    pub events: Vec<String>,
}

impl TemplateSettings {
    pub fn registered_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == "all" || e == "*" || e == event)
    }
}

/// Consume the `%!` settings rows at the top of a template file. Returns the
/// settings and the byte offset where the body starts.
pub fn parse_settings(name: &str, raw: &str) -> Result<(TemplateSettings, usize)> {
    let mut settings = TemplateSettings::default();
    let mut offset = 0usize;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim();
        if !trimmed.starts_with("%!") {
            break;
        }

        let rest = trimmed[2..].trim();
        if let Some(list) = rest.strip_prefix("event") {
            settings.events.extend(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            );
        } else if rest.starts_with("nop") {
            // Accepted and ignored.
        } else {
            anyhow::bail!("unknown template setting \"{}\" in \"{}\"", rest, name);
        }

        offset += line.len();
    }

    if settings.events.is_empty() {
        warn!("output template \"{}\" has no event filter, nothing will be generated", name);
    }

    Ok((settings, offset))
}
