pub mod render;

pub use render::{format_time, parse_settings, render, RenderError, TemplateSettings, VarSource, DEFAULT_TIME_FMT};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Where rendered events land: regenerated output files plus an optional
/// command per event. The decision engine only sees this trait.
pub trait EventSink {
    fn emit(&mut self, event: &str, vars: &dyn VarSource);

    /// Whether a command template is registered for this event. The engine
    /// uses this to pick between command and GPIO actuation backends.
    fn has_command(&self, _event: &str) -> bool {
        false
    }
}

/// One user-supplied output template, loaded from disk.
#[derive(Debug, Clone)]
struct OutputTemplate {
    name: String,
    target_path: String,
    body: String,
    settings: TemplateSettings,
    generated_path: Option<String>,
}

/// The event dispatcher: named lifecycle events regenerate registered
/// output templates and run the event's command template.
pub struct Output {
    templates: Vec<OutputTemplate>,
    commands: HashMap<String, String>,
    output_path: PathBuf,
    new_execute: bool,
}

impl Output {
    pub fn new(output_path: &str, new_execute: bool) -> Self {
        Self {
            templates: Vec::new(),
            commands: HashMap::new(),
            output_path: PathBuf::from(output_path),
            new_execute,
        }
    }

    /// Register the command template to run when `event` fires.
    pub fn set_command(&mut self, event: &str, command: &str) {
        self.commands.insert(event.to_string(), command.to_string());
    }

    pub fn load_template_file(&mut self, path: &str) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read output template \"{}\"", path))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        self.add_template(&raw, filename)
            .with_context(|| format!("load output template \"{}\"", path))
    }

    /// A target filename starting with `[name]` names the template so a
    /// command can reference `%template_path:name%`; otherwise the template
    /// is named by its index.
    pub fn add_template(&mut self, raw: &str, target_filename: &str) -> Result<()> {
        let (name, target_path) = match target_filename
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
        {
            Some((name, rest)) => (name.to_string(), rest.to_string()),
            None => (self.templates.len().to_string(), target_filename.to_string()),
        };

        let (settings, body_start) = parse_settings(&target_path, raw)?;
        let body = raw[body_start..].to_string();

        info!("output template: {} ({})", name, target_path);
        self.templates.push(OutputTemplate {
            name,
            target_path,
            body,
            settings,
            generated_path: None,
        });
        Ok(())
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// Dry-run every template body and target path against `vars`, without
    /// touching the filesystem. Used by the doctor checks.
    pub fn validate(&self, vars: &dyn VarSource) -> Result<()> {
        let paths = self.path_table();
        let vars = WithTemplatePaths { inner: vars, paths: &paths };

        for t in &self.templates {
            render(&vars, &t.target_path)
                .with_context(|| format!("template \"{}\" target path", t.name))?;
            render(&vars, &t.body).with_context(|| format!("template \"{}\" body", t.name))?;
        }
        for (event, cmd) in &self.commands {
            if self.new_execute {
                render(&vars, cmd).with_context(|| format!("{} command", event))?;
            }
        }
        Ok(())
    }

    fn path_table(&self) -> Vec<(String, Option<String>)> {
        self.templates
            .iter()
            .map(|t| (t.name.clone(), t.generated_path.clone()))
            .collect()
    }

    /// Regenerate every template registered to `event`. The target path is
    /// assigned before the body renders, so a template (or the event's
    /// command afterwards) can reference its own `%template_path%`. Any
    /// failure, rendering or persisting, aborts the whole pass: the caller
    /// must not run the event's command against half-generated output.
    fn generate_templates(&mut self, event: &str, vars: &dyn VarSource) -> Result<()> {
        for t in &mut self.templates {
            t.generated_path = None;
        }

        for i in 0..self.templates.len() {
            if !self.templates[i].settings.registered_to(event) {
                continue;
            }

            let path = {
                let paths = self.path_table();
                let vars = WithTemplatePaths { inner: vars, paths: &paths };
                render(&vars, &self.templates[i].target_path)?
            };
            let full_path = self.output_path.join(sanitize_path(&path));
            self.templates[i].generated_path = Some(full_path.to_string_lossy().into_owned());

            let content = {
                let paths = self.path_table();
                let vars = WithTemplatePaths { inner: vars, paths: &paths };
                render(&vars, &self.templates[i].body)?
            };

            if let Some(dir) = full_path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create output dir {}", dir.display()))?;
            }
            std::fs::write(&full_path, &content)
                .with_context(|| format!("write template {}", full_path.display()))?;
            debug!("generated template {} -> {}", self.templates[i].name, full_path.display());
        }

        Ok(())
    }
}

/// Layers `template_path` / `template_path:<name>` resolution over the
/// engine-provided vocabulary; only the dispatcher knows generated paths.
struct WithTemplatePaths<'a> {
    inner: &'a dyn VarSource,
    paths: &'a [(String, Option<String>)],
}

impl VarSource for WithTemplatePaths<'_> {
    fn var(&self, name: &str) -> Option<String> {
        if name == "template_path" {
            return Some(
                self.paths
                    .first()
                    .and_then(|(_, p)| p.clone())
                    .unwrap_or_default(),
            );
        }
        if let Some(n) = name.strip_prefix("template_path:") {
            return Some(
                self.paths
                    .iter()
                    .find(|(name, _)| name == n)
                    .and_then(|(_, p)| p.clone())
                    .unwrap_or_default(),
            );
        }
        self.inner.var(name)
    }
}

impl EventSink for Output {
    fn emit(&mut self, event: &str, vars: &dyn VarSource) {
        if let Err(e) = self.generate_templates(event, vars) {
            error!("event {}: template generation failed: {:#}", event, e);
            return;
        }

        let Some(cmd) = self.commands.get(event).cloned() else {
            return;
        };

        let line = if self.new_execute {
            let paths = self.path_table();
            let vars = WithTemplatePaths { inner: vars, paths: &paths };
            match render(&vars, &cmd) {
                Ok(line) => line,
                Err(e) => {
                    error!("event {}: command render failed: {}", event, e);
                    return;
                }
            }
        } else {
            cmd
        };

        run_command(event, &line);
    }

    fn has_command(&self, event: &str) -> bool {
        self.commands.contains_key(event)
    }
}

/// Whitespace and `:` make poor filename characters.
fn sanitize_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_whitespace() || c == ':' { '_' } else { c })
        .collect()
}

/// Fire and forget through the shell; the tick must not block on user
/// commands.
fn run_command(event: &str, line: &str) {
    debug!("event {}: running: {}", event, line);
    match std::process::Command::new("sh").arg("-c").arg(line).spawn() {
        Ok(_child) => {}
        Err(e) => error!("event {}: failed to run \"{}\": {}", event, line, e),
    }
}

/// Template-variable vocabulary, for `catcierge vars`.
pub const VAR_DOCS: &[(&str, &str)] = &[
    ("state", "The current state machine state."),
    ("prev_state", "The previous state machine state."),
    ("matcher", "The matching algorithm in use."),
    ("matchtime", "The rematch window, seconds."),
    ("ok_matches_needed", "Frame successes needed for a group success."),
    ("lockout_method", "The lockout method (1-3)."),
    ("lockout_time", "The lockout duration, seconds."),
    ("lockout_error", "Max consecutive lockouts before aborting."),
    ("lockout_error_delay", "Consecutive lockout window slack, seconds."),
    ("match_success", "Group success status."),
    ("match_count", "Frames matched so far in the group."),
    ("matchcur_<sub>", "Fields of the most recent match (see match#_<sub>)."),
    ("match#_id", "Unique ID for match #."),
    ("match#_path", "Image path for match #."),
    ("match#_success", "Success status for match #."),
    ("match#_direction", "Direction for match #."),
    ("match#_description", "Description of match #."),
    ("match#_result", "Score for match #."),
    ("match#_time", "Time of match # (also match#_time:<fmt>)."),
    ("match#_step_count", "Number of recorded pipeline steps for match #."),
    ("match#_step#_path", "Image path for a pipeline step."),
    ("match#_step#_name", "Short name of a pipeline step."),
    ("match#_step#_desc", "Description of a pipeline step."),
    ("match#_step#_active", "Whether the step kept an image."),
    ("time", "The current time."),
    ("time:<fmt>", "The current time, strftime-formatted (@ replaces %)."),
    ("template_path", "Path of the first generated output template."),
    ("template_path:<name>", "Path of the named generated output template."),
    ("git_hash", "The git commit this build was made from."),
    ("git_hash_short", "The short git commit hash."),
    ("git_tainted", "Whether the build tree had local changes."),
    ("version", "The catcierge version."),
];
