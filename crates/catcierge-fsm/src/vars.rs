use chrono::{DateTime, Local};

use catcierge_events::{format_time, VarSource, DEFAULT_TIME_FMT};
use catcierge_vision::MAX_STEPS;

use crate::group::{MatchGroup, MatchState, MATCH_MAX_COUNT};
use crate::{FsmConfig, State};

/// Frozen view of the engine handed to the template renderer for one event.
/// `now` is captured once per dispatch, so rendering the same context twice
/// yields identical output.
pub struct TemplateCtx<'a> {
    pub state: State,
    pub prev_state: State,
    pub cfg: &'a FsmConfig,
    pub matcher_kind: &'a str,
    pub group: &'a MatchGroup,
    pub now: DateTime<Local>,
}

impl VarSource for TemplateCtx<'_> {
    fn var(&self, name: &str) -> Option<String> {
        match name {
            "state" => return Some(self.state.name().to_string()),
            "prev_state" => return Some(self.prev_state.name().to_string()),
            "matcher" => return Some(self.matcher_kind.to_string()),
            "matchtime" => return Some(format!("{}", self.cfg.match_time)),
            "ok_matches_needed" => return Some(self.cfg.ok_matches_needed.to_string()),
            "lockout_method" => return Some(self.cfg.lockout_method.number().to_string()),
            "lockout_time" => return Some(format!("{}", self.cfg.lockout_time)),
            "lockout_error" => {
                return Some(self.cfg.max_consecutive_lockout_count.to_string());
            }
            "lockout_error_delay" => {
                return Some(format!("{:.2}", self.cfg.consecutive_lockout_delay));
            }
            "match_success" => return Some((self.group.success as u8).to_string()),
            "match_count" => return Some(self.group.len().to_string()),
            "version" => return Some(env!("CARGO_PKG_VERSION").to_string()),
            "git_hash" => {
                return Some(option_env!("CATCIERGE_GIT_HASH").unwrap_or("unknown").to_string());
            }
            "git_hash_short" => {
                let hash = option_env!("CATCIERGE_GIT_HASH").unwrap_or("unknown");
                return Some(hash.chars().take(7).collect());
            }
            "git_tainted" => {
                return Some(option_env!("CATCIERGE_GIT_TAINTED").unwrap_or("0").to_string());
            }
            "time" => return format_time(&self.now, DEFAULT_TIME_FMT),
            _ => {}
        }

        if let Some(fmt) = name.strip_prefix("time:") {
            return format_time(&self.now, fmt);
        }

        self.match_var(name)
    }
}

impl TemplateCtx<'_> {
    /// `matchcur_<sub>` and `match<N>_<sub>`: per-match fields. Indices past
    /// what has matched so far render empty; indices past capacity are
    /// unknown-variable errors.
    fn match_var(&self, name: &str) -> Option<String> {
        let (idx, sub) = if let Some(rest) = name.strip_prefix("matchcur_") {
            (self.group.len().checked_sub(1)?, rest)
        } else {
            let rest = name.strip_prefix("match")?;
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            let sub = rest[digits.len()..].strip_prefix('_')?;
            let n: usize = digits.parse().ok()?;
            (n.checked_sub(1)?, sub)
        };

        if idx >= MATCH_MAX_COUNT {
            return None;
        }
        let Some(m) = self.group.get(idx) else {
            return Some(String::new());
        };

        match sub {
            "path" => Some(m.path.clone()),
            "id" => Some(m.id.clone()),
            "success" => Some((m.result.success as u8).to_string()),
            "direction" => Some(m.result.direction.as_str().to_string()),
            "result" => Some(format!("{:.6}", m.result.score)),
            "step_count" => Some(m.result.step_count().to_string()),
            s if s.starts_with("desc") => Some(m.result.description.clone()),
            "time" => format_time(&m.time, DEFAULT_TIME_FMT),
            s if s.starts_with("time:") => format_time(&m.time, &s["time:".len()..]),
            s if s.starts_with("step") => step_var(m, &s["step".len()..]),
            _ => None,
        }
    }
}

fn step_var(m: &MatchState, rest: &str) -> Option<String> {
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let sub = rest[digits.len()..].strip_prefix('_')?;
    let idx = digits.parse::<usize>().ok()?.checked_sub(1)?;
    if idx >= MAX_STEPS {
        return None;
    }

    let step = m.result.steps.get(idx);
    match sub {
        "path" => Some(step.map(|s| s.path.clone()).unwrap_or_default()),
        "name" => Some(step.map(|s| s.name.clone()).unwrap_or_default()),
        s if s.starts_with("desc") => {
            Some(step.map(|s| s.description.clone()).unwrap_or_default())
        }
        "active" => Some((step.is_some_and(|s| s.img.is_some()) as u8).to_string()),
        _ => None,
    }
}
