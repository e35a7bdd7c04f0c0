//! Parsing for the autopilot-meta trailer embedded in task bodies.
//!
//! Format: `<!-- autopilot-meta branch:<branch> pr:<prId> iteration:<n> -->`
//! Stored in the task body (not the core's tables) so the iteration counter
//! survives forge restarts and adapter churn (§9).

use once_cell::sync::Lazy;
use regex::Regex;

static TRAILER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<!--\s*autopilot-meta(?P<fields>(?:\s+\S+:\S+)*)\s*-->").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutopilotMeta {
    pub branch: Option<String>,
    pub pr_id: Option<i64>,
    pub iteration: u32,
}

/// Parses the last autopilot-meta trailer found in `body`. Returns `None` if
/// no trailer is present; callers should treat that as `iteration = 0`.
pub fn parse_autopilot_meta(body: &str) -> Option<AutopilotMeta> {
    let caps = TRAILER_RE.captures_iter(body).last()?;
    let fields = caps.name("fields")?.as_str();

    let mut branch = None;
    let mut pr_id = None;
    let mut iteration = 0u32;

    for field in fields.split_whitespace() {
        if let Some((key, value)) = field.split_once(':') {
            match key {
                "branch" => branch = Some(value.to_string()),
                "pr" => pr_id = value.parse().ok(),
                "iteration" => iteration = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    Some(AutopilotMeta { branch, pr_id, iteration })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_trailer() {
        let body = "Some description.\n\n<!-- autopilot-meta branch:pilot/issue-7 pr:42 iteration:3 -->";
        let meta = parse_autopilot_meta(body).unwrap();
        assert_eq!(meta.branch.as_deref(), Some("pilot/issue-7"));
        assert_eq!(meta.pr_id, Some(42));
        assert_eq!(meta.iteration, 3);
    }

    #[test]
    fn missing_trailer_yields_none() {
        assert!(parse_autopilot_meta("just a plain task body").is_none());
    }

    #[test]
    fn picks_the_last_trailer_when_multiple_present() {
        let body = "<!-- autopilot-meta branch:a pr:1 iteration:1 -->\nmore text\n<!-- autopilot-meta branch:a pr:1 iteration:2 -->";
        let meta = parse_autopilot_meta(body).unwrap();
        assert_eq!(meta.iteration, 2);
    }

    #[test]
    fn tolerates_missing_fields() {
        let body = "<!-- autopilot-meta branch:a -->";
        let meta = parse_autopilot_meta(body).unwrap();
        assert_eq!(meta.iteration, 0);
        assert!(meta.pr_id.is_none());
    }
}
