//! Input-template resolution
//!
//! Step and story input templates carry `${KEY}` placeholders resolved from
//! run variables and declared outputs of earlier steps. An unresolvable
//! placeholder renders the literal `[missing: KEY]` so the agent fails
//! cleanly instead of papering over a hole in its instructions.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

/// Substitute `${KEY}` placeholders from `vars`.
pub fn resolve(template: &str, vars: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match vars.get(key) {
                Some(value) => value.clone(),
                None => format!("[missing: {key}]"),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let resolved = resolve("Do ${TASK} as ${ROLE}", &vars(&[("TASK", "it"), ("ROLE", "dev")]));
        assert_eq!(resolved, "Do it as dev");
    }

    #[test]
    fn missing_placeholder_renders_literal_marker() {
        let resolved = resolve("Need ${PLAN} here", &vars(&[]));
        assert_eq!(resolved, "Need [missing: PLAN] here");
    }

    #[test]
    fn plain_dollar_is_left_alone() {
        let resolved = resolve("costs $5 and ${X}", &vars(&[("X", "y")]));
        assert_eq!(resolved, "costs $5 and y");
    }

    #[test]
    fn repeated_placeholder_resolves_each_time() {
        let resolved = resolve("${A} and ${A}", &vars(&[("A", "x")]));
        assert_eq!(resolved, "x and x");
    }
}
