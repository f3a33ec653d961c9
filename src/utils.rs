use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid variable regex"));

/// Parse a `key=value` override as passed to `--set`.
pub fn parse_override(pair: &str) -> Result<(String, String), String> {
    let pair = pair.trim();
    match pair.find('=') {
        Some(eq_pos) if eq_pos > 0 => Ok((
            pair[..eq_pos].trim().to_string(),
            pair[eq_pos + 1..].to_string(),
        )),
        _ => Err(format!("expected key=value, got {:?}", pair)),
    }
}

/// Parse a list of `key=value` overrides into a BTreeMap.
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>, String> {
    pairs.iter().map(|p| parse_override(p)).collect()
}

/// Parse `500ms`, `5s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    let secs = |factor: u64| {
        n.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {:?} is too large", s))
    };
    match unit {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(format!("unknown duration unit {:?} in {:?}", unit, s)),
    }
}

/// Replace `${NAME}` with values from `vars`; unknown names are left as is.
pub fn expand_vars(text: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_RE
        .replace_all(text, |caps: &Captures| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Names of `${NAME}` placeholders still present in `text`.
pub fn unresolved_vars(text: &str) -> Vec<String> {
    VAR_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// File-name friendly form of a scenario name.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
