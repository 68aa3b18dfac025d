//! `<random:…>` prompt syntax.
//!
//! Prompt parameters may embed random choices that are resolved once per
//! run, seeded from the run's seed so the expansion is reproducible:
//!
//! | Syntax                    | Meaning                                    |
//! |---------------------------|--------------------------------------------|
//! | `<random:red, green>`     | one of the comma-separated options         |
//! | `<random:a, b\|c, d>`     | pipe separator when pipes outnumber commas |
//! | `<random:1-5>`            | integer range, inclusive                   |
//! | `<random:0.8-1.2>`        | float range, stepped by the finest decimal |
//! | `<random[2-4]:a, b, c>`   | 2 to 4 distinct picks, space-joined        |
//! | `<random[2,]:a, b, c>`    | 2 distinct picks, comma-joined             |

use std::sync::LazyLock;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use regex::{Captures, Regex};

static RANDOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<random(?:\[(\d+(?:-\d+)?)(,?)\])?:([^>]+)>").expect("valid regex")
});

static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)-(\d+(?:\.\d+)?)$").expect("valid regex"));

/// Whether `text` contains any `<random:…>` directive.
pub fn has_random_syntax(text: &str) -> bool {
    RANDOM_RE.is_match(text)
}

/// Resolve every `<random:…>` directive in `text` using `seed`.
pub fn expand_random_syntax(text: &str, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    RANDOM_RE
        .replace_all(text, |caps: &Captures| expand_directive(caps, &mut rng))
        .into_owned()
}

fn expand_directive(caps: &Captures, rng: &mut StdRng) -> String {
    let repeat_spec = caps.get(1).map(|m| m.as_str());
    let comma_join = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
    let options_str = &caps[3];

    let separator = if options_str.matches('|').count() > options_str.matches(',').count() {
        '|'
    } else {
        ','
    };

    let options: Vec<String> = options_str
        .split(separator)
        .map(str::trim)
        .flat_map(expand_range)
        .collect();

    let count = match repeat_spec {
        Some(spec) => match spec.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().unwrap_or(1);
                let hi: usize = hi.parse().unwrap_or(lo);
                if hi > lo {
                    rng.random_range(lo..=hi)
                } else {
                    lo
                }
            }
            None => spec.parse().unwrap_or(1),
        },
        None => 1,
    };

    let picked: Vec<&str> = if count <= options.len() {
        options
            .choose_multiple(rng, count)
            .map(String::as_str)
            .collect()
    } else {
        (0..count)
            .filter_map(|_| options.choose(rng).map(String::as_str))
            .collect()
    };

    picked.join(if comma_join { ", " } else { " " })
}

/// Expand `"1-3"` into `["1", "2", "3"]` and `"0.8-1.0"` into
/// `["0.8", "0.9", "1.0"]`; any other option is returned as-is.
fn expand_range(option: &str) -> Vec<String> {
    let Some(caps) = RANGE_RE.captures(option) else {
        return vec![option.to_string()];
    };
    let (start_str, end_str) = (&caps[1], &caps[2]);

    let expanded = if start_str.contains('.') || end_str.contains('.') {
        let decimals = |s: &str| s.split_once('.').map_or(0, |(_, frac)| frac.len());
        let places = decimals(start_str).max(decimals(end_str));
        let scale = 10f64.powi(places as i32);
        let start = (start_str.parse::<f64>().unwrap_or_default() * scale).round() as i64;
        let end = (end_str.parse::<f64>().unwrap_or_default() * scale).round() as i64;
        (start..=end)
            .map(|step| format!("{:.*}", places, step as f64 / scale))
            .collect::<Vec<_>>()
    } else {
        let start: u64 = start_str.parse().unwrap_or_default();
        let end: u64 = end_str.parse().unwrap_or_default();
        (start..=end).map(|i| i.to_string()).collect()
    };

    if expanded.is_empty() {
        vec![option.to_string()]
    } else {
        expanded
    }
}
