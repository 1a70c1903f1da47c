//! Metric selection by name.
//!
//! Patterns are globs: `*` matches any run of characters, `?` matches one.
//! Everything else is literal.

use regex::Regex;

/// A set of globs compiled into one anchored regex.
#[derive(Debug, Clone)]
struct GlobSet(Regex);

impl GlobSet {
    fn compile(patterns: &[String]) -> Result<Option<Self>, regex::Error> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let alternatives: Vec<String> = patterns.iter().map(|p| glob_to_regex(p)).collect();
        let re = Regex::new(&format!("^(?:{})$", alternatives.join("|")))?;
        Ok(Some(GlobSet(re)))
    }

    fn is_match(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

/// Name filter for one output.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    namepass: Option<GlobSet>,
    namedrop: Option<GlobSet>,
}

impl Filter {
    pub fn new(namepass: &[String], namedrop: &[String]) -> Result<Self, regex::Error> {
        Ok(Filter {
            namepass: GlobSet::compile(namepass)?,
            namedrop: GlobSet::compile(namedrop)?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.namepass.is_some() || self.namedrop.is_some()
    }

    /// Whether a metric with this name should be delivered.
    ///
    /// `namedrop` wins over `namepass`.
    pub fn should_name_pass(&self, name: &str) -> bool {
        if let Some(pass) = &self.namepass {
            if !pass.is_match(name) {
                return false;
            }
        }
        if let Some(drop) = &self.namedrop {
            if drop.is_match(name) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_passes_everything() {
        let f = Filter::default();
        assert!(!f.is_active());
        for name in ["foo", "bar", "foo.bar", "supercalifragilisticexpialidocious"] {
            assert!(f.should_name_pass(name), "{name}");
        }
    }

    #[test]
    fn namepass() {
        let f = Filter::new(&strings(&["foo*", "cpu_usage_idle"]), &[]).unwrap();
        assert!(f.is_active());
        for name in ["foo", "foo_bar", "foo.bar", "foo-bar", "cpu_usage_idle"] {
            assert!(f.should_name_pass(name), "{name} should pass");
        }
        for name in ["bar", "barfoo", "bar_foo", "cpu_usage_busy"] {
            assert!(!f.should_name_pass(name), "{name} should drop");
        }
    }

    #[test]
    fn namedrop() {
        let f = Filter::new(&[], &strings(&["foo*", "cpu_usage_idle"])).unwrap();
        for name in ["foo", "foo_bar", "foo.bar", "foo-bar", "cpu_usage_idle"] {
            assert!(!f.should_name_pass(name), "{name} should drop");
        }
        for name in ["bar", "barfoo", "bar_foo", "cpu_usage_busy"] {
            assert!(f.should_name_pass(name), "{name} should pass");
        }
    }

    #[test]
    fn pass_and_drop_combined() {
        let f = Filter::new(&strings(&["name1", "name2"]), &strings(&["name1", "name3"])).unwrap();
        let got: Vec<bool> = ["name1", "name2", "name3", "name4"]
            .iter()
            .map(|n| f.should_name_pass(n))
            .collect();
        assert_eq!(got, vec![false, true, false, false]);
    }

    #[test]
    fn question_mark_matches_one_char() {
        let f = Filter::new(&strings(&["cpu?"]), &[]).unwrap();
        assert!(f.should_name_pass("cpu0"));
        assert!(!f.should_name_pass("cpu"));
        assert!(!f.should_name_pass("cpu10"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let f = Filter::new(&strings(&["a.b+(c)"]), &[]).unwrap();
        assert!(f.should_name_pass("a.b+(c)"));
        assert!(!f.should_name_pass("axbb(c)"));
    }
}
