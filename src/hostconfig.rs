//! OpenSSH-style host configuration: wildcard host patterns, the
//! `Host`-block file format and `%`-token expansion for identity-file
//! paths.

use std::path::PathBuf;

use log::debug;

use crate::error::{Error, Result};

/// The pattern matching every host; its entry supplies global defaults.
pub const ALL_HOSTS_PATTERN: &str = "*";

/// Whether every character of `pattern` is allowed: alphanumerics and
/// `-_.*?`.
pub fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*' | '?'))
}

/// Case-insensitive wildcard match: `*` matches any run of characters
/// including the empty one, `?` matches exactly one.
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    fn glob(p: &[u8], h: &[u8]) -> bool {
        match p.first() {
            None => h.is_empty(),
            Some(b'*') => glob(&p[1..], h) || (!h.is_empty() && glob(p, &h[1..])),
            Some(b'?') => !h.is_empty() && glob(&p[1..], &h[1..]),
            Some(&c) => {
                h.first().map_or(false, |&hc| hc.eq_ignore_ascii_case(&c)) && glob(&p[1..], &h[1..])
            }
        }
    }
    glob(pattern.as_bytes(), host.as_bytes())
}

/// One `Host` block of a config file.
#[derive(Debug, Clone, Default)]
pub struct HostEntry {
    /// The patterns this entry applies to. Several patterns on one
    /// `Host` line share the body.
    pub patterns: Vec<String>,
    /// `HostName` directive.
    pub hostname: Option<String>,
    /// `Port` directive; 0 when unset.
    pub port: u16,
    /// `User` directive.
    pub username: Option<String>,
    /// `IdentityFile` directives, unexpanded.
    pub identity_files: Vec<String>,
    /// Any other directives, in file order.
    pub options: Vec<(String, String)>,
}

impl HostEntry {
    /// Whether any of the entry's patterns matches `host`.
    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, host))
    }

    /// Whether this is the global-defaults entry.
    pub fn is_global(&self) -> bool {
        self.patterns.iter().any(|p| p == ALL_HOSTS_PATTERN)
    }

    /// Whether one of the patterns names `host` exactly
    /// (case-insensitively, no wildcards involved).
    pub fn matches_exactly(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.eq_ignore_ascii_case(host))
    }
}

/// Effective settings for one destination after merging entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedHost {
    /// Host name to actually connect to.
    pub hostname: String,
    /// Port to connect to.
    pub port: u16,
    /// Username to authenticate as.
    pub username: String,
    /// Identity files with `%`-tokens and `~` already expanded.
    pub identity_files: Vec<String>,
}

/// An ordered list of host entries, as read from a config file.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    entries: Vec<HostEntry>,
}

impl HostConfig {
    /// Parse config-file text: one `Keyword Value...` directive per
    /// line, `Host` starting a new entry, `#` introducing comments.
    pub fn parse(text: &str) -> Result<HostConfig> {
        let mut entries: Vec<HostEntry> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (keyword, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => {
                    return Err(Error::Config(format!(
                        "line {}: directive without a value: {:?}",
                        lineno + 1,
                        line
                    )))
                }
            };

            if keyword.eq_ignore_ascii_case("Host") {
                let patterns: Vec<String> = value.split_whitespace().map(str::to_owned).collect();
                for pattern in &patterns {
                    if !is_valid_pattern(pattern) {
                        return Err(Error::Config(format!(
                            "line {}: invalid host pattern {:?}",
                            lineno + 1,
                            pattern
                        )));
                    }
                }
                entries.push(HostEntry {
                    patterns,
                    ..HostEntry::default()
                });
                continue;
            }

            let entry = entries.last_mut().ok_or_else(|| {
                Error::Config(format!(
                    "line {}: {:?} before any Host block",
                    lineno + 1,
                    keyword
                ))
            })?;
            if keyword.eq_ignore_ascii_case("HostName") {
                entry.hostname = Some(value.to_owned());
            } else if keyword.eq_ignore_ascii_case("Port") {
                entry.port = value
                    .parse()
                    .map_err(|_| Error::Config(format!("line {}: bad port {:?}", lineno + 1, value)))?;
            } else if keyword.eq_ignore_ascii_case("User") {
                entry.username = Some(value.to_owned());
            } else if keyword.eq_ignore_ascii_case("IdentityFile") {
                entry.identity_files.push(value.to_owned());
            } else {
                entry.options.push((keyword.to_owned(), value.to_owned()));
            }
        }
        Ok(HostConfig { entries })
    }

    /// The entries in file order.
    pub fn entries(&self) -> &[HostEntry] {
        &self.entries
    }

    /// The most specific entry for `host`: an exact pattern wins over
    /// any wildcard match, and any specific match wins over `Host *`,
    /// regardless of file order.
    pub fn find_best_match(&self, host: &str) -> Option<&HostEntry> {
        if let Some(exact) = self.entries.iter().find(|e| e.matches_exactly(host)) {
            return Some(exact);
        }
        if let Some(specific) = self
            .entries
            .iter()
            .find(|e| !e.is_global() && e.matches(host))
        {
            return Some(specific);
        }
        self.entries.iter().find(|e| e.is_global() && e.matches(host))
    }

    /// Resolve the effective settings for connecting to `host`, starting
    /// from the caller's `original_port` and `original_user`. The best
    /// match contributes first; the global entry only fills what is
    /// still unset.
    pub fn resolve(&self, host: &str, original_port: u16, original_user: &str) -> ResolvedHost {
        let mut resolved = ResolvedHost {
            hostname: host.to_owned(),
            port: original_port,
            username: original_user.to_owned(),
            identity_files: Vec::new(),
        };

        let best = self.find_best_match(host);
        let global = self
            .entries
            .iter()
            .find(|e| e.is_global() && e.matches(host))
            // Skip the global pass when it already was the best match.
            .filter(|g| !best.map_or(false, |b| std::ptr::eq(b, *g)));

        // First writer wins across the two passes: the global entry only
        // contributes values the more specific match left unset.
        let mut raw_identities: Vec<String> = Vec::new();
        let mut hostname_set = false;
        let mut port_set = false;
        let mut user_set = false;
        for entry in [best, global].into_iter().flatten() {
            if let (false, Some(hostname)) = (hostname_set, &entry.hostname) {
                resolved.hostname = hostname.clone();
                hostname_set = true;
            }
            if !port_set && entry.port > 0 {
                resolved.port = resolve_port(resolved.port, entry.port);
                port_set = true;
            }
            match entry.username.as_deref() {
                Some(name) if !user_set && !name.is_empty() => {
                    resolved.username = name.to_owned();
                    user_set = true;
                }
                _ => {}
            }
            if raw_identities.is_empty() {
                raw_identities = entry.identity_files.clone();
            }
        }

        resolved.identity_files = raw_identities
            .iter()
            .map(|path| expand_tokens(path, &resolved.hostname, resolved.port, &resolved.username))
            .collect();
        debug!("resolved {:?} -> {:?}", host, resolved);
        resolved
    }
}

/// The entry's port wins when it is set (> 0).
pub fn resolve_port(original: u16, entry: u16) -> u16 {
    if entry > 0 {
        entry
    } else {
        original
    }
}

/// The entry's username wins when it is non-empty.
pub fn resolve_username<'a>(original: &'a str, entry: Option<&'a str>) -> &'a str {
    match entry {
        Some(name) if !name.is_empty() => name,
        _ => original,
    }
}

fn home_dir() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .to_string_lossy()
        .into_owned()
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

/// Expand `%`-tokens and a leading `~` in an identity-file path. This
/// happens once, at resolution time.
pub fn expand_tokens(path: &str, host: &str, port: u16, user: &str) -> String {
    let mut expanded = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            expanded.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => expanded.push_str(host),
            Some('p') => expanded.push_str(&port.to_string()),
            Some('u') | Some('r') => expanded.push_str(user),
            Some('d') => expanded.push_str(&home_dir()),
            Some('l') => expanded.push_str(&local_hostname()),
            Some('%') => expanded.push('%'),
            Some(other) => {
                expanded.push('%');
                expanded.push(other);
            }
            None => expanded.push('%'),
        }
    }
    if let Some(rest) = expanded.strip_prefix("~/") {
        return format!("{}/{}", home_dir(), rest);
    }
    if expanded == "~" {
        return home_dir();
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        for n in 0..=255u32 {
            assert!(pattern_matches("10.0.0.*", &format!("10.0.0.{}", n)));
        }
        assert!(!pattern_matches("10.0.0.*", "10.0.1.5"));
        // '*' matches the empty run too.
        assert!(pattern_matches("10.0.0.*", "10.0.0."));

        // '?' matches exactly one character, never zero.
        assert!(pattern_matches("?", "a"));
        assert!(!pattern_matches("?", ""));
        assert!(!pattern_matches("?", "ab"));
        assert!(pattern_matches("h?st", "host"));

        assert!(pattern_matches("TESThost", "testHOST"));
        assert!(pattern_matches("*", ""));
    }

    #[test]
    fn pattern_charset() {
        assert!(is_valid_pattern("web-1.example_net"));
        assert!(is_valid_pattern("10.0.0.?"));
        assert!(!is_valid_pattern("bad host"));
        assert!(!is_valid_pattern("no[brackets]"));
        assert!(!is_valid_pattern(""));
    }

    fn sample_config() -> HostConfig {
        HostConfig::parse(
            "# defaults\n\
             Host *\n\
             \tUser fallback\n\
             \tPort 2200\n\
             \tIdentityFile ~/.ssh/id_ed25519\n\
             \n\
             Host test*   # trailing comment\n\
             \tUser tester\n\
             \n\
             Host testhost\n\
             \tHostName testhost.example.com\n\
             \tPort 2022\n\
             \tIdentityFile /keys/%u@%h:%p\n",
        )
        .unwrap()
    }

    #[test]
    fn best_match_prefers_most_specific_regardless_of_order() {
        let config = sample_config();
        let best = config.find_best_match("testhost").unwrap();
        assert_eq!(best.patterns, vec!["testhost"]);

        let best = config.find_best_match("testbox").unwrap();
        assert_eq!(best.patterns, vec!["test*"]);

        let best = config.find_best_match("other").unwrap();
        assert!(best.is_global());
    }

    #[test]
    fn resolution_merges_global_defaults() {
        let config = sample_config();

        let resolved = config.resolve("testhost", 22, "alice");
        assert_eq!(resolved.hostname, "testhost.example.com");
        // The specific entry's port wins over both the original and the
        // global default.
        assert_eq!(resolved.port, 2022);
        // No User in the specific entry: the global default applies.
        assert_eq!(resolved.username, "fallback");
        assert_eq!(
            resolved.identity_files,
            vec!["/keys/fallback@testhost.example.com:2022".to_string()]
        );

        let resolved = config.resolve("testbox", 22, "alice");
        assert_eq!(resolved.username, "tester");
        assert_eq!(resolved.port, 2200);
    }

    #[test]
    fn port_and_user_preference() {
        assert_eq!(resolve_port(22, 0), 22);
        assert_eq!(resolve_port(22, 2222), 2222);
        assert_eq!(resolve_username("orig", None), "orig");
        assert_eq!(resolve_username("orig", Some("")), "orig");
        assert_eq!(resolve_username("orig", Some("cfg")), "cfg");
    }

    #[test]
    fn token_expansion() {
        assert_eq!(
            expand_tokens("/k/%u@%h:%p-%%", "example.com", 2222, "bob"),
            "/k/bob@example.com:2222-%"
        );
        let expanded = expand_tokens("~/.ssh/id", "h", 22, "u");
        assert!(expanded.ends_with("/.ssh/id"));
        assert!(!expanded.starts_with('~'));
        let expanded = expand_tokens("%d/.ssh/id", "h", 22, "u");
        assert!(expanded.ends_with("/.ssh/id"));
        assert!(!expanded.contains('%'));
    }

    #[test]
    fn parse_rejects_directives_outside_host_blocks() {
        assert!(HostConfig::parse("User nobody\n").is_err());
        assert!(HostConfig::parse("Host bad[pattern]\n").is_err());
    }
}
