//! Parsing of `authorized_keys` files: per-line options, key type,
//! base64 blob and comment, plus the strict permission policy servers
//! apply before trusting the file.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;

use crate::error::{Error, Result};

/// One `[options] keytype base64-blob [comment]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Leading options as `name` or `name=value` pairs; quoted values
    /// have their quotes stripped.
    pub options: Vec<(String, Option<String>)>,
    /// The key algorithm name (`ssh-ed25519`, ...).
    pub key_type: String,
    /// The decoded public-key blob.
    pub blob: Vec<u8>,
    /// Trailing free-form comment.
    pub comment: Option<String>,
}

impl AuthorizedKey {
    /// The value of option `name`, if the option is present.
    pub fn option(&self, name: &str) -> Option<Option<&str>> {
        self.options
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

/// Split off the first whitespace-delimited token, honoring double
/// quotes (an option value may contain spaces).
fn next_token(line: &str) -> (&str, &str) {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                return (&line[..i], line[i..].trim_start());
            }
            _ => {}
        }
    }
    (line, "")
}

fn parse_options(token: &str) -> Result<Vec<(String, Option<String>)>> {
    let mut options = Vec::new();
    let mut rest = token;
    while !rest.is_empty() {
        // Scan one comma-separated option, ignoring commas in quotes.
        let mut quoted = false;
        let mut end = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '"' => quoted = !quoted,
                ',' if !quoted => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let option = &rest[..end];
        rest = rest.get(end + 1..).unwrap_or("");

        match option.split_once('=') {
            Some((name, value)) => {
                let value = value.trim_matches('"').to_owned();
                options.push((name.to_owned(), Some(value)));
            }
            None if option.is_empty() => {
                return Err(Error::Config("empty authorized_keys option".into()))
            }
            None => options.push((option.to_owned(), None)),
        }
    }
    Ok(options)
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<AuthorizedKey>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (first, rest) = next_token(line);
    let (options, key_type, rest) = if is_key_type(first) {
        (Vec::new(), first.to_owned(), rest)
    } else {
        let (key_type, rest) = next_token(rest);
        if !is_key_type(key_type) {
            return Err(Error::Config(format!(
                "unrecognized key type {:?}",
                key_type
            )));
        }
        (parse_options(first)?, key_type.to_owned(), rest)
    };

    let (blob64, rest) = next_token(rest);
    if blob64.is_empty() {
        return Err(Error::Config("missing key data".into()));
    }
    let blob = BASE64
        .decode(blob64)
        .map_err(|e| Error::Config(format!("bad key data: {}", e)))?;

    Ok(Some(AuthorizedKey {
        options,
        key_type,
        blob,
        comment: (!rest.is_empty()).then(|| rest.to_owned()),
    }))
}

/// Parse a whole file's text.
pub fn parse(text: &str) -> Result<Vec<AuthorizedKey>> {
    let mut keys = Vec::new();
    for line in text.lines() {
        if let Some(key) = parse_line(line)? {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// In strict mode the file must be at most `0600` and its directory at
/// most `0700`; any group or other bit is a violation.
fn check_strict(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let check = |p: &Path| -> Result<()> {
        let mode = std::fs::metadata(p)?.permissions().mode() & 0o7777;
        if mode & 0o077 != 0 {
            return Err(Error::FileSystem {
                path: p.to_string_lossy().into_owned(),
                mode,
            });
        }
        Ok(())
    };
    check(path)?;
    if let Some(parent) = path.parent() {
        check(parent)?;
    }
    Ok(())
}

/// Load and parse an `authorized_keys` file. With `strict`, the
/// permission policy is enforced before the file is read.
pub async fn load(path: &Path, strict: bool) -> Result<Vec<AuthorizedKey>> {
    if strict {
        check_strict(path)?;
    }
    let text = tokio::fs::read_to_string(path).await?;
    let keys = parse(&text)?;
    debug!("loaded {} keys from {}", keys.len(), path.display());
    Ok(keys)
}
