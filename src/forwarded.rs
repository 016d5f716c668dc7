use percent_encoding::percent_decode_str;
use std::{
    net::{IpAddr, SocketAddr},
    sync::LazyLock,
};
use url::Url;

use crate::error::{RequestError, TargetUrlFault};

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_CF_FORWARDED_URL: &str = "X-CF-Forwarded-Url";

/// Origin that relative forwarded URLs (`/admin/users`) are resolved against.
static PLACEHOLDER_ORIGIN: LazyLock<Url> = LazyLock::new(|| {
    Url::parse("http://route-guard.invalid/").expect("placeholder origin is a valid URL")
});

/// Flattens X-Forwarded-For values into one candidate list.
/// Format of each value: "client, proxy1, proxy2, ..." - order is kept, blanks are dropped.
#[must_use]
pub fn candidate_ips<S: AsRef<str>>(values: &[S]) -> Vec<&str> {
    values
        .iter()
        .flat_map(|value| value.as_ref().split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Parses one forwarded-for entry, tolerating a port and IPv6 brackets
/// (`1.2.3.4:80`, `[2001:db8::1]:443`). Tokens like `unknown` yield `None`.
#[must_use]
pub fn parse_candidate_ip(entry: &str) -> Option<IpAddr> {
    let entry = entry.trim().trim_matches('"');
    if let Some(bracketed) = entry.strip_prefix('[') {
        let (host, _port) = bracketed.split_once(']')?;
        return host.parse().ok();
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(ip);
    }
    entry.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}

/// Returns the first non-empty, percent-decoded path segment of the forwarded URL,
/// or an empty string for the root path.
///
/// The `url` parser repairs targets that RFC 3986 forbids (spaces, `<`, `|`,
/// stray `%`), so those are refused up front.
pub fn first_path_segment(forwarded_url: &str) -> Result<String, RequestError> {
    let trimmed = forwarded_url.trim();
    let malformed = |source: TargetUrlFault| RequestError::MalformedTargetUrl {
        url: forwarded_url.to_string(),
        source,
    };

    check_target_characters(trimmed).map_err(malformed)?;
    let url = Url::options()
        .base_url(Some(&*PLACEHOLDER_ORIGIN))
        .parse(trimmed)
        .map_err(|e| malformed(e.into()))?;

    Ok(url
        .path()
        .split('/')
        .find(|segment| !segment.is_empty())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .unwrap_or_default())
}

fn check_target_characters(target: &str) -> Result<(), TargetUrlFault> {
    let bytes = target.as_bytes();
    for (index, character) in target.char_indices() {
        match character {
            '%' => {
                let escape = bytes.get(index + 1..index + 3);
                if !escape.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                    return Err(TargetUrlFault::InvalidEscape { index });
                }
            }
            c if c.is_ascii_alphanumeric() || "-._~:/?#[]@!$&'()*+,;=".contains(c) => {}
            // Non-ASCII letters are tolerated and end up percent-encoded.
            c if !c.is_ascii() && !c.is_whitespace() && !c.is_control() => {}
            character => return Err(TargetUrlFault::IllegalCharacter { character, index }),
        }
    }
    Ok(())
}
