//! Request authorization: static bearer token and origin patterns.

/// Check a request against the configured static token. An empty configured
/// token disables auth entirely. The token may arrive as
/// `Authorization: Bearer <token>` or as a `?token=` query parameter.
pub fn is_authorized(
    expected_token: &str,
    authorization: Option<&str>,
    query_token: Option<&str>,
) -> bool {
    let expected = expected_token.trim();
    if expected.is_empty() {
        return true;
    }

    if let Some(header) = authorization {
        if let Some(bearer) = header.trim().strip_prefix("Bearer ") {
            if tokens_equal(expected, bearer.trim()) {
                return true;
            }
        }
    }

    query_token
        .map(str::trim)
        .is_some_and(|token| tokens_equal(expected, token))
}

/// Constant-time comparison; only the length is observable.
fn tokens_equal(expected: &str, actual: &str) -> bool {
    if expected.is_empty() || actual.is_empty() || expected.len() != actual.len() {
        return false;
    }
    expected
        .bytes()
        .zip(actual.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Check an Origin header against the allowed glob patterns. Patterns match
/// the origin's host[:port] (scheme stripped) or the full origin string.
/// Requests without an Origin header are admitted: only browsers send one,
/// and the token check still applies.
pub fn origin_allowed(patterns: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let host = origin_host(origin);
    patterns
        .iter()
        .any(|p| glob_match(p, host) || glob_match(p, origin))
}

fn origin_host(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or(rest)
}

/// `*` matches any run of characters, including the empty one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
