//! User-visible URL construction.
//!
//! Multiple consecutive slashes are significant in repository group paths,
//! so URLs are assembled by hand instead of through a path-join helper
//! that would collapse them.

/// Percent-encodes one path segment, keeping RFC 3986 unreserved bytes.
fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

/// Web URL of a repository: root + group segments + `/-/repos/` + name.
#[must_use]
pub fn repo_web_url(root: &str, group_path: &[String], repo_name: &str) -> String {
    let mut url = String::from(root.trim_end_matches('/'));
    for segment in group_path {
        url.push('/');
        url.push_str(&escape_segment(segment));
    }
    url.push_str("/-/repos/");
    url.push_str(&escape_segment(repo_name));
    url
}

/// Web URL of a merge request within a repository.
#[must_use]
pub fn merge_request_url(repo_url: &str, local_id: u64) -> String {
    format!("{repo_url}/contrib/{local_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_url_shape() {
        let url = repo_web_url(
            "https://forge.example.org",
            &["infra".to_owned(), "tools".to_owned()],
            "demo",
        );
        assert_eq!(url, "https://forge.example.org/infra/tools/-/repos/demo");
    }

    #[test]
    fn segments_are_escaped() {
        let url = repo_web_url(
            "https://forge.example.org",
            &["a b".to_owned()],
            "x/y",
        );
        assert_eq!(url, "https://forge.example.org/a%20b/-/repos/x%2Fy");
    }

    #[test]
    fn merge_request_url_shape() {
        assert_eq!(
            merge_request_url("https://forge.example.org/g/-/repos/demo", 4),
            "https://forge.example.org/g/-/repos/demo/contrib/4/"
        );
    }
}
