//! Job link canonicalization used as the store-wide deduplication key.

use url::Url;

/// Query keys dropped outright. Prefix families (`utm_*`, `mc_*`) are handled in
/// [`is_tracking_key`].
const TRACKING_KEYS: &[&str] = &["ref", "source", "fbclid", "gclid", "_ga"];
const TRACKING_PREFIXES: &[&str] = &["utm_", "mc_"];

fn is_tracking_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_KEYS.contains(&key.as_str())
        || TRACKING_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Normalize a raw job link into a stable dedup key.
///
/// Lower-cases the host, drops the fragment, collapses trailing slashes on the path
/// (an empty path becomes `/`) and removes tracking query parameters while keeping the
/// remaining ones in their original order. Input that does not parse as an absolute URL
/// with a host comes back trimmed and otherwise untouched.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(url) if url.has_host() && !url.cannot_be_a_base() => url,
        _ => return trimmed.to_string(),
    };

    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        if lower != host && url.set_host(Some(&lower)).is_err() {
            return trimmed.to_string();
        }
    }

    url.set_fragment(None);

    let path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&path);
    }

    let kept = url
        .query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .filter(|pair| {
                    let key = pair.split('=').next().unwrap_or_default();
                    !is_tracking_key(key)
                })
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&kept.join("&")));
    }

    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_parameters_are_stripped() {
        assert_eq!(
            canonicalize("https://x.com/job?id=1&utm_source=a"),
            canonicalize("https://x.com/job?id=1")
        );
        assert_eq!(canonicalize("https://x.com/job?id=1"), "https://x.com/job?id=1");
    }

    #[test]
    fn all_tracking_families_are_removed_and_order_is_kept() {
        let raw = "https://Jobs.Example.com/view/?b=2&UTM_campaign=x&ref=li&source=feed&fbclid=1&gclid=2&mc_eid=3&_ga=4&a=1#apply";
        assert_eq!(canonicalize(raw), "https://jobs.example.com/view?b=2&a=1");
    }

    #[test]
    fn root_path_and_trailing_slashes_collapse() {
        assert_eq!(canonicalize("https://example.com"), "https://example.com/");
        assert_eq!(canonicalize("https://example.com///"), "https://example.com/");
        assert_eq!(canonicalize("https://example.com/a/b/"), "https://example.com/a/b");
    }

    #[test]
    fn malformed_input_is_returned_trimmed() {
        assert_eq!(canonicalize("  not a url  "), "not a url");
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("www.example.com/jobs/1"), "www.example.com/jobs/1");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "https://x.com/job?id=1&utm_source=a",
            "HTTPS://WWW.Example.COM/Jobs/42/?ref=abc&q=rust%20dev#frag",
            "https://example.com/?&&a=1&&",
            "http://example.com:8080/a//",
            "garbage",
            "  https://example.com/path  ",
        ];
        for input in inputs {
            let once = canonicalize(input);
            assert_eq!(canonicalize(&once), once, "not idempotent for {input}");
        }
    }
}
