//! Transfer URL helpers

/// Join URL segments with exactly one `/` between them
pub fn join_url(parts: &[&str]) -> String {
    let mut url = String::new();
    for part in parts.iter().filter(|p| !p.is_empty()) {
        if url.is_empty() {
            url.push_str(part.trim_end_matches('/'));
            continue;
        }
        url.push('/');
        url.push_str(part.trim_matches('/'));
    }
    url
}
