//! Small HTTP helpers shared between the WebSocket upgrade path and the
//! plain HTTP routes (NIP-11 document, metrics, static assets).
use http::HeaderMap;

#[must_use]
pub fn get_header_string(header: &str, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header)
        .and_then(|x| x.to_str().ok().map(std::string::ToString::to_string))
}

/// Join `requested` onto `root`, rejecting any path that would escape it
/// via `..`, an absolute path, or a Windows drive/prefix component.
/// Returns `None` for anything suspicious; the caller turns that into a
/// 400 (spec.md §4.7 "static assets endpoint").
#[must_use]
pub fn safe_static_path(root: &std::path::Path, requested: &str) -> Option<std::path::PathBuf> {
    use std::path::Component;

    let mut resolved = root.to_path_buf();
    for component in std::path::Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    resolved.strip_prefix(root).ok()?;
    Some(resolved)
}
