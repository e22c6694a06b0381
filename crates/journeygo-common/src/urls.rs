//! URL normalization helpers.

use url::Url;

/// Drop the fragment. Cache keys never include one.
pub fn strip_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

/// Drop both query string and fragment.
pub fn strip_search(url: &Url) -> Url {
    let mut url = strip_fragment(url);
    url.set_query(None);
    url
}

/// Scheme, host and port all equal.
pub fn is_same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}
