use std::fmt;

use http::{HeaderMap, Method, Request, Uri, header::HOST};

/// Stable identity of a cacheable exchange: method plus normalized URL.
#[derive(Hash, Eq, PartialEq, Debug, Clone)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
        }
    }

    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::from_parts(req.method(), req.uri(), req.headers())
    }

    /// Derive a key from the pieces of a request. Origin-form URIs
    /// (`/path?q`) borrow their authority from the `Host` header.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: normalized_url(uri, headers),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

fn normalized_url(uri: &Uri, headers: &HeaderMap) -> String {
    let mut out = String::new();

    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| h.trim().to_string())
        })
        .filter(|a| !a.is_empty());

    if let Some(authority) = authority {
        out.push_str(&scheme);
        out.push_str("://");
        out.push_str(&strip_default_port(&authority.to_ascii_lowercase(), &scheme));
    }

    let path = uri.path();
    out.push_str(if path.is_empty() { "/" } else { path });

    if let Some(query) = uri.query() {
        out.push('?');
        out.push_str(query);
    }

    out
}

fn strip_default_port(authority: &str, scheme: &str) -> String {
    let default_port = match scheme {
        "http" => ":80",
        "https" => ":443",
        _ => return authority.to_string(),
    };
    authority
        .strip_suffix(default_port)
        .unwrap_or(authority)
        .to_string()
}

#[cfg(test)]
mod tests {
    use http::{Method, Request};

    use super::CacheKey;

    fn get(uri: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(())
            .expect("request")
    }

    #[test]
    fn equal_requests_produce_equal_keys() {
        let a = CacheKey::from_request(&get("http://somehost.com/assets/1"));
        let b = CacheKey::from_request(&get("http://somehost.com/assets/1"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET http://somehost.com/assets/1");
    }

    #[test]
    fn method_is_part_of_the_key() {
        let get_key = CacheKey::from_request(&get("http://h/assets/1"));
        let head = Request::builder()
            .method(Method::HEAD)
            .uri("http://h/assets/1")
            .body(())
            .expect("request");
        assert_ne!(get_key, CacheKey::from_request(&head));
    }

    #[test]
    fn query_distinguishes_keys() {
        let a = CacheKey::from_request(&get("http://h/assets/1?v=1"));
        let b = CacheKey::from_request(&get("http://h/assets/1?v=2"));
        assert_ne!(a, b);
        assert_eq!(a.url(), "http://h/assets/1?v=1");
    }

    #[test]
    fn host_and_default_port_are_normalized() {
        let a = CacheKey::from_request(&get("http://SomeHost.com:80/assets/1"));
        let b = CacheKey::from_request(&get("http://somehost.com/assets/1"));
        assert_eq!(a, b);

        let https = CacheKey::from_request(&get("https://h:443/x"));
        assert_eq!(https.url(), "https://h/x");
    }

    #[test]
    fn origin_form_uses_host_header() {
        let req = Request::builder()
            .uri("/assets/1")
            .header("host", "Example.org")
            .body(())
            .expect("request");
        assert_eq!(
            CacheKey::from_request(&req).url(),
            "http://example.org/assets/1"
        );

        let bare = Request::builder().uri("/assets/1").body(()).expect("request");
        assert_eq!(CacheKey::from_request(&bare).url(), "/assets/1");
    }
}
