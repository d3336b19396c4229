//! Parsed request heads and the view handlers read them through.
//!
//! [`RequestHeader`] wraps an `http::Request<()>` and additionally keeps the
//! headers in wire order together with the method token exactly as the client
//! sent it. [`HttpRequest`] borrows a header for the duration of one handler
//! call, so a handler can't keep it around after it returned.

use std::cell::OnceCell;
use std::ops::Range;
use std::rc::Rc;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use serde::de::DeserializeOwned;

#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
    raw_method: Box<str>,
    ordered: Vec<(HeaderName, HeaderValue)>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    pub(crate) fn new(inner: Request<()>, raw_method: Box<str>, ordered: Vec<(HeaderName, HeaderValue)>) -> Self {
        Self { inner, raw_method, ordered }
    }

    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// the method token as received, e.g. `get` stays `get`
    pub fn raw_method(&self) -> &str {
        &self.raw_method
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn ordered_headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.ordered
    }

    pub fn need_body(&self) -> bool {
        !matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT)
    }

    /// whether the client expects the connection to stay open after this request
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers().get(http::header::CONNECTION).map(HeaderValue::as_bytes);
        let has_token = |token: &[u8]| {
            connection.is_some_and(|value| value.split(|b| *b == b',').any(|item| item.trim_ascii().eq_ignore_ascii_case(token)))
        };

        match self.version() {
            Version::HTTP_10 => has_token(b"keep-alive"),
            _ => !has_token(b"close"),
        }
    }
}

/// Route parameters captured by a pattern match, as ranges into the request path.
#[derive(Debug, Default, Clone)]
pub struct RouteParams {
    entries: Vec<(Rc<str>, Range<usize>)>,
}

impl RouteParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: Rc<str>, range: Range<usize>) {
        self.entries.push((name, range));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Read-only view over one request, valid only while its handler runs.
///
/// Header names are matched case-insensitively and returned lower-cased, the
/// way they were normalized by the decoder. Besides reading, a handler can set
/// the yield flag to decline the request so the router tries the next route.
#[derive(Debug)]
pub struct HttpRequest<'a> {
    header: &'a RequestHeader,
    params: RouteParams,
    yield_flag: bool,
    query_pairs: OnceCell<Vec<(String, String)>>,
}

impl<'a> HttpRequest<'a> {
    pub fn new(header: &'a RequestHeader) -> Self {
        Self { header, params: RouteParams::new(), yield_flag: false, query_pairs: OnceCell::new() }
    }

    pub fn request_header(&self) -> &'a RequestHeader {
        self.header
    }

    /// `true` for HTTP/1.0 requests
    pub fn is_ancient(&self) -> bool {
        self.header.version() < Version::HTTP_11
    }

    pub fn get_yield(&self) -> bool {
        self.yield_flag
    }

    pub fn set_yield(&mut self, yield_flag: bool) {
        self.yield_flag = yield_flag;
    }

    pub fn method(&self) -> &'a Method {
        self.header.method()
    }

    /// lower-cased method name, `"get"`, `"post"` ...
    pub fn method_lowercase(&self) -> String {
        self.header.method().as_str().to_ascii_lowercase()
    }

    pub fn case_sensitive_method(&self) -> &'a str {
        self.header.raw_method()
    }

    /// the request path, without the query string
    pub fn url(&self) -> &'a str {
        self.header.uri().path()
    }

    /// the request path including the query string
    pub fn full_url(&self) -> &'a str {
        self.header.uri().path_and_query().map_or_else(|| self.url(), |pq| pq.as_str())
    }

    /// the raw query string, without the leading `?`
    pub fn query(&self) -> Option<&'a str> {
        self.header.uri().query()
    }

    /// Looks up a decoded query value by key, the first one wins.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        let pairs = self.query_pairs.get_or_init(|| match self.query() {
            Some(query) => serde_urlencoded::from_str::<Vec<(String, String)>>(query).unwrap_or_default(),
            None => Vec::new(),
        });
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Deserializes the whole query string, a missing query reads as empty.
    pub fn query_as<T: DeserializeOwned>(&self) -> Result<T, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(self.query().unwrap_or_default())
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.header_bytes(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn header_bytes(&self, name: &str) -> Option<&'a [u8]> {
        self.header
            .ordered_headers()
            .iter()
            .find(|(header_name, _)| header_name.as_str().eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_bytes())
    }

    /// All headers in the order they were received.
    pub fn headers(&self) -> impl Iterator<Item = (&'a str, &'a [u8])> + use<'a> {
        self.header.ordered_headers().iter().map(|(name, value)| (name.as_str(), value.as_bytes()))
    }

    pub fn for_each_header<F: FnMut(&str, &[u8])>(&self, mut f: F) {
        for (name, value) in self.headers() {
            f(name, value);
        }
    }

    pub fn set_parameters(&mut self, params: RouteParams) {
        self.params = params;
    }

    /// Positional route parameter, in pattern order.
    pub fn parameter(&self, index: usize) -> Option<&'a str> {
        let url = self.url();
        self.params.entries.get(index).and_then(|(_, range)| url.get(range.clone()))
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<&'a str> {
        let url = self.url();
        self.params.entries.iter().find(|(param, _)| &**param == name).and_then(|(_, range)| url.get(range.clone()))
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeaderDecoder;
    use bytes::BytesMut;
    use indoc::indoc;
    use tokio_util::codec::Decoder;

    fn decode(str: &str) -> RequestHeader {
        let mut buf = BytesMut::from(str);
        let (header, _) = HeaderDecoder::default().decode(&mut buf).unwrap().unwrap();
        header
    }

    #[test]
    fn view_reads_url_query_and_headers() {
        let header = decode(indoc! {r##"
        get /users/42/posts?page=2&tag=a%20b HTTP/1.1
        Host: 127.0.0.1:8080
        X-Custom: one
        x-custom: two
        Accept: */*

        "##});

        let request = HttpRequest::new(&header);
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.method_lowercase(), "get");
        assert_eq!(request.case_sensitive_method(), "get");
        assert_eq!(request.url(), "/users/42/posts");
        assert_eq!(request.full_url(), "/users/42/posts?page=2&tag=a%20b");
        assert_eq!(request.query(), Some("page=2&tag=a%20b"));
        assert_eq!(request.query_value("page"), Some("2"));
        assert_eq!(request.query_value("tag"), Some("a b"));
        assert_eq!(request.query_value("missing"), None);

        assert_eq!(request.header("x-custom"), Some("one"));
        assert_eq!(request.header("X-CUSTOM"), Some("one"));
        assert_eq!(request.header("none"), None);

        let names: Vec<&str> = request.headers().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["host", "x-custom", "x-custom", "accept"]);
        assert!(!request.is_ancient());
    }

    #[test]
    fn route_parameters_by_index_and_name() {
        let header = decode(indoc! {r##"
        GET /users/42/posts/7 HTTP/1.1
        Host: localhost

        "##});

        let mut request = HttpRequest::new(&header);
        let mut params = RouteParams::new();
        params.push(Rc::from("user"), 7..9);
        params.push(Rc::from("post"), 16..17);
        request.set_parameters(params);

        assert_eq!(request.parameter(0), Some("42"));
        assert_eq!(request.parameter(1), Some("7"));
        assert_eq!(request.parameter(2), None);
        assert_eq!(request.parameter_by_name("post"), Some("7"));
        assert_eq!(request.parameter_by_name("nope"), None);
    }

    #[test]
    fn ancient_and_keep_alive() {
        let header = decode("GET / HTTP/1.0\r\nHost: a\r\n\r\n");
        assert!(HttpRequest::new(&header).is_ancient());
        assert!(!header.keep_alive());

        let header = decode("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(header.keep_alive());

        let header = decode("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!header.keep_alive());

        let header = decode("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(header.keep_alive());
    }

    #[test]
    fn typed_query() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Page {
            page: u32,
            tag: Option<String>,
        }

        let header = decode("GET /list?page=3 HTTP/1.1\r\nHost: a\r\n\r\n");
        let request = HttpRequest::new(&header);
        assert_eq!(request.query_as::<Page>().unwrap(), Page { page: 3, tag: None });

        let header = decode("GET /list HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(HttpRequest::new(&header).query_as::<Page>().is_err());
    }

    #[test]
    fn yield_flag() {
        let header = decode("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut request = HttpRequest::new(&header);
        assert!(!request.get_yield());
        request.set_yield(true);
        assert!(request.get_yield());
    }
}
