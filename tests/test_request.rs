use control_http::http::request::{HttpVersion, Method, Request, RequestBuilder};
use std::collections::HashMap;

fn request(version: HttpVersion, headers: &[(&str, &str)]) -> Request {
    let mut builder = RequestBuilder::new()
        .method(Method::POST)
        .path("/foo/bar")
        .version(version);
    for (key, value) in headers {
        builder = builder.header(*key, *value);
    }
    builder.build().unwrap()
}

#[test]
fn test_request_header_retrieval() {
    let mut headers = HashMap::new();
    headers.insert("Host".to_string(), "example.com".to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());

    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: HttpVersion::HTTP_11,
        headers,
        body: vec![],
    };

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_type_strips_parameters() {
    let req = request(
        HttpVersion::HTTP_11,
        &[("Content-Type", "application/json; charset=utf-8")],
    );

    assert_eq!(req.content_type(), Some("application/json"));
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to persistent
    let req = request(HttpVersion::HTTP_11, &[]);
    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_http11_close() {
    let req = request(HttpVersion::HTTP_11, &[("Connection", "close")]);
    assert!(!req.keep_alive());

    let req = request(HttpVersion::HTTP_11, &[("connection", "Upgrade, Close")]);
    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_http10_default() {
    let req = request(HttpVersion::HTTP_10, &[]);
    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_http10_explicit() {
    let req = request(HttpVersion::HTTP_10, &[("Connection", "Keep-Alive")]);
    assert!(req.keep_alive());

    // Unrelated tokens do not make HTTP/1.0 persistent
    let req = request(HttpVersion::HTTP_10, &[("Connection", "TE")]);
    assert!(!req.keep_alive());
}

#[test]
fn test_request_builder_defaults() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/status")
        .build()
        .unwrap();

    assert_eq!(req.version, HttpVersion::HTTP_11);
    assert!(req.body.is_empty());

    assert!(RequestBuilder::new().path("/").build().is_err());
}

#[test]
fn test_http_version_display_and_default() {
    assert_eq!(HttpVersion::HTTP_10.to_string(), "HTTP/1.0");
    assert_eq!(HttpVersion::HTTP_11.to_string(), "HTTP/1.1");
    assert_eq!(HttpVersion::default(), HttpVersion::HTTP_10);
    assert!(HttpVersion::HTTP_10 < HttpVersion::HTTP_11);
}
