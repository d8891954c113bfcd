//! JSON request and response helpers for the control API.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::http::creator::{ResponseCreator, ResponseCreatorFactory};
use crate::http::parser::ParseError;
use crate::http::request::{HttpVersion, Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Produces the response for a validated request and its decoded body.
pub type JsonHandler = Arc<dyn Fn(&Request, &Value) -> Response + Send + Sync>;

/// Accepts only `POST` requests carrying a JSON document.
pub fn check_json_post(request: &Request) -> Result<(), ParseError> {
    if request.method != Method::POST {
        return Err(ParseError::InvalidMethod);
    }

    match request.content_type() {
        Some(media) if media.eq_ignore_ascii_case(JSON_CONTENT_TYPE) => {}
        Some(other) => {
            return Err(ParseError::InvalidBody(format!(
                "unsupported content type {other}"
            )));
        }
        None => return Err(ParseError::InvalidBody("missing content type".into())),
    }

    parse_body(request).map(|_| ())
}

fn parse_body(request: &Request) -> Result<Value, ParseError> {
    serde_json::from_slice(&request.body).map_err(|e| ParseError::InvalidBody(e.to_string()))
}

/// Response with a JSON document as body.
pub fn json_response(version: HttpVersion, status: StatusCode, body: &Value) -> Response {
    ResponseBuilder::new(status)
        .version(version)
        .header("Content-Type", JSON_CONTENT_TYPE)
        .body(body.to_string())
        .build()
}

/// `{"result": <code>, "text": "<reason>"}` tagged with `version`.
pub fn stock_response(version: HttpVersion, status: StatusCode) -> Response {
    let body = json!({
        "result": status.as_u16(),
        "text": status.reason_phrase(),
    });
    json_response(version, status, &body)
}

/// Ready-made creator for JSON control endpoints.
///
/// Without a handler every valid request is answered with an empty 200.
#[derive(Clone, Default)]
pub struct JsonResponseCreator {
    handler: Option<JsonHandler>,
}

impl JsonResponseCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: JsonHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }
}

impl ResponseCreator for JsonResponseCreator {
    fn check_request(&self, request: &Request) -> Result<(), ParseError> {
        check_json_post(request)
    }

    fn create_stock_response(&self, version: HttpVersion, status: StatusCode) -> Response {
        stock_response(version, status)
    }

    fn create_dynamic_response(&mut self, request: &Request) -> Response {
        let Some(handler) = &self.handler else {
            return ResponseBuilder::new(StatusCode::Ok)
                .version(request.version)
                .header("Content-Type", JSON_CONTENT_TYPE)
                .build();
        };

        match parse_body(request) {
            Ok(body) => handler(request, &body),
            Err(_) => stock_response(request.version, StatusCode::BadRequest),
        }
    }
}

#[derive(Clone, Default)]
pub struct JsonResponseCreatorFactory {
    handler: Option<JsonHandler>,
}

impl JsonResponseCreatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Request, &Value) -> Response + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
        }
    }
}

impl ResponseCreatorFactory for JsonResponseCreatorFactory {
    fn create(&self) -> Box<dyn ResponseCreator> {
        match &self.handler {
            Some(handler) => Box::new(JsonResponseCreator::with_handler(handler.clone())),
            None => Box::new(JsonResponseCreator::new()),
        }
    }
}
