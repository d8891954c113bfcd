//! Response generation seam.
//!
//! The embedding application decides what a response looks like. A
//! [`ResponseCreatorFactory`] is handed to the listener once; every accepted
//! connection asks it for its own [`ResponseCreator`].
//!
//! Creators are infallible: they must return a finished response for any
//! request that passed [`ResponseCreator::check_request`].

use crate::http::parser::ParseError;
use crate::http::request::{HttpVersion, Request};
use crate::http::response::{Response, StatusCode};

pub trait ResponseCreator: Send {
    /// Validates a framed request before it is answered.
    ///
    /// An error here is treated like a parse failure: the client gets a
    /// `400 Bad Request` and the connection is closed.
    fn check_request(&self, _request: &Request) -> Result<(), ParseError> {
        Ok(())
    }

    /// Builds a server-generated response for `status`.
    ///
    /// `version` is the request's version if the request line was parsed,
    /// HTTP/1.0 otherwise.
    fn create_stock_response(&self, version: HttpVersion, status: StatusCode) -> Response;

    /// Builds the application response for a valid request.
    fn create_dynamic_response(&mut self, request: &Request) -> Response;
}

pub trait ResponseCreatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn ResponseCreator>;
}
