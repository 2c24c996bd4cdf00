use serde_json::Value;
use uuid::Uuid;

/// HTTP/1.1 request methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Options,
    Trace,
    Post,
    Put,
    Patch,
    Delete,
    Connect,
}

impl Method {
    /// Idempotent retrieval methods skip the changeset path entirely; there
    /// is no point opening a write transaction just to SELECT some records.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options | Method::Trace)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
        }
    }
}

/// The narrow request shape the interceptor needs: method, path, the
/// authenticated user if the front end resolved one, and the free-text
/// change-comment header value. The `id` is a correlation id for logs.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub user: Option<String>,
    pub comment: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            method,
            path: path.into(),
            user: None,
            comment: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// The response a handler produced. Handler failures are not encoded here;
/// they travel as the `Err` arm of the handler result so the interceptor can
/// roll back and re-raise without inspecting response internals.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, detail: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "detail": detail }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}
