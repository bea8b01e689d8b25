// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    /// Method names are matched ignoring ASCII case.
    pub fn from_bytes(b: &[u8]) -> Self {
        const TABLE: [(&[u8], Method); 9] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"PATCH", Method::Patch),
            (b"HEAD", Method::Head),
            (b"OPTIONS", Method::Options),
            (b"TRACE", Method::Trace),
            (b"CONNECT", Method::Connect),
        ];
        TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b))
            .map(|&(_, m)| m)
            .unwrap_or(Method::Unknown)
    }
}

/// The only protocol version served.
pub const HTTP_1_1: &[u8] = b"HTTP/1.1";

/// Body sent for a 200 on an empty file.
pub const EMPTY_PAGE: &str = "<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Canned body for error statuses.
    pub fn form(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => {
                Some("Your request has bad syntax or is inherently impossible to satisfy.\n")
            }
            Status::Forbidden => Some("You do not have permission to get file from this server.\n"),
            Status::NotFound => Some("The requested file was not found on this server.\n"),
            Status::InternalError => {
                Some("There was an unusual problem serving the requested file.\n")
            }
        }
    }
}
