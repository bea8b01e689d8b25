// src/response.rs
//! Response formatting into the connection's write buffer.
//!
//! Every `add_*` helper either appends all of its bytes or fails with
//! [`EtudeError::WriteBufferFull`] leaving the buffer as it was.

use crate::buffer::WriteBuffer;
use crate::error::{EtudeError, EtudeResult};
use crate::fs::ServedFile;
use crate::http::{EMPTY_PAGE, Status};
use crate::parser::HttpCode;
use std::fmt::Display;

fn add_response(buf: &mut WriteBuffer, args: std::fmt::Arguments<'_>) -> EtudeResult<()> {
    buf.append_fmt(args).map_err(|_| EtudeError::WriteBufferFull)
}

pub fn add_status_line(buf: &mut WriteBuffer, status: Status) -> EtudeResult<()> {
    add_response(
        buf,
        format_args!("HTTP/1.1 {} {}\r\n", status.code(), status.title()),
    )
}

pub fn add_content_length(buf: &mut WriteBuffer, len: impl Display) -> EtudeResult<()> {
    add_response(buf, format_args!("Content-Length: {}\r\n", len))
}

pub fn add_linger(buf: &mut WriteBuffer, keep_alive: bool) -> EtudeResult<()> {
    let value = if keep_alive { "keep-alive" } else { "close" };
    add_response(buf, format_args!("Connection: {}\r\n", value))
}

pub fn add_blank_line(buf: &mut WriteBuffer) -> EtudeResult<()> {
    add_response(buf, format_args!("\r\n"))
}

pub fn add_headers(buf: &mut WriteBuffer, len: impl Display, keep_alive: bool) -> EtudeResult<()> {
    add_content_length(buf, len)?;
    add_linger(buf, keep_alive)?;
    add_blank_line(buf)
}

pub fn add_content(buf: &mut WriteBuffer, content: &str) -> EtudeResult<()> {
    add_response(buf, format_args!("{}", content))
}

/// Status line, headers and in-buffer body in one go.
fn add_page(
    buf: &mut WriteBuffer,
    status: Status,
    body: &str,
    keep_alive: bool,
) -> EtudeResult<()> {
    add_status_line(buf, status)?;
    add_headers(buf, body.len(), keep_alive)?;
    add_content(buf, body)
}

/// Layout of the scatter/gather list after the write buffer is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Everything, body included, sits in the write buffer.
    Buffered,
    /// Headers in the write buffer, then the mapped file.
    Mapped,
}

impl Layout {
    /// Number of scatter/gather entries.
    pub fn iov_count(self) -> usize {
        match self {
            Layout::Buffered => 1,
            Layout::Mapped => 2,
        }
    }
}

/// Fill `buf` with the response to `code`.
///
/// `file` must be present for [`HttpCode::FileRequest`]. Outcomes that are
/// not final (`NoRequest`, `GetRequest`) cannot be answered.
pub fn process_write(
    buf: &mut WriteBuffer,
    code: HttpCode,
    keep_alive: bool,
    file: Option<&ServedFile>,
) -> EtudeResult<Layout> {
    let status = match code {
        HttpCode::InternalError => Status::InternalError,
        HttpCode::BadRequest => Status::BadRequest,
        HttpCode::NoResource => Status::NotFound,
        HttpCode::ForbiddenRequest => Status::Forbidden,
        HttpCode::FileRequest => {
            let file = file.ok_or(EtudeError::Unrespondable(code))?;
            if file.size == 0 {
                add_page(buf, Status::Ok, EMPTY_PAGE, keep_alive)?;
                return Ok(Layout::Buffered);
            }
            add_status_line(buf, Status::Ok)?;
            add_headers(buf, file.size, keep_alive)?;
            return Ok(Layout::Mapped);
        }
        HttpCode::NoRequest | HttpCode::GetRequest => {
            return Err(EtudeError::Unrespondable(code));
        }
    };

    let form = status.form().ok_or(EtudeError::Unrespondable(code))?;
    add_page(buf, status, form, keep_alive)?;
    Ok(Layout::Buffered)
}
