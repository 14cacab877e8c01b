// src/response.rs
use thiserror::Error;

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

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body sent with error statuses. Empty for `Ok`, whose body is the file.
    pub fn body(self) -> &'static [u8] {
        match self {
            Status::Ok => b"",
            Status::BadRequest => {
                b"Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => b"You do not have permission to get file from this server.\n",
            Status::NotFound => b"The requested file was not found on this server.\n",
            Status::InternalError => {
                b"There was an unusual problem serving the requested file.\n"
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("response does not fit in the {capacity}-byte write buffer")]
pub struct Overflow {
    pub capacity: usize,
}

/// Appends a response to a fixed-capacity buffer, failing instead of
/// truncating when the buffer runs out.
pub struct ResponseBuilder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn status_line(&mut self, status: Status) -> Result<&mut Self, Overflow> {
        let mut code = itoa::Buffer::new();
        self.put(b"HTTP/1.1 ")?;
        self.put(code.format(status.code()).as_bytes())?;
        self.put(b" ")?;
        self.put(status.reason().as_bytes())?;
        self.put(b"\r\n")?;
        Ok(self)
    }

    pub fn header(&mut self, name: &str, value: &[u8]) -> Result<&mut Self, Overflow> {
        self.put(name.as_bytes())?;
        self.put(b": ")?;
        self.put(value)?;
        self.put(b"\r\n")?;
        Ok(self)
    }

    pub fn end_headers(&mut self) -> Result<&mut Self, Overflow> {
        self.put(b"\r\n")?;
        Ok(self)
    }

    pub fn body(&mut self, bytes: &[u8]) -> Result<&mut Self, Overflow> {
        self.put(bytes)?;
        Ok(self)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(Overflow {
                capacity: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

/// Write status line, the three fixed headers, the blank line and `body`.
/// `content_length` is announced as-is so a file body can follow separately.
/// Returns the number of bytes written.
pub fn compose(
    buf: &mut [u8],
    status: Status,
    content_length: usize,
    keep_alive: bool,
    body: &[u8],
) -> Result<usize, Overflow> {
    let mut length = itoa::Buffer::new();
    let connection: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
    let headers: [(&str, &[u8]); 3] = [
        ("Content-Length", length.format(content_length).as_bytes()),
        ("Content-Type", b"text/html"),
        ("Connection", connection),
    ];

    let mut builder = ResponseBuilder::new(buf);
    builder.status_line(status)?;
    for (name, value) in headers {
        builder.header(name, value)?;
    }
    builder.end_headers()?.body(body)?;
    Ok(builder.len())
}

/// An error status with its fixed body.
pub fn compose_error(buf: &mut [u8], status: Status, keep_alive: bool) -> Result<usize, Overflow> {
    let body = status.body();
    compose(buf, status, body.len(), keep_alive, body)
}
