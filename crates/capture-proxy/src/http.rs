//! HTTP/1.x message reader used on both sides of the proxy.
//!
//! Parses message heads with `httparse` and reads bodies per framing:
//! `Content-Length`, `Transfer-Encoding: chunked` (decoded, with the headers
//! re-framed to the decoded length), or EOF-delimited. Header order and
//! casing are preserved so messages re-serialize as received.

use scan_types::{HttpRequest, HttpResponse};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ProxyError;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Buffered reader for a stream carrying HTTP/1.x messages. The internal
/// buffer persists across messages so pipelined bytes are not lost.
pub struct MessageReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> MessageReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Access the underlying stream, e.g. to write a response back.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Give the stream back along with any bytes read past the last message.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    /// Read one request. `Ok(None)` on clean EOF before any bytes arrive
    /// (the client ended a keep-alive connection).
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>, ProxyError> {
        let head_len = match self.read_head().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        let head = self.buf[..head_len].to_vec();
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed
            .parse(&head)
            .map_err(|err| ProxyError::Parse(format!("request head: {err:?}")))?
        {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => {
                return Err(ProxyError::Parse("incomplete request head".to_string()))
            }
        }

        let method = parsed
            .method
            .ok_or_else(|| ProxyError::Parse("request without method".to_string()))?
            .to_string();
        let target = parsed
            .path
            .ok_or_else(|| ProxyError::Parse("request without target".to_string()))?
            .to_string();
        let version = parsed.version.unwrap_or(1);
        let header_list = collect_headers(parsed.headers);

        self.consume(head_len);

        let body_len = content_length(&header_list)?;
        let body = match body_len {
            Some(len) => self.read_exact_body(len).await?,
            None => Vec::new(),
        };

        Ok(Some(HttpRequest {
            method,
            target,
            version,
            headers: header_list,
            body,
        }))
    }

    /// Read one response. `head_only` suppresses body reading for replies to
    /// HEAD requests and other bodiless statuses.
    pub async fn read_response(&mut self, head_only: bool) -> Result<HttpResponse, ProxyError> {
        let head_len = self
            .read_head()
            .await?
            .ok_or_else(|| ProxyError::Parse("connection closed before response".to_string()))?;

        let head = self.buf[..head_len].to_vec();
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed
            .parse(&head)
            .map_err(|err| ProxyError::Parse(format!("response head: {err:?}")))?
        {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => {
                return Err(ProxyError::Parse("incomplete response head".to_string()))
            }
        }

        let version = parsed.version.unwrap_or(1);
        let status = parsed
            .code
            .ok_or_else(|| ProxyError::Parse("response without status".to_string()))?;
        let reason = parsed.reason.unwrap_or("").to_string();
        let mut header_list = collect_headers(parsed.headers);

        self.consume(head_len);

        let bodiless = head_only || status == 204 || status == 304 || (100..200).contains(&status);
        let body = if bodiless {
            Vec::new()
        } else if is_chunked(&header_list) {
            let body = self.read_chunked_body().await?;
            reframe_chunked(&mut header_list, body.len());
            body
        } else if let Some(len) = content_length(&header_list)? {
            self.read_exact_body(len).await?
        } else {
            self.read_to_eof().await?
        };

        Ok(HttpResponse {
            version,
            status,
            reason,
            headers: header_list,
            body,
        })
    }

    /// Fill the buffer until a complete head (terminated by a blank line) is
    /// available. `Ok(None)` on EOF with an empty buffer.
    async fn read_head(&mut self) -> Result<Option<usize>, ProxyError> {
        loop {
            if let Some(pos) = find_blank_line(&self.buf) {
                return Ok(Some(pos));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Parse("message head too large".to_string()));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Parse(
                    "connection closed mid message head".to_string(),
                ));
            }
        }
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>, ProxyError> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(ProxyError::Parse(
                    "connection closed mid message body".to_string(),
                ));
            }
        }
        Ok(self.take(len))
    }

    async fn read_to_eof(&mut self) -> Result<Vec<u8>, ProxyError> {
        while self.fill().await? > 0 {}
        Ok(std::mem::take(&mut self.buf))
    }

    async fn read_chunked_body(&mut self) -> Result<Vec<u8>, ProxyError> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| ProxyError::Parse(format!("bad chunk size {size_str:?}")))?;

            if size == 0 {
                // Consume optional trailers up to the final blank line.
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        break;
                    }
                }
                return Ok(body);
            }

            while self.buf.len() < size + 2 {
                if self.fill().await? == 0 {
                    return Err(ProxyError::Parse(
                        "connection closed mid chunk".to_string(),
                    ));
                }
            }
            let mut chunk = self.take(size + 2);
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    }

    async fn read_line(&mut self) -> Result<String, ProxyError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.take(pos + 2);
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            if self.fill().await? == 0 {
                return Err(ProxyError::Parse(
                    "connection closed mid chunk framing".to_string(),
                ));
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.buf.drain(..n).collect()
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|header| {
            (
                header.name.to_string(),
                String::from_utf8_lossy(header.value).into_owned(),
            )
        })
        .collect()
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, ProxyError> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ProxyError::Parse(format!("bad content-length {value:?}")))?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
    })
}

/// After decoding a chunked body, replace the transfer framing headers with
/// the decoded length so the message re-serializes consistently.
fn reframe_chunked(headers: &mut Vec<(String, String)>, body_len: usize) {
    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"));
    headers.push(("Content-Length".to_string(), body_len.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_request_with_body() {
        let wire = b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\ndata";
        let mut reader = MessageReader::new(&wire[..]);

        let request = reader
            .read_request()
            .await
            .expect("parse request")
            .expect("one request");

        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/submit");
        assert_eq!(request.version, 1);
        assert_eq!(request.header("host"), Some("example.com"));
        assert_eq!(request.body, b"data");
    }

    #[tokio::test]
    async fn empty_stream_yields_no_request() {
        let mut reader = MessageReader::new(&b""[..]);
        let request = reader.read_request().await.expect("clean eof");
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn reads_sequential_keepalive_requests() {
        let wire = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);

        let first = reader.read_request().await.expect("first").expect("some");
        let second = reader.read_request().await.expect("second").expect("some");
        assert_eq!(first.target, "/a");
        assert_eq!(second.target, "/b");
        assert!(reader.read_request().await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn reads_content_length_response() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = MessageReader::new(&wire[..]);

        let response = reader.read_response(false).await.expect("parse response");
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.body, b"hello");
        // Header order preserved for byte-faithful re-serialization.
        assert_eq!(response.headers[0].0, "Content-Type");
    }

    #[tokio::test]
    async fn decodes_chunked_response_and_reframes() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);

        let response = reader.read_response(false).await.expect("parse response");
        assert_eq!(response.body, b"hello world");
        assert_eq!(response.header("content-length"), Some("11"));
        assert_eq!(response.header("transfer-encoding"), None);
    }

    #[tokio::test]
    async fn reads_eof_delimited_response() {
        let wire = b"HTTP/1.0 200 OK\r\n\r\nuntil the end";
        let mut reader = MessageReader::new(&wire[..]);

        let response = reader.read_response(false).await.expect("parse response");
        assert_eq!(response.version, 0);
        assert_eq!(response.body, b"until the end");
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);

        let response = reader.read_response(true).await.expect("parse response");
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let mut reader = MessageReader::new(&wire[..]);

        let result = reader.read_response(false).await;
        assert!(matches!(result, Err(ProxyError::Parse(_))));
    }
}
