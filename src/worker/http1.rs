//! Minimal HTTP/1.x codec.
//!
//! One request per connection, `Connection: close` on every response.
//! Bodies are delimited by `Content-Length`; chunked request bodies are
//! rejected.

use std::io::{self, Read, Write};

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Request, Response, StatusCode, Version};
use tracing::field;

use crate::worker::handler::{ensure_request_id, Handler, HandlerError, RequestContext};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 4096;

/// Read and parse one request.
pub fn read_request<R: Read>(stream: &mut R) -> Result<Request<Vec<u8>>, HandlerError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let (head_len, mut request) = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HandlerError::Io(io::ErrorKind::UnexpectedEof.into())
            } else {
                HandlerError::BadRequest("connection closed mid-request".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => break (len, build_request(&parsed)?),
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_BYTES => continue,
            Ok(httparse::Status::Partial) => {
                return Err(HandlerError::BadRequest("request head too large".into()))
            }
            Err(e) => return Err(HandlerError::BadRequest(e.to_string())),
        }
    };

    if request.headers().contains_key(TRANSFER_ENCODING) {
        return Err(HandlerError::BadRequest(
            "chunked request bodies are not supported".into(),
        ));
    }

    let length = match request.headers().get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| HandlerError::BadRequest("invalid content-length".into()))?,
        None => 0,
    };
    if length > MAX_BODY_BYTES {
        return Err(HandlerError::BadRequest("request body too large".into()));
    }

    let mut body = buf.split_off(head_len);
    body.truncate(length);
    if body.len() < length {
        let already = body.len();
        body.resize(length, 0);
        stream.read_exact(&mut body[already..])?;
    }
    *request.body_mut() = body;
    Ok(request)
}

fn build_request(parsed: &httparse::Request<'_, '_>) -> Result<Request<Vec<u8>>, HandlerError> {
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder
        .body(Vec::new())
        .map_err(|e| HandlerError::BadRequest(e.to_string()))
}

/// Serialize `response`, forcing `Content-Length` and `Connection: close`.
pub fn write_response<W: Write>(stream: &mut W, response: &Response<Vec<u8>>) -> io::Result<()> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        if name == CONTENT_LENGTH || name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str(&format!(
        "content-length: {}\r\nconnection: close\r\n\r\n",
        response.body().len()
    ));

    stream.write_all(head.as_bytes())?;
    stream.write_all(response.body())?;
    stream.flush()
}

fn status_response(status: StatusCode) -> Response<Vec<u8>> {
    let mut response = Response::new(status.canonical_reason().unwrap_or("").as_bytes().to_vec());
    *response.status_mut() = status;
    response
}

/// Read one request, dispatch it to `handler` and write the response.
///
/// Errors that leave the connection usable get a best-effort error response.
pub fn serve_connection<H, S>(
    handler: &mut H,
    stream: &mut S,
    mut context: RequestContext,
) -> Result<StatusCode, HandlerError>
where
    H: Handler,
    S: Read + Write,
{
    let mut request = match read_request(stream) {
        Ok(request) => request,
        Err(e @ HandlerError::BadRequest(_)) => {
            let _ = write_response(stream, &status_response(StatusCode::BAD_REQUEST));
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    context.request_id = ensure_request_id(&mut request, context.request_id);
    tracing::Span::current().record("request_id", field::display(context.request_id));
    tracing::debug!(method = %request.method(), path = %request.uri().path(), "Handling request");
    request.extensions_mut().insert(context);

    match handler.handle(request) {
        Ok(response) => {
            write_response(stream, &response)?;
            Ok(response.status())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            let _ = write_response(stream, &status_response(StatusCode::INTERNAL_SERVER_ERROR));
            Err(e)
        }
    }
}
