// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{self, BufRead, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use hyper::body::{Bytes, HttpBody};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, error, info, trace};
use tokio::sync::mpsc;

use crate::config::{LogMask, TransportConfig};
use crate::error::Error;
use crate::error::Result;
use crate::io_adapters::{ChunkedWriter, DrainReader};
use crate::transport::{UsbConn, UsbTransport};

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

// Copy buffer for streaming bodies over USB.  The loop does not depend on
// the size for correctness; this is a middle ground between memory use and
// iterations, and a multiple of the USB read alignment.
const COPY_BUFFER_SIZE: usize = 16384;

static SESSION_ID: AtomicUsize = AtomicUsize::new(0);

/// Session number for correlating one transaction's log lines.
pub(crate) fn next_session_id() -> usize {
    SESSION_ID.fetch_add(1, Ordering::Relaxed) % 1000
}

/// How the body of a message is framed on the wire.
#[derive(Copy, Clone, Debug, PartialEq)]
enum BodyLength {
    Chunked,
    Exactly(u64),
}

fn is_end_to_end(header: &HeaderName) -> bool {
    let keep_alive = HeaderName::from_bytes(b"Keep-Alive").unwrap();
    !matches!(
        header,
        &header::CONNECTION
            | &header::EXPECT
            | &header::PROXY_AUTHENTICATE
            | &header::PROXY_AUTHORIZATION
            | &header::TE
            | &header::TRAILER
            | &header::TRANSFER_ENCODING
            | &header::UPGRADE
    ) && header != keep_alive
}

fn declared_body_length(headers: &HeaderMap) -> Option<u64> {
    let header = headers.get(header::CONTENT_LENGTH)?;
    let str_length = header.to_str().ok()?;
    str_length.trim().parse().ok()
}

// Convert a HeaderName to a title-case String.
// hyper always converts header names to lowercase for performance.  Even though HTTP headers are
// supposed to be case-insensitive, some printers only handle title-case headers.  For improved
// compatibility, this allows sending the more common title-case versions.  This assumes that
// header names are ASCII, as required by the HTTP RFC.
fn title_case_header(field: &HeaderName) -> String {
    let name = field.as_str();
    let mut result = Vec::with_capacity(name.len());
    let mut upper = true;

    for c in name.chars() {
        if upper {
            upper = false;
            result.push(c.to_ascii_uppercase());
        } else {
            result.push(c);
        }
        if c == '-' {
            upper = true;
        }
    }

    result.into_iter().collect()
}

/// The forwarded form of one client request.
struct OutboundRequest {
    method: String,
    uri: String,
    headers: HeaderMap,
    body: BodyLength,
}

// Build the request that goes to the printer: hop-by-hop headers filtered
// out, keep-alive disabled, and the body framing chosen from the declared
// content length.
//
// Some printer firmware (the HP OfficeJet Pro 8730, for one) wedges while
// generating a response if the transaction leaves the pipe open, so every
// forwarded request carries "Connection: close".
fn rewrite_request(request: &Request<Body>, config: &TransportConfig) -> OutboundRequest {
    let mut headers = HeaderMap::with_capacity(request.headers().len());
    // If the incoming request specifies a Transfer-Encoding, it must be chunked.
    let request_is_chunked = request.headers().contains_key(header::TRANSFER_ENCODING);

    for (header, val) in request.headers().iter().filter(|(h, _)| is_end_to_end(h)) {
        headers.append(header, val.clone());
    }

    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

    if !headers.contains_key(header::USER_AGENT) {
        let user_agent = format!("ippusb_relay/{}", VERSION.unwrap_or("unknown"));
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&user_agent).unwrap(),
        );
    }

    let body = if request_is_chunked {
        BodyLength::Chunked
    } else {
        match declared_body_length(request.headers()) {
            // An absent or zero length needs no shaping.
            None | Some(0) => BodyLength::Exactly(0),
            // A small body is prefetched and forwarded with its literal
            // Content-Length, shielding the device from slow clients.
            Some(length) if length < config.small_body_prefetch_threshold => {
                BodyLength::Exactly(length)
            }
            // A large body is forwarded chunked so the framing can be
            // terminated cleanly even if the client's stream errors out.
            Some(_) => BodyLength::Chunked,
        }
    };

    if body == BodyLength::Chunked {
        // Content-Length and chunked encoding are mutually exclusive.
        // We don't need to delete any existing Transfer-Encoding since it's a
        // Hop-by-hop header and is already filtered out above.
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
    }

    OutboundRequest {
        method: request.method().to_string(),
        uri: request.uri().to_string(),
        headers,
        body,
    }
}

fn serialize_request_header(request: &OutboundRequest, writer: &mut dyn Write) -> io::Result<()> {
    write!(writer, "{} {} HTTP/1.1\r\n", request.method, request.uri)?;
    for (field, value) in request.headers.iter() {
        write!(writer, "{}: ", title_case_header(field))?;
        writer.write_all(value.as_bytes())?;
        write!(writer, "\r\n")?;
    }
    write!(writer, "\r\n")?;
    writer.flush()
}

fn log_request(session: usize, request: &OutboundRequest) {
    trace!("[{}] > {} {} HTTP/1.1", session, request.method, request.uri);
    for (field, value) in request.headers.iter() {
        trace!(
            "[{}] >  {}: {}",
            session,
            title_case_header(field),
            value.to_str().unwrap_or("<binary>")
        );
    }
}

/// Read exactly `length` body bytes into memory before any USB contact.
///
/// Bytes past the declared length are dropped, the way a Content-Length
/// bounded read stops at the boundary.
async fn prefetch_body(body: &mut Body, length: u64) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(length as usize);
    while (buf.len() as u64) < length {
        match body.data().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(Error::ReadRequestBody(e)),
            None => return Err(Error::TruncatedRequestBody(buf.len() as u64, length)),
        }
    }
    buf.truncate(length as usize);
    Ok(Bytes::from(buf))
}

/// Copy the request body from the channel to the device in chunked framing.
///
/// The channel closing is the only end-of-body signal; client-side read
/// errors never reach this function (they close the channel instead), so
/// the framing always terminates with a proper final chunk.
fn send_request_body<W: Write>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    session: usize,
) -> Result<(W, u64)> {
    let mut total: u64 = 0;
    let mut chunked = ChunkedWriter::new(io::BufWriter::with_capacity(
        COPY_BUFFER_SIZE,
        &mut writer,
    ));
    while let Some(chunk) = rx.blocking_recv() {
        chunked.write_all(&chunk).map_err(|e| {
            error!("[{}] writing request body failed: {}", session, e);
            Error::WriteRequest(e)
        })?;
        total += chunk.len() as u64;
    }
    chunked.finish().map_err(Error::WriteRequest)?;
    drop(chunked); // Release the borrow on the writer.
    Ok((writer, total))
}

/// Reads an HTTP/1.1 response from the device side of a connection.
///
/// Once a request has been written, a complete response must always be
/// consumed, or leftover bytes would be parsed as the prologue of the next
/// transaction's response.  Dropping the reader drains whatever part of the
/// response has not been read yet.
struct ResponseReader<R: BufRead> {
    session: usize,
    log: LogMask,
    reader: R,
    // Assume the body is empty unless a header says otherwise.
    body_length: BodyLength,
    header_was_read: bool,
    created_body_reader: bool,
}

impl<R> ResponseReader<R>
where
    R: BufRead,
{
    fn new(session: usize, log: LogMask, reader: R) -> ResponseReader<R> {
        ResponseReader {
            session,
            log,
            reader,
            body_length: BodyLength::Exactly(0),
            header_was_read: false,
            created_body_reader: false,
        }
    }

    fn read_header(&mut self) -> Result<(StatusCode, HeaderMap)> {
        self.header_was_read = true;

        let buf =
            read_until_delimiter(&mut self.reader, b"\r\n\r\n").map_err(Error::ReadResponse)?;
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        let (status, headers) = match response.parse(&buf).map_err(Error::ParseResponse)? {
            httparse::Status::Complete(i) if i == buf.len() => {
                let code = response.code.ok_or(Error::EmptyField("code"))?;
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let version = response.version.ok_or(Error::EmptyField("version"))?;
                let reason = status.canonical_reason().unwrap_or("Unknown");
                info!(
                    "[{}] response: HTTP/1.{} {} {}",
                    self.session, version, code, reason
                );
                let mut parsed_headers = HeaderMap::new();
                for header in headers.iter().take_while(|&&h| h != httparse::EMPTY_HEADER) {
                    let name = HeaderName::from_bytes(header.name.as_bytes());
                    let val = HeaderValue::from_bytes(header.value);
                    if name.is_ok() && val.is_ok() {
                        let val = val.unwrap();
                        if self.log.trace_http() {
                            trace!(
                                "[{}] <  {}: {}",
                                self.session,
                                header.name,
                                val.to_str().unwrap_or("<binary>")
                            );
                        }
                        parsed_headers.append(name.unwrap(), val);
                    } else {
                        error!(
                            "[{}] ignoring malformed header {}:{:#?}",
                            self.session, header.name, header.value
                        );
                    }
                }
                (status, parsed_headers)
            }
            _ => return Err(Error::MalformedResponse),
        };

        // Determine the size of the body content.
        if headers.contains_key(header::TRANSFER_ENCODING) {
            self.body_length = BodyLength::Chunked;
        } else if let Some(length) = declared_body_length(&headers) {
            self.body_length = BodyLength::Exactly(length);
        }

        Ok((status, headers))
    }

    fn body_reader(&mut self) -> DrainReader<Box<dyn Read + '_>> {
        self.created_body_reader = true;
        let inner: Box<dyn Read + '_> = match self.body_length {
            BodyLength::Exactly(length) => Box::new((&mut self.reader).take(length)),
            BodyLength::Chunked => Box::new(chunked_transfer::Decoder::new(&mut self.reader)),
        };
        DrainReader::new(inner)
    }
}

impl<R> Drop for ResponseReader<R>
where
    R: BufRead,
{
    fn drop(&mut self) {
        if !self.created_body_reader {
            if !self.header_was_read {
                // Read the header to learn how long the body is.
                let _ = self.read_header();
            }

            // The body reader drains whatever is left when it drops.
            drop(self.body_reader());
        }
    }
}

/// Read from `reader` until `delimiter` is seen or EOF is reached.
/// Returns read data.
fn read_until_delimiter(reader: &mut dyn BufRead, delimiter: &[u8]) -> io::Result<Vec<u8>> {
    let mut result: Vec<u8> = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if buf.is_empty() {
            return Ok(result);
        }

        // First check if our delimiter spans the old buffer and the new buffer.
        for split in 1..delimiter.len() {
            let (first_delimiter, second_delimiter) = delimiter.split_at(split);
            if first_delimiter.len() > result.len() || second_delimiter.len() > buf.len() {
                continue;
            }

            let first = result.get(result.len() - first_delimiter.len()..);
            let second = buf.get(..second_delimiter.len());
            if let (Some(first), Some(second)) = (first, second) {
                if first == first_delimiter && second == second_delimiter {
                    result.extend_from_slice(second);
                    reader.consume(second_delimiter.len());
                    return Ok(result);
                }
            }
        }

        // Then check if our delimiter occurs in the new buffer.
        if let Some(i) = buf
            .windows(delimiter.len())
            .position(|window| window == delimiter)
        {
            result.extend_from_slice(&buf[..i + delimiter.len()]);
            reader.consume(i + delimiter.len());
            return Ok(result);
        }

        // Otherwise just copy the entire buffer into result.
        let consumed = buf.len();
        result.extend_from_slice(buf);
        reader.consume(consumed);
    }
}

// Read the response body from `response_reader` in chunks and send them to
// the client via `sender`.  If the client stops accepting data, the rest of
// the body is read and discarded so the connection comes back clean.
fn copy_response_body<R: BufRead>(
    mut response_reader: ResponseReader<R>,
    sender: &mut hyper::body::Sender,
    session: usize,
) -> io::Result<u64> {
    let mut reader = response_reader.body_reader();
    let mut buf = [0; COPY_BUFFER_SIZE];
    let mut discarding = false;
    let mut copied: u64 = 0;

    loop {
        let num = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(num) => num,
            Err(e) => return Err(e),
        };
        if discarding {
            continue;
        }

        let mut to_send = Bytes::copy_from_slice(&buf[..num]);
        let mut tries = 10;
        loop {
            match sender.try_send_data(to_send) {
                Ok(()) => {
                    copied += num as u64;
                    break;
                }
                Err(remaining) => {
                    tries -= 1;
                    if tries == 0 {
                        // The client stopped reading this response.  Keep
                        // going in discard mode so the USB side is fully
                        // drained before the connection is reused.
                        debug!(
                            "[{}] client has gone; draining response from USB",
                            session
                        );
                        discarding = true;
                        break;
                    }
                    // Give the client a brief time to catch up.
                    thread::sleep(Duration::from_millis(10));
                    to_send = remaining;
                }
            }
        }
    }

    if discarding {
        debug!(
            "[{}] response body: drained {} bytes total, {} delivered",
            session,
            reader.count(),
            copied
        );
    }
    Ok(copied)
}

/// Execute one HTTP transaction over a connection from the transport's pool.
pub(crate) async fn round_trip(
    transport: UsbTransport,
    session: usize,
    request: Request<Body>,
) -> Result<Response<Body>> {
    info!(
        "[{}] {}: {} {} {:?}",
        session,
        transport.descriptor(),
        request.method(),
        request.uri(),
        request.version()
    );

    let config = transport.config().clone();
    let outbound = rewrite_request(&request, &config);
    if config.log.trace_http() {
        log_request(session, &outbound);
    }

    let mut body = request.into_body();

    let prefetched = match outbound.body {
        BodyLength::Exactly(length) if length > 0 => {
            let buf = prefetch_body(&mut body, length).await?;
            debug!(
                "[{}] request body is small ({} bytes), prefetched before sending",
                session,
                buf.len()
            );
            Some(buf)
        }
        _ => None,
    };

    // Everything before this point may be cancelled freely.  Acquisition is
    // the last cancellable step: dropping the future while waiting consumes
    // nothing.
    let conn = transport.acquire().await?;
    debug!("[{}] connection {} allocated", session, conn.index());

    // Once the request starts flowing onto the USB interface the transaction
    // must run to completion, so the exchange happens on tasks the caller's
    // future does not own.
    tokio::spawn(exchange(session, config, outbound, prefetched, body, conn))
        .await
        .map_err(Error::TaskJoin)?
}

async fn exchange(
    session: usize,
    config: TransportConfig,
    outbound: OutboundRequest,
    prefetched: Option<Bytes>,
    mut body: Body,
    conn: UsbConn,
) -> Result<Response<Body>> {
    let body_length = outbound.body;

    // The header, plus the prefetched body if there is one, goes out as a
    // single blocking write.
    let conn = tokio::task::spawn_blocking(move || -> Result<UsbConn> {
        let mut conn = conn;
        let mut buf = Vec::with_capacity(1024);
        serialize_request_header(&outbound, &mut buf).map_err(Error::WriteRequest)?;
        if let Some(data) = &prefetched {
            buf.extend_from_slice(data);
        }
        conn.write_all(&buf).map_err(|e| {
            error!("[{}] writing request failed: {}", session, e);
            Error::WriteRequest(e)
        })?;
        Ok(conn)
    })
    .await
    .map_err(Error::TaskJoin)??;

    // A chunked request body streams from the client one chunk at a time
    // through a channel to the blocking writer.  A client-side error closes
    // the channel, which ends the body as if the stream had finished; the
    // device still sees well-formed framing.
    let conn = if body_length == BodyLength::Chunked {
        debug!("[{}] forwarding request body", session);
        let (tx, rx) = mpsc::channel::<Bytes>(2);
        let writer = tokio::task::spawn_blocking(move || send_request_body(rx, conn, session));

        let mut count: u64 = 0;
        loop {
            match body.data().await {
                Some(Ok(chunk)) => {
                    count += chunk.len() as u64;
                    if tx.send(chunk).await.is_err() {
                        // The writer bailed out; its error surfaces below.
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("[{}] request body: got {} bytes; {}", session, count, e);
                    break;
                }
                None => break,
            }
        }
        drop(tx); // Close the channel to tell the writer to finish.

        let (conn, total) = writer.await.map_err(Error::TaskJoin)??;
        debug!("[{}] copied {} bytes of request body to USB", session, total);
        conn
    } else {
        conn
    };

    debug!("[{}] reading response header", session);
    let mut response_reader = ResponseReader::new(session, config.log, conn);
    let (response_reader, header) = tokio::task::spawn_blocking(move || {
        let header = response_reader.read_header();
        (response_reader, header)
    })
    .await
    .map_err(Error::TaskJoin)?;
    let (status, headers) = match header {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("[{}] {}", session, e);
            // Dropping the reader releases the connection.
            return Err(e);
        }
    };

    let mut builder = Response::builder().status(status);
    for (h, val) in headers.iter() {
        builder = builder.header(h, val);
    }

    // The copy task owns the connection from here: it releases it after the
    // body is fully read, or after draining it if the client goes away.
    debug!("[{}] forwarding response body", session);
    let (mut sender, response_body) = Body::channel();
    tokio::task::spawn_blocking(move || {
        match copy_response_body(response_reader, &mut sender, session) {
            Ok(copied) => debug!("[{}] copied {} bytes of response body", session, copied),
            Err(e) => {
                error!("[{}] failed to copy response body: {}", session, e);
                sender.abort();
            }
        }
    });
    builder.body(response_body).map_err(Error::BuildResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Version;
    use std::io::{BufReader, Cursor};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn test_config() -> TransportConfig {
        TransportConfig {
            log: LogMask::empty(),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn session_ids_wrap() {
        let first = next_session_id();
        let second = next_session_id();
        assert!(first < 1000);
        assert!(second < 1000);
    }

    #[test]
    fn e2e_header() {
        let header = HeaderName::from_bytes(b"Content-Type").unwrap();
        assert!(is_end_to_end(&header));

        let header = HeaderName::from_bytes(b"Connection").unwrap();
        assert!(!is_end_to_end(&header));

        let header = HeaderName::from_bytes(b"Keep-Alive").unwrap();
        assert!(!is_end_to_end(&header));

        let header = HeaderName::from_bytes(b"Transfer-Encoding").unwrap();
        assert!(!is_end_to_end(&header));

        // Special case since Expect is normally end-to-end.
        let header = HeaderName::from_bytes(b"Expect").unwrap();
        assert!(!is_end_to_end(&header));
    }

    #[test]
    fn title_case() {
        let header = HeaderName::from_bytes(b"transfer-encoding").unwrap();
        assert_eq!(title_case_header(&header), "Transfer-Encoding");
        let header = HeaderName::from_bytes(b"te").unwrap();
        assert_eq!(title_case_header(&header), "Te");
    }

    #[test]
    fn body_length_no_header() {
        let headers = HeaderMap::new();
        assert!(declared_body_length(&headers).is_none());
    }

    #[test]
    fn body_length_invalid_number() {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(header::CONTENT_LENGTH, "xyz".parse().unwrap());
        assert!(declared_body_length(&headers).is_none());
    }

    #[test]
    fn body_length_zero_header() {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(header::CONTENT_LENGTH, "0".parse().unwrap());
        assert_eq!(declared_body_length(&headers), Some(0));
    }

    #[test]
    fn body_length_nonzero_header() {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(header::CONTENT_LENGTH, "32768".parse().unwrap());
        assert_eq!(declared_body_length(&headers), Some(32768));
    }

    #[test]
    fn rewrite_request_no_body() {
        let request_in = Request::builder()
            .method("GET")
            .version(Version::HTTP_11)
            .uri("/eSCL/ScannerCapabilities")
            .header("Content-Type", "text/plain")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert_eq!(request_out.method, "GET");
        assert_eq!(request_out.uri, "/eSCL/ScannerCapabilities");
        assert_eq!(request_out.body, BodyLength::Exactly(0));
        assert!(request_out.headers.contains_key("User-Agent"));
        assert!(request_out.headers.contains_key("Content-Type"));
        // No Content-Length is synthesized for a body-less request.
        assert!(!request_out.headers.contains_key("Content-Length"));
        assert_eq!(request_out.headers.get("Connection").unwrap(), "close");
    }

    #[test]
    fn rewrite_request_small_body_keeps_literal_length() {
        let request_in = Request::builder()
            .method("POST")
            .version(Version::HTTP_11)
            .uri("/ipp/print")
            .header("Content-Length", "100")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert_eq!(request_out.body, BodyLength::Exactly(100));
        assert_eq!(request_out.headers.get("Content-Length").unwrap(), "100");
        assert!(!request_out.headers.contains_key("Transfer-Encoding"));
    }

    #[test]
    fn rewrite_request_large_body_forces_chunked() {
        let request_in = Request::builder()
            .method("POST")
            .version(Version::HTTP_11)
            .uri("/ipp/print")
            .header("Content-Length", "1000000")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert_eq!(request_out.body, BodyLength::Chunked);
        assert!(!request_out.headers.contains_key("Content-Length"));
        assert_eq!(
            request_out.headers.get("Transfer-Encoding").unwrap(),
            "chunked"
        );
    }

    #[test]
    fn rewrite_request_threshold_boundary() {
        let config = test_config();
        let at_threshold = Request::builder()
            .method("POST")
            .uri("/ipp/print")
            .header(
                "Content-Length",
                config.small_body_prefetch_threshold.to_string(),
            )
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            rewrite_request(&at_threshold, &config).body,
            BodyLength::Chunked
        );

        let below = Request::builder()
            .method("POST")
            .uri("/ipp/print")
            .header(
                "Content-Length",
                (config.small_body_prefetch_threshold - 1).to_string(),
            )
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            rewrite_request(&below, &config).body,
            BodyLength::Exactly(config.small_body_prefetch_threshold - 1)
        );
    }

    #[test]
    fn rewrite_request_chunked_body_stays_chunked() {
        let request_in = Request::builder()
            .method("POST")
            .version(Version::HTTP_11)
            .uri("/ipp/print")
            .header("Transfer-Encoding", "chunked")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert_eq!(request_out.body, BodyLength::Chunked);
        assert!(!request_out.headers.contains_key("Content-Length"));
        assert_eq!(
            request_out.headers.get("Transfer-Encoding").unwrap(),
            "chunked"
        );
    }

    #[test]
    fn rewrite_request_strips_expect_and_keep_alive() {
        let request_in = Request::builder()
            .method("POST")
            .version(Version::HTTP_11)
            .uri("/ipp/print")
            .header("Expect", "100-continue")
            .header("Connection", "keep-alive")
            .header("Keep-Alive", "timeout=5")
            .header("Content-Length", "32")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert!(!request_out.headers.contains_key("Expect"));
        assert!(!request_out.headers.contains_key("Keep-Alive"));
        assert_eq!(request_out.headers.get("Connection").unwrap(), "close");
    }

    #[test]
    fn rewrite_request_keeps_existing_user_agent() {
        let request_in = Request::builder()
            .method("GET")
            .uri("/")
            .header("User-Agent", "CUPS/2.4")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        assert_eq!(request_out.headers.get("User-Agent").unwrap(), "CUPS/2.4");
    }

    #[test]
    fn copy_request_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/plain".parse().unwrap());
        let request = OutboundRequest {
            method: "GET".to_string(),
            uri: "/eSCL/ScannerCapabilities".to_string(),
            headers,
            body: BodyLength::Exactly(0),
        };

        let mut buf = Vec::new();
        assert!(serialize_request_header(&request, &mut buf).is_ok());
        assert_eq!(
            buf,
            b"GET /eSCL/ScannerCapabilities HTTP/1.1\r
Content-Type: text/plain\r
\r
"
        );
    }

    #[test]
    fn serialized_request_has_no_expect_header() {
        let request_in = Request::builder()
            .method("POST")
            .uri("/ipp/print")
            .header("Expect", "100-continue")
            .header("Content-Length", "32")
            .body(Body::empty())
            .unwrap();

        let request_out = rewrite_request(&request_in, &test_config());
        let mut buf = Vec::new();
        serialize_request_header(&request_out, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("Expect"));
        assert!(!text.contains("keep-alive"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 32\r\n"));
    }

    #[test]
    fn response_reader_invalid_status_line() {
        let payload = b"HTTP/1.1 OK\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        assert!(reader.read_header().is_err());
    }

    #[test]
    fn response_reader_invalid_http_version() {
        let payload = b"HTTP/0.9 200 OK\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        assert!(reader.read_header().is_err());
    }

    #[test]
    fn response_reader_missing_header_end() {
        let payload = b"HTTP/1.1 200 OK\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        assert!(reader.read_header().is_err());
    }

    #[test]
    fn response_reader_empty_response() {
        let payload = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("failed to read header");
        assert_eq!(status, 200);
        assert_eq!(headers.len(), 0);
    }

    #[test]
    fn response_reader_static_response() {
        let payload = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("failed to read header");
        assert_eq!(status, 200);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), &"100");
        assert_eq!(reader.body_length, BodyLength::Exactly(100));
    }

    #[test]
    fn response_reader_chunked_response() {
        let payload = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("failed to read header");
        assert_eq!(status, 200);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(header::TRANSFER_ENCODING).unwrap(), &"chunked");
        assert_eq!(reader.body_length, BodyLength::Chunked);
    }

    #[test]
    fn test_read_until_delimiter() {
        let mut source = Cursor::new(&b"abdcdef"[..]);
        let v = read_until_delimiter(&mut source, b"20").unwrap();
        assert_eq!(v, b"abdcdef");

        let mut source = Cursor::new(&b"abdcdef"[..]);
        let v = read_until_delimiter(&mut source, b"de").unwrap();
        assert_eq!(v, b"abdcde");

        let mut source = Cursor::new(&b"abdcdef"[..]);
        let v = read_until_delimiter(&mut source, b"dc").unwrap();
        assert_eq!(v, b"abdc");

        let mut source = Cursor::new(&b"abdcdef"[..]);
        let v = read_until_delimiter(&mut source, b"abd").unwrap();
        assert_eq!(v, b"abd");

        let mut source = BufReader::with_capacity(2, Cursor::new(&b"abdcdeffegh"[..]));
        let v = read_until_delimiter(&mut source, b"bdc").unwrap();
        assert_eq!(v, b"abdc");

        let v = read_until_delimiter(&mut source, b"ef").unwrap();
        assert_eq!(v, b"def");

        let v = read_until_delimiter(&mut source, b"g").unwrap();
        assert_eq!(v, b"feg");
    }

    #[tokio::test]
    async fn prefetch_exact_body() {
        let (mut sender, mut body) = Body::channel();
        let feeder = tokio::spawn(async move {
            sender
                .send_data(Bytes::from_static(&[7u8; 100]))
                .await
                .unwrap();
            // The generator fails after yielding the declared 100 bytes.
            sender.abort();
        });
        let buf = prefetch_body(&mut body, 100).await.unwrap();
        assert_eq!(buf.len(), 100);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_fails_on_early_error() {
        let (mut sender, mut body) = Body::channel();
        let feeder = tokio::spawn(async move {
            sender
                .send_data(Bytes::from_static(&[7u8; 50]))
                .await
                .unwrap();
            sender.abort();
        });
        assert!(matches!(
            prefetch_body(&mut body, 100).await,
            Err(Error::ReadRequestBody(_))
        ));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_fails_on_truncated_body() {
        let (mut sender, mut body) = Body::channel();
        sender
            .send_data(Bytes::from_static(&[7u8; 50]))
            .await
            .unwrap();
        drop(sender);
        assert!(matches!(
            prefetch_body(&mut body, 100).await,
            Err(Error::TruncatedRequestBody(50, 100))
        ));
    }

    #[tokio::test]
    async fn request_body_is_chunked_on_the_wire() {
        let (tx, rx) = mpsc::channel::<Bytes>(2);
        let writer =
            tokio::task::spawn_blocking(move || send_request_body(rx, Vec::<u8>::new(), 0));
        tx.send(Bytes::from_static(b"test")).await.unwrap();
        tx.send(Bytes::from_static(b"body")).await.unwrap();
        drop(tx);
        let (wire, total) = writer.await.unwrap().unwrap();
        assert_eq!(total, 8);
        assert_eq!(wire, b"4\r\ntest\r\n4\r\nbody\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn request_body_chunks_sum_to_original_length() {
        let (tx, rx) = mpsc::channel::<Bytes>(2);
        let writer =
            tokio::task::spawn_blocking(move || send_request_body(rx, Vec::<u8>::new(), 0));
        let payload = vec![0x55u8; 1_000_000];
        for piece in payload.chunks(65536) {
            tx.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        drop(tx);
        let (wire, total) = writer.await.unwrap().unwrap();
        assert_eq!(total, 1_000_000);

        // Decode the chunked framing and compare against the original.
        let mut decoded = Vec::new();
        chunked_transfer::Decoder::new(&wire[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn copy_response_empty() {
        let payload = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("should read headers");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.len(), 0);

        let (mut sender, body) = Body::channel();
        #[allow(deprecated)]
        let bytes_task = tokio::spawn(async move { hyper::body::to_bytes(body).await });

        let len = tokio::task::spawn_blocking(move || copy_response_body(reader, &mut sender, 0))
            .await
            .expect("failed to join copy_response_body task")
            .expect("failed to copy body");
        assert_eq!(len, 0);

        let bytes = bytes_task
            .await
            .expect("failed to join to_bytes task")
            .expect("failed to read body");
        assert_eq!(bytes, b""[..]);
    }

    #[tokio::test]
    async fn copy_response_static() {
        let payload =
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 8\r\n\r\ntestbody";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("should read headers");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers
                .get(header::CONTENT_LENGTH)
                .unwrap()
                .to_str()
                .unwrap(),
            "8"
        );

        let (mut sender, body) = Body::channel();
        #[allow(deprecated)]
        let bytes_task = tokio::spawn(async move { hyper::body::to_bytes(body).await });

        let len = tokio::task::spawn_blocking(move || copy_response_body(reader, &mut sender, 0))
            .await
            .expect("failed to join copy_response_body task")
            .expect("failed to copy body");
        assert_eq!(len, 8);

        let bytes = bytes_task
            .await
            .expect("failed to join to_bytes task")
            .expect("failed to read body");
        assert_eq!(bytes, b"testbody"[..]);
    }

    #[tokio::test]
    async fn copy_response_chunked() {
        let payload = b"HTTP/1.1 200 OK\r
Content-Type: text/plain\r
Transfer-Encoding: chunked\r
\r
4\r
test\r
4\r
body\r
0\r
\r
";
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(&payload[..]));
        let (status, headers) = reader.read_header().expect("should read headers");
        assert_eq!(status, StatusCode::OK);
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
        assert!(headers.contains_key(header::TRANSFER_ENCODING));

        let (mut sender, body) = Body::channel();
        #[allow(deprecated)]
        let bytes_task = tokio::spawn(async move { hyper::body::to_bytes(body).await });

        let len = tokio::task::spawn_blocking(move || copy_response_body(reader, &mut sender, 0))
            .await
            .expect("failed to join copy_response_body task")
            .expect("failed to copy body");
        assert_eq!(len, 8);

        let bytes = bytes_task
            .await
            .expect("failed to join to_bytes task")
            .expect("failed to read body");
        assert_eq!(bytes, b"testbody"[..]);
    }

    /// Reader that records how far it has been consumed.
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        consumed: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.consumed.fetch_add(n, Ordering::SeqCst);
            Ok(n)
        }
    }

    #[tokio::test]
    async fn abandoned_response_is_fully_drained() {
        let mut payload = b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\n\r\n".to_vec();
        payload.extend_from_slice(&[0x42u8; 10000]);
        let total_len = payload.len();

        let consumed = Arc::new(AtomicUsize::new(0));
        let source = CountingReader {
            inner: Cursor::new(payload),
            consumed: consumed.clone(),
        };
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(source));
        reader.read_header().expect("should read headers");

        // The client drops the response body without reading it.
        let (mut sender, body) = Body::channel();
        drop(body);

        tokio::task::spawn_blocking(move || copy_response_body(reader, &mut sender, 0))
            .await
            .expect("failed to join copy_response_body task")
            .expect("copy should succeed in discard mode");

        // The full response was pulled off the transport regardless.
        assert_eq!(consumed.load(Ordering::SeqCst), total_len);
    }

    #[tokio::test]
    async fn dropped_response_reader_drains_body() {
        let mut payload = b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n".to_vec();
        payload.extend_from_slice(&[0x13u8; 5000]);
        let total_len = payload.len();

        let consumed = Arc::new(AtomicUsize::new(0));
        let source = CountingReader {
            inner: Cursor::new(payload),
            consumed: consumed.clone(),
        };
        let mut reader = ResponseReader::new(0, LogMask::empty(), BufReader::new(source));
        reader.read_header().expect("should read headers");
        drop(reader);

        assert_eq!(consumed.load(Ordering::SeqCst), total_len);
    }
}
