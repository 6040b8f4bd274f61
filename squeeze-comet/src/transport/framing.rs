//! Raw HTTP/1.1 response framing for the persistent socket.
//!
//! The server streams Bayeux messages on a chunked response that never ends,
//! and a single JSON document may be split across several physical chunks.
//! [`ChunkAssembler`] concatenates chunk payloads and re-validates after every
//! chunk, emitting each document once it is complete.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::TransportError;
use crate::message::{messages_from_value, Message};

/// Reassembles JSON documents from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffer: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every JSON document completed by it.
    ///
    /// Incomplete trailing input stays buffered for the next chunk. Malformed
    /// input that can never become valid is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut consumed = 0;
        let mut malformed = false;
        {
            let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        values.push(value);
                        consumed = stream.byte_offset();
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "discarding malformed stream data");
                        malformed = true;
                        break;
                    }
                    None => break,
                }
            }
        }

        let rest = &self.buffer[consumed..];
        if malformed || rest.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
        } else {
            self.buffer.drain(..consumed);
        }
        values
    }

    /// Bytes waiting for the rest of their document.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Status line and the headers the reader cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<usize>,
    pub chunked: bool,
}

/// Reads consecutive HTTP responses off a buffered byte stream.
pub struct ResponseReader<R> {
    reader: R,
    assembler: ChunkAssembler,
}

impl<R: AsyncBufRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            assembler: ChunkAssembler::new(),
        }
    }

    /// Read one complete response, handing each batch of decoded messages to
    /// `sink` as soon as it is complete.
    ///
    /// For a chunked response the sink may be called many times before this
    /// returns. A non-200 status is returned as [`TransportError::Status`]
    /// after its body has been consumed.
    pub async fn read_response(
        &mut self,
        sink: &mut (dyn FnMut(Vec<Message>) + Send),
    ) -> Result<ResponseHead, TransportError> {
        let head = self.read_head().await?;

        if head.chunked {
            self.read_chunked(head.status, sink).await?;
        } else if let Some(length) = head.content_length {
            let mut body = vec![0u8; length];
            self.reader.read_exact(&mut body).await?;
            self.dispatch(head.status, &body, sink);
        } else {
            let mut body = Vec::new();
            self.reader.read_to_end(&mut body).await?;
            self.dispatch(head.status, &body, sink);
        }

        if self.assembler.pending() > 0 {
            tracing::warn!(bytes = self.assembler.pending(), "response ended inside a JSON document");
            self.assembler.clear();
        }

        if head.status != 200 {
            return Err(TransportError::Status(head.status));
        }
        Ok(head)
    }

    async fn read_head(&mut self) -> Result<ResponseHead, TransportError> {
        let status_line = loop {
            let line = self.read_line().await?;
            if !line.is_empty() {
                break line;
            }
        };

        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|_| status_line.starts_with("HTTP/"))
            .ok_or_else(|| TransportError::Framing(format!("bad status line: {}", status_line)))?;

        let mut head = ResponseHead {
            status,
            content_length: None,
            chunked: false,
        };

        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                head.content_length = Some(value.parse().map_err(|_| {
                    TransportError::Framing(format!("bad content length: {}", value))
                })?);
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                head.chunked = value.to_ascii_lowercase().contains("chunked");
            }
        }

        tracing::trace!(?head, "response head");
        Ok(head)
    }

    async fn read_chunked(
        &mut self,
        status: u16,
        sink: &mut (dyn FnMut(Vec<Message>) + Send),
    ) -> Result<(), TransportError> {
        loop {
            let size_line = self.read_line().await?;
            let size_field = size_line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_field, 16)
                .map_err(|_| TransportError::Framing(format!("bad chunk size: {}", size_line)))?;

            if size == 0 {
                // Trailer section ends with an empty line
                while !self.read_line().await?.is_empty() {}
                return Ok(());
            }

            let mut chunk = vec![0u8; size];
            self.reader.read_exact(&mut chunk).await?;
            let terminator = self.read_line().await?;
            if !terminator.is_empty() {
                return Err(TransportError::Framing("missing chunk terminator".to_string()));
            }

            self.dispatch(status, &chunk, sink);
        }
    }

    fn dispatch(&mut self, status: u16, bytes: &[u8], sink: &mut (dyn FnMut(Vec<Message>) + Send)) {
        for value in self.assembler.push(bytes) {
            if status != 200 {
                tracing::debug!(status, body = %value, "ignoring body of failed response");
                continue;
            }
            match messages_from_value(value) {
                Ok(batch) if !batch.is_empty() => sink(batch),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "stream data is not a Bayeux message"),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
