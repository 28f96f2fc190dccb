//! UTF-8 line helpers, layered over the zero-copy read core.

use crate::error::Error;

use super::BytePipe;

impl BytePipe {
    /// Reads one line of UTF-8 text, suspending as needed.
    ///
    /// A line ends at `\n`; a directly preceding `\r` is stripped. The
    /// terminator is consumed but not returned. At end-of-stream, trailing
    /// bytes without a terminator form the last line; `None` means the stream
    /// ended with no line left.
    ///
    /// Fails with [`Error::TooLongLine`] when the line grows past `limit`
    /// bytes and [`Error::MalformedInput`] on invalid UTF-8.
    pub async fn read_utf8_line(&self, limit: usize) -> Result<Option<String>, Error> {
        let mut line = String::new();
        Ok(self.read_utf8_line_to(&mut line, limit).await?.then_some(line))
    }

    /// Appends one line of UTF-8 text to `out`; see
    /// [`read_utf8_line`](`BytePipe::read_utf8_line`). Returns `false` when
    /// the stream ended with no line left.
    pub async fn read_utf8_line_to(&self, out: &mut String, limit: usize) -> Result<bool, Error> {
        let mut buf: Vec<u8> = Vec::new();
        let mut pending_cr = false;
        let mut saw_terminator = false;
        let mut consumed_any = false;

        loop {
            let status = self.try_read_with(1, |view| {
                let (consumed, line_len) = match view.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        saw_terminator = true;
                        (i + 1, i)
                    }
                    None => (view.len(), view.len()),
                };
                let mut data = &view[..line_len];

                if pending_cr {
                    // A CR held from the previous chunk is literal unless it
                    // sat directly before this terminator.
                    if !(saw_terminator && line_len == 0) {
                        buf.push(b'\r');
                    }
                    pending_cr = false;
                }

                if saw_terminator {
                    if let Some(stripped) = data.strip_suffix(b"\r") {
                        data = stripped;
                    }
                } else if let Some(stripped) = data.strip_suffix(b"\r") {
                    data = stripped;
                    pending_cr = true;
                }

                buf.extend_from_slice(data);
                consumed
            })?;

            match status {
                Some(n) => {
                    consumed_any |= n > 0;
                    if buf.len() > limit {
                        return Err(Error::TooLongLine(limit));
                    }
                    if saw_terminator {
                        break;
                    }
                    if n == 0 {
                        self.await_content().await?;
                    }
                }
                None => {
                    // End of stream; a held CR was literal after all.
                    if pending_cr {
                        buf.push(b'\r');
                    }
                    if !consumed_any && buf.is_empty() {
                        return Ok(false);
                    }
                    break;
                }
            }
        }

        if buf.len() > limit {
            return Err(Error::TooLongLine(limit));
        }
        let line = String::from_utf8(buf).map_err(|_| Error::MalformedInput)?;
        out.push_str(&line);
        Ok(true)
    }
}
