use axum::body::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};

/// Copilot sends `"content":null` in delta chunks where OpenAI clients expect a string.
const NULL_CONTENT: &[u8] = br#""content":null"#;
const EMPTY_CONTENT: &[u8] = br#""content":"""#;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Append `line` to `out` with every null content field patched, followed by `\n`.
fn push_rewritten_line(mut line: &[u8], out: &mut Vec<u8>) {
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    while let Some(idx) = find(line, NULL_CONTENT) {
        out.extend_from_slice(&line[..idx]);
        out.extend_from_slice(EMPTY_CONTENT);
        line = &line[idx + NULL_CONTENT.len()..];
    }
    out.extend_from_slice(line);
    out.push(b'\n');
}

/// Splits an SSE byte stream into lines and patches each one.
///
/// Chunks may end mid-line; the tail is held until the next `\n` or `finish()`.
#[derive(Debug, Default)]
pub struct SseLineRewriter {
    pending: Vec<u8>,
}

impl SseLineRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk; returns the complete lines it closed, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        let Some(last_nl) = chunk.iter().rposition(|&b| b == b'\n') else {
            self.pending.extend_from_slice(chunk);
            return None;
        };

        let (complete, rest) = chunk.split_at(last_nl + 1);
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(complete);

        let mut out = Vec::with_capacity(buf.len() + 8);
        // `buf` ends with '\n', so the final split piece is empty and skipped.
        let mut lines = buf.split(|&b| b == b'\n').peekable();
        while let Some(line) = lines.next() {
            if lines.peek().is_none() {
                break;
            }
            push_rewritten_line(line, &mut out);
        }
        self.pending.extend_from_slice(rest);
        Some(Bytes::from(out))
    }

    /// Flush an unterminated final line.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(line.len() + 1);
        push_rewritten_line(&line, &mut out);
        Some(Bytes::from(out))
    }
}

struct RewriteState<E> {
    inner: BoxStream<'static, Result<Bytes, E>>,
    rewriter: SseLineRewriter,
    done: bool,
}

/// Adapt an upstream byte stream into a patched, line-by-line response body stream.
pub fn rewrite_sse_stream<S, E>(
    upstream: S,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let state = RewriteState {
        inner: upstream.boxed(),
        rewriter: SseLineRewriter::new(),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    if let Some(out) = st.rewriter.push(&chunk) {
                        return Some((Ok(out), st));
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(std::io::Error::other(err)), st));
                }
                None => {
                    st.done = true;
                    let tail = st.rewriter.finish()?;
                    return Some((Ok(tail), st));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(chunks: &[&[u8]]) -> String {
        let mut rw = SseLineRewriter::new();
        let mut out = Vec::new();
        for c in chunks {
            if let Some(b) = rw.push(c) {
                out.extend_from_slice(&b);
            }
        }
        if let Some(b) = rw.finish() {
            out.extend_from_slice(&b);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn null_content_becomes_empty_string() {
        let out = collect(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":null,\"role\":\"assistant\"}}]}\n\n",
        ]);
        assert_eq!(
            out,
            "data: {\"choices\":[{\"delta\":{\"content\":\"\",\"role\":\"assistant\"}}]}\n\n"
        );
    }

    #[test]
    fn every_occurrence_in_a_line_is_patched() {
        let out = collect(&[b"{\"content\":null},{\"content\":null},{\"content\":\"x\"}\n"]);
        assert_eq!(
            out,
            "{\"content\":\"\"},{\"content\":\"\"},{\"content\":\"x\"}\n"
        );
    }

    #[test]
    fn needle_split_across_chunks_is_still_patched() {
        let out = collect(&[b"data: {\"cont", b"ent\":nu", b"ll}\n", b"data: [DONE]\n"]);
        assert_eq!(out, "data: {\"content\":\"\"}\ndata: [DONE]\n");
    }

    #[test]
    fn crlf_is_normalised_and_tail_is_flushed() {
        let out = collect(&[b"data: a\r\ndata: b"]);
        assert_eq!(out, "data: a\ndata: b\n");
    }

    #[test]
    fn other_nulls_are_left_alone() {
        let out = collect(&[b"{\"content\": null,\"finish_reason\":null}\n"]);
        assert_eq!(out, "{\"content\": null,\"finish_reason\":null}\n");
    }

    #[test]
    fn chunk_without_newline_emits_nothing_yet() {
        let mut rw = SseLineRewriter::new();
        assert!(rw.push(b"data: partial").is_none());
        assert_eq!(rw.push(b"\n").as_deref(), Some(&b"data: partial\n"[..]));
        assert!(rw.finish().is_none());
    }

    #[tokio::test]
    async fn stream_adapter_relays_lines_and_stops_on_error() {
        let upstream = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"content\":null}\n")),
            Ok(Bytes::from_static(b"data: [DO")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"NE]\n")),
        ]);
        let items = rewrite_sse_stream(upstream).collect::<Vec<_>>().await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].as_ref().unwrap().as_ref(),
            b"data: {\"content\":\"\"}\n"
        );
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn stream_adapter_flushes_tail_at_end() {
        let upstream = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: [DONE]",
        ))]);
        let items = rewrite_sse_stream(upstream).collect::<Vec<_>>().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().as_ref(), b"data: [DONE]\n");
    }
}
