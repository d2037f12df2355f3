//! Streaming (SSE) rehydration.
//!
//! The upstream byte stream is re-framed into text lines; each complete
//! line is substituted and emitted, preserving event framing and latency.
//! The vault snapshot is loaded once, lazily, when the first line that can
//! hold a token arrives, and cached for the lifetime of the stream.

use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio_stream::StreamExt;

use veil_core::error::VeilError;

pub type MappingLoader = Pin<Box<dyn Future<Output = HashMap<String, String>> + Send>>;

struct RehydrateState {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    mappings: Option<HashMap<String, String>>,
    loader: Option<MappingLoader>,
    finished: bool,
}

impl RehydrateState {
    /// Substitute every known token in a line. Loads the vault snapshot on
    /// first need.
    async fn rehydrate_line(&mut self, mut line: String) -> String {
        if !line.contains('[') {
            return line;
        }
        if self.mappings.is_none() {
            let mappings = match self.loader.take() {
                Some(loader) => loader.await,
                None => HashMap::new(),
            };
            self.mappings = Some(mappings);
        }
        if let Some(mappings) = &self.mappings {
            for (token, original) in mappings {
                if line.contains(token.as_str()) {
                    line = line.replace(token.as_str(), original);
                }
            }
        }
        line
    }
}

/// Wrap an upstream byte stream in a line-buffered rehydrator.
pub fn rehydrate_sse_stream(
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    loader: MappingLoader,
) -> impl Stream<Item = Result<Bytes, VeilError>> + Send {
    futures::stream::unfold(
        RehydrateState {
            stream: Box::pin(byte_stream),
            buffer: String::new(),
            mappings: None,
            loader: Some(loader),
            finished: false,
        },
        |mut state| async move {
            loop {
                // Emit the next complete line, delimiter included.
                if let Some(pos) = state.buffer.find('\n') {
                    let line: String = state.buffer.drain(..=pos).collect();
                    let line = state.rehydrate_line(line).await;
                    return Some((Ok(Bytes::from(line)), state));
                }

                if state.finished {
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let tail = std::mem::take(&mut state.buffer);
                    let tail = state.rehydrate_line(tail).await;
                    return Some((Ok(Bytes::from(tail)), state));
                }

                match state.stream.next().await {
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((
                            Err(VeilError::Upstream {
                                status: 502,
                                body: format!("stream error: {e}"),
                            }),
                            state,
                        ));
                    }
                    None => {
                        state.finished = true;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(pairs: &[(&str, &str)]) -> MappingLoader {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::pin(async move { map })
    }

    async fn collect(
        chunks: Vec<&'static str>,
        loader: MappingLoader,
    ) -> String {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c.as_bytes()))),
        );
        let out: Vec<Result<Bytes, VeilError>> =
            rehydrate_sse_stream(stream, loader).collect().await;
        out.into_iter()
            .map(|r| String::from_utf8_lossy(&r.unwrap()).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_token_substituted_per_line() {
        let result = collect(
            vec!["data: {\"content\":\"Hello [CCCD_1]\"}\n\n"],
            loader(&[("[CCCD_1]", "012345678901")]),
        )
        .await;
        assert_eq!(result, "data: {\"content\":\"Hello 012345678901\"}\n\n");
    }

    #[tokio::test]
    async fn test_token_split_across_chunks() {
        let result = collect(
            vec!["data: Hello [CC", "CD_1] bye\n"],
            loader(&[("[CCCD_1]", "012345678901")]),
        )
        .await;
        assert_eq!(result, "data: Hello 012345678901 bye\n");
    }

    #[tokio::test]
    async fn test_framing_preserved() {
        let result = collect(
            vec!["event: delta\n", "data: plain\n\n", "data: [DONE]\n\n"],
            loader(&[("[CCCD_1]", "012345678901")]),
        )
        .await;
        assert_eq!(result, "event: delta\ndata: plain\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_unknown_token_passes_through() {
        let result = collect(
            vec!["data: keep [EMAIL_9] as is\n"],
            loader(&[("[CCCD_1]", "012345678901")]),
        )
        .await;
        assert_eq!(result, "data: keep [EMAIL_9] as is\n");
    }

    #[tokio::test]
    async fn test_tail_without_newline_flushed() {
        let result = collect(
            vec!["data: tail [CCCD_1]"],
            loader(&[("[CCCD_1]", "012345678901")]),
        )
        .await;
        assert_eq!(result, "data: tail 012345678901");
    }
}
