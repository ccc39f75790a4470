use crate::adapter::{build_payload, chat_endpoint, request_headers};
use crate::error::ModelError;
use crate::{ModelClient, ModelRequest, ModelTarget};
use anyhow::{Context as _, Result};
use plandex_api::StreamBody;
use plandex_api::client::parse_retry_after_seconds;
use plandex_stream::{Frame, Sentinel, StreamMessage, encode_record};
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;
use tracing::debug;

/// Talks to OpenAI-compatible `chat/completions` endpoints and re-frames the
/// SSE deltas as plan stream records.
pub struct HttpModelClient {
    client: Client,
}

impl HttpModelClient {
    /// Replies can stream for minutes, so only connecting is time-bounded.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .context("failed to build model http client")?;
        Ok(Self { client })
    }
}

impl ModelClient for HttpModelClient {
    fn open(&self, target: &ModelTarget, req: &ModelRequest) -> Result<StreamBody> {
        let endpoint = chat_endpoint(target)?;
        let mut builder = self.client.post(&endpoint).json(&build_payload(target, req));
        for (name, value) in request_headers(target)? {
            builder = builder.header(name, value);
        }
        debug!(
            model_id = %target.model.model_id,
            provider = %target.provider.provider,
            %endpoint,
            "opening model stream"
        );
        let resp = builder.send().map_err(|err| {
            anyhow::Error::new(ModelError::Other {
                retriable: err.is_timeout() || err.is_connect(),
                msg: format!("Network error: {err}"),
            })
        })?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
            let body = resp.text().unwrap_or_default();
            return Err(anyhow::Error::new(ModelError::from_status(
                status.as_u16(),
                &body,
                retry_after,
            )));
        }
        Ok(Box::new(SseFrameReader::new(resp)))
    }
}

/// Turns a `text/event-stream` body into `<MSG_SEP>` records: one `reply`
/// message per content delta, a model error record when the provider fails
/// mid-stream, and `<END>` on `[DONE]` or EOF.
pub struct SseFrameReader<R: Read> {
    inner: BufReader<R>,
    out: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> SseFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            out: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn push(&mut self, frame: &Frame) {
        self.out.extend_from_slice(encode_record(frame).as_bytes());
    }

    fn finish(&mut self, frame: &Frame) {
        self.push(frame);
        self.finished = true;
    }

    /// Reads SSE lines until at least one record is queued.
    fn fill(&mut self) -> io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.inner.read_line(&mut line)? == 0 {
                self.finish(&Frame::Sentinel(Sentinel::End));
                return Ok(());
            }
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.finish(&Frame::Sentinel(Sentinel::End));
                return Ok(());
            }
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(err) = value.get("error") {
                let msg = err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| err.to_string());
                let classified = ModelError::from_message(&msg).unwrap_or_else(|| ModelError::other(msg));
                let record = Frame::Message(Box::new(StreamMessage::model_error(classified.to_info())));
                self.finish(&record);
                return Ok(());
            }
            let content = value
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
                .and_then(|choice| choice.get("delta").or_else(|| choice.get("message")))
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !content.is_empty() {
                self.push(&Frame::Message(Box::new(StreamMessage::reply(content))));
                return Ok(());
            }
        }
    }
}

impl<R: Read> Read for SseFrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.out.len() {
            if self.finished {
                return Ok(0);
            }
            self.out.clear();
            self.pos = 0;
            self.fill()?;
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ChatMessage;
    use crate::adapter::tests::target;
    use plandex_core::{ModelRoleConfig, Provider};
    use plandex_stream::{FrameDecoder, StreamMessageType};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;

    #[derive(Clone)]
    pub(crate) struct MockHttpResponse {
        pub status: u16,
        pub body: String,
        pub retry_after: Option<String>,
    }

    impl MockHttpResponse {
        pub(crate) fn sse(chunks: &[&str]) -> Self {
            let mut body = String::new();
            for chunk in chunks {
                let event = serde_json::json!({ "choices": [{ "delta": { "content": chunk } }] });
                body.push_str(&format!("data: {event}\n\n"));
            }
            body.push_str("data: [DONE]\n\n");
            Self {
                status: 200,
                body,
                retry_after: None,
            }
        }

        pub(crate) fn error(status: u16, body: &str) -> Self {
            Self {
                status,
                body: body.to_string(),
                retry_after: None,
            }
        }
    }

    pub(crate) struct MockModelServer {
        pub base_url: String,
        request_count: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<String>>>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockModelServer {
        pub(crate) fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }

        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl Drop for MockModelServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn start_mock_model_server(responses: Vec<MockHttpResponse>) -> MockModelServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock model server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let count_thread = Arc::clone(&request_count);
        let requests_thread = Arc::clone(&requests);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let body = read_http_body(&mut stream).unwrap_or_default();
                        requests_thread.lock().expect("requests lock").push(body);
                        let idx = count_thread.fetch_add(1, Ordering::SeqCst);
                        let Some(selected) = responses.get(idx).or_else(|| responses.last()).cloned()
                        else {
                            break;
                        };
                        let content_type = if selected.status == 200 {
                            "text/event-stream"
                        } else {
                            "application/json"
                        };
                        let mut headers = format!(
                            "HTTP/1.1 {} Status\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
                            selected.status,
                            selected.body.len()
                        );
                        if let Some(retry_after) = selected.retry_after {
                            headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
                        }
                        headers.push_str("\r\n");
                        let _ = stream.write_all(format!("{headers}{}", selected.body).as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockModelServer {
            base_url: format!("http://{addr}/v1"),
            request_count,
            requests,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn read_http_body(stream: &mut std::net::TcpStream) -> io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let content_length = parse_content_length(&buffer[..header_len]);
        let mut body = buffer[header_len..].to_vec();
        while body.len() < content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    fn parse_content_length(headers: &[u8]) -> usize {
        let raw = String::from_utf8_lossy(headers);
        for line in raw.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("content-length")
                && let Some(value) = parts.next()
                && let Ok(parsed) = value.trim().parse::<usize>()
            {
                return parsed;
            }
        }
        0
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    pub(crate) fn local_target(server: &MockModelServer) -> ModelTarget {
        let mut t = target("openai/gpt-4.1", Provider::OpenAI, &[("OPENAI_API_KEY", "test-key")]);
        t.provider.base_url = server.base_url.clone();
        t
    }

    fn frames(mut body: StreamBody) -> Vec<Frame> {
        let mut raw = Vec::new();
        body.read_to_end(&mut raw).expect("read body");
        let mut decoder = FrameDecoder::new();
        let mut out = decoder.push(&raw);
        out.extend(decoder.finish());
        out
    }

    fn request(t: &ModelTarget) -> ModelRequest {
        ModelRequest::for_role(
            &ModelRoleConfig::new("openai/gpt-4.1"),
            &t.model,
            vec![ChatMessage::user("hi")],
        )
    }

    #[test]
    fn sse_deltas_become_reply_records_then_end() {
        let server = start_mock_model_server(vec![MockHttpResponse::sse(&["hel", "lo"])]);
        let client = HttpModelClient::new(Duration::from_secs(5)).expect("client");
        let t = local_target(&server);
        let out = frames(client.open(&t, &request(&t)).expect("open"));
        assert_eq!(
            out,
            vec![
                Frame::Message(Box::new(StreamMessage::reply("hel"))),
                Frame::Message(Box::new(StreamMessage::reply("lo"))),
                Frame::Sentinel(Sentinel::End),
            ]
        );
        let sent = server.requests();
        assert!(sent[0].contains("\"model\":\"gpt-4.1\""));
        assert!(sent[0].contains("\"stream\":true"));
    }

    #[test]
    fn http_failures_are_classified() {
        let mut limited = MockHttpResponse::error(429, r#"{"error":{"message":"slow down"}}"#);
        limited.retry_after = Some("3".to_string());
        let server = start_mock_model_server(vec![limited]);
        let client = HttpModelClient::new(Duration::from_secs(5)).expect("client");
        let t = local_target(&server);
        let err = match client.open(&t, &request(&t)) {
            Ok(_) => panic!("expected failure"),
            Err(err) => err,
        };
        let model_err = err.downcast_ref::<ModelError>().expect("model error");
        assert_eq!(
            model_err,
            &ModelError::RateLimited {
                retry_after_seconds: Some(3),
                msg: "slow down".to_string()
            }
        );
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn mid_stream_provider_errors_become_model_error_records() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\ndata: {\"error\":{\"message\":\"model is currently overloaded\"}}\n\n";
        let out = frames(Box::new(SseFrameReader::new(io::Cursor::new(body.as_bytes().to_vec()))));
        assert_eq!(out.len(), 2);
        let Frame::Message(msg) = &out[1] else {
            panic!("expected message frame");
        };
        assert_eq!(msg.message_type, StreamMessageType::Error);
        assert_eq!(msg.model_error.as_ref().map(|e| e.kind.as_str()), Some("overloaded"));
    }

    #[test]
    fn eof_without_done_still_ends_the_stream() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n: keepalive\n";
        let out = frames(Box::new(SseFrameReader::new(io::Cursor::new(body.as_bytes().to_vec()))));
        assert_eq!(out.last(), Some(&Frame::Sentinel(Sentinel::End)));
    }
}
