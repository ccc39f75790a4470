use anyhow::{Context as _, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, Utc};
use plandex_core::{
    ApiConfig, BaseModel, Branch, Context, ConvoMessage, ConvoSummary, CurrentPlanState,
    ModelPack, Plan, PlanConfig, PlanFileResult, PlanLogEntry, Project,
};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::error::Error as _;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::types::*;
use crate::{PlanApi, StreamBody};

const NETWORK_RETRY_BASE_MS: u64 = 1_000;

/// Blocking JSON client for the plan server.
pub struct HttpApiClient {
    host: String,
    client: Client,
    stream_client: Client,
    auth: Option<ClientAuth>,
    max_retries: u8,
    retry_base_ms: u64,
}

impl HttpApiClient {
    pub fn new(cfg: &ApiConfig, auth: Option<ClientAuth>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        // streams stay open for the whole reply
        let stream_client = Client::builder().build()?;
        let host = auth
            .as_ref()
            .map(|a| a.host.trim())
            .filter(|h| !h.is_empty() && std::env::var("PLANDEX_API_HOST").is_err())
            .unwrap_or(&cfg.host)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            host,
            client,
            stream_client,
            auth,
            max_retries: cfg.max_retries,
            retry_base_ms: cfg.retry_base_ms,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let Some(auth) = &self.auth else {
            return Ok(builder);
        };
        let header = serde_json::to_vec(&AuthHeader {
            token: &auth.token,
            org_id: &auth.org_id,
        })?;
        Ok(builder.bearer_auth(BASE64.encode(header)))
    }

    /// Sends with bounded retries and returns the raw body of a 2xx response.
    fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<String> {
        let url = self.url(path);
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.max_retries {
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            debug!(%method, path, attempt, "api request");
            match self.authorize(builder)?.send() {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let text = resp.text()?;
                    if status.is_success() {
                        return Ok(text);
                    }
                    let err = ApiError::from_response(status.as_u16(), &text);
                    if should_retry_status(&method, status) && attempt < self.max_retries {
                        warn!(%method, path, status = status.as_u16(), attempt, "retrying api request");
                        thread::sleep(retry_delay_ms(self.retry_base_ms, attempt, retry_after));
                        last_err = Some(err.into());
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    return Err(err.into());
                }
                Err(e) => {
                    let retry = should_retry_transport_error(&e);
                    last_err = Some(format_transport_error(&e));
                    if retry && attempt < self.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("{method} {path} failed without detailed error")))
    }

    fn call<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> Result<T> {
        let text = self.send(method.clone(), path, body)?;
        serde_json::from_str(&text).with_context(|| format!("invalid response from {method} {path}"))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(Method::GET, path, None)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.call(Method::POST, path, Some(&body))
    }

    fn exec<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> Result<()> {
        let body = body.map(serde_json::to_value).transpose()?;
        self.send(method, path, body.as_ref())?;
        Ok(())
    }

    fn open_stream(&self, method: Method, path: &str, body: Option<&Value>) -> Result<StreamBody> {
        let mut builder = self.stream_client.request(method.clone(), self.url(path));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = self
            .authorize(builder)?
            .send()
            .map_err(|e| format_transport_error(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), &text).into());
        }
        debug!(%method, path, "stream connected");
        Ok(Box::new(resp))
    }
}

fn project_query(project_ids: &[String]) -> String {
    format!("projectIds={}", project_ids.join(","))
}

#[derive(Deserialize)]
struct BodyResponse {
    body: String,
}

impl PlanApi for HttpApiClient {
    fn list_projects(&self) -> Result<Vec<Project>> {
        self.get("/projects")
    }

    fn create_project(&self, req: &CreateProjectRequest) -> Result<CreateProjectResponse> {
        self.post("/projects", req)
    }

    fn list_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>> {
        self.get(&format!("/plans?{}", project_query(project_ids)))
    }

    fn list_archived_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>> {
        self.get(&format!("/plans/archive?{}", project_query(project_ids)))
    }

    fn list_plans_running(&self, project_ids: &[String]) -> Result<ListPlansRunningResponse> {
        self.get(&format!("/plans/ps?{}", project_query(project_ids)))
    }

    fn create_plan(&self, project_id: &str, req: &CreatePlanRequest) -> Result<CreatePlanResponse> {
        self.post(&format!("/projects/{project_id}/plans"), req)
    }

    fn get_plan(&self, plan_id: &str) -> Result<Plan> {
        self.get(&format!("/plans/{plan_id}"))
    }

    fn delete_plan(&self, plan_id: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/plans/{plan_id}"), None)
    }

    fn delete_all_plans(&self, project_id: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/projects/{project_id}/plans"), None)
    }

    fn rename_plan(&self, plan_id: &str, name: &str) -> Result<()> {
        self.exec(
            Method::PATCH,
            &format!("/plans/{plan_id}/rename"),
            Some(&RenamePlanRequest {
                name: name.to_string(),
            }),
        )
    }

    fn archive_plan(&self, plan_id: &str) -> Result<()> {
        self.exec::<Value>(Method::PATCH, &format!("/plans/{plan_id}/archive"), None)
    }

    fn unarchive_plan(&self, plan_id: &str) -> Result<()> {
        self.exec::<Value>(Method::PATCH, &format!("/plans/{plan_id}/unarchive"), None)
    }

    fn list_branches(&self, plan_id: &str) -> Result<Vec<Branch>> {
        self.get(&format!("/plans/{plan_id}/branches"))
    }

    fn create_branch(
        &self,
        plan_id: &str,
        from_branch: &str,
        req: &CreateBranchRequest,
    ) -> Result<()> {
        self.exec(
            Method::POST,
            &format!("/plans/{plan_id}/{from_branch}/branches"),
            Some(req),
        )
    }

    fn delete_branch(&self, plan_id: &str, branch: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/plans/{plan_id}/branches/{branch}"), None)
    }

    fn list_context(&self, plan_id: &str, branch: &str) -> Result<Vec<Context>> {
        self.get(&format!("/plans/{plan_id}/{branch}/context"))
    }

    fn get_context_body(&self, plan_id: &str, branch: &str, context_id: &str) -> Result<String> {
        let resp: BodyResponse =
            self.get(&format!("/plans/{plan_id}/{branch}/context/{context_id}/body"))?;
        Ok(resp.body)
    }

    fn load_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &LoadContextRequest,
    ) -> Result<LoadContextResponse> {
        self.post(&format!("/plans/{plan_id}/{branch}/context"), req)
    }

    fn update_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &UpdateContextRequest,
    ) -> Result<UpdateContextResponse> {
        let body = serde_json::to_value(req)?;
        self.call(
            Method::PUT,
            &format!("/plans/{plan_id}/{branch}/context"),
            Some(&body),
        )
    }

    fn delete_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &DeleteContextRequest,
    ) -> Result<DeleteContextResponse> {
        let body = serde_json::to_value(req)?;
        self.call(
            Method::DELETE,
            &format!("/plans/{plan_id}/{branch}/context"),
            Some(&body),
        )
    }

    fn auto_load_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &LoadContextRequest,
    ) -> Result<LoadContextResponse> {
        self.post(&format!("/plans/{plan_id}/{branch}/auto_load_context"), req)
    }

    fn get_file_map(&self, req: &GetFileMapRequest) -> Result<GetFileMapResponse> {
        self.post("/file_map", req)
    }

    fn list_convo(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoMessage>> {
        self.get(&format!("/plans/{plan_id}/{branch}/convo"))
    }

    fn list_convo_summaries(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoSummary>> {
        self.get(&format!("/plans/{plan_id}/{branch}/convo/summaries"))
    }

    fn get_current_plan_state(&self, plan_id: &str, branch: &str) -> Result<CurrentPlanState> {
        self.get(&format!("/plans/{plan_id}/{branch}/current_plan"))
    }

    fn get_current_plan_state_at_sha(
        &self,
        plan_id: &str,
        branch: &str,
        sha: &str,
    ) -> Result<CurrentPlanState> {
        self.get(&format!("/plans/{plan_id}/{branch}/current_plan/{sha}"))
    }

    fn get_plan_diffs(&self, plan_id: &str, branch: &str, plain: bool) -> Result<String> {
        self.send(
            Method::GET,
            &format!("/plans/{plan_id}/{branch}/diffs?plain={plain}"),
            None,
        )
    }

    fn list_logs(&self, plan_id: &str, branch: &str) -> Result<Vec<PlanLogEntry>> {
        self.get(&format!("/plans/{plan_id}/{branch}/logs"))
    }

    fn rewind_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &RewindPlanRequest,
    ) -> Result<RewindPlanResponse> {
        let body = serde_json::to_value(req)?;
        self.call(
            Method::PATCH,
            &format!("/plans/{plan_id}/{branch}/rewind"),
            Some(&body),
        )
    }

    fn apply_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &ApplyPlanRequest,
    ) -> Result<ApplyPlanResponse> {
        let body = serde_json::to_value(req)?;
        self.call(
            Method::PATCH,
            &format!("/plans/{plan_id}/{branch}/apply"),
            Some(&body),
        )
    }

    fn reject_all_changes(&self, plan_id: &str, branch: &str) -> Result<()> {
        self.exec::<Value>(
            Method::PATCH,
            &format!("/plans/{plan_id}/{branch}/reject_all"),
            None,
        )
    }

    fn reject_files(&self, plan_id: &str, branch: &str, req: &RejectFilesRequest) -> Result<()> {
        self.exec(
            Method::PATCH,
            &format!("/plans/{plan_id}/{branch}/reject_files"),
            Some(req),
        )
    }

    fn put_plan_file_results(
        &self,
        plan_id: &str,
        branch: &str,
        results: &[PlanFileResult],
    ) -> Result<()> {
        self.exec(
            Method::PUT,
            &format!("/plans/{plan_id}/{branch}/results"),
            Some(&results),
        )
    }

    fn tell_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &TellPlanRequest,
    ) -> Result<Option<StreamBody>> {
        let path = format!("/plans/{plan_id}/{branch}/tell");
        let body = serde_json::to_value(req)?;
        if req.connect_stream {
            return self.open_stream(Method::POST, &path, Some(&body)).map(Some);
        }
        self.send(Method::POST, &path, Some(&body))?;
        Ok(None)
    }

    fn build_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &BuildPlanRequest,
    ) -> Result<Option<StreamBody>> {
        let path = format!("/plans/{plan_id}/{branch}/build");
        let body = serde_json::to_value(req)?;
        if req.connect_stream {
            return self.open_stream(Method::PATCH, &path, Some(&body)).map(Some);
        }
        self.send(Method::PATCH, &path, Some(&body))?;
        Ok(None)
    }

    fn connect_plan(&self, plan_id: &str, branch: &str) -> Result<StreamBody> {
        self.open_stream(Method::PATCH, &format!("/plans/{plan_id}/{branch}/connect"), None)
    }

    fn stop_plan(&self, plan_id: &str, branch: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/plans/{plan_id}/{branch}/stop"), None)
    }

    fn get_settings(&self, plan_id: &str, branch: &str) -> Result<PlanSettings> {
        self.get(&format!("/plans/{plan_id}/{branch}/settings"))
    }

    fn update_settings(&self, plan_id: &str, branch: &str, settings: &PlanSettings) -> Result<()> {
        self.exec(
            Method::PUT,
            &format!("/plans/{plan_id}/{branch}/settings"),
            Some(settings),
        )
    }

    fn get_default_settings(&self) -> Result<PlanSettings> {
        self.get("/default_settings")
    }

    fn update_default_settings(&self, settings: &PlanSettings) -> Result<()> {
        self.exec(Method::PUT, "/default_settings", Some(settings))
    }

    fn get_plan_config(&self, plan_id: &str) -> Result<PlanConfig> {
        self.get(&format!("/plans/{plan_id}/config"))
    }

    fn update_plan_config(&self, plan_id: &str, config: &PlanConfig) -> Result<()> {
        self.exec(
            Method::PUT,
            &format!("/plans/{plan_id}/config"),
            Some(&json!({ "config": config })),
        )
    }

    fn get_default_plan_config(&self) -> Result<PlanConfig> {
        self.get("/default_plan_config")
    }

    fn update_default_plan_config(&self, config: &PlanConfig) -> Result<()> {
        self.exec(
            Method::PUT,
            "/default_plan_config",
            Some(&json!({ "config": config })),
        )
    }

    fn list_custom_models(&self) -> Result<Vec<BaseModel>> {
        self.get("/custom_models")
    }

    fn create_custom_model(&self, model: &BaseModel) -> Result<()> {
        self.exec(Method::POST, "/custom_models", Some(model))
    }

    fn update_custom_model(&self, model: &BaseModel) -> Result<()> {
        self.exec(
            Method::PUT,
            &format!("/custom_models/{}", model.model_id),
            Some(model),
        )
    }

    fn delete_custom_model(&self, model_id: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/custom_models/{model_id}"), None)
    }

    fn update_custom_models_input(&self, input: &CustomModelsInput) -> Result<()> {
        self.exec(Method::PUT, "/custom_models_input", Some(input))
    }

    fn list_custom_providers(&self) -> Result<Vec<CustomProvider>> {
        self.get("/custom_providers")
    }

    fn create_custom_provider(&self, provider: &CustomProvider) -> Result<()> {
        self.exec(Method::POST, "/custom_providers", Some(provider))
    }

    fn delete_custom_provider(&self, provider_id: &str) -> Result<()> {
        self.exec::<Value>(
            Method::DELETE,
            &format!("/custom_providers/{provider_id}"),
            None,
        )
    }

    fn list_model_packs(&self) -> Result<Vec<ModelPack>> {
        self.get("/model_sets")
    }

    fn create_model_pack(&self, pack: &ModelPack) -> Result<()> {
        self.exec(Method::POST, "/model_sets", Some(pack))
    }

    fn update_model_pack(&self, pack: &ModelPack) -> Result<()> {
        self.exec(Method::PUT, &format!("/model_sets/{}", pack.id), Some(pack))
    }

    fn delete_model_pack(&self, pack_id: &str) -> Result<()> {
        self.exec::<Value>(Method::DELETE, &format!("/model_sets/{pack_id}"), None)
    }

    fn get_usage_summary(&self) -> Result<UsageSummary> {
        self.get("/billing/usage")
    }
}

fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host");

    if err.is_timeout() {
        anyhow!("Request timed out. The Plandex server did not respond in time.")
    } else if is_dns {
        anyhow!("DNS resolution failed. Could not resolve the Plandex server hostname.")
    } else if err.is_connect() {
        anyhow!(
            "Connection refused. Could not reach the Plandex server. \
             Check PLANDEX_API_HOST and your network connection."
        )
    } else {
        anyhow!("Network error: {err}")
    }
}

/// Writes are only retried on statuses where the server did no work.
fn should_retry_status(method: &Method, status: StatusCode) -> bool {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => true,
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => method == Method::GET,
        _ => false,
    }
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

pub fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

pub fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorType;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        body: String,
        retry_after: Option<String>,
    }

    impl MockHttpResponse {
        fn ok(body: &str) -> Self {
            Self {
                status: 200,
                body: body.to_string(),
                retry_after: None,
            }
        }
    }

    struct MockServer {
        host: String,
        request_count: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<String>>>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockServer {
        fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("requests").clone()
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(responses: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener.set_nonblocking(true).expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_thread = Arc::clone(&request_count);
        let requests = Arc::new(Mutex::new(Vec::new()));
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
                        let raw = consume_http_request(&mut stream).unwrap_or_default();
                        requests_thread.lock().expect("requests").push(raw);
                        let idx = request_count_thread.fetch_add(1, Ordering::SeqCst);
                        let selected = responses
                            .get(idx)
                            .cloned()
                            .or_else(|| responses.last().cloned())
                            .expect("scripted response");
                        let status_text = match selected.status {
                            200 => "OK",
                            403 => "Forbidden",
                            429 => "Too Many Requests",
                            500 => "Internal Server Error",
                            503 => "Service Unavailable",
                            _ => "Error",
                        };
                        let mut headers = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                            selected.status,
                            status_text,
                            selected.body.len()
                        );
                        if let Some(retry_after) = selected.retry_after {
                            headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
                        }
                        headers.push_str("\r\n");
                        let _ = stream.write_all(format!("{headers}{}", selected.body).as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            host: format!("http://{addr}"),
            request_count,
            requests,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<String> {
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
        while buffer.len() < header_len + content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(String::from_utf8_lossy(&buffer).to_string())
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

    fn client_for(server: &MockServer, auth: Option<ClientAuth>) -> HttpApiClient {
        let cfg = ApiConfig {
            host: server.host.clone(),
            timeout_seconds: 5,
            max_retries: 2,
            retry_base_ms: 1,
        };
        HttpApiClient::new(&cfg, auth).expect("client")
    }

    #[test]
    fn get_retries_transient_status_then_succeeds() {
        let server = start_mock_server(vec![
            MockHttpResponse {
                status: 503,
                body: r#"{"type":"other","status":503,"msg":"busy"}"#.to_string(),
                retry_after: Some("0".to_string()),
            },
            MockHttpResponse::ok(r#"[{"id":"p1","name":"demo"}]"#),
        ]);
        let client = client_for(&server, None);
        let projects = client.list_projects().expect("projects");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "demo");
        assert_eq!(server.request_count(), 2);
    }

    #[test]
    fn structured_errors_surface_as_api_error() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 403,
            body: r#"{"type":"trial_messages_exceeded","status":403,"msg":"upgrade","trialMessagesExceededError":{"maxReplies":20}}"#.to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server, None);
        let err = client.get_plan("p1").expect_err("forbidden");
        let api = crate::api_error(&err).expect("api error");
        assert_eq!(api.error_type, ApiErrorType::TrialMessagesExceeded);
        assert_eq!(err.to_string(), "403 Error: upgrade");
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn writes_are_not_retried_on_internal_errors() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 500,
            body: "boom".to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server, None);
        let err = client
            .create_project(&CreateProjectRequest {
                name: "x".to_string(),
            })
            .expect_err("server error");
        assert!(err.to_string().contains("boom"));
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn auth_header_is_base64_json_of_token_and_org() {
        let server = start_mock_server(vec![MockHttpResponse::ok("[]")]);
        let auth = ClientAuth {
            user_id: "u1".to_string(),
            org_id: "o1".to_string(),
            token: "secret".to_string(),
            email: String::new(),
            host: String::new(),
        };
        let client = client_for(&server, Some(auth));
        client.list_branches("plan-1").expect("branches");
        let raw = server.requests().pop().expect("request");
        assert!(raw.starts_with("GET /plans/plan-1/branches "), "{raw}");
        let token_line = raw
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("authorization:"))
            .expect("auth header");
        let encoded = token_line.split("Bearer ").nth(1).expect("bearer").trim();
        let decoded: Value =
            serde_json::from_slice(&BASE64.decode(encoded).expect("base64")).expect("json");
        assert_eq!(decoded, json!({"token": "secret", "orgId": "o1"}));
    }

    #[test]
    fn tell_stream_body_is_readable() {
        let server = start_mock_server(vec![MockHttpResponse::ok("hello<MSG_SEP><END><MSG_SEP>")]);
        let client = client_for(&server, None);
        let mut body = client
            .tell_plan(
                "p1",
                "main",
                &TellPlanRequest {
                    prompt: "do it".to_string(),
                    connect_stream: true,
                    ..TellPlanRequest::default()
                },
            )
            .expect("tell")
            .expect("stream");
        let mut text = String::new();
        body.read_to_string(&mut text).expect("read");
        assert_eq!(text, "hello<MSG_SEP><END><MSG_SEP>");
    }

    #[test]
    fn retry_delay_prefers_retry_after() {
        assert_eq!(retry_delay_ms(400, 0, Some(2)), Duration::from_secs(2));
        assert_eq!(retry_delay_ms(400, 2, None), Duration::from_millis(1600));
        assert_eq!(retry_delay_ms(1, 0, None), Duration::from_millis(100));
    }
}
