//! Claude Max sign-in: PKCE authorization, token exchange, and refresh.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use plandex_core::models::CLAUDE_MAX_BETA_HEADER;
use plandex_errors::PlandexError;
use plandex_store::{CredentialStore, OAuthCreds};
use rand::RngCore;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
pub const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const SCOPES: &str = "org:create_api_key user:profile user:inference";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = random_token();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
            state: random_token(),
        }
    }

    pub fn authorize_url(&self) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("code", "true"),
                ("client_id", CLIENT_ID),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("redirect_uri", REDIRECT_URI),
                ("code_challenge", self.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", self.state.as_str()),
            ],
        )?;
        Ok(url.to_string())
    }

    /// The callback page shows `code#state`; the state must be ours.
    pub fn parse_pasted_code(&self, pasted: &str) -> Result<String> {
        let pasted = pasted.trim();
        let (code, state) = pasted.split_once('#').unwrap_or((pasted, ""));
        if code.is_empty() {
            bail!("no authorization code in the pasted value");
        }
        if state != self.state {
            bail!("authorization state mismatch; start the sign-in again");
        }
        Ok(code.to_string())
    }
}

fn random_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

impl TokenResponse {
    fn into_creds(self) -> OAuthCreds {
        OAuthCreds {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
        }
    }
}

pub struct ClaudeMaxAuth {
    store: Arc<CredentialStore>,
    token_url: String,
    client: Client,
    refresh_lock: Mutex<()>,
}

impl ClaudeMaxAuth {
    pub fn new(store: Arc<CredentialStore>) -> Result<Self> {
        Self::with_token_url(store, TOKEN_URL)
    }

    pub fn with_token_url(store: Arc<CredentialStore>, token_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build oauth http client")?;
        Ok(Self {
            store,
            token_url: token_url.to_string(),
            client,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn is_connected(&self) -> Result<bool> {
        Ok(self.store.claude_max()?.is_some())
    }

    fn post_token(&self, body: serde_json::Value) -> Result<(StatusCode, String)> {
        let resp = self
            .client
            .post(&self.token_url)
            .header("anthropic-beta", CLAUDE_MAX_BETA_HEADER)
            .json(&body)
            .send()
            .context("token request failed")?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        Ok((status, text))
    }

    /// Trades the pasted `code#state` for tokens and stores them.
    pub fn exchange(&self, pkce: &Pkce, pasted: &str) -> Result<OAuthCreds> {
        let code = pkce.parse_pasted_code(pasted)?;
        let (status, text) = self.post_token(json!({
            "grant_type": "authorization_code",
            "code": code,
            "state": pkce.state,
            "code_verifier": pkce.verifier,
            "redirect_uri": REDIRECT_URI,
            "client_id": CLIENT_ID,
        }))?;
        if !status.is_success() {
            bail!("token exchange failed ({status}): {text}");
        }
        let creds = serde_json::from_str::<TokenResponse>(&text)
            .context("unexpected token response")?
            .into_creds();
        self.store.set_claude_max(Some(creds.clone()))?;
        info!("connected claude max");
        Ok(creds)
    }

    fn refresh(&self, current: &OAuthCreds) -> Result<OAuthCreds> {
        let (status, text) = self.post_token(json!({
            "grant_type": "refresh_token",
            "refresh_token": current.refresh_token,
            "client_id": CLIENT_ID,
        }))?;
        if status == StatusCode::UNAUTHORIZED {
            warn!("claude max refresh rejected; clearing stored credentials");
            self.store.set_claude_max(None)?;
            return Err(anyhow!(PlandexError::AuthMissing {
                explanation: "Claude Max sign-in expired. Connect your Claude subscription again."
                    .to_string(),
            }));
        }
        if !status.is_success() {
            bail!("token refresh failed ({status}): {text}");
        }
        let creds = serde_json::from_str::<TokenResponse>(&text)
            .context("unexpected token response")?
            .into_creds();
        self.store.set_claude_max(Some(creds.clone()))?;
        info!("refreshed claude max token");
        Ok(creds)
    }

    /// A usable access token, refreshing first when it is close to expiry.
    /// Concurrent callers share one refresh.
    pub fn access_token(&self) -> Result<Option<String>> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(creds) = self.store.reload()?.claude_max else {
            return Ok(None);
        };
        if !creds.needs_refresh(Utc::now()) {
            return Ok(Some(creds.access_token));
        }
        Ok(Some(self.refresh(&creds)?.access_token))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.store.set_claude_max(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Answers each connection with the next scripted `(status, body)` and
    /// keeps the request bodies.
    pub(crate) struct TokenServer {
        pub url: String,
        pub hits: Arc<AtomicUsize>,
        pub bodies: Arc<Mutex<Vec<String>>>,
    }

    pub(crate) fn token_server(responses: Vec<(u16, String)>) -> TokenServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let (hits_t, bodies_t) = (Arc::clone(&hits), Arc::clone(&bodies));
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0_u8; 1024];
                loop {
                    let n = stream.read(&mut chunk).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(idx) = text.find("\r\n\r\n") {
                        let len = text[..idx]
                            .lines()
                            .find_map(|l| {
                                let (k, v) = l.split_once(':')?;
                                k.eq_ignore_ascii_case("content-length")
                                    .then(|| v.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if buf.len() >= idx + 4 + len {
                            bodies_t
                                .lock()
                                .expect("bodies")
                                .push(text[idx + 4..].to_string());
                            break;
                        }
                    }
                }
                hits_t.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
                let _ = stream.flush();
            }
        });
        TokenServer {
            url: format!("http://{addr}/v1/oauth/token"),
            hits,
            bodies,
        }
    }

    fn token_body(access: &str) -> String {
        json!({"access_token": access, "refresh_token": "rt-new", "expires_in": 28800}).to_string()
    }

    fn store_with(dir: &std::path::Path, creds: Option<OAuthCreds>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new(dir.join("u/o/creds.json")));
        if creds.is_some() {
            store.set_claude_max(creds).expect("seed");
        }
        store
    }

    #[test]
    fn pkce_challenge_is_s256_of_the_verifier() {
        let pkce = Pkce::generate();
        assert_eq!(
            pkce.challenge,
            URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()))
        );
        assert_eq!(pkce.verifier.len(), 43);
        let url = pkce.authorize_url().expect("url");
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", pkce.state)));
    }

    #[test]
    fn pasted_code_must_carry_our_state() {
        let pkce = Pkce::generate();
        let ok = format!("abc123#{}", pkce.state);
        assert_eq!(pkce.parse_pasted_code(&ok).expect("code"), "abc123");
        assert!(pkce.parse_pasted_code("abc123#other").is_err());
        assert!(pkce.parse_pasted_code("abc123").is_err());
    }

    #[test]
    fn exchange_stores_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = token_server(vec![(200, token_body("at-1"))]);
        let store = store_with(dir.path(), None);
        let auth = ClaudeMaxAuth::with_token_url(Arc::clone(&store), &server.url).expect("auth");
        let pkce = Pkce::generate();
        let creds = auth
            .exchange(&pkce, &format!("the-code#{}", pkce.state))
            .expect("exchange");
        assert_eq!(creds.access_token, "at-1");
        assert!(auth.is_connected().expect("connected"));
        let sent = server.bodies.lock().expect("bodies")[0].clone();
        assert!(sent.contains("\"grant_type\":\"authorization_code\""));
        assert!(sent.contains(&pkce.verifier));
    }

    #[test]
    fn fresh_tokens_are_used_without_a_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = token_server(vec![]);
        let store = store_with(
            dir.path(),
            Some(OAuthCreds {
                access_token: "at-live".into(),
                refresh_token: "rt".into(),
                expires_at: Utc::now() + Duration::hours(5),
            }),
        );
        let auth = ClaudeMaxAuth::with_token_url(store, &server.url).expect("auth");
        assert_eq!(auth.access_token().expect("token").as_deref(), Some("at-live"));
        assert_eq!(server.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_callers_share_one_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = token_server(vec![(200, token_body("at-2"))]);
        let store = store_with(
            dir.path(),
            Some(OAuthCreds {
                access_token: "at-old".into(),
                refresh_token: "rt".into(),
                expires_at: Utc::now() + Duration::minutes(30),
            }),
        );
        let auth = Arc::new(ClaudeMaxAuth::with_token_url(store, &server.url).expect("auth"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let auth = Arc::clone(&auth);
                thread::spawn(move || auth.access_token().expect("token"))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("join").as_deref(), Some("at-2"));
        }
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_refresh_clears_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = token_server(vec![(401, "{\"error\":\"invalid_grant\"}".to_string())]);
        let store = store_with(
            dir.path(),
            Some(OAuthCreds {
                access_token: "at-old".into(),
                refresh_token: "rt".into(),
                expires_at: Utc::now() - Duration::minutes(1),
            }),
        );
        let auth = ClaudeMaxAuth::with_token_url(Arc::clone(&store), &server.url).expect("auth");
        let err = auth.access_token().expect_err("expired");
        assert!(matches!(
            err.downcast_ref::<PlandexError>(),
            Some(PlandexError::AuthMissing { .. })
        ));
        assert_eq!(store.reload().expect("reload").claude_max, None);
    }
}
