use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppEnv;
use crate::error::{RelayError, Result};
use crate::relay::Relay;
use crate::ClientId;

/// Name of the identity cookie.
pub const COOKIE_NAME: &str = "clientId";
/// Identity cookie lifetime: 24 hours.
pub const COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Embedded single-page chat client.
pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Chat Relay</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{background:#0d1117;color:#c9d1d9;font-family:system-ui,sans-serif;display:flex;justify-content:center;padding:24px}
main{width:100%;max-width:640px;display:flex;flex-direction:column;gap:12px}
h1{font-size:1.2rem;color:#58a6ff;text-align:center}
#log{border:1px solid #30363d;border-radius:8px;padding:12px;height:60vh;overflow-y:auto;display:flex;flex-direction:column;gap:8px}
.msg{padding:8px 12px;border-radius:8px;max-width:80%;white-space:pre-wrap;word-wrap:break-word;line-height:1.5}
.user{align-self:flex-end;background:#1f6feb;color:#fff}
.ai{align-self:flex-start;background:#161b22;border:1px solid #30363d}
.thinking{color:#8b949e;font-style:italic}
form{display:flex;gap:8px}
input{flex:1;background:#0d1117;border:1px solid #30363d;color:#c9d1d9;padding:8px 10px;border-radius:6px;font-size:.95rem}
input:focus{outline:none;border-color:#58a6ff}
button{background:#238636;color:#fff;border:none;border-radius:6px;padding:8px 16px;cursor:pointer}
</style>
</head>
<body>
<main>
  <h1>Chat with AI</h1>
  <div id="log"></div>
  <form id="ask"><input id="q" type="text" placeholder="Ask a question..." autocomplete="off"><button type="submit">Send</button></form>
</main>
<script>
const log=document.getElementById('log');
let current=null;
function bubble(cls,text){const d=document.createElement('div');d.className='msg '+cls;d.textContent=text;log.appendChild(d);log.scrollTop=log.scrollHeight;return d}
function md(text){return text.replace(/\*\*(.+?)\*\*/g,'$1')}
document.getElementById('ask').onsubmit=async e=>{
  e.preventDefault();
  const input=document.getElementById('q');const question=input.value.trim();
  if(!question)return;
  input.value='';
  if(current){current.ctrl.abort();current.node.remove();current=null}
  bubble('user',question);
  const ask={ctrl:new AbortController(),node:bubble('ai thinking','Thinking...'),buf:''};
  current=ask;
  try{
    const res=await fetch('/stream',{method:'POST',credentials:'include',headers:{'Content-Type':'application/json'},body:JSON.stringify({question}),signal:ask.ctrl.signal});
    const reader=res.body.getReader();const dec=new TextDecoder();let pending='';
    for(;;){
      const {value,done}=await reader.read();if(done)break;
      pending+=dec.decode(value,{stream:true});
      let i;while((i=pending.indexOf('\n\n'))>=0){
        const frame=pending.slice(0,i);pending=pending.slice(i+2);
        if(!frame.startsWith('data:'))continue;
        const ev=JSON.parse(frame.slice(5));
        if(ev.type==='START_THINKING'){ask.node.textContent='Thinking...'}
        else if(ev.type==='AI_RESPONSE'){ask.buf+=ev.message;ask.node.classList.remove('thinking');ask.node.textContent=md(ask.buf)}
        else if(ev.type==='STOP_THINKING'){if(!ask.buf)ask.node.remove();if(current===ask)current=null}
      }
    }
  }catch(err){if(err.name!=='AbortError'){ask.node.textContent='Connection lost.'}}
};
</script>
</body>
</html>"##;

/// Per-server HTTP settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub env: AppEnv,
    /// Origins allowed to call `/stream` with credentials.
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    /// Whether `origin` is whitelisted. A trailing slash is ignored on both
    /// sides.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin)
    }
}

/// Shared by every connection.
pub struct AppState {
    pub relay: Relay,
    pub config: ServerConfig,
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Result<usize> {
        match self.header("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| RelayError::BadRequest(format!("invalid Content-Length: {v}"))),
            None => Ok(0),
        }
    }
}

/// Parse a request head. Returns the request (without body) and the number
/// of bytes the head occupied, or `None` while the head is incomplete.
pub fn parse_head(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RelayError::BadRequest(format!("malformed request: {e}"))),
    };

    let target = req.path.unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();

    Ok(Some((
        HttpRequest {
            method: req.method.unwrap_or("").to_string(),
            path,
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            body: Vec::new(),
        },
        head_len,
    )))
}

/// Read one request (head and `Content-Length` body) from `reader`.
///
/// Returns `Ok(None)` if the peer closes before sending a complete head.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (mut request, head_len) = loop {
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(RelayError::BadRequest("request head too large".into()));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let content_length = request.content_length()?;
    if content_length > MAX_BODY_BYTES {
        return Err(RelayError::BadRequest("request body too large".into()));
    }

    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::BadRequest("body shorter than Content-Length".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    request.body = body;

    Ok(Some(request))
}

#[derive(Debug, Deserialize)]
struct QuestionRequest {
    question: String,
}

/// Extract the trimmed question from a `{"question": ...}` body.
pub fn parse_question(body: &[u8]) -> Result<String> {
    let req: QuestionRequest = serde_json::from_slice(body).map_err(|e| {
        RelayError::BadRequest(format!("expected {{\"question\": string}}: {e}"))
    })?;
    let question = req.question.trim();
    if question.is_empty() {
        return Err(RelayError::BadRequest("question must not be empty".into()));
    }
    Ok(question.to_string())
}

// ---------------------------------------------------------------------------
// Identity and CORS
// ---------------------------------------------------------------------------

/// Value of cookie `name` in a `Cookie` header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Identity tokens we hand out are UUIDs; anything odd is replaced.
fn plausible_identity(value: &str) -> bool {
    value.len() <= 128 && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `Set-Cookie` value issuing `client` as the identity for `env`.
pub fn identity_cookie(client: &ClientId, env: AppEnv) -> String {
    let attrs = if env.is_prod() {
        "SameSite=None; Secure"
    } else {
        "SameSite=Lax"
    };
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; {}",
        COOKIE_NAME, client, COOKIE_MAX_AGE_SECS, attrs
    )
}

/// The request's client identity, plus a `Set-Cookie` value when a new one
/// had to be issued.
pub fn resolve_client(request: &HttpRequest, env: AppEnv) -> (ClientId, Option<String>) {
    let existing = request
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        .find_map(|(_, v)| cookie_value(v, COOKIE_NAME))
        .filter(|v| plausible_identity(v));

    match existing {
        Some(value) => (ClientId::from(value), None),
        None => {
            let client = ClientId::generate();
            let cookie = identity_cookie(&client, env);
            (client, Some(cookie))
        }
    }
}

/// Extra response header lines (each ending in CRLF) for CORS and identity.
fn common_headers(request: &HttpRequest, config: &ServerConfig, set_cookie: Option<&str>) -> String {
    let mut headers = String::new();
    if let Some(origin) = request.header("origin") {
        if config.origin_allowed(origin) {
            headers.push_str(&format!("Access-Control-Allow-Origin: {}\r\nVary: Origin\r\n", origin));
        }
    }
    headers.push_str("Access-Control-Allow-Credentials: true\r\n");
    if let Some(cookie) = set_cookie {
        headers.push_str(&format!("Set-Cookie: {}\r\n", cookie));
    }
    headers
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept connections on `listener` forever.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state).await {
                warn!(%addr, error = %e, "connection error");
            }
        });
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    content_type: &str,
    extra_headers: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        status,
        content_type,
        body.len(),
        extra_headers
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    extra_headers: &str,
    message: &str,
) -> Result<()> {
    let body = serde_json::json!({ "error": message }).to_string();
    write_response(writer, status, "application/json", extra_headers, body.as_bytes()).await
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let request = match read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(RelayError::BadRequest(msg)) => {
            return write_error(&mut writer, "400 Bad Request", "", &msg).await;
        }
        Err(e) => return Err(e),
    };
    debug!(%addr, method = %request.method, path = %request.path, "request");

    let (client, set_cookie) = resolve_client(&request, state.config.env);
    if set_cookie.is_some() {
        info!(%client, "assigned new client id");
    }
    let headers = common_headers(&request, &state.config, set_cookie.as_deref());

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => {
            write_response(
                &mut writer,
                "200 OK",
                "text/html; charset=utf-8",
                &headers,
                INDEX_HTML.as_bytes(),
            )
            .await
        }
        ("OPTIONS", "/stream") => {
            let preflight = format!(
                "{}Access-Control-Allow-Methods: POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nAccess-Control-Max-Age: 600\r\n",
                headers
            );
            write_response(&mut writer, "204 No Content", "text/plain", &preflight, b"").await
        }
        ("POST", "/stream") => match parse_question(&request.body) {
            Ok(question) => stream_answer(reader, writer, &state, client, question, &headers).await,
            Err(e) => {
                debug!(%client, error = %e, "rejected question");
                write_error(&mut writer, "400 Bad Request", &headers, &e.to_string()).await
            }
        },
        (_, "/stream") => {
            let allow = format!("{}Allow: POST, OPTIONS\r\n", headers);
            write_error(&mut writer, "405 Method Not Allowed", &allow, "method not allowed").await
        }
        _ => write_error(&mut writer, "404 Not Found", &headers, "not found").await,
    }
}

/// Relay one question as an SSE response.
///
/// The socket's read half is watched while events flow: EOF or a read error
/// means the client went away, which drops the event receiver and so cancels
/// the generation.
async fn stream_answer(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    state: &AppState,
    client: ClientId,
    question: String,
    extra_headers: &str,
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n{}\r\n",
        extra_headers
    );
    writer.write_all(head.as_bytes()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = state.relay.clone();
    let relay_client = client.clone();
    let task =
        tokio::spawn(async move { relay.handle_question(&relay_client, &question, tx).await });

    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let frame = event.to_sse_frame()?;
                    if writer.write_all(frame.as_bytes()).await.is_err() {
                        debug!(%client, "write failed; client gone");
                        break;
                    }
                }
                None => break,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => {
                    info!(%client, "request closed by client");
                    break;
                }
                Ok(_) => {}
            },
        }
    }
    drop(rx);

    match task.await {
        Ok(outcome) => debug!(%client, %outcome, "stream closed"),
        Err(e) => warn!(%client, error = %e, "relay task panicked"),
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_headers(headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "POST".into(),
            path: "/stream".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_parse_head_complete() {
        let raw = b"POST /stream?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\n{}";
        let (req, len) = parse_head(raw).expect("ok").expect("complete");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/stream");
        assert_eq!(req.header("content-length"), Some("2"));
        assert_eq!(len, raw.len() - 2);
    }

    #[test]
    fn test_parse_head_partial() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: a\r\n").expect("ok").is_none());
    }

    #[test]
    fn test_parse_head_garbage_is_bad_request() {
        assert!(matches!(
            parse_head(b"\x00\x01 nonsense\r\n\r\n"),
            Err(RelayError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_reads_body() {
        let raw: &[u8] = b"POST /stream HTTP/1.1\r\nContent-Length: 21\r\n\r\n{\"question\":\"hello\"}\n";
        let mut reader = raw;
        let req = read_request(&mut reader).await.expect("ok").expect("request");
        assert_eq!(req.body.len(), 21);
        assert_eq!(parse_question(&req.body).expect("question"), "hello");
    }

    #[tokio::test]
    async fn test_read_request_eof_before_head() {
        let mut reader: &[u8] = b"GET / HTT";
        assert!(read_request(&mut reader).await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn test_read_request_short_body_is_bad_request() {
        let mut reader: &[u8] = b"POST /stream HTTP/1.1\r\nContent-Length: 50\r\n\r\n{}";
        assert!(matches!(
            read_request(&mut reader).await,
            Err(RelayError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_question_trims() {
        assert_eq!(parse_question(br#"{"question":"  Q  "}"#).expect("ok"), "Q");
    }

    #[test]
    fn test_parse_question_rejects_blank_and_malformed() {
        assert!(parse_question(br#"{"question":"   "}"#).is_err());
        assert!(parse_question(br#"{"q":"x"}"#).is_err());
        assert!(parse_question(b"not json").is_err());
    }

    #[test]
    fn test_cookie_value_finds_named_cookie() {
        assert_eq!(cookie_value("a=1; clientId=abc-123; b=2", "clientId"), Some("abc-123"));
        assert_eq!(cookie_value("a=1", "clientId"), None);
        assert_eq!(cookie_value("clientId=", "clientId"), None);
    }

    #[test]
    fn test_identity_cookie_dev_is_lax() {
        let cookie = identity_cookie(&ClientId::from("abc"), AppEnv::Dev);
        assert_eq!(cookie, "clientId=abc; Max-Age=86400; Path=/; HttpOnly; SameSite=Lax");
    }

    #[test]
    fn test_identity_cookie_prod_is_secure_none() {
        let cookie = identity_cookie(&ClientId::from("abc"), AppEnv::Prod);
        assert!(cookie.ends_with("SameSite=None; Secure"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn test_resolve_client_reuses_cookie() {
        let req = request_with_headers(&[("Cookie", "clientId=1234-abcd")]);
        let (client, set_cookie) = resolve_client(&req, AppEnv::Dev);
        assert_eq!(client.as_str(), "1234-abcd");
        assert!(set_cookie.is_none());
    }

    #[test]
    fn test_resolve_client_issues_new_when_missing() {
        let (client, set_cookie) = resolve_client(&request_with_headers(&[]), AppEnv::Dev);
        let cookie = set_cookie.expect("cookie issued");
        assert!(cookie.starts_with(&format!("clientId={};", client)));
    }

    #[test]
    fn test_resolve_client_replaces_implausible_cookie() {
        let req = request_with_headers(&[("cookie", "clientId=<script>")]);
        let (client, set_cookie) = resolve_client(&req, AppEnv::Dev);
        assert_ne!(client.as_str(), "<script>");
        assert!(set_cookie.is_some());
    }

    #[test]
    fn test_origin_allowed_ignores_trailing_slash() {
        let config = ServerConfig {
            env: AppEnv::Dev,
            allowed_origins: vec!["https://chat.example.com/".into()],
        };
        assert!(config.origin_allowed("https://chat.example.com"));
        assert!(!config.origin_allowed("https://evil.example.com"));
    }

    #[test]
    fn test_common_headers_echo_allowed_origin_only() {
        let config = ServerConfig {
            env: AppEnv::Dev,
            allowed_origins: vec!["http://localhost:5173".into()],
        };
        let allowed = request_with_headers(&[("Origin", "http://localhost:5173")]);
        let h = common_headers(&allowed, &config, None);
        assert!(h.contains("Access-Control-Allow-Origin: http://localhost:5173\r\n"));
        assert!(h.contains("Access-Control-Allow-Credentials: true\r\n"));

        let denied = request_with_headers(&[("Origin", "http://other.test")]);
        let h = common_headers(&denied, &config, Some("clientId=x"));
        assert!(!h.contains("Allow-Origin"));
        assert!(h.contains("Set-Cookie: clientId=x\r\n"));
    }

    #[test]
    fn test_index_html_posts_to_stream() {
        assert!(INDEX_HTML.contains("fetch('/stream'"));
        assert!(INDEX_HTML.contains("STOP_THINKING"));
    }
}
