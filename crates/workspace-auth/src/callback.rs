//! Loopback listener that receives the OAuth redirect
//!
//! Binds `127.0.0.1` only. The configured redirect port is tried first, then
//! the following ports up to `attempts`. One route (the redirect path) is
//! served; every other path gets a 404 page. The first request carrying a
//! `code` or an `error` resolves the session and shuts the server down.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long `stop()` waits for in-flight responses before aborting the server.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// What the browser redirect delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Consent granted; `state` is checked by the caller.
    Code {
        code: String,
        state: Option<String>,
    },
    /// Provider reported an error (e.g. `access_denied`).
    Denied {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },
}

struct CallbackState {
    sender: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
    shutdown: Arc<Notify>,
}

impl CallbackState {
    fn new(sender: oneshot::Sender<CallbackOutcome>, shutdown: Arc<Notify>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            shutdown,
        }
    }

    /// Deliver the outcome once. Returns false if already resolved.
    fn resolve(&self, outcome: CallbackOutcome) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                // Receiver may be gone if the flow already timed out
                let _ = tx.send(outcome);
                self.shutdown.notify_one();
                true
            }
            None => false,
        }
    }
}

/// A running loopback callback server for one authorization session.
pub struct CallbackListener {
    addr: SocketAddr,
    path: String,
    receiver: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown: Arc<Notify>,
    server: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind the listener and start serving.
    ///
    /// `preferred_port` 0 asks the OS for any free port.
    pub async fn bind(preferred_port: u16, path: &str, attempts: u16) -> Result<Self> {
        let listener = bind_loopback(preferred_port, attempts).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Listener(format!("reading bound address: {e}")))?;

        let (tx, rx) = oneshot::channel();
        let shutdown = Arc::new(Notify::new());
        let state = Arc::new(CallbackState::new(tx, shutdown.clone()));
        let app = callback_router(path, state);

        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "callback server error");
            }
            debug!("callback server stopped");
        });

        info!(%addr, path, "callback listener started");

        Ok(Self {
            addr,
            path: path.to_string(),
            receiver: Some(rx),
            shutdown,
            server: Some(server),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Redirect URI for the port actually bound.
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), self.path)
    }

    /// Wait for the redirect. Times out with `Authentication("timeout")`.
    pub async fn wait(&mut self, timeout: Duration) -> Result<CallbackOutcome> {
        let rx = self
            .receiver
            .take()
            .ok_or_else(|| Error::Listener("callback already awaited".into()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Listener("callback server closed".into())),
            Err(_) => Err(Error::Authentication("timeout".into())),
        }
    }

    /// Shut the server down, aborting it if it does not finish promptly.
    pub async fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(mut handle) = self.server.take()
            && tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err()
        {
            warn!("callback server did not stop in time, aborting");
            handle.abort();
            // Wait for the task to drop so the port is released on return.
            let _ = handle.await;
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn bind_loopback(preferred_port: u16, attempts: u16) -> Result<TcpListener> {
    if preferred_port == 0 {
        return TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| Error::Listener(format!("binding loopback port: {e}")));
    }

    let mut last_error = None;
    for offset in 0..attempts.max(1) {
        let Some(port) = preferred_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                if offset > 0 {
                    info!(preferred_port, port, "preferred callback port busy, using fallback");
                }
                return Ok(listener);
            }
            Err(e) => {
                debug!(port, error = %e, "callback port unavailable");
                last_error = Some(e);
            }
        }
    }

    Err(Error::Listener(format!(
        "no free port in {preferred_port}..{}: {}",
        preferred_port.saturating_add(attempts.max(1)),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn callback_router(path: &str, state: Arc<CallbackState>) -> Router {
    Router::new()
        .route(path, get(callback_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

async fn callback_handler(
    State(state): State<Arc<CallbackState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut code = None;
    let mut returned_state = None;
    let mut error = None;
    let mut description = None;

    if let Some(query) = query.as_deref() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "code" => code = Some(value.into_owned()),
                "state" => returned_state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    let (outcome, page) = match (code, error) {
        (_, Some(error)) => {
            let shown = description.clone().unwrap_or_else(|| error.clone());
            let page = error_page(&shown);
            (
                CallbackOutcome::Denied {
                    error,
                    description,
                    state: returned_state,
                },
                page,
            )
        }
        (Some(code), None) => (
            CallbackOutcome::Code {
                code,
                state: returned_state,
            },
            SUCCESS_PAGE.to_string(),
        ),
        (None, None) => {
            debug!("callback request without code or error");
            return html_ok(error_page("The request did not include an authorization code."));
        }
    };

    if state.resolve(outcome) {
        info!("authorization callback received");
        html_ok(page)
    } else {
        html_ok(COMPLETED_PAGE.to_string())
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE)).into_response()
}

fn html_ok(body: String) -> Response {
    (StatusCode::OK, [(header::CONNECTION, "close")], Html(body)).into_response()
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const SUCCESS_PAGE: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Authentication successful</title></head>
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">
<h1>Authentication successful</h1>
<p>You can close this window and return to the application.</p>
</body></html>";

const COMPLETED_PAGE: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Already completed</title></head>
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">
<h1>Authorization already completed</h1>
<p>This sign-in request has already been handled. You can close this window.</p>
</body></html>";

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Not found</title></head>
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">
<h1>Not found</h1>
</body></html>";

fn error_page(message: &str) -> String {
    format!(
        "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Authentication failed</title></head>
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">
<h1>Authentication failed</h1>
<p>{}</p>
<p>You can close this window and try again.</p>
</body></html>",
        escape_html(message)
    )
}
