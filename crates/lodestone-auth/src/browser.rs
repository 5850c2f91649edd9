use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::client::MicrosoftClient;
use crate::errors::{AuthError, Result};
use crate::flow::{MicrosoftFlow, SignInContext};
use crate::opener::{UrlOpener, open_or_warn};
use crate::pkce;
use crate::session::MicrosoftGrant;

const SUCCESS_PAGE: &str = "<html><head><title>Signed in</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding: 50px;\">\
<h1>Microsoft sign-in complete</h1><p>You can close this window and return to the launcher.</p>\
</body></html>";

/// How long a connection may take to send its request head
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the request line plus headers
const MAX_REQUEST_BYTES: u64 = 8 * 1024;

/// Interactive authorization code flow with a loopback redirect
#[derive(Debug, Clone)]
pub struct BrowserAuthenticator {
    client: MicrosoftClient,
    opener: Arc<dyn UrlOpener>,
    port: u16,
    timeout: Duration,
}

impl BrowserAuthenticator {
    pub fn new(client: MicrosoftClient, opener: Arc<dyn UrlOpener>) -> Self {
        let port = client.config().redirect_port;
        let timeout = client.config().browser_timeout;
        Self {
            client,
            opener,
            port,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl MicrosoftFlow for BrowserAuthenticator {
    fn name(&self) -> &'static str {
        "browser"
    }

    #[instrument(skip_all, fields(port = self.port))]
    async fn authenticate(&self, ctx: &SignInContext) -> Result<MicrosoftGrant> {
        if ctx.is_cancelled() {
            return Err(AuthError::UserCancelled);
        }

        let listener = RedirectListener::bind(self.port).await?;
        let redirect_uri = listener.redirect_uri();

        let state = pkce::generate_state()?;
        let verifier = pkce::generate_code_verifier()?;
        let challenge = pkce::generate_code_challenge(&verifier);
        let url = self
            .client
            .build_authorize_url(&redirect_uri, &state, &challenge);
        open_or_warn(self.opener.as_ref(), url.as_str());

        let code = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(AuthError::UserCancelled),
            result = tokio::time::timeout(self.timeout, listener.wait_for_code(&state)) => {
                result.unwrap_or(Err(AuthError::ExpiredChallenge))
            }
        };
        // Free the port before the (slow) code exchange
        drop(listener);
        let code = code?;

        let tokens = self
            .client
            .exchange_code(&code, &verifier, &redirect_uri)
            .await?;

        info!("Browser sign-in completed");
        Ok(MicrosoftGrant {
            tokens,
            account: self.client.new_account()?,
        })
    }
}

/// Loopback listener receiving a single OAuth redirect.
///
/// The port is released when the listener is dropped.
#[derive(Debug)]
pub struct RedirectListener {
    listener: TcpListener,
    port: u16,
}

impl RedirectListener {
    /// Bind `127.0.0.1:port`; port 0 picks a free one
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(AuthError::Listener)?;
        let port = listener.local_addr().map_err(AuthError::Listener)?.port();
        debug!("Redirect listener bound on port {}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Serve requests until one carries the authorization code.
    ///
    /// Each connection is handled on its own task, so an idle or slow
    /// client cannot hold back the real redirect. Pending handlers are
    /// aborted when this future returns or is dropped.
    pub async fn wait_for_code(&self, expected_state: &str) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<Result<String>>(1);
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(AuthError::Listener)?;
                    debug!("Redirect connection from {}", peer);

                    let expected_state = expected_state.to_string();
                    let tx = tx.clone();
                    handlers.spawn(async move {
                        if let Some(outcome) =
                            handle_connection(stream, &expected_state).await.transpose()
                        {
                            let _ = tx.send(outcome).await;
                        }
                    });
                }
                Some(outcome) = rx.recv() => return outcome,
                // Reap finished handlers
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}

/// Read the request line and drain the headers, up to [`MAX_REQUEST_BYTES`]
async fn read_request_line<R: AsyncRead + Unpin>(stream: R) -> std::io::Result<String> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_BYTES));

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain the headers so closing the socket does not reset the connection
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header).await {
            Ok(0) | Err(_) => break,
            Ok(_) if header.trim().is_empty() => break,
            Ok(_) => {}
        }
    }

    Ok(request_line)
}

/// Answer one HTTP request on the listener
async fn handle_connection(mut stream: TcpStream, expected_state: &str) -> Result<Option<String>> {
    let request_line =
        match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request_line(&mut stream)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                warn!("Failed to read redirect request: {}", e);
                return Ok(None);
            }
            Err(_) => {
                debug!("Dropping idle redirect connection");
                return Ok(None);
            }
        };

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let url = match Url::parse(&format!("http://localhost{target}")) {
        Ok(url) if url.path() == "/" => url,
        _ => {
            respond(stream, "404 Not Found", "Not Found").await;
            return Ok(None);
        }
    };

    match parse_redirect(&url, expected_state) {
        Ok(code) => {
            respond(stream, "200 OK", SUCCESS_PAGE).await;
            Ok(Some(code))
        }
        Err(AuthError::InvalidRedirect) => {
            respond(stream, "400 Bad Request", "Missing authorization code").await;
            Ok(None)
        }
        Err(AuthError::StateMismatch) => {
            warn!("Ignoring redirect with a mismatched state");
            respond(stream, "400 Bad Request", "Invalid state parameter").await;
            Ok(None)
        }
        Err(e) => {
            respond(stream, "400 Bad Request", &format!("Sign-in failed: {e}")).await;
            Err(e)
        }
    }
}

async fn respond(mut stream: TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to answer redirect request: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// Extract the authorization code from a redirect URL
pub fn parse_redirect(url: &Url, expected_state: &str) -> Result<String> {
    let params: HashMap<_, _> = url.query_pairs().collect();

    let code = params.get("code");
    let error = params.get("error");
    if code.is_none() && error.is_none() {
        return Err(AuthError::InvalidRedirect);
    }

    match params.get("state") {
        Some(actual) if actual == expected_state => {}
        _ => return Err(AuthError::StateMismatch),
    }

    if let Some(error) = error {
        if error == "access_denied" {
            return Err(AuthError::UserCancelled);
        }
        return Err(AuthError::ProviderRejection {
            code: error.to_string(),
            description: params
                .get("error_description")
                .map(|d| d.to_string())
                .unwrap_or_default(),
        });
    }

    code.map(|c| c.to_string()).ok_or(AuthError::InvalidRedirect)
}
