//! HTML consent and error pages.

/// `Content-Security-Policy` sent with every HTML page.
///
/// No `form-action`: browsers apply it to the redirect that follows the consent
/// POST, which would block the hop to the upstream provider.
pub const CONTENT_SECURITY_POLICY: &str = concat!(
    "default-src 'none'; style-src 'unsafe-inline'; img-src https: data:; ",
    "frame-ancestors 'none'; base-uri 'none'"
);

/// Data shown on the consent page.
#[derive(Debug, Clone)]
pub struct ConsentPage {
    pub client_name: Option<String>,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub txn_id: String,
    pub csrf_token: String,
    /// Absolute URL the form posts to.
    pub action_url: String,
}

/// Renders the consent page. Swap in a custom implementation for branding.
pub trait ConsentRenderer: Send + Sync {
    fn render(&self, page: &ConsentPage) -> String;
}

/// Built-in consent page.
#[derive(Debug, Clone)]
pub struct DefaultConsentRenderer {
    server_name: String,
}

impl DefaultConsentRenderer {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self { server_name: server_name.into() }
    }
}

impl Default for DefaultConsentRenderer {
    fn default() -> Self {
        Self::new(crate::config::defaults::SERVER_NAME)
    }
}

const STYLE: &str = r#"body {
  font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
  background: #f5f5f5; margin: 0; display: flex; justify-content: center;
  align-items: center; min-height: 100vh;
}
.card {
  background: #fff; border-radius: 8px; box-shadow: 0 2px 8px rgba(0,0,0,0.1);
  padding: 32px; max-width: 440px; width: 100%;
}
h1 { font-size: 20px; margin: 0 0 8px; color: #333; }
.subtitle { color: #666; font-size: 14px; margin: 0 0 24px; }
dl { font-size: 13px; color: #444; margin: 0 0 16px; }
dt { font-weight: 600; margin-top: 8px; }
dd { margin: 2px 0 0; word-break: break-all; font-family: ui-monospace, monospace; }
.actions { display: flex; gap: 12px; margin-top: 16px; }
button {
  flex: 1; padding: 10px; border: none; border-radius: 4px;
  font-size: 14px; font-weight: 500; cursor: pointer;
}
.approve { background: #4a90d9; color: #fff; }
.approve:hover { background: #357abd; }
.deny { background: #eee; color: #333; }"#;

impl ConsentRenderer for DefaultConsentRenderer {
    fn render(&self, page: &ConsentPage) -> String {
        let client_label = page.client_name.as_deref().unwrap_or(&page.client_id);
        let scopes = if page.scopes.is_empty() {
            "<dd>(none)</dd>".to_string()
        } else {
            page.scopes.iter().map(|s| format!("<dd>{}</dd>", html_escape(s))).collect()
        };

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>Authorize - {server_name}</title>
<style>
{STYLE}
</style>
</head>
<body>
<div class="card">
<h1>{server_name}</h1>
<p class="subtitle"><strong>{client_label}</strong> is requesting access</p>
<dl>
<dt>Client ID</dt><dd>{client_id}</dd>
<dt>Redirect URI</dt><dd>{redirect_uri}</dd>
<dt>Scopes</dt>{scopes}
</dl>
<form method="POST" action="{action_url}">
<input type="hidden" name="txn_id" value="{txn_id}">
<input type="hidden" name="csrf_token" value="{csrf_token}">
<div class="actions">
<button class="deny" type="submit" name="action" value="deny">Deny</button>
<button class="approve" type="submit" name="action" value="approve">Approve</button>
</div>
</form>
</div>
</body>
</html>"#,
            server_name = html_escape(&self.server_name),
            client_label = html_escape(client_label),
            client_id = html_escape(&page.client_id),
            redirect_uri = html_escape(&page.redirect_uri),
            action_url = html_escape(&page.action_url),
            txn_id = html_escape(&page.txn_id),
            csrf_token = html_escape(&page.csrf_token),
        )
    }
}

/// Minimal error page.
#[must_use]
pub fn render_error_page(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Error</title></head>
<body><h1>Error</h1><p>{}</p></body>
</html>"#,
        html_escape(message)
    )
}

/// Escape HTML special characters.
pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
