//! Google OAuth endpoints, scopes and token lifecycle timings
//!
//! Scopes are grouped per tool module. The bridge requests the union of the
//! configured services plus the identity scopes used to fetch user info.

use std::time::Duration;

/// Authorization endpoint (user consent page)
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Token endpoint for code exchange and token refresh
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Token revocation endpoint
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// OpenID user info endpoint
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Default loopback redirect URI. Only the port and path are used for
/// binding; the listener always binds 127.0.0.1.
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:3000/oauth2callback";

/// Identity scopes requested alongside every service.
pub const IDENTITY_SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub const CALENDAR_SCOPES: &[&str] = &["https://www.googleapis.com/auth/calendar"];

pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.send",
];

pub const DRIVE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/drive"];

pub const SHEETS_SCOPES: &[&str] = &["https://www.googleapis.com/auth/spreadsheets"];

/// Service names accepted in configuration and by `scopes_for_service`.
pub const SERVICES: &[&str] = &["calendar", "gmail", "drive", "sheets"];

/// Scopes a tool module needs, by service name.
pub fn scopes_for_service(service: &str) -> Option<&'static [&'static str]> {
    match service {
        "calendar" => Some(CALENDAR_SCOPES),
        "gmail" => Some(GMAIL_SCOPES),
        "drive" => Some(DRIVE_SCOPES),
        "sheets" => Some(SHEETS_SCOPES),
        _ => None,
    }
}

/// Identity scopes plus the scopes of every named service, deduplicated and sorted.
///
/// Unknown service names are skipped; configuration validation rejects them
/// before this is called.
pub fn scopes_for_services<S: AsRef<str>>(services: &[S]) -> Vec<String> {
    let mut scopes: Vec<String> = IDENTITY_SCOPES.iter().map(|s| s.to_string()).collect();
    for service in services {
        if let Some(service_scopes) = scopes_for_service(service.as_ref()) {
            scopes.extend(service_scopes.iter().map(|s| s.to_string()));
        }
    }
    scopes.sort();
    scopes.dedup();
    scopes
}

/// A token counts as valid only while `now < expiry - TOKEN_EXPIRY_BUFFER`.
pub const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Tokens closer than this to expiry are refreshed before they are handed out.
pub const PREEMPTIVE_REFRESH_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Minimum spacing between refresh attempts.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How long the authorization flow waits for the browser redirect.
pub const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Ports tried (starting at the preferred one) when binding the callback listener.
pub const CALLBACK_PORT_ATTEMPTS: u16 = 10;
