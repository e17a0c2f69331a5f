//! Auth cookie helpers.

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Attributes shared by every auth cookie we set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookiePolicy {
    /// Adds `Secure`; enable when served over HTTPS.
    pub secure: bool,
}

impl CookiePolicy {
    /// `Set-Cookie` value for an auth cookie: HttpOnly, SameSite=Lax, Path=/.
    pub fn set(&self, name: &str, value: &str, max_age_secs: i64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            name,
            value,
            max_age_secs.max(0)
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that makes the browser drop the cookie.
    pub fn clear(&self, name: &str) -> String {
        self.set(name, "", 0)
    }
}

/// Non-empty cookie value from request headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}
