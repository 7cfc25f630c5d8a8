use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::config::IdentityConfig;
use crate::services::TokenPair;

/// Builds and clears the session cookie pair.
#[derive(Debug, Clone)]
pub struct SessionCookies {
    refresh_name: String,
    access_name: String,
    domain: Option<String>,
    refresh_max_age: time::Duration,
    access_max_age: time::Duration,
}

impl SessionCookies {
    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            refresh_name: config.cookies.refresh_name.clone(),
            access_name: config.cookies.access_name.clone(),
            domain: config.cookies.domain.clone(),
            refresh_max_age: time::Duration::days(config.jwt.refresh_token_expiry_days),
            access_max_age: time::Duration::minutes(config.jwt.access_token_expiry_minutes),
        }
    }

    pub fn refresh_name(&self) -> &str {
        &self.refresh_name
    }

    pub fn access_name(&self) -> &str {
        &self.access_name
    }

    /// Raw refresh token presented by the client, if any.
    pub fn refresh_token<'a>(&self, jar: &'a CookieJar) -> Option<&'a str> {
        jar.get(&self.refresh_name)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
    }

    fn base(&self, name: &str, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::build((name.to_string(), value))
            .path("/")
            .secure(true)
            .build();
        if let Some(domain) = &self.domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    /// HttpOnly, never readable by scripts.
    pub fn refresh_cookie(&self, raw_token: &str) -> Cookie<'static> {
        let mut cookie = self.base(&self.refresh_name, raw_token.to_string());
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(self.refresh_max_age);
        cookie
    }

    /// Readable by the client so it can send the token as a bearer header.
    pub fn access_cookie(&self, access_token: &str) -> Cookie<'static> {
        let mut cookie = self.base(&self.access_name, access_token.to_string());
        cookie.set_http_only(false);
        cookie.set_same_site(SameSite::None);
        cookie.set_max_age(self.access_max_age);
        cookie
    }

    pub fn set_pair(&self, jar: CookieJar, pair: &TokenPair) -> CookieJar {
        jar.add(self.refresh_cookie(&pair.refresh_token))
            .add(self.access_cookie(&pair.access_token))
    }

    /// Expire both cookies, whether or not the request carried them.
    pub fn clear(&self, jar: CookieJar) -> CookieJar {
        jar.add(self.removal(&self.refresh_name))
            .add(self.removal(&self.access_name))
    }

    fn removal(&self, name: &str) -> Cookie<'static> {
        let mut cookie = self.base(name, String::new());
        cookie.make_removal();
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookies() -> SessionCookies {
        SessionCookies {
            refresh_name: "rt".into(),
            access_name: "at".into(),
            domain: Some("example.com".into()),
            refresh_max_age: time::Duration::days(365),
            access_max_age: time::Duration::minutes(60),
        }
    }

    #[test]
    fn test_refresh_cookie_attributes() {
        let c = cookies().refresh_cookie("raw");
        assert_eq!(c.name(), "rt");
        assert_eq!(c.http_only(), Some(true));
        assert_eq!(c.secure(), Some(true));
        assert_eq!(c.same_site(), Some(SameSite::Lax));
        assert_eq!(c.path(), Some("/"));
        assert_eq!(c.domain(), Some("example.com"));
        assert_eq!(c.max_age(), Some(time::Duration::days(365)));
    }

    #[test]
    fn test_access_cookie_is_script_readable() {
        let c = cookies().access_cookie("jwt");
        assert_eq!(c.name(), "at");
        assert_eq!(c.http_only(), Some(false));
        assert_eq!(c.secure(), Some(true));
        assert_eq!(c.same_site(), Some(SameSite::None));
    }

    #[test]
    fn test_clear_expires_cookies_absent_from_request() {
        let jar = cookies().clear(CookieJar::new());
        for name in ["rt", "at"] {
            let c = jar.get(name).unwrap();
            assert_eq!(c.value(), "");
            assert_eq!(c.max_age(), Some(time::Duration::ZERO));
            assert_eq!(c.path(), Some("/"));
        }
    }

    #[test]
    fn test_empty_refresh_cookie_is_ignored() {
        let jar = CookieJar::new().add(Cookie::new("rt", ""));
        assert_eq!(cookies().refresh_token(&jar), None);
        let jar = CookieJar::new().add(Cookie::new("rt", "abc"));
        assert_eq!(cookies().refresh_token(&jar), Some("abc"));
    }
}
