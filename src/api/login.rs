use std::fmt;

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::error::{AuthenticationError, FetchError, ScraperError, ValidationError};
use crate::{ApiClient, CookieJar, PortalResponse};

pub(crate) const LOGIN_URL: &str = "/lv/private/user-authentification/";

/// Hidden fields the login form must carry back.
const TOKEN_FIELD: &str = "_token";
const RETURN_URL_FIELD: &str = "returnUrl";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::Empty("username"));
        }
        if self.password.is_empty() {
            return Err(ValidationError::Empty("password"));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated portal session. Only [`authenticate`] hands these out.
#[derive(Debug, Clone)]
pub struct Session {
    cookies: CookieJar,
    established_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

/// The hidden inputs scraped from the login page.
#[derive(Debug, PartialEq, Eq)]
struct LoginForm {
    token: String,
    return_url: Option<String>,
}

impl LoginForm {
    fn parse(page: &str) -> Result<Self, AuthenticationError> {
        let document = Html::parse_document(page);

        let token = input_value(&document, TOKEN_FIELD)
            .map_err(AuthenticationError::UnexpectedLoginPage)?
            .ok_or_else(|| {
                AuthenticationError::UnexpectedLoginPage(format!("no {} field", TOKEN_FIELD))
            })?;
        let return_url =
            input_value(&document, RETURN_URL_FIELD).map_err(AuthenticationError::UnexpectedLoginPage)?;

        Ok(LoginForm { token, return_url })
    }

    fn into_fields(self, credentials: &Credentials) -> Vec<(String, String)> {
        vec![
            (TOKEN_FIELD.to_string(), self.token),
            (
                RETURN_URL_FIELD.to_string(),
                self.return_url.unwrap_or_default(),
            ),
            ("login".to_string(), credentials.username.clone()),
            ("password".to_string(), credentials.password.clone()),
        ]
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("bad selector {}: {:?}", css, e))
}

fn input_value(document: &Html, name: &str) -> Result<Option<String>, String> {
    let sel = selector(&format!("input[name=\"{}\"]", name))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string))
}

/// Whether the page served is the login form, which is what the portal shows
/// for rejected credentials and for requests without a live session.
pub(crate) fn is_login_page(response: &PortalResponse) -> bool {
    if response.final_path.starts_with(LOGIN_URL) {
        return true;
    }
    let document = Html::parse_document(&response.body);
    match selector("input[name=\"password\"]") {
        Ok(sel) => document.select(&sel).next().is_some(),
        Err(_) => false,
    }
}

/// Logs in with the portal's form flow: fetch the login page for its CSRF
/// token and cookies, then post the credentials.
pub(crate) fn authenticate(
    client: &dyn ApiClient,
    credentials: &Credentials,
) -> Result<Session, ScraperError> {
    credentials.validate()?;

    let mut cookies = CookieJar::default();

    let page = client
        .http_get(LOGIN_URL, &[], &cookies)
        .map_err(FetchError::Transport)?;
    if !page.is_success() {
        warn!(status = page.status, "login page unavailable");
        return Err(AuthenticationError::Status(page.status).into());
    }
    cookies.absorb(&page.set_cookies);

    let form = LoginForm::parse(&page.body)?;
    debug!(has_return_url = form.return_url.is_some(), "login form scraped");

    let reply = client
        .http_post_form(LOGIN_URL, &form.into_fields(credentials), &cookies)
        .map_err(FetchError::Transport)?;
    cookies.absorb(&reply.set_cookies);

    match reply.status {
        401 | 403 | 422 => return Err(AuthenticationError::Rejected.into()),
        // stale CSRF token or guest session, not bad credentials
        419 => {
            return Err(AuthenticationError::UnexpectedLoginPage(
                "login form expired before it was posted (HTTP 419)".to_string(),
            )
            .into())
        }
        status if !reply.is_success() => return Err(AuthenticationError::Status(status).into()),
        _ => {}
    }
    if is_login_page(&reply) {
        return Err(AuthenticationError::Rejected.into());
    }

    info!(username = %credentials.username, "logged in");
    Ok(Session {
        cookies,
        established_at: Utc::now(),
    })
}
