use chrono::NaiveDateTime;
use thiserror::Error;

/// Everything the client can fail with.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Malformed input, always reported before any request goes out.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("unknown period '{0}', expected one of day, month, year")]
    UnknownPeriod(String),

    #[error("year {0} is out of range (1..=9999)")]
    YearOutOfRange(i32),

    #[error("month {0} is out of range (1..=12)")]
    MonthOutOfRange(u32),

    #[error("{year:04}-{month:02}-{day:02} is not a calendar date")]
    InvalidDate { year: i32, month: u32, day: u32 },

    #[error("a {period} period does not take a {field}")]
    UnexpectedField {
        period: &'static str,
        field: &'static str,
    },

    #[error("'{0}' is not a boolean, expected True or False")]
    InvalidFlag(String),
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The portal answered the login post with the login form again.
    #[error("the portal rejected the credentials")]
    Rejected,

    #[error("unexpected login page: {0}")]
    UnexpectedLoginPage(String),

    #[error("login failed with HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),

    #[error("the portal refused the session (HTTP {0})")]
    Unauthorized(u16),

    /// The portal bounced the request to its login page.
    #[error("the session has expired")]
    SessionExpired,

    #[error("request failed with HTTP {status}: {excerpt}")]
    Status { status: u16, excerpt: String },

    #[error("no consumption chart in the response page")]
    MissingChart,

    #[error("malformed chart data: {0}")]
    MalformedResponse(String),

    #[error("timestamp {0} appears twice in the {1} series")]
    DuplicateTimestamp(NaiveDateTime, &'static str),
}

impl FetchError {
    /// True when the failure means the session is no longer valid and a new
    /// `authenticate` call is needed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchError::Unauthorized(_) | FetchError::SessionExpired)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::MalformedResponse(e.to_string())
    }
}

impl ScraperError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ScraperError::Authentication(_) => true,
            ScraperError::Fetch(e) => e.is_auth_failure(),
            ScraperError::Validation(_) => false,
        }
    }
}
