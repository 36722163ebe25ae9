use std::cmp::min;
use std::fmt::{self, Display};

use async_trait::async_trait;
use reqwest::Response;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Error as JsonError;
use serde_json::error::Category;

/// A json parsing error, wrapped with the span of input it occurred in when
/// that can be recovered.
#[derive(Debug)]
pub enum Error {
    Serde(serde_json::Error),
    Span(SpanError),
}

#[derive(Debug)]
pub struct SpanError {
    span: String,
    idx: usize,
    error: JsonError,
}

impl SpanError {
    const PADDING: usize = 20;

    fn new(s: &str, error: JsonError) -> Self {
        // column is 1 based, but can be 0 sometimes
        let c = error.column().saturating_sub(1);
        let mut curlies = 0;
        let l = s[0..c].rfind(|c: char| match c {
            '{' => {
                curlies += 1;
                curlies >= 0
            }
            '}' => {
                curlies -= 1;
                false
            }
            _ => false,
        }).unwrap_or(0)
            .saturating_sub(Self::PADDING);
        let max = min(c + Self::PADDING, s.len());
        Self {
            span: s[l..max].to_string(),
            idx: c - l,
            error,
        }
    }
}

impl Display for SpanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let here = "^ here";
        write!(f,
               "{}\n{}\n{:->width$}",
               self.error,
               self.span,
               here,
               width = self.idx + here.len()
        )
    }
}

impl std::error::Error for SpanError {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Serde(serde) => write!(f, "{}", serde),
            Self::Span(span) => write!(f, "{}", span),
        }
    }
}

impl std::error::Error for Error {}

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Serde(JsonError::custom(msg))
    }
}

/// A wrapper for [`serde_json::from_str`] that annotates parsing errors with
/// the region of `s` the error occurred in.
///
/// # Errors
///
/// If [`serde_json::from_str`] errors, and with more information
pub fn nice_from_str<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, Error> {
    match serde_json::from_str(s) {
        Ok(t) => Ok(t),
        Err(e) => {
            match e.classify() {
                Category::Syntax | Category::Data => {
                    let line = s.lines()
                        .nth(e.line().saturating_sub(1))
                        .unwrap();
                    Err(Error::Span(SpanError::new(line, e)))
                }
                Category::Eof | Category::Io => Err(Error::Serde(e))
            }
        }
    }
}

#[async_trait]
pub trait NiceResponseJson {
    async fn nice_json<T: DeserializeOwned>(self) -> crate::http::ClientResult<T>;
}

#[async_trait]
impl NiceResponseJson for Response {
    async fn nice_json<T: DeserializeOwned>(self) -> crate::http::ClientResult<T> {
        let mut text = self.text().await?;
        if text.is_empty() {
            text = "null".into();
        }
        Ok(nice_from_str(&text)?)
    }
}
