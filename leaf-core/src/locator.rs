//! Document addressing: source locators and the navigation path grammar.

use std::fmt;

use url::Url;

use crate::error::LocatorError;
use crate::PageNumber;

pub const UPLOAD_ROUTE: &str = "/api/pdf-upload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    Remote(Url),
    Uploaded(String),
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LocatorError::Empty);
        }
        Url::parse(raw)
            .map(SourceLocator::Remote)
            .map_err(|_| LocatorError::InvalidUrl(raw.to_owned()))
    }

    /// Key under which reading progress is stored for this document.
    pub fn identity(&self) -> String {
        match self {
            SourceLocator::Remote(url) => url.to_string(),
            SourceLocator::Uploaded(id) => format!("{UPLOAD_ROUTE}/{id}"),
        }
    }

    pub fn fallback_title(&self) -> Option<String> {
        match self {
            SourceLocator::Remote(url) => title_from_url(url),
            SourceLocator::Uploaded(_) => None,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Remote(url) => write!(f, "{url}"),
            SourceLocator::Uploaded(id) => write!(f, "uploaded/{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTarget {
    pub locator: SourceLocator,
    pub start_page: PageNumber,
}

/// Rebuilds a document locator from a viewer path such as
/// `/https%3A%2F%2Fexample.com%2Fa.pdf`, `/https:/example.com/a.pdf?page=4`
/// or `/uploaded/<id>`.
pub fn parse_navigation_path(path: &str) -> Result<NavigationTarget, LocatorError> {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let start_page = query.map(start_page_from_query).unwrap_or(1);

    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(LocatorError::Empty);
    }
    let segments: Vec<&str> = trimmed.split('/').collect();

    if segments.len() == 2 && segments[0] == "uploaded" && !segments[1].is_empty() {
        return Ok(NavigationTarget {
            locator: SourceLocator::Uploaded(segments[1].to_owned()),
            start_page,
        });
    }

    let rebuilt = if segments.len() == 1 {
        let single = segments[0];
        match urlencoding::decode(single) {
            Ok(decoded) if Url::parse(&decoded).is_ok() => decoded.into_owned(),
            _ if single.starts_with("http") => single.to_owned(),
            _ => format!("https://{single}"),
        }
    } else if segments[0] == "https:" || segments[0] == "http:" {
        let rest: Vec<&str> = segments[1..]
            .iter()
            .copied()
            .filter(|segment| !segment.is_empty())
            .collect();
        format!("{}//{}", segments[0], rest.join("/"))
    } else {
        format!("https://{}", segments.join("/"))
    };

    let url = Url::parse(&rebuilt).map_err(|_| LocatorError::InvalidUrl(rebuilt.clone()))?;
    Ok(NavigationTarget {
        locator: SourceLocator::Remote(url),
        start_page,
    })
}

fn start_page_from_query(query: &str) -> PageNumber {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| {
            let digits: String = value
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<PageNumber>().ok()
        })
        .map(|page| page.max(1))
        .unwrap_or(1)
}

/// Last path segment without a `.pdf` extension.
pub fn title_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let split = last.len().saturating_sub(4);
    let stem = match (last.get(..split), last.get(split..)) {
        (Some(stem), Some(ext)) if ext.eq_ignore_ascii_case(".pdf") => stem,
        _ => last,
    };
    (!stem.is_empty()).then(|| stem.to_owned())
}

/// Human-friendly rendering of a stored title: percent-decoded, separators
/// turned into spaces, each word capitalised.
pub fn format_display_title(title: &str) -> String {
    let decoded = urlencoding::decode(title)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| title.to_owned());
    let spaced: String = decoded
        .chars()
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .collect();

    let mut out = String::with_capacity(spaced.len());
    let mut at_word_start = true;
    for word in spaced.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for c in word.chars() {
            if at_word_start && c.is_alphanumeric() {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            at_word_start = !c.is_alphanumeric();
        }
        at_word_start = true;
    }
    out
}
