//! Locations of ingest sources.

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

/// Errors of URL parsing and component access.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UrlError {
    #[snafu(display("invalid url '{}'", url))]
    InvalidUrl { url: String },

    #[snafu(display("url '{}' is not a {} resource", url, expected))]
    WrongScheme { url: String, expected: &'static str },
}

/// The scheme of a [`ResourceUrl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    /// `file://[host]/path`
    File,
    /// `http://host[:port][/target]`
    Http,
    /// `https://host[:port][/target]`
    Https,
}

/// A parsed source location.
///
/// Only the components applicable to the parsed scheme are accessible;
/// asking a `file://` URL for its HTTP host is an error, not an empty
/// string, so mixed-up call sites fail loudly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUrl {
    url: String,
    scheme: Scheme,

    // Scheme::File only
    file_host: String,
    file_path: String,

    // Scheme::Http and Scheme::Https only
    host: String,
    port: u16,
    target: String,
}

impl ResourceUrl {
    /// Parse a URL string.
    pub fn parse(url: impl Into<String>) -> Result<Self, UrlError> {
        let url = url.into();
        ensure!(!url.is_empty(), InvalidUrlSnafu { url: url.clone() });

        if let Some(rest) = url.strip_prefix("file://") {
            return Self::parse_file(url.clone(), rest);
        }
        for (prefix, scheme) in [("http://", Scheme::Http), ("https://", Scheme::Https)] {
            if let Some(rest) = url.strip_prefix(prefix) {
                return Self::parse_http(url.clone(), scheme, rest);
            }
        }
        Err(UrlError::InvalidUrl { url })
    }

    /// `file://[host]/path`. The path is always absolute and must have at
    /// least one character past the root.
    fn parse_file(url: String, rest: &str) -> Result<Self, UrlError> {
        let invalid = || UrlError::InvalidUrl { url: url.clone() };

        let slash = rest.find('/').ok_or_else(invalid)?;
        let (file_host, file_path) = rest.split_at(slash);
        if file_path.len() < 2 {
            return Err(invalid());
        }
        Ok(Self {
            scheme: Scheme::File,
            file_host: file_host.to_string(),
            file_path: file_path.to_string(),
            host: String::new(),
            port: 0,
            target: String::new(),
            url,
        })
    }

    /// `http[s]://host[:port][/target]`. A non-empty host is the only
    /// required component.
    fn parse_http(url: String, scheme: Scheme, rest: &str) -> Result<Self, UrlError> {
        let invalid = || UrlError::InvalidUrl { url: url.clone() };

        let (host_port, target) = match rest.find('/') {
            Some(pos) => rest.split_at(pos),
            None => (rest, ""),
        };
        let (host, port) = match host_port.find(':') {
            Some(pos) => {
                let port = host_port[pos + 1..].parse::<u16>().map_err(|_| invalid())?;
                (&host_port[..pos], port)
            }
            None => (host_port, 0),
        };
        ensure!(!host.is_empty(), InvalidUrlSnafu { url: url.clone() });
        Ok(Self {
            scheme,
            file_host: String::new(),
            file_path: String::new(),
            host: host.to_string(),
            port,
            target: target.to_string(),
            url,
        })
    }

    /// The original URL string.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The parsed scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host component of a `file://` URL, empty when none was given.
    pub fn file_host(&self) -> Result<&str, UrlError> {
        ensure!(
            self.scheme == Scheme::File,
            WrongSchemeSnafu {
                url: self.url.clone(),
                expected: "file",
            }
        );
        Ok(&self.file_host)
    }

    /// The path component of a `file://` URL.
    pub fn file_path(&self) -> Result<&str, UrlError> {
        ensure!(
            self.scheme == Scheme::File,
            WrongSchemeSnafu {
                url: self.url.clone(),
                expected: "file",
            }
        );
        Ok(&self.file_path)
    }

    /// The host of an `http://` or `https://` URL.
    pub fn host(&self) -> Result<&str, UrlError> {
        self.require_http()?;
        Ok(&self.host)
    }

    /// The port of an `http://` or `https://` URL, `0` when absent.
    pub fn port(&self) -> Result<u16, UrlError> {
        self.require_http()?;
        Ok(self.port)
    }

    /// The target of an `http://` or `https://` URL, empty when absent.
    pub fn target(&self) -> Result<&str, UrlError> {
        self.require_http()?;
        Ok(&self.target)
    }

    fn require_http(&self) -> Result<(), UrlError> {
        ensure!(
            matches!(self.scheme, Scheme::Http | Scheme::Https),
            WrongSchemeSnafu {
                url: self.url.clone(),
                expected: "HTTP/HTTPS",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_without_host() {
        let url = ResourceUrl::parse("file:///a").unwrap();
        assert_eq!(url.url(), "file:///a");
        assert_eq!(url.scheme(), Scheme::File);
        assert_eq!(url.file_host().unwrap(), "");
        assert_eq!(url.file_path().unwrap(), "/a");
        assert!(matches!(url.host(), Err(UrlError::WrongScheme { .. })));
        assert!(matches!(url.port(), Err(UrlError::WrongScheme { .. })));
        assert!(matches!(url.target(), Err(UrlError::WrongScheme { .. })));
    }

    #[test]
    fn file_url_with_host() {
        let url = ResourceUrl::parse("file://h/b").unwrap();
        assert_eq!(url.scheme(), Scheme::File);
        assert_eq!(url.file_host().unwrap(), "h");
        assert_eq!(url.file_path().unwrap(), "/b");
    }

    #[test]
    fn http_url_with_port_and_target() {
        let url = ResourceUrl::parse("http://a:123/c").unwrap();
        assert_eq!(url.url(), "http://a:123/c");
        assert_eq!(url.scheme(), Scheme::Http);
        assert_eq!(url.host().unwrap(), "a");
        assert_eq!(url.port().unwrap(), 123);
        assert_eq!(url.target().unwrap(), "/c");
        assert!(matches!(url.file_path(), Err(UrlError::WrongScheme { .. })));
    }

    #[test]
    fn http_url_with_defaults() {
        let url = ResourceUrl::parse("https://example.org").unwrap();
        assert_eq!(url.scheme(), Scheme::Https);
        assert_eq!(url.host().unwrap(), "example.org");
        assert_eq!(url.port().unwrap(), 0);
        assert_eq!(url.target().unwrap(), "");
    }

    #[test]
    fn rejected_urls() {
        for bad in [
            "",
            "http://",
            "https://",
            "file://",
            "file:///",
            "file://h",
            "other://x/y",
            "http://:123/c",
        ] {
            assert!(
                matches!(ResourceUrl::parse(bad), Err(UrlError::InvalidUrl { .. })),
                "expected rejection of '{}'",
                bad
            );
        }
    }

    #[test]
    fn round_trip_preserves_the_input() {
        for good in [
            "file:///data/chunk_1.tsv",
            "file://host/data/chunk_1.tsv",
            "http://svc:8080/load?chunk=1",
            "https://svc/load",
        ] {
            assert_eq!(ResourceUrl::parse(good).unwrap().url(), good);
        }
    }
}
