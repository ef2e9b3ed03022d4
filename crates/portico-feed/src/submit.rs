use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// The appliance accepts feeds on a dedicated port, one for http and
/// another for https.
const FEED_PORT: u16 = 19900;
const SECURE_FEED_PORT: u16 = 19902;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(300);

static DATASOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_-]*$").unwrap());

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid datasource name {0:?}")]
    InvalidDatasource(String),
    #[error("invalid feed endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to connect to {url}: {reason}")]
    FailedToConnect { url: Url, reason: String },
    #[error("failed writing feed to {url}: {reason}")]
    FailedWriting { url: Url, reason: String },
    #[error("failed reading reply from {url}: {reason}")]
    FailedReadingReply { url: Url, reason: String },
    #[error("appliance rejected the feed: HTTP {status}, body {body:?}")]
    Rejected { status: u16, body: String },
}

impl SubmitError {
    /// True for the three transport kinds that a retry might cure.
    /// A rejection or an invalid datasource will not get better by
    /// asking again.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::FailedToConnect { .. }
                | Self::FailedWriting { .. }
                | Self::FailedReadingReply { .. }
        )
    }
}

/// Whether a group-definitions push replaces the source's existing
/// definitions or amends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFeedType {
    Replace,
    Incremental,
}

impl GroupFeedType {
    fn wire_name(self) -> &'static str {
        match self {
            Self::Replace => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// The delivery seam between the pusher and the appliance. The real
/// implementation is [`FeedSubmitter`]; tests substitute a recorder.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn send_metadata_and_url(&self, datasource: &str, xml: &str) -> Result<(), SubmitError>;

    async fn send_group_definitions(
        &self,
        source: &str,
        feed_type: GroupFeedType,
        xml: &str,
    ) -> Result<(), SubmitError>;
}

/// POSTs feed XML to the appliance.
///
/// The wire format is a `multipart/form-data` body with the literal
/// boundary `<<` and three parts, in order: `datasource`, `feedtype`
/// and the XML payload in `data`. The appliance answers a 200 whose
/// body is exactly `Success`; anything else is a rejection.
pub struct FeedSubmitter {
    client: reqwest::Client,
    feed_url: Url,
    groups_url: Url,
    gzip: bool,
}

impl FeedSubmitter {
    /// A submitter for the conventional appliance ports on `hostname`.
    pub fn new(hostname: &str, secure: bool, gzip: bool) -> Result<Self, SubmitError> {
        let (scheme, port) = if secure {
            ("https", SECURE_FEED_PORT)
        } else {
            ("http", FEED_PORT)
        };
        let base = Url::parse(&format!("{scheme}://{hostname}:{port}/"))
            .map_err(|err| SubmitError::InvalidEndpoint(err.to_string()))?;
        Self::with_endpoint(base, gzip)
    }

    /// A submitter aimed at an explicit base URL, for tests and for
    /// deployments that front the appliance with a proxy.
    pub fn with_endpoint(base: Url, gzip: bool) -> Result<Self, SubmitError> {
        let join = |path| {
            base.join(path)
                .map_err(|err: url::ParseError| SubmitError::InvalidEndpoint(err.to_string()))
        };
        Ok(Self {
            client: reqwest::Client::new(),
            feed_url: join("xmlfeed")?,
            groups_url: join("xmlgroups")?,
            gzip,
        })
    }

    async fn submit(
        &self,
        url: &Url,
        datasource: &str,
        feed_type: &str,
        xml: &str,
    ) -> Result<(), SubmitError> {
        validate_datasource(datasource)?;
        let mut body = multipart_body(datasource, feed_type, xml).into_bytes();
        let mut request = self
            .client
            .post(url.clone())
            .timeout(SUBMIT_TIMEOUT)
            .header(CONTENT_TYPE, "multipart/form-data; boundary=<<");
        if self.gzip {
            body = gzip_bytes(&body).map_err(|err| SubmitError::FailedWriting {
                url: url.clone(),
                reason: format!("gzip: {err}"),
            })?;
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(err) if err.is_connect() => {
                return Err(SubmitError::FailedToConnect {
                    url: url.clone(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                return Err(SubmitError::FailedWriting {
                    url: url.clone(),
                    reason: err.to_string(),
                })
            }
        };
        let status = response.status();
        let reply = response
            .text()
            .await
            .map_err(|err| SubmitError::FailedReadingReply {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        if status != StatusCode::OK || reply != "Success" {
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                body: reply,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FeedClient for FeedSubmitter {
    async fn send_metadata_and_url(&self, datasource: &str, xml: &str) -> Result<(), SubmitError> {
        self.submit(&self.feed_url, datasource, "metadata-and-url", xml)
            .await
    }

    async fn send_group_definitions(
        &self,
        source: &str,
        feed_type: GroupFeedType,
        xml: &str,
    ) -> Result<(), SubmitError> {
        self.submit(&self.groups_url, source, feed_type.wire_name(), xml)
            .await
    }
}

/// Datasource names must look like `^[A-Za-z_][A-Za-z0-9_-]*$`; the
/// appliance rejects anything else, so we do too, earlier.
pub fn validate_datasource(datasource: &str) -> Result<(), SubmitError> {
    if DATASOURCE_RE.is_match(datasource) {
        Ok(())
    } else {
        Err(SubmitError::InvalidDatasource(datasource.to_string()))
    }
}

fn multipart_body(datasource: &str, feed_type: &str, xml: &str) -> String {
    let mut body = String::new();
    for (name, content_type, value) in [
        ("datasource", "text/plain", datasource),
        ("feedtype", "text/plain", feed_type),
        ("data", "text/xml", xml),
    ] {
        body.push_str("--<<\r\n");
        body.push_str(&format!(
            "Content-Disposition: form-data; name=\"{name}\"\r\n"
        ));
        body.push_str(&format!("Content-Type: {content_type}\r\n\r\n"));
        body.push_str(value);
        body.push_str("\r\n");
    }
    body.push_str("--<<--\r\n");
    body
}

fn gzip_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
