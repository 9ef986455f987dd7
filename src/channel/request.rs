//! Requests carried over an API channel.

use serde::{Deserialize, Serialize};

use super::frame::{FrameType, PayloadFormat, TunnelFrame};
use crate::constants::RPC_CONTENT_TYPE;
use crate::error::{RelayError, Result};

/// An HTTP-style call tunneled to the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    /// `GET path`, no body.
    Get {
        /// Correlation id echoed by the response.
        id: String,
        /// Absolute path on the console.
        path: String,
    },
    /// `POST path` with a body.
    Post {
        /// Correlation id echoed by the response.
        id: String,
        /// Absolute path on the console.
        path: String,
        /// Raw body, normally JSON.
        body: Vec<u8>,
    },
}

fn check_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(RelayError::InvalidInput(format!(
            "Invalid path {path}, does not start with /"
        )));
    }
    Ok(path.to_string())
}

impl ApiRequest {
    /// A GET request with a fresh id.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInput`] if `path` does not start with `/`.
    pub fn get(path: &str) -> Result<Self> {
        Ok(Self::Get {
            id: uuid::Uuid::new_v4().to_string(),
            path: check_path(path)?,
        })
    }

    /// A POST request whose body is `body` serialized as JSON.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInput`] if `path` does not start with `/`.
    pub fn post<T: Serialize>(path: &str, body: &T) -> Result<Self> {
        Ok(Self::Post {
            id: uuid::Uuid::new_v4().to_string(),
            path: check_path(path)?,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Correlation id.
    pub fn id(&self) -> &str {
        match self {
            Self::Get { id, .. } | Self::Post { id, .. } => id,
        }
    }

    /// HTTP method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Post { .. } => "POST",
        }
    }

    /// Target path.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path, .. } | Self::Post { path, .. } => path,
        }
    }

    /// Uncompressed body; empty for GET.
    pub fn body(&self) -> &[u8] {
        match self {
            Self::Get { .. } => &[],
            Self::Post { body, .. } => body,
        }
    }

    /// Metadata sent in the header frame.
    pub fn header(&self) -> RequestHeader<'_> {
        RequestHeader {
            id: self.id(),
            kind: "httpRequest",
            method: self.method(),
            path: self.path(),
            headers: ContentHeaders {
                content_length: self.body().len(),
                content_type: RPC_CONTENT_TYPE,
            },
        }
    }

    /// Header frame followed by body frame, both compressed, as one message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header())?;
        let mut bytes =
            TunnelFrame::new(FrameType::Header, PayloadFormat::Json, &header, true)?.encode()?;
        bytes.extend(TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, self.body(), true)?.encode()?);
        Ok(bytes)
    }
}

/// JSON metadata of a request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestHeader<'a> {
    /// Correlation id.
    pub id: &'a str,
    /// Always `httpRequest`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// HTTP method.
    pub method: &'static str,
    /// Target path.
    pub path: &'a str,
    /// Content headers.
    pub headers: ContentHeaders,
}

/// Content headers of a request.
#[derive(Debug, Clone, Serialize)]
pub struct ContentHeaders {
    /// Uncompressed body length.
    #[serde(rename = "content-length")]
    pub content_length: usize,
    /// Body media type.
    #[serde(rename = "content-type")]
    pub content_type: &'static str,
}

/// JSON metadata of a response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeader {
    /// Id of the request answered.
    #[serde(default)]
    pub id: Option<String>,
    /// HTTP status code.
    #[serde(default)]
    pub status_code: Option<u16>,
    /// HTTP status text.
    #[serde(default)]
    pub status_message: Option<String>,
}
