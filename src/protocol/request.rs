//! Client request discovery
//!
//! A client names a stream in two steps: `connect` carries a tcUrl of the
//! form `rtmp://host[:port]/app[?params]`, and the later `publish` or
//! `play` carries `stream[?params]`. Together they identify the stream as
//! the tuple `(vhost, app, stream)`. The vhost is the host from the tcUrl
//! unless a `vhost=` or `domain=` parameter overrides it.

use std::fmt;

use crate::error::{ProtocolError, SourceError};
use crate::protocol::constants::RTMP_PORT;
use crate::registry::StreamKey;

/// Everything known about what a client asked for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Query string including the leading `?`, empty when absent
    pub param: String,
    pub tc_url: String,
    pub page_url: String,
    pub swf_url: String,
    pub object_encoding: f64,
    /// Requested play duration, -1 for live
    pub duration: f64,
}

impl Request {
    /// Parse the tcUrl of a `connect` command
    pub fn from_tc_url(tc_url: &str) -> Result<Self, ProtocolError> {
        if tc_url.is_empty() {
            return Err(ProtocolError::InvalidRequest("empty tcUrl".into()));
        }

        let (schema, rest) = tc_url.split_once("://").unwrap_or(("rtmp", tc_url));
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    ProtocolError::InvalidRequest(format!("bad port in tcUrl {tc_url}"))
                })?;
                (host, port)
            }
            None => (authority, RTMP_PORT),
        };
        let (app, param) = match path.find('?') {
            Some(idx) => (&path[..idx], &path[idx..]),
            None => (path, ""),
        };
        let app = app.trim_end_matches('/');

        if host.is_empty() {
            return Err(ProtocolError::InvalidRequest(format!("no host in tcUrl {tc_url}")));
        }
        if app.is_empty() {
            return Err(ProtocolError::InvalidRequest(format!("no app in tcUrl {tc_url}")));
        }

        let mut req = Self {
            schema: schema.to_string(),
            host: host.to_string(),
            port,
            vhost: host.to_string(),
            app: app.to_string(),
            param: param.to_string(),
            tc_url: tc_url.to_string(),
            duration: -1.0,
            ..Default::default()
        };
        req.apply_vhost_param();
        Ok(req)
    }

    /// Apply the stream name from `publish` or `play`.
    ///
    /// Parameters on the stream name are appended to the connect
    /// parameters and may also override the vhost.
    pub fn set_stream(&mut self, name: &str) -> Result<(), SourceError> {
        let (stream, param) = match name.find('?') {
            Some(idx) => (&name[..idx], &name[idx..]),
            None => (name, ""),
        };
        let stream = stream.trim_matches('/');
        if stream.is_empty() {
            return Err(SourceError::EmptyStreamName);
        }

        self.stream = stream.to_string();
        if !param.is_empty() {
            if self.param.is_empty() {
                self.param = param.to_string();
            } else {
                self.param.push('&');
                self.param.push_str(&param[1..]);
            }
            self.apply_vhost_param();
        }
        Ok(())
    }

    fn apply_vhost_param(&mut self) {
        let query = self.param.trim_start_matches('?');
        for pair in query.split(['&', '?']) {
            if let Some((key, value)) = pair.split_once('=') {
                if (key == "vhost" || key == "domain") && !value.is_empty() {
                    self.vhost = value.to_string();
                }
            }
        }
    }

    /// Registry key of the stream this request refers to
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.vhost, &self.app, &self.stream)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}
