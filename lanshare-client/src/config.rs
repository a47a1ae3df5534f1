use std::time::Duration;

use url::Url;

use crate::error::ClientError;

pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const MIN_UPLOAD_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(60_000);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: Url,
    pub upload_timeout: Duration,
    /// Pause before each upload after the first in a batch.
    pub upload_delay: Duration,
    pub refresh_interval: Duration,
    pub stats_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        let mut server_url = Url::parse(server_url)?;
        match server_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ClientError::Connection(format!(
                    "unsupported scheme {other:?}, expected http or https"
                )));
            }
        }
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }

        Ok(Self {
            server_url,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            upload_delay: MIN_UPLOAD_DELAY,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
        })
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay.max(MIN_UPLOAD_DELAY);
        self
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.server_url.join(path)?)
    }

    /// `<server>/<action>/<filename>` with the name escaped as a single path segment.
    pub fn file_endpoint(&self, action: &str, filename: &str) -> Result<Url, ClientError> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Connection("server url cannot carry a path".to_owned()))?
            .pop_if_empty()
            .push(action)
            .push(filename);
        Ok(url)
    }

    /// The real-time channel lives at `/ws` on the same host, over ws/wss.
    pub fn ws_url(&self) -> Result<Url, ClientError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::Connection("cannot derive websocket url".to_owned()))?;
        Ok(url)
    }
}
