use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Response bodies larger than this are treated as an error.
const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    InProgress,
    Ok,
    Error,
}

#[derive(Debug)]
struct FetchInner {
    state: FetchState,
    body: Option<Vec<u8>>,
    error: Option<String>,
}

/// Handle to one asynchronous GET. Completion is observed purely by
/// polling; the worker thread never calls back into the owner.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    url: String,
    inner: Arc<Mutex<FetchInner>>,
}

impl FetchRequest {
    fn pending(url: String) -> Self {
        Self {
            url,
            inner: Arc::new(Mutex::new(FetchInner {
                state: FetchState::InProgress,
                body: None,
                error: None,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> FetchState {
        self.inner.lock().unwrap().state
    }

    pub fn body(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().body.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    fn complete(&self, body: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.body = Some(body);
        inner.state = FetchState::Ok;
    }

    fn fail(&self, error: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = Some(error);
        inner.state = FetchState::Error;
    }

    /// Build an already-resolved request, bypassing the network.
    #[cfg(test)]
    pub(crate) fn resolved(url: &str, body: Vec<u8>) -> Self {
        let request = Self::pending(url.to_string());
        request.complete(body);
        request
    }

    #[cfg(test)]
    pub(crate) fn failed(url: &str, error: &str) -> Self {
        let request = Self::pending(url.to_string());
        request.fail(error.to_string());
        request
    }
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self { agent }
    }

    /// Start a GET on a worker thread and return the pollable handle.
    /// Abandoning the handle abandons the request.
    pub fn start_get(&self, url: &str) -> FetchRequest {
        let request = FetchRequest::pending(url.to_string());
        let handle = request.clone();
        let agent = self.agent.clone();
        let url = url.to_string();

        thread::spawn(move || match agent.get(&url).call() {
            Ok(response) => {
                let mut body = Vec::new();
                match response
                    .into_reader()
                    .take(MAX_BODY_SIZE)
                    .read_to_end(&mut body)
                {
                    Ok(_) => handle.complete(body),
                    Err(err) => handle.fail(format!("reading body of {url}: {err}")),
                }
            }
            Err(err) => handle.fail(format!("GET {url}: {err}")),
        });

        request
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), "mistvale")
    }
}
