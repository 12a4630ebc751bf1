//! REST adapter for the remote API.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (reqwest, ureq, hyper) or an in-process loopback can carry the requests.
//! [`RestRemote`] maps the table API onto routes, encodes bodies and turns
//! status codes into [`SyncError`]s.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{AttachmentApi, ManifestResponse, RemoteTableApi};
use std::time::Duration;
use tablesync_protocol::multipart::{self, MultipartKind};
use tablesync_protocol::{
    AlterRowsRequest, AlterRowsResponse, ChangesetPage, DownloadRequest, FilePart,
    RemoteTableState, Route, RowId, RowManifest, TableId,
};
use thiserror::Error;
use tracing::debug;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
}

impl HttpMethod {
    fn for_route(route: &Route) -> Self {
        match route.method() {
            "PUT" => HttpMethod::Put,
            "POST" => HttpMethod::Post,
            _ => HttpMethod::Get,
        }
    }

    /// The method name, upper case.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Path and query relative to the base URL.
    pub path: String,
    /// Headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
}

impl HttpRequest {
    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response without headers.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// Connect or read timeout elapsed.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be made or broke.
    #[error("connection failed: {0}")]
    Connection(String),
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual transport. Implementations
/// must honor the request's connect and read timeouts.
pub trait HttpClient: Send + Sync {
    /// Sends a request and waits for the full response.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError>;
}

/// Remote API over HTTP.
pub struct RestRemote<C: HttpClient> {
    base_url: String,
    client: C,
    connect_timeout: Duration,
    read_timeout: Duration,
    authorization: Option<String>,
}

impl<C: HttpClient> RestRemote<C> {
    /// Creates an adapter for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C, config: &SyncConfig) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            client,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            authorization: None,
        }
    }

    /// Sends `value` as the `Authorization` header on every request.
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn send(
        &self,
        route: &Route,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> SyncResult<HttpResponse> {
        let path = route.path();
        let mut request = HttpRequest {
            method: HttpMethod::for_route(route),
            url: format!("{}{}", self.base_url, path),
            path,
            headers,
            body,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        };
        if let Some(auth) = &self.authorization {
            request
                .headers
                .push(("Authorization".into(), auth.clone()));
        }

        debug!(method = ?request.method, url = %request.url, "remote call");
        let response = self.client.send(request).map_err(|err| match err {
            HttpClientError::Timeout => SyncError::Timeout,
            HttpClientError::Connection(msg) => SyncError::transport_retryable(msg),
        })?;
        check_status(route, response)
    }

    fn send_json(&self, route: &Route, body: Vec<u8>) -> SyncResult<HttpResponse> {
        let headers = vec![
            ("Content-Type".into(), "application/json".into()),
            ("Accept".into(), "application/json".into()),
        ];
        self.send(route, headers, body)
    }
}

fn body_text(response: &HttpResponse) -> String {
    let text = String::from_utf8_lossy(&response.body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {}: {text}", response.status)
    }
}

fn check_status(route: &Route, response: HttpResponse) -> SyncResult<HttpResponse> {
    match response.status {
        200..=299 | 304 => Ok(response),
        401 => Err(SyncError::AuthenticationFailed(body_text(&response))),
        409 => {
            let table_id = match route {
                Route::TableState { table_id }
                | Route::Diff { table_id, .. }
                | Route::AlterRows { table_id }
                | Route::Manifest { table_id, .. }
                | Route::Upload { table_id, .. }
                | Route::Download { table_id, .. } => table_id.to_string(),
            };
            Err(SyncError::DataEtagConflict { table_id })
        }
        500..=599 => Err(SyncError::transport_retryable(body_text(&response))),
        _ => Err(SyncError::Protocol(body_text(&response))),
    }
}

fn expect_ok(response: &HttpResponse) -> SyncResult<()> {
    if response.status == 304 {
        Err(SyncError::Protocol("unexpected 304 Not Modified".into()))
    } else {
        Ok(())
    }
}

impl<C: HttpClient> RemoteTableApi for RestRemote<C> {
    fn table_state(&self, table_id: &TableId) -> SyncResult<RemoteTableState> {
        let route = Route::TableState {
            table_id: table_id.clone(),
        };
        let response = self.send_json(&route, Vec::new())?;
        expect_ok(&response)?;
        Ok(RemoteTableState::decode(&response.body)?)
    }

    fn get_updates(
        &self,
        table_id: &TableId,
        since_data_etag: Option<&str>,
        cursor: Option<&str>,
        page_size_hint: usize,
    ) -> SyncResult<ChangesetPage> {
        let route = Route::Diff {
            table_id: table_id.clone(),
            data_etag: since_data_etag.map(str::to_string),
            cursor: cursor.map(str::to_string),
            fetch_limit: Some(page_size_hint),
        };
        let response = self.send_json(&route, Vec::new())?;
        expect_ok(&response)?;
        Ok(ChangesetPage::decode(&response.body)?)
    }

    fn alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> SyncResult<AlterRowsResponse> {
        let route = Route::AlterRows {
            table_id: table_id.clone(),
        };
        let response = self.send_json(&route, request.encode()?)?;
        expect_ok(&response)?;
        Ok(AlterRowsResponse::decode(&response.body)?)
    }
}

impl<C: HttpClient> AttachmentApi for RestRemote<C> {
    fn manifest_uri(&self, table_id: &TableId, row_id: &RowId) -> String {
        let route = Route::Manifest {
            table_id: table_id.clone(),
            row_id: row_id.clone(),
        };
        format!("{}{}", self.base_url, route.path())
    }

    fn row_manifest(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        if_none_match: Option<&str>,
    ) -> SyncResult<ManifestResponse> {
        let route = Route::Manifest {
            table_id: table_id.clone(),
            row_id: row_id.clone(),
        };
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(etag) = if_none_match {
            headers.push(("If-None-Match".into(), etag.to_string()));
        }
        let response = self.send(&route, headers, Vec::new())?;
        if response.status == 304 {
            return Ok(ManifestResponse::NotModified);
        }
        Ok(ManifestResponse::Manifest {
            etag: response.header("ETag").map(str::to_string),
            manifest: RowManifest::decode(&response.body)?,
        })
    }

    fn upload_files(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        files: &[FilePart],
    ) -> SyncResult<()> {
        let route = Route::Upload {
            table_id: table_id.clone(),
            row_id: row_id.clone(),
        };
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let headers = vec![(
            "Content-Type".to_string(),
            multipart::content_type(MultipartKind::FormData, &boundary),
        )];
        let body = multipart::encode(MultipartKind::FormData, &boundary, files);
        let response = self.send(&route, headers, body)?;
        expect_ok(&response)
    }

    fn download_files(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filenames: &[String],
    ) -> SyncResult<Vec<FilePart>> {
        let route = Route::Download {
            table_id: table_id.clone(),
            row_id: row_id.clone(),
        };
        let request = DownloadRequest {
            filenames: filenames.to_vec(),
        };
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "multipart/mixed".to_string()),
        ];
        let response = self.send(&route, headers, request.encode()?)?;
        expect_ok(&response)?;
        let content_type = response
            .header("Content-Type")
            .ok_or_else(|| SyncError::Protocol("download response without Content-Type".into()))?;
        Ok(multipart::decode(content_type, &response.body)?)
    }
}

/// Handles requests in-process, for tests and embedded servers.
pub trait LoopbackServer: Send + Sync {
    /// Produces the response to a request.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// An HTTP client that routes requests directly to a [`LoopbackServer`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client connected to `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        Ok(self.server.handle(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tablesync_protocol::{ManifestEntry, RowChange};

    struct Scripted {
        responses: Mutex<Vec<Result<HttpResponse, HttpClientError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<HttpResponse, HttpClientError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for &Scripted {
        fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
            self.seen.lock().push(request);
            self.responses.lock().remove(0)
        }
    }

    fn remote(client: &Scripted) -> RestRemote<&Scripted> {
        RestRemote::new("https://sync.example.com/app", client, &SyncConfig::default())
            .with_authorization("Bearer t0k")
    }

    #[test]
    fn status_codes_map_to_errors() {
        let client = Scripted::new(vec![
            Ok(HttpResponse::new(401, b"bad token".to_vec())),
            Ok(HttpResponse::new(409, Vec::new())),
            Ok(HttpResponse::new(503, Vec::new())),
            Ok(HttpResponse::new(404, Vec::new())),
            Err(HttpClientError::Timeout),
        ]);
        let remote = remote(&client);
        let t = TableId::from("t");
        let request = AlterRowsRequest {
            prior_data_etag: Some("d1".into()),
            rows: vec![RowChange::update("a", "e1")],
        };

        assert!(matches!(
            remote.table_state(&t),
            Err(SyncError::AuthenticationFailed(msg)) if msg.contains("bad token")
        ));
        assert!(matches!(
            remote.alter_rows(&t, &request),
            Err(SyncError::DataEtagConflict { .. })
        ));
        let err = remote.get_updates(&t, None, None, 10).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(remote.table_state(&t), Err(SyncError::Protocol(_))));
        assert!(matches!(remote.table_state(&t), Err(SyncError::Timeout)));
    }

    #[test]
    fn requests_carry_routes_timeouts_and_auth() {
        let page = ChangesetPage::last(Vec::new(), "d2");
        let client = Scripted::new(vec![Ok(HttpResponse::new(200, page.encode().unwrap()))]);
        let remote = remote(&client);
        let got = remote
            .get_updates(&"t".into(), Some("d1"), Some("c9"), 50)
            .unwrap();
        assert_eq!(got, page);

        let seen = client.seen.lock();
        let request = &seen[0];
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(
            request.url,
            "https://sync.example.com/app/tables/t/diff?data_etag=d1&cursor=c9&fetch_limit=50"
        );
        assert_eq!(request.header("authorization"), Some("Bearer t0k"));
        assert_eq!(request.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn manifest_is_conditional() {
        let manifest = RowManifest {
            entries: vec![ManifestEntry {
                filename: "a.jpg".into(),
                md5hash: "md5:00".into(),
                download_url: None,
                content_length: 1,
            }],
        };
        let client = Scripted::new(vec![
            Ok(HttpResponse::new(200, manifest.encode().unwrap()).with_header("ETag", "\"m1\"")),
            Ok(HttpResponse::new(304, Vec::new())),
        ]);
        let remote = remote(&client);
        let (t, r) = (TableId::from("t"), RowId::from("r"));

        assert_eq!(
            remote.row_manifest(&t, &r, None).unwrap(),
            ManifestResponse::Manifest {
                manifest,
                etag: Some("\"m1\"".into())
            }
        );
        assert_eq!(
            remote.row_manifest(&t, &r, Some("\"m1\"")).unwrap(),
            ManifestResponse::NotModified
        );
        assert_eq!(
            client.seen.lock()[1].header("If-None-Match"),
            Some("\"m1\"")
        );
    }

    #[test]
    fn downloads_decode_multipart() {
        let parts = vec![FilePart::new("a.jpg", vec![1, 2, 3])];
        let body = multipart::encode(MultipartKind::Mixed, "bnd", &parts);
        let client = Scripted::new(vec![Ok(HttpResponse::new(200, body)
            .with_header("Content-Type", multipart::content_type(MultipartKind::Mixed, "bnd")))]);
        let remote = remote(&client);
        let got = remote
            .download_files(&"t".into(), &"r".into(), &["a.jpg".into()])
            .unwrap();
        assert_eq!(got, parts);
    }

    #[test]
    fn loopback_routes_to_closure() {
        let server = |request: &HttpRequest| {
            HttpResponse::new(200, request.path.clone().into_bytes())
        };
        let client = LoopbackClient::new(server);
        let response = client
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: "x/tables/t".into(),
                path: "tables/t".into(),
                headers: Vec::new(),
                body: Vec::new(),
                connect_timeout: Duration::ZERO,
                read_timeout: Duration::ZERO,
            })
            .unwrap();
        assert_eq!(response.body, b"tables/t");
    }
}
