//! Request handlers for the table endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::tables::ServerTables;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tablesync_protocol::multipart::{self, MultipartKind};
use tablesync_protocol::{
    AlterRowsRequest, AlterRowsResponse, ChangesetPage, DownloadRequest, RemoteTableState, Route,
    RowId, RowManifest, TableId,
};
use tracing::{debug, warn};

/// A request as seen by the server. Paths are relative to the base URL.
#[derive(Debug, Clone, Default)]
pub struct ServerRequest {
    /// HTTP method, upper case.
    pub method: String,
    /// Path and query.
    pub path: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl ServerRequest {
    /// Creates a request without headers or body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body (builder style).
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response produced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl ServerResponse {
    fn new(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
        }
    }

    fn json(body: Vec<u8>) -> Self {
        Self::new(200, "application/json", body)
    }

    fn error(err: &ServerError) -> Self {
        Self::new(err.status(), "text/plain", err.to_string().into_bytes())
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Table state (shared across all handlers).
    pub tables: Arc<ServerTables>,
    validator: Option<TokenValidator>,
    unavailable: AtomicBool,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, tables: Arc<ServerTables>) -> Self {
        let validator = config.auth_secret.clone().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret).with_expiry(config.token_expiry))
        });
        Self {
            config,
            tables,
            validator,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Returns the token validator, if a secret is configured.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Makes every request fail with 503 until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

/// Handler for table requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Returns a table's schema and data ETags.
    pub fn handle_table_state(&self, table_id: &TableId) -> ServerResult<RemoteTableState> {
        self.context.tables.table_state(table_id)
    }

    /// Returns one changeset page, capping the page size.
    pub fn handle_diff(
        &self,
        table_id: &TableId,
        data_etag: Option<&str>,
        cursor: Option<&str>,
        fetch_limit: Option<usize>,
    ) -> ServerResult<ChangesetPage> {
        let max = self.context.config.max_page_size;
        let limit = fetch_limit.unwrap_or(max).min(max);
        self.context.tables.diff(table_id, data_etag, cursor, limit)
    }

    /// Applies a push batch.
    pub fn handle_alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> ServerResult<AlterRowsResponse> {
        let max = self.context.config.max_alter_batch;
        if request.rows.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many rows: {} > {max}",
                request.rows.len()
            )));
        }
        self.context.tables.alter_rows(table_id, request)
    }

    /// Returns a row's manifest, or `None` if `if_none_match` is current.
    pub fn handle_manifest(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        if_none_match: Option<&str>,
    ) -> ServerResult<(Option<RowManifest>, String)> {
        let (manifest, etag) = self.context.tables.manifest(table_id, row_id)?;
        if if_none_match == Some(etag.as_str()) {
            return Ok((None, etag));
        }
        Ok((Some(manifest), etag))
    }

    /// Dispatches a raw request.
    pub fn handle(&self, request: &ServerRequest) -> ServerResponse {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                if err.is_server_error() {
                    warn!(path = %request.path, error = %err, "request failed");
                } else {
                    debug!(path = %request.path, error = %err, "request rejected");
                }
                ServerResponse::error(&err)
            }
        }
    }

    fn authenticate(&self, request: &ServerRequest) -> ServerResult<()> {
        if !self.context.config.require_auth {
            return Ok(());
        }
        let validator = self
            .context
            .validator()
            .ok_or_else(|| ServerError::Internal("authentication enabled without a secret".into()))?;
        validator.validate_header(request.header("Authorization"))?;
        Ok(())
    }

    fn dispatch(&self, request: &ServerRequest) -> ServerResult<ServerResponse> {
        if self.context.unavailable.load(Ordering::SeqCst) {
            return Err(ServerError::Unavailable);
        }
        let route = Route::parse(&request.path)
            .ok_or_else(|| ServerError::NotFound(request.path.clone()))?;
        if !route.method().eq_ignore_ascii_case(&request.method) {
            return Err(ServerError::InvalidRequest(format!(
                "{} not allowed on {}",
                request.method, request.path
            )));
        }
        self.authenticate(request)?;

        match &route {
            Route::TableState { table_id } => {
                Ok(ServerResponse::json(self.handle_table_state(table_id)?.encode()?))
            }
            Route::Diff {
                table_id,
                data_etag,
                cursor,
                fetch_limit,
            } => {
                let page = self.handle_diff(
                    table_id,
                    data_etag.as_deref(),
                    cursor.as_deref(),
                    *fetch_limit,
                )?;
                Ok(ServerResponse::json(page.encode()?))
            }
            Route::AlterRows { table_id } => {
                let body = AlterRowsRequest::decode(&request.body)?;
                Ok(ServerResponse::json(
                    self.handle_alter_rows(table_id, &body)?.encode()?,
                ))
            }
            Route::Manifest { table_id, row_id } => {
                let (manifest, etag) =
                    self.handle_manifest(table_id, row_id, request.header("If-None-Match"))?;
                let mut response = match manifest {
                    Some(manifest) => ServerResponse::json(manifest.encode()?),
                    None => ServerResponse {
                        status: 304,
                        headers: Vec::new(),
                        body: Vec::new(),
                    },
                };
                response.headers.push(("ETag".to_string(), etag));
                Ok(response)
            }
            Route::Upload { table_id, row_id } => {
                let content_type = request
                    .header("Content-Type")
                    .ok_or_else(|| ServerError::InvalidRequest("upload without Content-Type".into()))?;
                let parts = multipart::decode(content_type, &request.body)?;
                self.context.tables.store_files(table_id, row_id, parts)?;
                Ok(ServerResponse::new(200, "text/plain", Vec::new()))
            }
            Route::Download { table_id, row_id } => {
                let wanted = DownloadRequest::decode(&request.body)?;
                let parts = self
                    .context
                    .tables
                    .files(table_id, row_id, &wanted.filenames)?;
                let boundary = uuid::Uuid::new_v4().simple().to_string();
                Ok(ServerResponse::new(
                    200,
                    &multipart::content_type(MultipartKind::Mixed, &boundary),
                    multipart::encode(MultipartKind::Mixed, &boundary, &parts),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{FilePart, RowChange};

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let tables = Arc::new(ServerTables::new());
        tables.create_table("t", "s1");
        let context = Arc::new(HandlerContext::new(config, tables));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    #[test]
    fn table_state_route() {
        let (handler, _) = create_handler(ServerConfig::default());
        let response = handler.handle(&ServerRequest::new("GET", "tables/t"));
        assert_eq!(response.status, 200);
        let state = RemoteTableState::decode(&response.body).unwrap();
        assert_eq!(state.schema_etag, "s1");
        assert_eq!(state.data_etag.as_deref(), Some("d0"));
    }

    #[test]
    fn unknown_routes_and_methods() {
        let (handler, _) = create_handler(ServerConfig::default());
        assert_eq!(handler.handle(&ServerRequest::new("GET", "nowhere")).status, 404);
        assert_eq!(handler.handle(&ServerRequest::new("GET", "tables/x")).status, 404);
        assert_eq!(handler.handle(&ServerRequest::new("POST", "tables/t")).status, 400);
    }

    #[test]
    fn diff_is_capped_by_config() {
        let (handler, context) = create_handler(ServerConfig::default().with_max_page_size(2));
        for id in ["a", "b", "c"] {
            context
                .tables
                .put_row(&"t".into(), RowChange::update(id, ""))
                .unwrap();
        }
        let page = handler
            .handle_diff(&"t".into(), None, None, Some(100))
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn oversized_push_is_rejected() {
        let (handler, _) = create_handler(ServerConfig::default().with_max_alter_batch(1));
        let request = AlterRowsRequest {
            prior_data_etag: Some("d0".into()),
            rows: vec![RowChange::update("a", ""), RowChange::update("b", "")],
        };
        let err = handler.handle_alter_rows(&"t".into(), &request).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn stale_push_maps_to_409() {
        let (handler, _) = create_handler(ServerConfig::default());
        let body = AlterRowsRequest {
            prior_data_etag: None,
            rows: vec![RowChange::update("a", "")],
        };
        let response = handler.handle(
            &ServerRequest::new("PUT", "tables/t/rows").with_body(body.encode().unwrap()),
        );
        assert_eq!(response.status, 409);
    }

    #[test]
    fn manifest_honours_if_none_match() {
        let (handler, context) = create_handler(ServerConfig::default());
        context
            .tables
            .store_files(&"t".into(), &"r".into(), vec![FilePart::new("a.txt", b"x".to_vec())])
            .unwrap();
        let path = "tables/t/attachments/r/manifest";
        let first = handler.handle(&ServerRequest::new("GET", path));
        assert_eq!(first.status, 200);
        let etag = first.header("ETag").unwrap().to_string();

        let second = handler.handle(&ServerRequest::new("GET", path).with_header("If-None-Match", etag));
        assert_eq!(second.status, 304);
        assert!(second.body.is_empty());
    }

    #[test]
    fn upload_then_download() {
        let (handler, _) = create_handler(ServerConfig::default());
        let parts = vec![FilePart::new("a.jpg", vec![1, 2, 3])];
        let upload = ServerRequest::new("POST", "tables/t/attachments/r/upload")
            .with_header("Content-Type", multipart::content_type(MultipartKind::FormData, "b0"))
            .with_body(multipart::encode(MultipartKind::FormData, "b0", &parts));
        assert_eq!(handler.handle(&upload).status, 200);

        let want = DownloadRequest {
            filenames: vec!["a.jpg".into()],
        };
        let download = handler.handle(
            &ServerRequest::new("POST", "tables/t/attachments/r/download")
                .with_body(want.encode().unwrap()),
        );
        assert_eq!(download.status, 200);
        let got = multipart::decode(download.header("Content-Type").unwrap(), &download.body).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].contents, vec![1, 2, 3]);
    }

    #[test]
    fn auth_and_unavailable() {
        let (handler, context) =
            create_handler(ServerConfig::default().with_auth(b"secret".to_vec()));
        assert_eq!(handler.handle(&ServerRequest::new("GET", "tables/t")).status, 401);

        let token = context.validator().unwrap().create_token("u1").unwrap();
        let request =
            ServerRequest::new("GET", "tables/t").with_header("Authorization", format!("Bearer {token}"));
        assert_eq!(handler.handle(&request).status, 200);

        context.set_unavailable(true);
        assert_eq!(handler.handle(&request).status, 503);
    }
}
